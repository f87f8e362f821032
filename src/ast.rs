/// 查询树的根：一个实体及其投影列、过滤条件和关联
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTree {
    pub entity_name: String,
    /// 投影列，集合语义，顺序无关
    pub columns: Vec<String>,
    pub all_columns: bool,
    pub distinct: bool,
    pub top: Option<u32>,
    pub orders: Vec<OrderBy>,
    /// 根过滤器，默认为 AND
    pub criteria: FilterNode,
    pub joins: Vec<JoinSpec>,
}

impl QueryTree {
    pub fn new(entity_name: impl Into<String>) -> Self {
        Self {
            entity_name: entity_name.into(),
            columns: Vec::new(),
            all_columns: false,
            distinct: false,
            top: None,
            orders: Vec::new(),
            criteria: FilterNode::default(),
            joins: Vec::new(),
        }
    }

    /// 按命名约定得到的主键属性，例如 `accountid`
    pub fn id_attribute(&self) -> String {
        id_attribute_of(&self.entity_name)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// 添加列，已存在时跳过
    pub fn add_column(&mut self, column: impl Into<String>) {
        let column = column.into();
        if !self.has_column(&column) {
            self.columns.push(column);
        }
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            self.add_column(column);
        }
        self
    }

    pub fn with_criteria(mut self, criteria: FilterNode) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn with_join(mut self, join: JoinSpec) -> Self {
        self.joins.push(join);
        self
    }

    /// 按子节点索引路径向下遍历关联树
    pub fn join_at(&self, path: &[usize]) -> Option<&JoinSpec> {
        let (first, rest) = path.split_first()?;
        let mut join = self.joins.get(*first)?;
        for index in rest {
            join = join.joins.get(*index)?;
        }
        Some(join)
    }

    pub fn join_at_mut(&mut self, path: &[usize]) -> Option<&mut JoinSpec> {
        let (first, rest) = path.split_first()?;
        let mut join = self.joins.get_mut(*first)?;
        for index in rest {
            join = join.joins.get_mut(*index)?;
        }
        Some(join)
    }
}

/// `<entity>id`, the naming convention for primary keys and default foreign keys.
pub fn id_attribute_of(entity_name: &str) -> String {
    format!("{}id", entity_name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub attribute: String,
    pub descending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogicalOperator {
    #[default]
    And,
    Or,
}

/// 由同一逻辑运算符连接的一组条件和嵌套过滤器
///
/// 变更锚点不单独存储，而是从当前条件中读取，直接修改 `conditions` 也会立即生效。
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FilterNode {
    pub logic: LogicalOperator,
    pub conditions: Vec<Condition>,
    pub filters: Vec<FilterNode>,
}

impl FilterNode {
    pub fn new(logic: LogicalOperator, conditions: Vec<Condition>, filters: Vec<FilterNode>) -> Self {
        Self {
            logic,
            conditions,
            filters,
        }
    }

    pub fn with_conditions(conditions: Vec<Condition>) -> Self {
        Self::new(LogicalOperator::And, conditions, Vec::new())
    }

    /// An OR group holding `attr IS NULL OR attr IS NOT NULL`, the marker a query
    /// author places around a clause that may be rewritten.
    pub fn anchor_on(attribute: &str) -> Self {
        Self::new(
            LogicalOperator::Or,
            vec![Condition::null(attribute), Condition::not_null(attribute)],
            Vec::new(),
        )
    }

    pub fn with_filter(mut self, filter: FilterNode) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty() && self.filters.is_empty()
    }

    pub fn add_condition(&mut self, condition: Condition) {
        self.conditions.push(condition);
    }

    pub fn clear_conditions(&mut self) {
        self.conditions.clear();
    }

    /// 本节点自身条件中的 Null/NotNull 配对，每次读取时重新计算
    pub fn anchor(&self) -> Option<MutationAnchor> {
        MutationAnchor::detect(&self.conditions)
    }

    pub fn is_anchor_for(&self, attribute: &str) -> bool {
        self.anchor().is_some_and(|a| a.marks(attribute))
    }
}

/// Marks a filter node as safe to rewrite for the listed attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationAnchor {
    pub attributes: Vec<String>,
}

impl MutationAnchor {
    /// 找出同时带有 Null 与 NotNull 条件的所有属性
    pub fn detect(conditions: &[Condition]) -> Option<Self> {
        let mut attributes: Vec<String> = Vec::new();
        for condition in conditions {
            if condition.operator != ConditionOperator::Null {
                continue;
            }
            let paired = conditions.iter().any(|other| {
                other.operator == ConditionOperator::NotNull && other.attribute == condition.attribute
            });
            if paired && !attributes.contains(&condition.attribute) {
                attributes.push(condition.attribute.clone());
            }
        }
        if attributes.is_empty() {
            None
        } else {
            Some(Self { attributes })
        }
    }

    pub fn marks(&self, attribute: &str) -> bool {
        self.attributes.iter().any(|a| a == attribute)
    }
}

/// A single attribute predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    /// 属性位于关联实体上时的别名限定
    pub entity_name: Option<String>,
    pub attribute: String,
    pub operator: ConditionOperator,
    pub values: Vec<crate::record::Value>,
}

impl Condition {
    pub fn new(
        attribute: impl Into<String>,
        operator: ConditionOperator,
        values: Vec<crate::record::Value>,
    ) -> Self {
        Self {
            entity_name: None,
            attribute: attribute.into(),
            operator,
            values,
        }
    }

    pub fn equal(attribute: impl Into<String>, value: impl Into<crate::record::Value>) -> Self {
        Self::new(attribute, ConditionOperator::Equal, vec![value.into()])
    }

    pub fn null(attribute: impl Into<String>) -> Self {
        Self::new(attribute, ConditionOperator::Null, Vec::new())
    }

    pub fn not_null(attribute: impl Into<String>) -> Self {
        Self::new(attribute, ConditionOperator::NotNull, Vec::new())
    }

    pub fn on_entity(mut self, entity_name: impl Into<String>) -> Self {
        self.entity_name = Some(entity_name.into());
        self
    }

    /// `attribute = <guid>` with exactly one id value.
    pub fn is_id_equality_on(&self, attribute: &str) -> bool {
        self.attribute == attribute
            && self.operator == ConditionOperator::Equal
            && self.values.len() == 1
            && self.values[0].as_guid().is_some()
    }

    /// 按运算符的元数检查值的个数
    pub fn validate(&self) -> Result<(), String> {
        let count = self.values.len();
        let ok = match self.operator.arity() {
            Arity::None => count == 0,
            Arity::One => count == 1,
            Arity::Many => count >= 1,
        };
        if ok {
            Ok(())
        } else {
            Err(format!(
                "operator {} on '{}' does not take {} value(s)",
                self.operator.as_fetch_str(),
                self.attribute,
                count
            ))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOperator {
    Equal,        // eq
    NotEqual,     // ne
    GreaterThan,  // gt
    GreaterEqual, // ge
    LessThan,     // lt
    LessEqual,    // le
    Like,         // like
    NotLike,      // not-like
    In,           // in
    NotIn,        // not-in
    Null,         // null
    NotNull,      // not-null
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    None,
    One,
    Many,
}

impl ConditionOperator {
    pub fn arity(self) -> Arity {
        match self {
            ConditionOperator::Null | ConditionOperator::NotNull => Arity::None,
            ConditionOperator::In | ConditionOperator::NotIn => Arity::Many,
            _ => Arity::One,
        }
    }

    pub fn from_fetch_str(s: &str) -> Option<Self> {
        let op = match s {
            "eq" => ConditionOperator::Equal,
            "ne" | "neq" => ConditionOperator::NotEqual,
            "gt" => ConditionOperator::GreaterThan,
            "ge" => ConditionOperator::GreaterEqual,
            "lt" => ConditionOperator::LessThan,
            "le" => ConditionOperator::LessEqual,
            "like" => ConditionOperator::Like,
            "not-like" => ConditionOperator::NotLike,
            "in" => ConditionOperator::In,
            "not-in" => ConditionOperator::NotIn,
            "null" => ConditionOperator::Null,
            "not-null" => ConditionOperator::NotNull,
            _ => return None,
        };
        Some(op)
    }

    pub fn as_fetch_str(self) -> &'static str {
        match self {
            ConditionOperator::Equal => "eq",
            ConditionOperator::NotEqual => "ne",
            ConditionOperator::GreaterThan => "gt",
            ConditionOperator::GreaterEqual => "ge",
            ConditionOperator::LessThan => "lt",
            ConditionOperator::LessEqual => "le",
            ConditionOperator::Like => "like",
            ConditionOperator::NotLike => "not-like",
            ConditionOperator::In => "in",
            ConditionOperator::NotIn => "not-in",
            ConditionOperator::Null => "null",
            ConditionOperator::NotNull => "not-null",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinType {
    #[default]
    Inner,
    LeftOuter,
}

/// A relationship traversal from a parent node (`from_*`) to a joined entity (`to_*`).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct JoinSpec {
    pub from_entity: String,
    pub from_attribute: String,
    pub to_entity: String,
    pub to_attribute: String,
    pub alias: String,
    pub join_type: JoinType,
    pub columns: Vec<String>,
    pub criteria: FilterNode,
    pub joins: Vec<JoinSpec>,
}

impl JoinSpec {
    pub fn new(
        from_entity: impl Into<String>,
        from_attribute: impl Into<String>,
        to_entity: impl Into<String>,
        to_attribute: impl Into<String>,
    ) -> Self {
        Self {
            from_entity: from_entity.into(),
            from_attribute: from_attribute.into(),
            to_entity: to_entity.into(),
            to_attribute: to_attribute.into(),
            ..Default::default()
        }
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = alias.into();
        self
    }

    pub fn with_join_type(mut self, join_type: JoinType) -> Self {
        self.join_type = join_type;
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for column in columns {
            self.add_column(column);
        }
        self
    }

    pub fn with_criteria(mut self, criteria: FilterNode) -> Self {
        self.criteria = criteria;
        self
    }

    pub fn with_join(mut self, join: JoinSpec) -> Self {
        self.joins.push(join);
        self
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn add_column(&mut self, column: impl Into<String>) {
        let column = column.into();
        if !self.has_column(&column) {
            self.columns.push(column);
        }
    }

    /// Exact match on all four relationship names.
    pub fn links(&self, from_entity: &str, from_attribute: &str, to_entity: &str, to_attribute: &str) -> bool {
        self.from_entity == from_entity
            && self.from_attribute == from_attribute
            && self.to_entity == to_entity
            && self.to_attribute == to_attribute
    }
}
