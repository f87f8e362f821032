//! Generic attribute-mapped records exchanged with the remote data service.

use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A typed pointer to another record.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EntityReference {
    pub logical_name: String,
    pub id: Uuid,
    pub name: Option<String>,
}

impl EntityReference {
    pub fn new(logical_name: impl Into<String>, id: Uuid) -> Self {
        Self {
            logical_name: logical_name.into(),
            id,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// A value read through a join, tagged with the join alias and the entity it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasedValue {
    pub alias: String,
    pub entity_name: String,
    pub attribute: String,
    pub value: Value,
}

impl AliasedValue {
    pub fn new(
        alias: impl Into<String>,
        entity_name: impl Into<String>,
        attribute: impl Into<String>,
        value: Value,
    ) -> Self {
        Self {
            alias: alias.into(),
            entity_name: entity_name.into(),
            attribute: attribute.into(),
            value,
        }
    }
}

/// Attribute value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Guid(Uuid),
    OptionSet(i32),
    Reference(EntityReference),
    Aliased(Box<AliasedValue>),
}

impl Value {
    pub fn as_guid(&self) -> Option<Uuid> {
        match self {
            Value::Guid(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<&EntityReference> {
        match self {
            Value::Reference(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_aliased(&self) -> Option<&AliasedValue> {
        match self {
            Value::Aliased(a) => Some(a),
            _ => None,
        }
    }

    /// Strips any alias wrapping, returning the underlying value.
    pub fn unaliased(&self) -> &Value {
        match self {
            Value::Aliased(a) => a.value.unaliased(),
            other => other,
        }
    }

    /// Reads a literal the way FetchXml values are written: ids first, then integers,
    /// anything else stays text. Only canonical integers qualify, so `00123` or
    /// `+5` keep their exact text.
    pub fn from_literal(text: &str) -> Value {
        let trimmed = text.trim();
        let unbraced = trimmed
            .strip_prefix('{')
            .and_then(|s| s.strip_suffix('}'))
            .unwrap_or(trimmed);
        if let Ok(id) = Uuid::parse_str(unbraced) {
            return Value::Guid(id);
        }
        if let Ok(n) = text.parse::<i64>() {
            if n.to_string() == text {
                return Value::Int(n);
            }
        }
        Value::String(text.to_string())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(n) => write!(f, "{}", n),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
            Value::Guid(id) => write!(f, "{}", id),
            Value::OptionSet(n) => write!(f, "{}", n),
            Value::Reference(r) => write!(f, "{}", r.id),
            Value::Aliased(a) => write!(f, "{}", a.value),
        }
    }
}

impl From<Uuid> for Value {
    fn from(id: Uuid) -> Self {
        Value::Guid(id)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<EntityReference> for Value {
    fn from(r: EntityReference) -> Self {
        Value::Reference(r)
    }
}

impl From<AliasedValue> for Value {
    fn from(a: AliasedValue) -> Self {
        Value::Aliased(Box::new(a))
    }
}

/// A row of a result set, or an outgoing write.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Record {
    pub logical_name: String,
    pub id: Option<Uuid>,
    pub attributes: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(logical_name: impl Into<String>) -> Self {
        Self {
            logical_name: logical_name.into(),
            id: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(attribute, value);
        self
    }

    pub fn set(&mut self, attribute: impl Into<String>, value: impl Into<Value>) {
        self.attributes.insert(attribute.into(), value.into());
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.attributes.get(attribute)
    }

    pub fn contains(&self, attribute: &str) -> bool {
        self.attributes.contains_key(attribute)
    }

    /// Reference to this record; a record without an id yields the nil id.
    pub fn to_reference(&self) -> EntityReference {
        EntityReference::new(self.logical_name.clone(), self.id.unwrap_or_else(Uuid::nil))
    }
}
