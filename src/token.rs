//! 标记语法（FetchXml 与插件配置）的 Token 定义

/// Token 是标记文本中的最小单元，包含类型和位置
#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind<'a> {
    // 标签符号
    TagOpen,  // <
    EndOpen,  // </
    TagClose, // >
    EmptyClose, // />
    Eq,       // =

    // 标签内部
    Name(&'a str),
    String(&'a str), // 原始属性值，不含引号，实体尚未解码

    // 标签之间
    Text(&'a str),
    CData(&'a str), // <![CDATA[ ... ]]> 的内容

    /// 标签内的非法字符
    Illegal,
}

/// 输入中的字节范围 `start..end`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}
