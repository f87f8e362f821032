//! 标记语言的语法分析器
//!
//! ## 解析流程图
//!
//! ```text
//! parse()
//!   └─ parse_element()
//!        ├─ 期望 '<' 和元素名
//!        ├─ parse_attributes()   解析 name = "value"，直到 '>' 或 '/>'
//!        ├─ '/>' → 空元素，结束
//!        └─ '>'  → parse_content()
//!                   ├─ Text / CDATA → Node::Text
//!                   ├─ '<'          → parse_element() (递归)
//!                   └─ '</'         → 期望匹配的名称和 '>'
//! ```
//!
//! 只接受一个根元素。属性值和文本中的实体引用（`&lt;`、`&amp;`、`&#38;` 等）会被解码。

use crate::token::{Span, Token, TokenKind};
use thiserror::Error;

/// 解析得到的元素
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Element(Element),
    Text(String),
}

impl Element {
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    /// 元素内所有文本和 CDATA 内容拼接的结果，不去除空白
    pub fn text(&self) -> String {
        let mut text = String::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                text.push_str(t);
            }
        }
        text
    }
}

pub struct Parser<'a> {
    tokens: &'a [Token<'a>],
    position: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}{}", .span.map(|s| format!(" at {}", s)).unwrap_or_default())]
pub struct ParseError {
    pub message: String,
    pub span: Option<Span>,
}

impl ParseError {
    fn new(message: String, span: Option<Span>) -> Self {
        Self { message, span }
    }

    fn at_position(message: String, span: Span) -> Self {
        Self {
            message,
            span: Some(span),
        }
    }
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token<'a>]) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    /// 返回当前 token，不推进位置
    fn peek(&self) -> Option<&'a Token<'a>> {
        self.tokens.get(self.position)
    }

    /// 返回当前 token 并推进位置
    fn advance(&mut self) -> Option<&'a Token<'a>> {
        let token = self.tokens.get(self.position)?;
        self.position += 1;
        Some(token)
    }

    /// 期望指定类型的 token 并推进位置，否则返回错误
    fn expect(&mut self, expected: TokenKind) -> Result<&'a Token<'a>, ParseError> {
        match self.peek() {
            Some(token) if std::mem::discriminant(&token.kind) == std::mem::discriminant(&expected) => {
                self.position += 1;
                Ok(token)
            }
            Some(token) => Err(ParseError::at_position(
                format!("Expected {:?}, found {:?}", expected, token.kind),
                token.span,
            )),
            None => Err(ParseError::new(
                format!("Expected {:?}, but reached end of input", expected),
                None,
            )),
        }
    }

    fn expect_name(&mut self) -> Result<(&'a str, Span), ParseError> {
        let token = self.expect(TokenKind::Name(""))?;
        match token.kind {
            TokenKind::Name(name) => Ok((name, token.span)),
            _ => Err(ParseError::at_position("Expected a name".to_string(), token.span)),
        }
    }

    /// 解析唯一的根元素，其前后只允许空白、注释和声明
    pub fn parse(&mut self) -> Result<Element, ParseError> {
        let root = self.parse_element()?;
        if let Some(token) = self.peek() {
            return Err(ParseError::at_position(
                format!("Unexpected content after root element: {:?}", token.kind),
                token.span,
            ));
        }
        Ok(root)
    }

    fn parse_element(&mut self) -> Result<Element, ParseError> {
        self.expect(TokenKind::TagOpen)?;
        let (name, _) = self.expect_name()?;
        let attributes = self.parse_attributes()?;

        let mut element = Element {
            name: name.to_string(),
            attributes,
            children: Vec::new(),
        };

        let Some(token) = self.advance() else {
            return Err(ParseError::new(format!("Unclosed tag <{}>", name), None));
        };
        match token.kind {
            TokenKind::EmptyClose => return Ok(element),
            TokenKind::TagClose => {}
            ref other => {
                return Err(ParseError::at_position(
                    format!("Expected '>' or '/>', found {:?}", other),
                    token.span,
                ))
            }
        }

        self.parse_content(&mut element)?;
        Ok(element)
    }

    fn parse_attributes(&mut self) -> Result<Vec<(String, String)>, ParseError> {
        let mut attributes = Vec::new();
        while let Some(token) = self.peek() {
            match token.kind {
                TokenKind::Name(_) => {
                    let (key, key_span) = self.expect_name()?;
                    self.expect(TokenKind::Eq)?;
                    let value_token = self.expect(TokenKind::String(""))?;
                    let TokenKind::String(raw) = value_token.kind else {
                        return Err(ParseError::at_position(
                            "Expected attribute value".to_string(),
                            value_token.span,
                        ));
                    };
                    if attributes.iter().any(|(k, _): &(String, String)| k == key) {
                        return Err(ParseError::at_position(
                            format!("Duplicate attribute '{}'", key),
                            key_span,
                        ));
                    }
                    attributes.push((key.to_string(), decode_entities(raw)));
                }
                _ => break,
            }
        }
        Ok(attributes)
    }

    /// 解析子节点，直到（并包括）匹配的结束标签
    fn parse_content(&mut self, element: &mut Element) -> Result<(), ParseError> {
        loop {
            let Some(token) = self.peek() else {
                return Err(ParseError::new(
                    format!("Missing end tag </{}>", element.name),
                    None,
                ));
            };
            match token.kind {
                TokenKind::Text(text) => {
                    element.children.push(Node::Text(decode_entities(text)));
                    self.advance();
                }
                TokenKind::CData(text) => {
                    element.children.push(Node::Text(text.to_string()));
                    self.advance();
                }
                TokenKind::TagOpen => {
                    let child = self.parse_element()?;
                    element.children.push(Node::Element(child));
                }
                TokenKind::EndOpen => {
                    self.advance();
                    let (name, span) = self.expect_name()?;
                    if name != element.name {
                        return Err(ParseError::at_position(
                            format!("Mismatched end tag </{}>, expected </{}>", name, element.name),
                            span,
                        ));
                    }
                    self.expect(TokenKind::TagClose)?;
                    return Ok(());
                }
                ref other => {
                    return Err(ParseError::at_position(
                        format!("Unexpected token: {:?}", other),
                        token.span,
                    ))
                }
            }
        }
    }
}

/// Lexes and parses a markup document into its root element.
pub fn parse_markup(input: &str) -> Result<Element, ParseError> {
    let tokens: Vec<_> = crate::lexer::Lexer::new(input).collect();
    Parser::new(&tokens).parse()
}

/// Decodes the predefined entities and numeric character references.
/// Unknown references are kept as written.
pub fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp..];
        let Some(semi) = after.find(';') else {
            out.push_str(after);
            return out;
        };
        let entity = &after[1..semi];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            _ => entity
                .strip_prefix("#x")
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };
        match decoded {
            Some(c) => out.push(c),
            None => out.push_str(&after[..=semi]),
        }
        rest = &after[semi + 1..];
    }
    out.push_str(rest);
    out
}

/// Escapes text for use inside a double-quoted attribute value or element content.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
