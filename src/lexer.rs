//! 标记语言的词法分析器
//!
//! 处理 FetchXml 和插件配置所用的 XML 子集。词法分析器在内容模式（文本、CDATA、注释）
//! 与标签模式（名称、`=`、带引号的值）之间切换。注释、`<?...?>` 声明以及 `<!...>`
//! 指令会被跳过。

use crate::token::{Span, Token, TokenKind};

pub struct Lexer<'a> {
    input: &'a str,
    /// 输入字符串中的当前位置（字节索引）
    position: usize,
    /// 位于 `<` / `</` 与 `>` / `/>` 之间时为 true
    in_tag: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer {
            input,
            position: 0,
            in_tag: false,
        }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.position..]
    }

    /// 返回当前位置的字符，不推进位置
    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    /// 推进位置一个字符并返回该字符
    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if let Some(c) = c {
            self.position += c.len_utf8();
        }
        c
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else {
                break;
            }
        }
    }

    /// 跳过 `terminator`，找不到时移动到输入末尾。
    /// 找到时返回终止符的起始位置。
    fn skip_past(&mut self, terminator: &str) -> Option<usize> {
        match self.rest().find(terminator) {
            Some(offset) => {
                let found = self.position + offset;
                self.position = found + terminator.len();
                Some(found)
            }
            None => {
                self.position = self.input.len();
                None
            }
        }
    }

    /// 读取带引号的属性值
    /// 注意：开始的引号已经被调用者消费
    fn read_string(&mut self, start: usize, quote: char) -> Token<'a> {
        let content_start = self.position;
        while let Some(c) = self.peek() {
            if c == quote {
                break;
            }
            self.bump();
        }
        let content_end = self.position;
        if self.bump().is_none() {
            // 值没有结束引号
            return Token {
                kind: TokenKind::Illegal,
                span: Span::new(start, self.position),
            };
        }
        Token {
            kind: TokenKind::String(&self.input[content_start..content_end]),
            span: Span::new(start, self.position),
        }
    }

    /// 元素名和属性名可以包含字母、数字、`-`、`_`、`:` 和 `.`
    fn read_name(&mut self, start: usize) -> Token<'a> {
        while let Some(c) = self.peek() {
            if is_name_char(c) {
                self.bump();
            } else {
                break;
            }
        }
        Token {
            kind: TokenKind::Name(&self.input[start..self.position]),
            span: Span::new(start, self.position),
        }
    }

    fn next_in_tag(&mut self) -> Option<Token<'a>> {
        self.skip_whitespace();
        let start = self.position;
        let c = self.bump()?;

        let token = match c {
            '>' => {
                self.in_tag = false;
                Token { kind: TokenKind::TagClose, span: Span::new(start, self.position) }
            }
            '/' if self.peek() == Some('>') => {
                self.bump();
                self.in_tag = false;
                Token { kind: TokenKind::EmptyClose, span: Span::new(start, self.position) }
            }
            '=' => Token { kind: TokenKind::Eq, span: Span::new(start, self.position) },
            '"' | '\'' => self.read_string(start, c),
            c if is_name_start(c) => self.read_name(start),
            _ => Token { kind: TokenKind::Illegal, span: Span::new(start, self.position) },
        };
        Some(token)
    }

    fn next_in_content(&mut self) -> Option<Token<'a>> {
        loop {
            if self.position >= self.input.len() {
                return None;
            }
            let start = self.position;
            let rest = self.rest();

            if rest.starts_with("<!--") {
                self.position += 4;
                self.skip_past("-->");
                continue;
            }
            if rest.starts_with("<?") {
                self.position += 2;
                self.skip_past("?>");
                continue;
            }
            if rest.starts_with("<![CDATA[") {
                self.position += 9;
                let content_start = self.position;
                return Some(match self.skip_past("]]>") {
                    Some(content_end) => Token {
                        kind: TokenKind::CData(&self.input[content_start..content_end]),
                        span: Span::new(start, self.position),
                    },
                    None => Token {
                        kind: TokenKind::Illegal,
                        span: Span::new(start, self.position),
                    },
                });
            }
            if rest.starts_with("<!") {
                self.position += 2;
                self.skip_past(">");
                continue;
            }
            if rest.starts_with("</") {
                self.position += 2;
                self.in_tag = true;
                return Some(Token { kind: TokenKind::EndOpen, span: Span::new(start, self.position) });
            }
            if rest.starts_with('<') {
                self.position += 1;
                self.in_tag = true;
                return Some(Token { kind: TokenKind::TagOpen, span: Span::new(start, self.position) });
            }

            // 直到下一个标签之前的字符数据
            let end = rest.find('<').map(|i| start + i).unwrap_or(self.input.len());
            self.position = end;
            let text = &self.input[start..end];
            if text.trim().is_empty() {
                continue;
            }
            return Some(Token { kind: TokenKind::Text(text), span: Span::new(start, end) });
        }
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == ':'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '-' | '_' | ':' | '.')
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.in_tag {
            self.next_in_tag()
        } else {
            self.next_in_content()
        }
    }
}
