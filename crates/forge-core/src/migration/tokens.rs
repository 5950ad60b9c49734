//! 단일 SQL 문장 토크나이저.
//!
//! 실행기 가드 검출과 메모리 백엔드의 DDL 해석에서 사용합니다. 문장 분리는
//! [`super::lexer`] 가 담당하고, 여기서는 이미 분리된 문장 하나를 토큰으로
//! 나눕니다. 각 토큰은 원본 SQL 의 바이트 범위를 가지므로 원문을 부분적으로
//! 다시 쓸 수 있습니다.

use super::models::TableRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TokenKind {
    /// 키워드 또는 따옴표 없는 식별자 (소문자로 정규화)
    Word,
    /// `"..."` 식별자 (대소문자 유지)
    QuotedIdent,
    /// 문자열/숫자/달러 인용 리터럴
    Literal,
    LParen,
    RParen,
    Comma,
    Dot,
    Punct,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub value: String,
    pub start: usize,
    pub end: usize,
}

impl Token {
    /// 키워드 일치 (따옴표 식별자는 키워드가 아님)
    pub fn is_kw(&self, kw: &str) -> bool {
        self.kind == TokenKind::Word && self.value == kw
    }

    pub fn is_ident(&self) -> bool {
        matches!(self.kind, TokenKind::Word | TokenKind::QuotedIdent)
    }
}

pub(crate) fn tokenize(sql: &str) -> Vec<Token> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        let start = i;

        match c {
            b' ' | b'\t' | b'\r' | b'\n' => i += 1,
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let mut depth = 0usize;
                while i < bytes.len() {
                    if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
                        depth += 1;
                        i += 2;
                    } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
                        depth -= 1;
                        i += 2;
                        if depth == 0 {
                            break;
                        }
                    } else {
                        i += 1;
                    }
                }
            }
            b'\'' => {
                i = skip_quoted(bytes, i, b'\'', false);
                tokens.push(token(TokenKind::Literal, &sql[start..i], start, i));
            }
            b'"' => {
                i = skip_quoted(bytes, i, b'"', false);
                let inner = &sql[start + 1..i.saturating_sub(1).max(start + 1)];
                tokens.push(token(
                    TokenKind::QuotedIdent,
                    &inner.replace("\"\"", "\""),
                    start,
                    i,
                ));
            }
            b'$' => match dollar_tag(sql, i) {
                Some(tag) => {
                    let body_start = i + tag.len();
                    i = match sql[body_start..].find(&tag) {
                        Some(off) => body_start + off + tag.len(),
                        None => bytes.len(),
                    };
                    tokens.push(token(TokenKind::Literal, &sql[start..i], start, i));
                }
                None => {
                    i += 1;
                    while i < bytes.len() && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                    tokens.push(token(TokenKind::Literal, &sql[start..i], start, i));
                }
            },
            b'(' => {
                i += 1;
                tokens.push(token(TokenKind::LParen, "(", start, i));
            }
            b')' => {
                i += 1;
                tokens.push(token(TokenKind::RParen, ")", start, i));
            }
            b',' => {
                i += 1;
                tokens.push(token(TokenKind::Comma, ",", start, i));
            }
            b'.' => {
                i += 1;
                tokens.push(token(TokenKind::Dot, ".", start, i));
            }
            c if c.is_ascii_digit() => {
                while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                    i += 1;
                }
                tokens.push(token(TokenKind::Literal, &sql[start..i], start, i));
            }
            c if is_word_byte(c) => {
                while i < bytes.len() && (is_word_byte(bytes[i]) || bytes[i] == b'$') {
                    i += 1;
                }
                let word = &sql[start..i];
                // E'...' 이스케이프 문자열
                if word.eq_ignore_ascii_case("e") && bytes.get(i) == Some(&b'\'') {
                    i = skip_quoted(bytes, i, b'\'', true);
                    tokens.push(token(TokenKind::Literal, &sql[start..i], start, i));
                } else {
                    tokens.push(token(TokenKind::Word, &word.to_lowercase(), start, i));
                }
            }
            _ => {
                // 멀티바이트 문자도 한 글자 단위로 처리
                let ch_len = sql[i..].chars().next().map(char::len_utf8).unwrap_or(1);
                i += ch_len;
                tokens.push(token(TokenKind::Punct, &sql[start..i], start, i));
            }
        }
    }

    tokens
}

fn token(kind: TokenKind, value: &str, start: usize, end: usize) -> Token {
    Token {
        kind,
        value: value.to_string(),
        start,
        end,
    }
}

fn is_word_byte(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_' || c >= 0x80
}

/// 닫는 따옴표 다음 위치 (닫히지 않으면 끝)
fn skip_quoted(bytes: &[u8], open: usize, quote: u8, backslash: bool) -> usize {
    let mut i = open + 1;
    while i < bytes.len() {
        if backslash && bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// `$tag$` 구분자 (없으면 None)
fn dollar_tag(sql: &str, at: usize) -> Option<String> {
    let rest = &sql[at + 1..];
    let end = rest.find('$')?;
    let tag = &rest[..end];
    let valid = tag.chars().all(|c| c.is_alphanumeric() || c == '_')
        && !tag.starts_with(|c: char| c.is_ascii_digit());
    valid.then(|| format!("${}$", tag))
}

/// 최상위 쉼표 기준 분할
pub(crate) fn split_top_level(tokens: &[Token]) -> Vec<&[Token]> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut begin = 0;
    for (i, t) in tokens.iter().enumerate() {
        match t.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth -= 1,
            TokenKind::Comma if depth == 0 => {
                parts.push(&tokens[begin..i]);
                begin = i + 1;
            }
            _ => {}
        }
    }
    if begin < tokens.len() {
        parts.push(&tokens[begin..]);
    }
    parts
}

/// 토큰 커서
pub(crate) struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(tokens: &'a [Token]) -> Self {
        Self { tokens, pos: 0 }
    }

    pub fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    pub fn peek_kw(&self, kw: &str) -> bool {
        self.peek().is_some_and(|t| t.is_kw(kw))
    }

    #[cfg(any(test, feature = "testing"))]
    pub fn bump(&mut self) -> Option<&'a Token> {
        let t = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(t)
    }

    /// 키워드 하나 소비
    pub fn eat_kw(&mut self, kw: &str) -> bool {
        if self.peek_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// 키워드 나열을 모두 일치할 때만 소비
    pub fn eat_kws(&mut self, kws: &[&str]) -> bool {
        let matches = kws
            .iter()
            .enumerate()
            .all(|(i, kw)| self.tokens.get(self.pos + i).is_some_and(|t| t.is_kw(kw)));
        if matches {
            self.pos += kws.len();
        }
        matches
    }

    /// 식별자 하나
    pub fn ident(&mut self) -> Option<String> {
        match self.peek() {
            Some(t) if t.is_ident() => {
                self.pos += 1;
                Some(t.value.clone())
            }
            _ => None,
        }
    }

    /// `schema.name` 또는 `name`
    pub fn qualified_name(&mut self) -> Option<TableRef> {
        let first = self.ident()?;
        if self.peek().is_some_and(|t| t.kind == TokenKind::Dot) {
            self.pos += 1;
            let name = self.ident()?;
            Some(TableRef {
                schema: Some(first),
                name,
            })
        } else {
            Some(TableRef::new(first))
        }
    }

    /// 남은 토큰
    pub fn rest(&self) -> &'a [Token] {
        &self.tokens[self.pos.min(self.tokens.len())..]
    }
}
