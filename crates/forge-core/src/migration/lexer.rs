//! SQL 문장 분리기.
//!
//! 최상위 `;` 에서 문장을 나눕니다. 주석(`--`, 중첩 `/* */`), 문자열(`'...'`,
//! `E'...'`), 따옴표 식별자(`"..."`), 달러 인용 본문(`$$`, `$tag$`) 안의 `;` 는
//! 무시합니다. 입력이 어떤 상태로 끝났는지도 함께 반환하여 잘린 파일을
//! 검출할 수 있게 합니다.

/// 분리된 원본 문장
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawStatement {
    /// 문장 SQL (앞쪽 주석/공백과 끝 `;` 제외)
    pub sql: String,
    /// 시작 라인 (1-based)
    pub line: usize,
    /// 종료 라인 (1-based)
    pub end_line: usize,
}

/// 입력 종료 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitEnd {
    /// 모든 문장이 `;` 로 끝남
    Clean,
    /// 달러 인용 블록이 닫히지 않음
    DollarQuote { tag: String, line: usize },
    /// 문자열/식별자/블록 주석이 닫히지 않음
    Unterminated { kind: &'static str, line: usize },
    /// 마지막 문장이 `;` 없이 끝남
    Fragment { line: usize, tail: String },
}

/// 분리 결과
#[derive(Debug, Clone)]
pub struct SplitResult {
    pub statements: Vec<RawStatement>,
    pub end: SplitEnd,
}

/// SQL 텍스트를 문장 단위로 분리
pub fn split_statements(input: &str) -> SplitResult {
    Lexer::new(input).run()
}

/// 달러 인용 구분자에 쓸 수 있는 문자인지
fn is_tag_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    current: String,
    start_line: Option<usize>,
    statements: Vec<RawStatement>,
}

impl Lexer {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
            line: 1,
            current: String::new(),
            start_line: None,
            statements: Vec::new(),
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    /// 현재 문자를 소비 (문장이 시작된 경우에만 기록)
    fn bump(&mut self) -> char {
        let c = self.chars[self.pos];
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
        }
        if self.start_line.is_some() {
            self.current.push(c);
        }
        c
    }

    fn start_statement(&mut self) {
        if self.start_line.is_none() {
            self.start_line = Some(self.line);
        }
    }

    fn finish_statement(&mut self) {
        if let Some(line) = self.start_line.take() {
            let sql = self.current.trim().to_string();
            if !sql.is_empty() {
                self.statements.push(RawStatement {
                    sql,
                    line,
                    end_line: self.line,
                });
            }
        }
        self.current.clear();
    }

    fn run(mut self) -> SplitResult {
        while self.pos < self.chars.len() {
            let c = self.chars[self.pos];
            let next = self.peek(1);

            let outcome = match c {
                '-' if next == Some('-') => {
                    self.skip_line_comment();
                    None
                }
                '/' if next == Some('*') => self.skip_block_comment(),
                '\'' => {
                    self.start_statement();
                    let escapes = self.is_escape_string_prefix();
                    self.read_quoted('\'', escapes, "string literal")
                }
                '"' => {
                    self.start_statement();
                    self.read_quoted('"', false, "quoted identifier")
                }
                '$' => {
                    self.start_statement();
                    match self.dollar_tag() {
                        Some(tag) => self.read_dollar_body(&tag),
                        None => {
                            self.bump();
                            None
                        }
                    }
                }
                ';' => {
                    self.pos += 1;
                    self.finish_statement();
                    None
                }
                c if c.is_whitespace() => {
                    self.bump();
                    None
                }
                _ => {
                    self.start_statement();
                    self.bump();
                    None
                }
            };

            if let Some(end) = outcome {
                return SplitResult {
                    statements: self.statements,
                    end,
                };
            }
        }

        let end = match self.start_line {
            Some(line) if !self.current.trim().is_empty() => SplitEnd::Fragment {
                line,
                tail: tail_of(&self.current),
            },
            _ => SplitEnd::Clean,
        };

        SplitResult {
            statements: self.statements,
            end,
        }
    }

    fn skip_line_comment(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos] != '\n' {
            self.bump();
        }
    }

    /// PostgreSQL 블록 주석은 중첩 가능
    fn skip_block_comment(&mut self) -> Option<SplitEnd> {
        let open_line = self.line;
        let mut depth = 0usize;
        while self.pos < self.chars.len() {
            match (self.chars[self.pos], self.peek(1)) {
                ('/', Some('*')) => {
                    self.bump();
                    self.bump();
                    depth += 1;
                }
                ('*', Some('/')) => {
                    self.bump();
                    self.bump();
                    depth -= 1;
                    if depth == 0 {
                        return None;
                    }
                }
                _ => {
                    self.bump();
                }
            }
        }
        Some(SplitEnd::Unterminated {
            kind: "block comment",
            line: open_line,
        })
    }

    /// 직전 문자가 단독 `E`/`e` 이면 백슬래시 이스케이프 문자열
    fn is_escape_string_prefix(&self) -> bool {
        let mut prev = self.current.chars().rev();
        match prev.next() {
            Some('e') | Some('E') => !prev.next().is_some_and(is_tag_char),
            _ => false,
        }
    }

    fn read_quoted(
        &mut self,
        quote: char,
        backslash_escapes: bool,
        kind: &'static str,
    ) -> Option<SplitEnd> {
        let open_line = self.line;
        self.bump();
        while self.pos < self.chars.len() {
            let c = self.bump();
            if backslash_escapes && c == '\\' {
                if self.pos < self.chars.len() {
                    self.bump();
                }
                continue;
            }
            if c == quote {
                // '' 또는 "" 는 이스케이프된 따옴표
                if self.peek(0) == Some(quote) {
                    self.bump();
                    continue;
                }
                return None;
            }
        }
        Some(SplitEnd::Unterminated {
            kind,
            line: open_line,
        })
    }

    /// `$tag$` 또는 `$$` 여는 구분자의 태그 추출 (`$1` 같은 파라미터는 제외)
    fn dollar_tag(&self) -> Option<String> {
        if self.current.chars().last().is_some_and(is_tag_char) {
            return None;
        }
        let mut tag = String::new();
        let mut offset = 1;
        loop {
            let c = self.peek(offset)?;
            if c == '$' {
                return Some(tag);
            }
            if !is_tag_char(c) || (tag.is_empty() && c.is_ascii_digit()) {
                return None;
            }
            tag.push(c);
            offset += 1;
        }
    }

    fn read_dollar_body(&mut self, tag: &str) -> Option<SplitEnd> {
        let open_line = self.line;
        let delimiter: Vec<char> = format!("${}$", tag).chars().collect();

        for _ in 0..delimiter.len() {
            self.bump();
        }

        while self.pos < self.chars.len() {
            if self.chars[self.pos..].starts_with(&delimiter) {
                for _ in 0..delimiter.len() {
                    self.bump();
                }
                return None;
            }
            self.bump();
        }

        Some(SplitEnd::DollarQuote {
            tag: format!("${}$", tag),
            line: open_line,
        })
    }
}

/// 잘린 문장의 마지막 줄 (최대 80자)
fn tail_of(fragment: &str) -> String {
    let last = fragment
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("");
    let count = last.chars().count();
    if count > 80 {
        last.chars().skip(count - 80).collect()
    } else {
        last.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sqls(input: &str) -> Vec<String> {
        split_statements(input)
            .statements
            .into_iter()
            .map(|s| s.sql)
            .collect()
    }

    #[test]
    fn test_splits_on_top_level_semicolons() {
        let input = "-- header\nCREATE TABLE users (id INT);\n\nINSERT INTO users VALUES (1);\n";
        let result = split_statements(input);
        assert_eq!(result.end, SplitEnd::Clean);
        assert_eq!(result.statements.len(), 2);
        assert_eq!(result.statements[0].sql, "CREATE TABLE users (id INT)");
        assert_eq!(result.statements[0].line, 2);
        assert_eq!(result.statements[1].line, 4);
    }

    #[test]
    fn test_ignores_semicolons_in_strings_and_comments() {
        let input = "INSERT INTO notes VALUES ('a;b', 'it''s; fine'); /* x; y */\n\
                     SELECT \"odd;name\" FROM t; -- trailing; comment\n";
        assert_eq!(
            sqls(input),
            vec![
                "INSERT INTO notes VALUES ('a;b', 'it''s; fine')",
                "SELECT \"odd;name\" FROM t",
            ]
        );
    }

    #[test]
    fn test_escape_string_backslash_quote() {
        let input = "INSERT INTO t VALUES (E'it\\'s; here');\nSELECT 1;";
        assert_eq!(sqls(input).len(), 2);
    }

    #[test]
    fn test_dollar_quoted_do_block() {
        let input = r#"
DO $$
BEGIN
    IF NOT EXISTS (SELECT 1 FROM information_schema.table_constraints
                   WHERE constraint_name = 'users_email_key') THEN
        ALTER TABLE users ADD CONSTRAINT users_email_key UNIQUE (email);
    END IF;
END
$$;
CREATE FUNCTION touch() RETURNS trigger AS $body$ BEGIN NEW.updated_at := now(); RETURN NEW; END; $body$ LANGUAGE plpgsql;
"#;
        let result = split_statements(input);
        assert_eq!(result.end, SplitEnd::Clean);
        assert_eq!(result.statements.len(), 2);
        assert!(result.statements[0].sql.starts_with("DO $$"));
        assert!(result.statements[0].sql.ends_with("$$"));
        assert_eq!(result.statements[0].line, 2);
        assert!(result.statements[1].sql.contains("$body$ LANGUAGE plpgsql"));
    }

    #[test]
    fn test_positional_parameter_is_not_a_quote() {
        let input = "PREPARE q AS SELECT $1::int; SELECT 2;";
        let result = split_statements(input);
        assert_eq!(result.end, SplitEnd::Clean);
        assert_eq!(result.statements.len(), 2);
    }

    #[test]
    fn test_truncated_information_schema_check() {
        let input = "ALTER TABLE posts ADD COLUMN IF NOT EXISTS slug TEXT;\n\
                     DO $$ BEGIN END $$;\n\
                     SELECT CASE WHEN NOT EXISTS (SELECT 1 FROM informat";
        let result = split_statements(input);
        assert_eq!(result.statements.len(), 2);
        match result.end {
            SplitEnd::Fragment { line, tail } => {
                assert_eq!(line, 3);
                assert!(tail.ends_with("SELECT 1 FROM informat"));
            }
            other => panic!("unexpected end state: {:?}", other),
        }
    }

    #[test]
    fn test_unbalanced_dollar_quote() {
        let input = "DO $$\nBEGIN\n  PERFORM 1;\nEND;\n";
        let result = split_statements(input);
        assert_eq!(
            result.end,
            SplitEnd::DollarQuote {
                tag: "$$".to_string(),
                line: 1
            }
        );
    }

    #[test]
    fn test_unterminated_literal_and_comment() {
        let result = split_statements("INSERT INTO t VALUES ('oops);");
        assert!(matches!(
            result.end,
            SplitEnd::Unterminated {
                kind: "string literal",
                ..
            }
        ));

        let result = split_statements("SELECT 1; /* outer /* inner */ still open");
        assert!(matches!(
            result.end,
            SplitEnd::Unterminated {
                kind: "block comment",
                ..
            }
        ));
    }

    #[test]
    fn test_comment_only_input_is_clean_and_empty() {
        let result = split_statements("-- nothing here\n/* still nothing */\n");
        assert_eq!(result.end, SplitEnd::Clean);
        assert!(result.statements.is_empty());
    }
}
