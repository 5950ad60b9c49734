//! 실행기 멱등성 가드.
//!
//! PostgreSQL 에는 `ADD CONSTRAINT IF NOT EXISTS` 도, 조건부
//! `ALTER COLUMN ... DROP NOT NULL` 도 없습니다. 이런 문장은 실행 전에
//! information_schema 를 조회해 이미 목표 상태이면 건너뜁니다.

use super::tokens::{split_top_level, tokenize, Cursor, TokenKind};
use super::models::TableRef;

/// 사전 확인이 필요한 문장
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    /// 제약조건이 이미 있으면 건너뜀. `sql` 은 `IF NOT EXISTS` 를 제거한 실행용 문장
    AddConstraint {
        table: TableRef,
        constraint: String,
        sql: String,
    },
    /// 컬럼이 이미 nullable 이면 건너뜀
    DropNotNull { table: TableRef, column: String },
    /// 컬럼이 이미 NOT NULL 이면 건너뜀
    SetNotNull { table: TableRef, column: String },
}

impl Guard {
    pub fn table(&self) -> &TableRef {
        match self {
            Guard::AddConstraint { table, .. }
            | Guard::DropNotNull { table, .. }
            | Guard::SetNotNull { table, .. } => table,
        }
    }
}

/// 단일 동작 ALTER TABLE 문장에서 가드 검출.
///
/// 여러 동작을 쉼표로 묶은 문장은 일부만 건너뛸 수 없으므로 가드하지 않습니다.
pub fn detect_guard(sql: &str) -> Option<Guard> {
    let tokens = tokenize(sql);
    let mut cur = Cursor::new(&tokens);

    if !cur.eat_kws(&["alter", "table"]) {
        return None;
    }
    cur.eat_kws(&["if", "exists"]);
    cur.eat_kw("only");
    let table = cur.qualified_name()?;

    if split_top_level(cur.rest()).len() != 1 {
        return None;
    }

    if cur.eat_kws(&["add", "constraint"]) {
        let if_token = cur.peek().filter(|t| t.is_kw("if")).cloned();
        let has_ine = cur.eat_kws(&["if", "not", "exists"]);
        let name_token = cur.peek().filter(|t| t.is_ident())?.clone();
        let constraint = cur.ident()?;
        // 이름 다음에 제약 본문이 있어야 함
        cur.peek()?;

        let sql = match (has_ine, if_token) {
            (true, Some(if_tok)) => {
                format!("{}{}", &sql[..if_tok.start], &sql[name_token.start..])
            }
            _ => sql.to_string(),
        };
        return Some(Guard::AddConstraint {
            table,
            constraint,
            sql,
        });
    }

    if cur.eat_kw("alter") {
        cur.eat_kw("column");
        let column = cur.ident()?;
        let guard = if cur.eat_kws(&["drop", "not", "null"]) {
            Guard::DropNotNull { table, column }
        } else if cur.eat_kws(&["set", "not", "null"]) {
            Guard::SetNotNull { table, column }
        } else {
            return None;
        };
        // 뒤에 다른 토큰이 붙어 있으면 가드하지 않음
        let trailing = cur
            .rest()
            .iter()
            .any(|t| t.kind != TokenKind::Punct || t.value != ";");
        return (!trailing).then_some(guard);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_constraint_strips_if_not_exists() {
        let guard = detect_guard(
            "ALTER TABLE users ADD CONSTRAINT IF NOT EXISTS users_email_key UNIQUE (email)",
        )
        .unwrap();
        assert_eq!(
            guard,
            Guard::AddConstraint {
                table: TableRef::new("users"),
                constraint: "users_email_key".into(),
                sql: "ALTER TABLE users ADD CONSTRAINT users_email_key UNIQUE (email)".into(),
            }
        );
    }

    #[test]
    fn test_add_constraint_without_if_not_exists_is_unchanged() {
        let sql = "ALTER TABLE public.posts ADD CONSTRAINT \"FK_Author\" FOREIGN KEY (author_id) REFERENCES users(id)";
        match detect_guard(sql).unwrap() {
            Guard::AddConstraint {
                table,
                constraint,
                sql: rewritten,
            } => {
                assert_eq!(table.schema.as_deref(), Some("public"));
                assert_eq!(table.name, "posts");
                assert_eq!(constraint, "FK_Author");
                assert_eq!(rewritten, sql);
            }
            other => panic!("unexpected guard {other:?}"),
        }
    }

    #[test]
    fn test_not_null_guards() {
        assert_eq!(
            detect_guard("ALTER TABLE Posts ALTER COLUMN Scheduled_At DROP NOT NULL"),
            Some(Guard::DropNotNull {
                table: TableRef::new("posts"),
                column: "scheduled_at".into(),
            })
        );
        assert_eq!(
            detect_guard("alter table posts alter title set not null"),
            Some(Guard::SetNotNull {
                table: TableRef::new("posts"),
                column: "title".into(),
            })
        );
    }

    #[test]
    fn test_unguarded_statements() {
        assert_eq!(detect_guard("ALTER TABLE users ADD COLUMN IF NOT EXISTS bio TEXT"), None);
        assert_eq!(detect_guard("CREATE TABLE users (id INT)"), None);
        assert_eq!(
            detect_guard("ALTER TABLE users ALTER COLUMN a DROP NOT NULL, ALTER COLUMN b DROP NOT NULL"),
            None
        );
        assert_eq!(
            detect_guard("ALTER TABLE users ALTER COLUMN a TYPE BIGINT"),
            None
        );
    }
}
