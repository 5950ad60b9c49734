//! SQL 마이그레이션 문장 분석기.
//!
//! 분리된 문장의 유형과 대상 객체, 멱등성 가드 사용 여부, 참조 객체를
//! 추출하고 카탈로그 전체의 의존성 그래프를 생성합니다.

use std::collections::{HashMap, HashSet};

use super::lexer::{split_statements, RawStatement};
use super::models::*;

/// 마이그레이션 문장 분석기
#[derive(Debug)]
pub struct MigrationAnalyzer {
    /// 시스템 테이블/함수/타입 (의존성에서 제외)
    system_objects: HashSet<String>,
}

impl Default for MigrationAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl MigrationAnalyzer {
    /// 새 분석기 생성
    pub fn new() -> Self {
        let mut system_objects = HashSet::new();

        for obj in [
            // 시스템 함수
            "now",
            "current_timestamp",
            "gen_random_uuid",
            "coalesce",
            "nullif",
            "greatest",
            "least",
            "count",
            "sum",
            "avg",
            "min",
            "max",
            "array_agg",
            "string_agg",
            "jsonb_agg",
            "row_number",
            "unnest",
            "generate_series",
            // 시스템 스키마
            "information_schema",
            "pg_catalog",
            "pg_constraint",
            "pg_class",
            "pg_type",
            "pg_indexes",
            // 시스템 타입
            "uuid",
            "text",
            "varchar",
            "integer",
            "bigint",
            "smallint",
            "numeric",
            "boolean",
            "timestamp",
            "timestamptz",
            "date",
            "interval",
            "jsonb",
            "json",
            "bytea",
            "serial",
            "bigserial",
        ] {
            system_objects.insert(obj.to_string());
        }

        Self { system_objects }
    }

    /// SQL 텍스트를 분리하고 분석 (종료 상태 검사는 카탈로그 담당)
    pub fn parse_statements(&self, content: &str) -> Vec<SqlStatement> {
        split_statements(content)
            .statements
            .iter()
            .map(|raw| self.analyze(raw))
            .collect()
    }

    /// 단일 문장 분석
    pub fn analyze(&self, raw: &RawStatement) -> SqlStatement {
        let sql = raw.sql.as_str();
        let sql_upper = sql.to_ascii_uppercase();
        let words: Vec<&str> = sql_upper
            .split(|c: char| c.is_whitespace() || c == '(')
            .filter(|w| !w.is_empty())
            .take(8)
            .collect();

        let (stmt_type, object_name) = self.detect_statement_type(&words, &sql_upper, sql);

        let mut stmt = SqlStatement::new(stmt_type, object_name, sql.to_string(), raw.line);
        stmt.end_line_number = raw.end_line;

        stmt.if_not_exists = sql_upper.contains("IF NOT EXISTS");
        stmt.if_exists = sql_upper.contains("IF EXISTS");
        stmt.concurrently = words.contains(&"CONCURRENTLY");

        // DDL CASCADE (DROP ... CASCADE) 와 FK CASCADE (ON DELETE/UPDATE CASCADE) 구분
        if sql_upper.contains("CASCADE") {
            stmt.fk_cascade =
                sql_upper.contains("ON DELETE CASCADE") || sql_upper.contains("ON UPDATE CASCADE");
            stmt.cascade = sql_upper
                .replace("ON DELETE CASCADE", "")
                .replace("ON UPDATE CASCADE", "")
                .contains("CASCADE");
        }

        if stmt.statement_type != StatementType::DoBlock {
            stmt.references = self.extract_references(&sql_upper, sql);
            let own = stmt.object_name.clone();
            stmt.references.retain(|r| r != &own);
        }

        stmt
    }

    /// 문장 유형 및 대상 객체 검출 (선두 키워드 기준)
    fn detect_statement_type(
        &self,
        words: &[&str],
        sql_upper: &str,
        sql: &str,
    ) -> (StatementType, String) {
        let first = words.first().copied().unwrap_or("");

        match first {
            "CREATE" => self.detect_create(words, sql),
            "DROP" => self.detect_drop(words, sql),
            "ALTER" if words.get(1) == Some(&"TABLE") => (
                StatementType::AlterTable,
                self.extract_after(sql, &["ALTER TABLE IF EXISTS ONLY", "ALTER TABLE IF EXISTS", "ALTER TABLE ONLY", "ALTER TABLE"])
                    .unwrap_or_default(),
            ),
            "INSERT" => (
                StatementType::Insert,
                self.extract_after(sql, &["INSERT INTO"]).unwrap_or_default(),
            ),
            "UPDATE" => (
                StatementType::Update,
                self.extract_after(sql, &["UPDATE ONLY", "UPDATE"])
                    .unwrap_or_default(),
            ),
            "DELETE" => (
                StatementType::Delete,
                self.extract_after(sql, &["DELETE FROM ONLY", "DELETE FROM"])
                    .unwrap_or_default(),
            ),
            "DO" => (StatementType::DoBlock, String::new()),
            "BEGIN" | "COMMIT" | "ROLLBACK" | "END" | "START" => {
                (StatementType::TransactionControl, String::new())
            }
            _ if sql_upper.trim().is_empty() => (StatementType::Other(String::new()), String::new()),
            other => (StatementType::Other(other.to_string()), String::new()),
        }
    }

    fn detect_create(&self, words: &[&str], sql: &str) -> (StatementType, String) {
        // CREATE [OR REPLACE] [UNIQUE] [TEMP] [MATERIALIZED] <kind>
        let kind_words: Vec<&str> = words
            .iter()
            .skip(1)
            .copied()
            .filter(|w| !matches!(*w, "OR" | "REPLACE" | "UNIQUE" | "TEMP" | "TEMPORARY" | "UNLOGGED"))
            .collect();
        let kind = kind_words.first().copied().unwrap_or("");

        let name_after = |keyword: &str| {
            self.extract_object_name(sql, keyword).unwrap_or_default()
        };

        match kind {
            "TABLE" => (StatementType::CreateTable, name_after("TABLE")),
            "VIEW" => (StatementType::CreateView, name_after("VIEW")),
            "MATERIALIZED" => (
                StatementType::CreateMaterializedView,
                name_after("MATERIALIZED VIEW"),
            ),
            "INDEX" => (
                StatementType::CreateIndex,
                self.extract_index_name(sql).unwrap_or_default(),
            ),
            "FUNCTION" | "PROCEDURE" => (
                StatementType::CreateFunction,
                self.extract_routine_name(sql, kind).unwrap_or_default(),
            ),
            "TRIGGER" | "CONSTRAINT" => (StatementType::CreateTrigger, name_after("TRIGGER")),
            "TYPE" => (StatementType::CreateType, name_after("TYPE")),
            "EXTENSION" => (StatementType::CreateExtension, name_after("EXTENSION")),
            other => (StatementType::Other(format!("CREATE {}", other)), String::new()),
        }
    }

    fn detect_drop(&self, words: &[&str], sql: &str) -> (StatementType, String) {
        let kind = words.get(1).copied().unwrap_or("");
        let drop_name = |keyword: &str| {
            self.extract_after(
                sql,
                &[
                    &format!("DROP {} IF EXISTS", keyword),
                    &format!("DROP {} CONCURRENTLY IF EXISTS", keyword),
                    &format!("DROP {} CONCURRENTLY", keyword),
                    &format!("DROP {}", keyword),
                ],
            )
            .unwrap_or_default()
        };

        match kind {
            "TABLE" => (StatementType::DropTable, drop_name("TABLE")),
            "VIEW" => (StatementType::DropView, drop_name("VIEW")),
            "MATERIALIZED" => (
                StatementType::DropMaterializedView,
                drop_name("MATERIALIZED VIEW"),
            ),
            "INDEX" => (StatementType::DropIndex, drop_name("INDEX")),
            "FUNCTION" | "PROCEDURE" => (StatementType::DropFunction, drop_name(kind)),
            "TRIGGER" => (StatementType::DropTrigger, drop_name("TRIGGER")),
            "TYPE" => (StatementType::DropType, drop_name("TYPE")),
            other => (StatementType::Other(format!("DROP {}", other)), String::new()),
        }
    }

    /// CREATE ... <keyword> [IF NOT EXISTS] name
    fn extract_object_name(&self, sql: &str, keyword: &str) -> Option<String> {
        let pattern_ine = format!("{} IF NOT EXISTS", keyword);
        self.extract_after(sql, &[&pattern_ine, keyword])
    }

    /// 패턴 목록 중 처음 일치하는 것 바로 뒤의 식별자
    fn extract_after(&self, sql: &str, patterns: &[&str]) -> Option<String> {
        let normalized = normalize_whitespace(sql);
        let upper = normalized.to_ascii_uppercase();

        for pattern in patterns {
            if let Some(pos) = find_keyword(&upper, pattern) {
                let after = &normalized[pos + pattern.len()..];
                let name = after
                    .split(|c: char| c.is_whitespace() || c == '(' || c == ';' || c == ',')
                    .find(|s| !s.is_empty())?;
                let cleaned = self.clean_object_name(name);
                if !cleaned.is_empty() {
                    return Some(cleaned);
                }
            }
        }

        None
    }

    /// 인덱스명 추출 (이름 없는 인덱스는 None)
    fn extract_index_name(&self, sql: &str) -> Option<String> {
        let name = self.extract_after(
            sql,
            &[
                "INDEX CONCURRENTLY IF NOT EXISTS",
                "INDEX IF NOT EXISTS",
                "INDEX CONCURRENTLY",
                "INDEX",
            ],
        )?;
        if name == "on" {
            None
        } else {
            Some(name)
        }
    }

    /// 함수/프로시저명은 ( 전까지
    fn extract_routine_name(&self, sql: &str, kind: &str) -> Option<String> {
        let upper = sql.to_ascii_uppercase();
        let pos = find_keyword(&upper, kind)?;
        let after = &sql[pos + kind.len()..];
        let name = after.split('(').next()?.trim();
        Some(self.clean_object_name(name))
    }

    /// 객체명 정리 (스키마 prefix 제거, 따옴표 제거, 소문자 변환)
    fn clean_object_name(&self, name: &str) -> String {
        let name = name.rsplit('.').next().unwrap_or(name);
        name.trim_matches(|c: char| c == '"' || c == '\'' || c == ';' || c == ')')
            .to_lowercase()
    }

    /// SQL에서 참조 객체 추출 (FROM, JOIN, REFERENCES, ON)
    fn extract_references(&self, sql_upper: &str, sql: &str) -> Vec<String> {
        let mut refs = HashSet::new();

        for keyword in ["FROM ", "JOIN ", "REFERENCES "] {
            for (pos, _) in sql_upper.match_indices(keyword) {
                let after = &sql[pos + keyword.len()..];
                self.push_reference(after, &mut refs);
            }
        }

        // CREATE INDEX ... ON table_name / CREATE TRIGGER ... ON table_name
        if sql_upper.starts_with("CREATE") && (sql_upper.contains(" INDEX ") || sql_upper.contains(" TRIGGER ")) {
            for (pos, _) in sql_upper.match_indices(" ON ") {
                let after = &sql[pos + 4..];
                self.push_reference(after, &mut refs);
            }
        }

        let mut refs: Vec<String> = refs.into_iter().collect();
        refs.sort();
        refs
    }

    fn push_reference(&self, after: &str, refs: &mut HashSet<String>) {
        let Some(token) = after
            .split(|c: char| c == '(' || c == ',' || c == ')' || c.is_whitespace())
            .find(|s| !s.is_empty())
        else {
            return;
        };
        // information_schema.columns 처럼 시스템 스키마로 한정된 이름은 제외
        if let Some((schema, _)) = token.split_once('.') {
            if self.system_objects.contains(&schema.trim_matches('"').to_lowercase()) {
                return;
            }
        }
        let clean = self.clean_object_name(token);
        let is_identifier = clean
            .chars()
            .next()
            .is_some_and(|c| c.is_alphabetic() || c == '_');
        if is_identifier
            && !self.system_objects.contains(&clean)
            && !is_sql_keyword(&clean)
        {
            refs.insert(clean);
        }
    }

    /// 마이그레이션들에서 의존성 그래프 생성
    pub fn build_dependency_graph(&self, migrations: &[Migration]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        let mut object_to_file: HashMap<String, String> = HashMap::new();

        for migration in migrations {
            for stmt in &migration.statements {
                if stmt.statement_type.is_create() && !stmt.object_name.is_empty() {
                    graph.add_definition(&stmt.object_name, &migration.filename, stmt.line_number);
                    object_to_file
                        .entry(stmt.object_name.to_lowercase())
                        .or_insert_with(|| migration.filename.clone());
                }
            }
        }

        for migration in migrations {
            for stmt in &migration.statements {
                for ref_obj in &stmt.references {
                    if let Some(def_file) = object_to_file.get(ref_obj) {
                        graph.add_file_dependency(&migration.filename, def_file);
                    }
                }
            }
        }

        graph
    }
}

/// 연속 공백을 한 칸으로
fn normalize_whitespace(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 단어 경계에서 시작하는 키워드 위치
fn find_keyword(haystack_upper: &str, keyword: &str) -> Option<usize> {
    haystack_upper.match_indices(keyword).map(|(pos, _)| pos).find(|&pos| {
        let before_ok = haystack_upper[..pos]
            .chars()
            .last()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '_'));
        let after_ok = haystack_upper[pos + keyword.len()..]
            .chars()
            .next()
            .map_or(true, |c| !(c.is_alphanumeric() || c == '_'));
        before_ok && after_ok
    })
}

fn is_sql_keyword(word: &str) -> bool {
    matches!(
        word,
        "select" | "where" | "lateral" | "only" | "unnest" | "values" | "on" | "the"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(sql: &str) -> SqlStatement {
        let analyzer = MigrationAnalyzer::new();
        let mut stmts = analyzer.parse_statements(sql);
        assert_eq!(stmts.len(), 1, "expected exactly one statement in {sql}");
        stmts.remove(0)
    }

    #[test]
    fn test_parse_create_table() {
        let stmt = one("CREATE TABLE IF NOT EXISTS users (id SERIAL PRIMARY KEY, name TEXT);");
        assert_eq!(stmt.statement_type, StatementType::CreateTable);
        assert_eq!(stmt.object_name, "users");
        assert!(stmt.if_not_exists);
    }

    #[test]
    fn test_parse_create_view() {
        let stmt = one(
            "CREATE OR REPLACE VIEW v_active_projects AS SELECT * FROM projects WHERE archived = false;",
        );
        assert_eq!(stmt.statement_type, StatementType::CreateView);
        assert_eq!(stmt.object_name, "v_active_projects");
        assert!(stmt.references.contains(&"projects".to_string()));
    }

    #[test]
    fn test_parse_drop_cascade() {
        let stmt = one("DROP TABLE IF EXISTS legacy_posts CASCADE;");
        assert_eq!(stmt.statement_type, StatementType::DropTable);
        assert_eq!(stmt.object_name, "legacy_posts");
        assert!(stmt.if_exists);
        assert!(stmt.cascade);
        assert!(!stmt.fk_cascade);
    }

    #[test]
    fn test_parse_create_index_concurrently() {
        let stmt = one("CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_posts_author ON posts (author_id);");
        assert_eq!(stmt.statement_type, StatementType::CreateIndex);
        assert_eq!(stmt.object_name, "idx_posts_author");
        assert!(stmt.concurrently);
        assert!(stmt.references.contains(&"posts".to_string()));
    }

    #[test]
    fn test_fk_cascade_is_not_ddl_cascade() {
        let stmt = one(
            "CREATE TABLE scheduled_posts (
                id UUID PRIMARY KEY,
                project_id UUID REFERENCES projects(id) ON DELETE CASCADE
            );",
        );
        assert!(stmt.fk_cascade);
        assert!(!stmt.cascade);
        assert!(stmt.references.contains(&"projects".to_string()));
    }

    #[test]
    fn test_alter_table_with_schema_prefix() {
        let stmt = one("ALTER TABLE public.users ADD COLUMN IF NOT EXISTS avatar_url TEXT;");
        assert_eq!(stmt.statement_type, StatementType::AlterTable);
        assert_eq!(stmt.object_name, "users");
    }

    #[test]
    fn test_do_block_and_transaction_control() {
        let analyzer = MigrationAnalyzer::new();
        let stmts = analyzer.parse_statements(
            "BEGIN;\nDO $$ BEGIN PERFORM 1 FROM information_schema.columns; END $$;\nCOMMIT;",
        );
        assert_eq!(stmts.len(), 3);
        assert_eq!(stmts[0].statement_type, StatementType::TransactionControl);
        assert_eq!(stmts[1].statement_type, StatementType::DoBlock);
        assert!(stmts[1].references.is_empty());
        assert_eq!(stmts[2].statement_type, StatementType::TransactionControl);
    }

    #[test]
    fn test_non_ascii_literal_before_keyword() {
        // 대문자 변환 시 바이트 길이가 바뀌는 문자 (ﬁ -> FI, ß -> SS)
        let stmt = one("INSERT INTO posts (title) SELECT 'ﬁﬁﬁﬁﬁﬁﬁﬁ' FROM users;");
        assert_eq!(stmt.statement_type, StatementType::Insert);
        assert_eq!(stmt.object_name, "posts");
        assert_eq!(stmt.references, vec!["users".to_string()]);

        let stmt = one(
            "CREATE TABLE IF NOT EXISTS straße_notes (id INT PRIMARY KEY, user_id INT REFERENCES users(id));",
        );
        assert_eq!(stmt.statement_type, StatementType::CreateTable);
        assert_eq!(stmt.object_name, "straße_notes");
        assert!(stmt.references.contains(&"users".to_string()));

        let stmt = one("CREATE OR REPLACE FUNCTION größe_of(x TEXT) RETURNS INT AS $$ SELECT 1 $$ LANGUAGE sql;");
        assert_eq!(stmt.statement_type, StatementType::CreateFunction);
        assert_eq!(stmt.object_name, "größe_of");
    }

    #[test]
    fn test_information_schema_reference_is_ignored() {
        let stmt = one("SELECT column_name FROM information_schema.columns WHERE table_name = 'users';");
        assert!(stmt.references.is_empty());
    }
}
