//! 마이그레이션 데이터 모델.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SQL 문장 유형
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StatementType {
    /// CREATE TABLE
    CreateTable,
    /// CREATE VIEW
    CreateView,
    /// CREATE MATERIALIZED VIEW
    CreateMaterializedView,
    /// CREATE INDEX
    CreateIndex,
    /// CREATE FUNCTION / PROCEDURE
    CreateFunction,
    /// CREATE TRIGGER
    CreateTrigger,
    /// CREATE TYPE (ENUM 등)
    CreateType,
    /// CREATE EXTENSION
    CreateExtension,
    /// DROP TABLE
    DropTable,
    /// DROP VIEW
    DropView,
    /// DROP MATERIALIZED VIEW
    DropMaterializedView,
    /// DROP INDEX
    DropIndex,
    /// DROP FUNCTION
    DropFunction,
    /// DROP TRIGGER
    DropTrigger,
    /// DROP TYPE
    DropType,
    /// ALTER TABLE
    AlterTable,
    /// INSERT INTO
    Insert,
    /// UPDATE
    Update,
    /// DELETE FROM
    Delete,
    /// DO $$ ... $$ 절차 블록
    DoBlock,
    /// BEGIN / COMMIT / START TRANSACTION 등
    TransactionControl,
    /// 기타 문장 (첫 키워드)
    Other(String),
}

impl StatementType {
    /// DROP 문장인지 확인
    pub fn is_drop(&self) -> bool {
        matches!(
            self,
            StatementType::DropTable
                | StatementType::DropView
                | StatementType::DropMaterializedView
                | StatementType::DropIndex
                | StatementType::DropFunction
                | StatementType::DropTrigger
                | StatementType::DropType
        )
    }

    /// CREATE 문장인지 확인
    pub fn is_create(&self) -> bool {
        matches!(
            self,
            StatementType::CreateTable
                | StatementType::CreateView
                | StatementType::CreateMaterializedView
                | StatementType::CreateIndex
                | StatementType::CreateFunction
                | StatementType::CreateTrigger
                | StatementType::CreateType
                | StatementType::CreateExtension
        )
    }
}

/// 파싱된 SQL 문장
#[derive(Debug, Clone)]
pub struct SqlStatement {
    /// 문장 유형
    pub statement_type: StatementType,
    /// 대상 객체 이름 (테이블명, 뷰명 등)
    pub object_name: String,
    /// 원본 SQL (끝의 세미콜론 제외)
    pub raw_sql: String,
    /// 파일 내 시작 라인 번호 (1-based)
    pub line_number: usize,
    /// 파일 내 종료 라인 번호 (1-based)
    pub end_line_number: usize,
    /// IF NOT EXISTS 사용 여부
    pub if_not_exists: bool,
    /// IF EXISTS 사용 여부
    pub if_exists: bool,
    /// CASCADE 사용 여부 (DROP ... CASCADE 등 DDL CASCADE)
    pub cascade: bool,
    /// FK ON DELETE/UPDATE CASCADE 사용 여부
    pub fk_cascade: bool,
    /// CONCURRENTLY 사용 여부 (트랜잭션 안에서 실행 불가)
    pub concurrently: bool,
    /// 참조하는 다른 객체들 (FROM, JOIN, REFERENCES 등에서 추출)
    pub references: Vec<String>,
}

impl SqlStatement {
    /// 새 SQL 문장 생성
    pub fn new(
        statement_type: StatementType,
        object_name: String,
        raw_sql: String,
        line_number: usize,
    ) -> Self {
        Self {
            statement_type,
            object_name,
            raw_sql,
            line_number,
            end_line_number: line_number,
            if_not_exists: false,
            if_exists: false,
            cascade: false,
            fk_cascade: false,
            concurrently: false,
            references: Vec::new(),
        }
    }
}

/// 사이드카 메타데이터의 상태 값
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetaStatus {
    /// 정상 적용 대상
    #[default]
    Active,
    /// 운영자가 비활성화 (적용하지 않음)
    Disabled,
    /// 이후 마이그레이션으로 대체됨
    Superseded,
}

/// `<stem>.toml` 사이드카 메타데이터
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationMeta {
    #[serde(default)]
    pub status: MetaStatus,
    /// 대체한 마이그레이션 (superseded 일 때 필수)
    pub superseded_by: Option<String>,
    /// 비활성화/대체 사유
    pub reason: Option<String>,
}

impl MigrationMeta {
    /// 실행 대상에서 제외되는지 여부
    pub fn is_skipped(&self) -> bool {
        self.status != MetaStatus::Active
    }

    /// 로그/보고서용 제외 사유
    pub fn skip_reason(&self) -> Option<String> {
        let reason = self
            .reason
            .as_deref()
            .map(|r| format!(": {}", r))
            .unwrap_or_default();
        match self.status {
            MetaStatus::Active => None,
            MetaStatus::Disabled => Some(format!("disabled{}", reason)),
            MetaStatus::Superseded => Some(format!(
                "superseded by {}{}",
                self.superseded_by.as_deref().unwrap_or("?"),
                reason
            )),
        }
    }
}

/// 마이그레이션 파일 정보
#[derive(Debug, Clone)]
pub struct Migration {
    /// 파일 경로
    pub path: PathBuf,
    /// 파일명 (추적 테이블의 키, 예: 0001_create_users.sql)
    pub filename: String,
    /// 파일명 (확장자 제외, 예: 0001_create_users)
    pub name: String,
    /// 순서 번호 (파일명 앞 4자리)
    pub sequence: u32,
    /// 파일 내용
    pub content: String,
    /// 내용 체크섬 (SHA-256 hex)
    pub checksum: String,
    /// 파싱된 SQL 문장들
    pub statements: Vec<SqlStatement>,
    /// 사이드카 메타데이터
    pub meta: MigrationMeta,
}

/// 추적 테이블의 상태 값
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    /// 실행 시작 (완료 전)
    Pending,
    /// 적용 완료
    Completed,
    /// 실패 (롤백됨)
    Failed,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::Pending => write!(f, "pending"),
            MigrationStatus::Completed => write!(f, "completed"),
            MigrationStatus::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for MigrationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(MigrationStatus::Pending),
            "completed" => Ok(MigrationStatus::Completed),
            "failed" => Ok(MigrationStatus::Failed),
            _ => Err(format!("Invalid migration status: {}", s)),
        }
    }
}

/// 추적 테이블 한 행
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub filename: String,
    pub checksum: String,
    pub status: MigrationStatus,
    pub error_message: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub applied_at: DateTime<Utc>,
}

/// 스키마 객체 위치 (스키마 생략 시 current_schema())
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: Option<String>,
    pub name: String,
}

impl TableRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            schema: None,
            name: name.into(),
        }
    }

    /// `public.users` 또는 `users` 형식 파싱
    pub fn parse(s: &str) -> Self {
        match s.trim().split_once('.') {
            Some((schema, name)) => Self {
                schema: Some(schema.trim().to_string()),
                name: name.trim().to_string(),
            },
            None => Self::new(s.trim()),
        }
    }
}

impl std::fmt::Display for TableRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// 의존성 그래프
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// 객체별 정의 위치 (객체명 → (파일명, 라인번호) 목록)
    pub definitions: HashMap<String, Vec<(String, usize)>>,
    /// 파일별 의존 관계 (파일명 → 의존 파일명 목록)
    pub file_dependencies: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    /// 새 그래프 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 정의 추가
    pub fn add_definition(&mut self, object: &str, file: &str, line: usize) {
        self.definitions
            .entry(object.to_lowercase())
            .or_default()
            .push((file.to_string(), line));
    }

    /// 파일 의존성 추가
    pub fn add_file_dependency(&mut self, file: &str, depends_on_file: &str) {
        if file != depends_on_file {
            self.file_dependencies
                .entry(file.to_string())
                .or_default()
                .insert(depends_on_file.to_string());
        }
    }

    /// 최초 정의 파일
    pub fn first_definition(&self, object: &str) -> Option<&(String, usize)> {
        self.definitions
            .get(&object.to_lowercase())
            .and_then(|locs| locs.first())
    }

    /// 여러 파일에서 정의된 객체 찾기
    pub fn find_duplicates(&self) -> Vec<(String, Vec<(String, usize)>)> {
        let mut dups: Vec<_> = self
            .definitions
            .iter()
            .filter(|(_, locations)| {
                let files: HashSet<_> = locations.iter().map(|(f, _)| f.as_str()).collect();
                files.len() > 1
            })
            .map(|(name, locs)| (name.clone(), locs.clone()))
            .collect();
        dups.sort_by(|a, b| a.0.cmp(&b.0));
        dups
    }
}

/// 검사 결과 심각도
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// 정보 (권장사항)
    Info,
    /// 경고 (수정 권장)
    Warning,
    /// 에러 (수정 필수)
    Error,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARNING"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// 린트 결과 항목
#[derive(Debug, Clone, Serialize)]
pub struct LintIssue {
    /// 심각도
    pub severity: Severity,
    /// 문제 코드
    pub code: &'static str,
    /// 문제 설명
    pub message: String,
    /// 관련 파일
    pub file: Option<String>,
    /// 관련 라인 번호
    pub line: Option<usize>,
    /// 관련 객체명
    pub object: Option<String>,
    /// 권장 해결 방법
    pub suggestion: Option<String>,
}

impl LintIssue {
    /// 새 이슈 생성
    pub fn new(severity: Severity, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
            file: None,
            line: None,
            object: None,
            suggestion: None,
        }
    }

    /// 문장 위치 정보 추가
    pub fn at(mut self, file: &str, stmt: &SqlStatement) -> Self {
        self.file = Some(file.to_string());
        self.line = Some(stmt.line_number);
        if !stmt.object_name.is_empty() {
            self.object = Some(stmt.object_name.clone());
        }
        self
    }

    /// 객체 정보 추가
    pub fn with_object(mut self, object: &str) -> Self {
        self.object = Some(object.to_string());
        self
    }

    /// 해결 방법 추가
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl std::fmt::Display for LintIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.code, self.message)?;

        if let Some(ref file) = self.file {
            write!(f, "\n  파일: {}", file)?;
            if let Some(line) = self.line {
                write!(f, ":{}", line)?;
            }
        }

        if let Some(ref obj) = self.object {
            write!(f, "\n  객체: {}", obj)?;
        }

        if let Some(ref suggestion) = self.suggestion {
            write!(f, "\n  해결: {}", suggestion)?;
        }

        Ok(())
    }
}

/// 린트 보고서
#[derive(Debug, Clone, Default, Serialize)]
pub struct LintReport {
    /// 발견된 이슈들
    pub issues: Vec<LintIssue>,
    /// 분석된 파일 수
    pub files_analyzed: usize,
    /// 총 SQL 문장 수
    pub total_statements: usize,
    /// 의존성 그래프
    #[serde(skip)]
    pub graph: DependencyGraph,
}

impl LintReport {
    /// 새 보고서 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 이슈 추가
    pub fn add_issue(&mut self, issue: LintIssue) {
        self.issues.push(issue);
    }

    /// 심각도별 개수
    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }

    /// 에러가 없으면 통과
    pub fn is_valid(&self) -> bool {
        self.count(Severity::Error) == 0
    }

    /// 특정 코드의 이슈 존재 여부
    pub fn has(&self, code: &str) -> bool {
        self.issues.iter().any(|i| i.code == code)
    }

    /// 심각도별 정렬된 이슈 목록
    pub fn sorted_issues(&self) -> Vec<&LintIssue> {
        let mut sorted: Vec<_> = self.issues.iter().collect();
        sorted.sort_by(|a, b| b.severity.cmp(&a.severity));
        sorted
    }
}

impl std::fmt::Display for LintReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", RULE_HEAVY)?;
        writeln!(f, "                    마이그레이션 린트 보고서")?;
        writeln!(f, "{}", RULE_HEAVY)?;
        writeln!(f)?;
        writeln!(f, "📊 요약")?;
        writeln!(f, "  분석 파일: {} 개", self.files_analyzed)?;
        writeln!(f, "  SQL 문장: {} 개", self.total_statements)?;
        writeln!(f)?;
        writeln!(
            f,
            "  🔴 에러: {} 개  🟡 경고: {} 개  🔵 정보: {} 개",
            self.count(Severity::Error),
            self.count(Severity::Warning),
            self.count(Severity::Info)
        )?;
        writeln!(f)?;

        if self.issues.is_empty() {
            writeln!(f, "✅ 문제가 발견되지 않았습니다.")?;
        } else {
            writeln!(f, "{}", RULE_LIGHT)?;
            writeln!(f, "🔍 발견된 이슈")?;
            writeln!(f, "{}", RULE_LIGHT)?;
            for (i, issue) in self.sorted_issues().iter().enumerate() {
                writeln!(f)?;
                writeln!(f, "{}. {}", i + 1, issue)?;
            }
        }

        writeln!(f)?;
        writeln!(f, "{}", RULE_HEAVY)?;

        Ok(())
    }
}

pub(crate) const RULE_HEAVY: &str =
    "═══════════════════════════════════════════════════════════════";
pub(crate) const RULE_LIGHT: &str =
    "───────────────────────────────────────────────────────────────";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dependency_graph_duplicates_across_files() {
        let mut graph = DependencyGraph::new();
        graph.add_definition("users", "0001_create_users.sql", 10);
        graph.add_definition("users", "0005_recreate_users.sql", 20);
        graph.add_definition("posts", "0002_posts.sql", 1);
        graph.add_definition("posts", "0002_posts.sql", 30);

        let dups = graph.find_duplicates();
        assert_eq!(dups.len(), 1);
        assert_eq!(dups[0].0, "users");
    }

    #[test]
    fn test_status_round_trip_text() {
        for status in [
            MigrationStatus::Pending,
            MigrationStatus::Completed,
            MigrationStatus::Failed,
        ] {
            let parsed: MigrationStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("done".parse::<MigrationStatus>().is_err());
    }

    #[test]
    fn test_meta_skip_reason() {
        let meta = MigrationMeta {
            status: MetaStatus::Superseded,
            superseded_by: Some("0016_fix_post_columns".into()),
            reason: Some("duplicate column add".into()),
        };
        assert!(meta.is_skipped());
        assert_eq!(
            meta.skip_reason().unwrap(),
            "superseded by 0016_fix_post_columns: duplicate column add"
        );
        assert!(MigrationMeta::default().skip_reason().is_none());
    }

    #[test]
    fn test_table_ref_parse() {
        let t = TableRef::parse("public.users");
        assert_eq!(t.schema.as_deref(), Some("public"));
        assert_eq!(t.name, "users");
        assert_eq!(TableRef::parse("users").to_string(), "users");
    }

    #[test]
    fn test_lint_report_display() {
        let mut report = LintReport::new();
        report.files_analyzed = 5;
        report.total_statements = 100;
        report.add_issue(
            LintIssue::new(Severity::Error, "TXN002", "CONCURRENTLY 사용").with_object("idx_a"),
        );

        let output = format!("{}", report);
        assert!(output.contains("에러: 1"));
        assert!(output.contains("TXN002"));
        assert!(!report.is_valid());
    }
}
