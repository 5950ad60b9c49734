//! 마이그레이션 정적 검사 (`migrate lint`).
//!
//! DB 없이 카탈로그만 보고 멱등성 가드 누락, 데이터 손실 위험, 트랜잭션 안에서
//! 실행할 수 없는 문장, 정의 순서 문제 등을 찾아냅니다.

use std::collections::{HashMap, HashSet};

use super::analyzer::MigrationAnalyzer;
use super::catalog::Catalog;
use super::models::*;
use super::tokens::{split_top_level, tokenize, Cursor};

/// 마이그레이션 린터
pub struct MigrationLinter<'a> {
    catalog: &'a Catalog,
    analyzer: MigrationAnalyzer,
}

impl<'a> MigrationLinter<'a> {
    /// 새 린터 생성
    pub fn new(catalog: &'a Catalog) -> Self {
        Self {
            catalog,
            analyzer: MigrationAnalyzer::new(),
        }
    }

    /// 실행 대상 (비활성/대체됨 제외)
    fn active(&self) -> impl Iterator<Item = &'a Migration> {
        self.catalog
            .migrations()
            .iter()
            .filter(|m| !m.meta.is_skipped())
    }

    /// 전체 검사 수행
    pub fn lint(&self) -> LintReport {
        let active: Vec<Migration> = self.active().cloned().collect();

        let mut report = LintReport::new();
        report.files_analyzed = self.catalog.len();
        report.total_statements = self
            .catalog
            .migrations()
            .iter()
            .map(|m| m.statements.len())
            .sum();
        report.graph = self.analyzer.build_dependency_graph(&active);

        self.check_duplicate_definitions(&mut report);
        self.check_idempotency(&mut report);
        self.check_constraint_guards(&mut report);
        self.check_cascade_usage(&mut report);
        self.check_data_safety(&mut report);
        self.check_transaction_control(&mut report);
        self.check_definition_order(&mut report);
        self.check_skipped_migrations(&mut report);

        report
    }

    /// 여러 마이그레이션에서 정의된 객체
    fn check_duplicate_definitions(&self, report: &mut LintReport) {
        for (object, locations) in report.graph.find_duplicates() {
            let locations_str: Vec<String> = locations
                .iter()
                .map(|(f, l)| format!("{}:{}", f, l))
                .collect();
            let issue = LintIssue::new(
                Severity::Warning,
                "DUP001",
                format!("'{}' 객체가 {} 곳에서 정의됨", object, locations.len()),
            )
            .with_object(&object)
            .with_suggestion(format!(
                "이후 정의가 이전 정의를 덮어쓰는지 확인. 위치: {}",
                locations_str.join(", ")
            ));
            report.add_issue(issue);
        }
    }

    /// IF [NOT] EXISTS 누락
    fn check_idempotency(&self, report: &mut LintReport) {
        for m in self.active() {
            for stmt in &m.statements {
                match &stmt.statement_type {
                    StatementType::CreateTable
                    | StatementType::CreateIndex
                    | StatementType::CreateType
                        if !stmt.if_not_exists =>
                    {
                        report.add_issue(
                            LintIssue::new(
                                Severity::Info,
                                "IDEM001",
                                "IF NOT EXISTS 누락 - 재실행 시 실패",
                            )
                            .at(&m.filename, stmt)
                            .with_suggestion("CREATE ... IF NOT EXISTS 사용 권장."),
                        );
                    }
                    t if t.is_drop() && !stmt.if_exists => {
                        report.add_issue(
                            LintIssue::new(
                                Severity::Info,
                                "IDEM002",
                                "IF EXISTS 누락 - 대상이 없으면 실패",
                            )
                            .at(&m.filename, stmt)
                            .with_suggestion("DROP ... IF EXISTS 사용 권장."),
                        );
                    }
                    StatementType::AlterTable => {
                        for column in unguarded_added_columns(&stmt.raw_sql) {
                            report.add_issue(
                                LintIssue::new(
                                    Severity::Info,
                                    "IDEM003",
                                    format!("컬럼 '{}' 추가에 IF NOT EXISTS 누락", column),
                                )
                                .at(&m.filename, stmt)
                                .with_suggestion("ADD COLUMN IF NOT EXISTS 사용 권장."),
                            );
                        }
                    }
                    _ => {}
                }
            }
        }
    }

    /// ADD CONSTRAINT IF NOT EXISTS (PostgreSQL 미지원 문법)
    fn check_constraint_guards(&self, report: &mut LintReport) {
        for m in self.active() {
            for stmt in &m.statements {
                if stmt.statement_type != StatementType::AlterTable {
                    continue;
                }
                let upper = stmt.raw_sql.to_ascii_uppercase();
                let normalized: String = upper.split_whitespace().collect::<Vec<_>>().join(" ");
                if normalized.contains("ADD CONSTRAINT IF NOT EXISTS") {
                    report.add_issue(
                        LintIssue::new(
                            Severity::Info,
                            "GUARD001",
                            "ADD CONSTRAINT IF NOT EXISTS 는 PostgreSQL 문법이 아님 - 실행기가 사전 확인 후 제거하여 실행",
                        )
                        .at(&m.filename, stmt)
                        .with_suggestion(
                            "단일 동작 ALTER TABLE 로 유지하거나 information_schema.table_constraints 확인 DO 블록 사용.",
                        ),
                    );
                }
            }
        }
    }

    /// DDL CASCADE (FK ON DELETE CASCADE 는 의도된 설계이므로 제외)
    fn check_cascade_usage(&self, report: &mut LintReport) {
        for m in self.active() {
            for stmt in &m.statements {
                if !stmt.cascade {
                    continue;
                }
                let severity = if stmt.statement_type.is_drop() {
                    Severity::Warning
                } else {
                    Severity::Info
                };
                report.add_issue(
                    LintIssue::new(
                        severity,
                        "CASC001",
                        "CASCADE 사용 - 의존 객체가 자동 삭제될 수 있음",
                    )
                    .at(&m.filename, stmt)
                    .with_suggestion("명시적 삭제 순서 권장. CASCADE 제거 후 수동 정리."),
                );
            }
        }
    }

    /// 데이터 손실 위험 (DROP COLUMN, 조건 없는 DELETE)
    fn check_data_safety(&self, report: &mut LintReport) {
        for m in self.active() {
            for stmt in &m.statements {
                let upper = stmt.raw_sql.to_ascii_uppercase();
                match stmt.statement_type {
                    StatementType::AlterTable if upper.contains("DROP COLUMN") => {
                        report.add_issue(
                            LintIssue::new(
                                Severity::Warning,
                                "DATA002",
                                "DROP COLUMN - 컬럼 데이터가 영구 삭제됨",
                            )
                            .at(&m.filename, stmt)
                            .with_suggestion("백업 후 별도 마이그레이션으로 분리 권장."),
                        );
                    }
                    StatementType::Delete if !upper.contains("WHERE") => {
                        report.add_issue(
                            LintIssue::new(
                                Severity::Warning,
                                "DATA003",
                                "WHERE 없는 DELETE - 전체 행 삭제",
                            )
                            .at(&m.filename, stmt),
                        );
                    }
                    _ => {}
                }
            }
        }
    }

    /// 파일 내 트랜잭션 제어문, CONCURRENTLY
    fn check_transaction_control(&self, report: &mut LintReport) {
        for m in self.active() {
            for stmt in &m.statements {
                if stmt.statement_type == StatementType::TransactionControl {
                    report.add_issue(
                        LintIssue::new(
                            Severity::Warning,
                            "TXN001",
                            "명시적 트랜잭션 제어문 - 실행기가 무시함",
                        )
                        .at(&m.filename, stmt)
                        .with_suggestion("BEGIN/COMMIT 제거. 마이그레이션 전체가 하나의 트랜잭션으로 실행됨."),
                    );
                }
                if stmt.concurrently {
                    report.add_issue(
                        LintIssue::new(
                            Severity::Error,
                            "TXN002",
                            "CONCURRENTLY 는 트랜잭션 안에서 실행할 수 없음",
                        )
                        .at(&m.filename, stmt)
                        .with_suggestion("CONCURRENTLY 제거 또는 마이그레이션 밖에서 별도 실행."),
                    );
                }
            }
        }
    }

    /// 이후 마이그레이션에서 처음 정의되는 객체 참조
    fn check_definition_order(&self, report: &mut LintReport) {
        let sequences: HashMap<&str, u32> = self
            .catalog
            .migrations()
            .iter()
            .map(|m| (m.filename.as_str(), m.sequence))
            .collect();

        let mut issues = Vec::new();
        for m in self.active() {
            let own: HashSet<&str> = m
                .statements
                .iter()
                .filter(|s| s.statement_type.is_create())
                .map(|s| s.object_name.as_str())
                .collect();

            for stmt in &m.statements {
                for reference in &stmt.references {
                    if own.contains(reference.as_str()) {
                        continue;
                    }
                    let Some((def_file, def_line)) = report.graph.first_definition(reference) else {
                        continue;
                    };
                    let def_seq = sequences.get(def_file.as_str()).copied().unwrap_or(0);
                    if def_seq > m.sequence {
                        issues.push(
                            LintIssue::new(
                                Severity::Error,
                                "VDEP001",
                                format!(
                                    "'{}' 참조 - {}:{} 에서 나중에 정의됨",
                                    reference, def_file, def_line
                                ),
                            )
                            .at(&m.filename, stmt)
                            .with_object(reference)
                            .with_suggestion("정의하는 마이그레이션을 먼저 실행되도록 순번 조정."),
                        );
                    }
                }
            }
        }
        for issue in issues {
            report.add_issue(issue);
        }
    }

    /// 비활성/대체된 마이그레이션 (기술 부채)
    fn check_skipped_migrations(&self, report: &mut LintReport) {
        for m in self.catalog.migrations() {
            if let Some(reason) = m.meta.skip_reason() {
                let mut issue = LintIssue::new(
                    Severity::Info,
                    "META001",
                    format!("실행되지 않는 마이그레이션 ({})", reason),
                );
                issue.file = Some(m.filename.clone());
                report.add_issue(issue);
            }
        }
    }
}

/// `ALTER TABLE ... ADD [COLUMN] name` 중 IF NOT EXISTS 없는 컬럼
fn unguarded_added_columns(sql: &str) -> Vec<String> {
    let tokens = tokenize(sql);
    let mut cur = Cursor::new(&tokens);
    if !cur.eat_kws(&["alter", "table"]) {
        return Vec::new();
    }
    cur.eat_kws(&["if", "exists"]);
    cur.eat_kw("only");
    if cur.qualified_name().is_none() {
        return Vec::new();
    }

    let mut columns = Vec::new();
    for action in split_top_level(cur.rest()) {
        let mut a = Cursor::new(action);
        if !a.eat_kw("add") {
            continue;
        }
        let is_constraint = ["constraint", "primary", "unique", "foreign", "check", "exclude"]
            .iter()
            .any(|kw| a.peek_kw(kw));
        if is_constraint {
            continue;
        }
        a.eat_kw("column");
        if a.eat_kws(&["if", "not", "exists"]) {
            continue;
        }
        if let Some(name) = a.ident() {
            columns.push(name);
        }
    }
    columns
}
