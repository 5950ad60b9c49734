//! 적용 후 스키마 검증.
//!
//! 기대하는 테이블/컬럼/제약조건/행 수를 TOML 파일로 선언하고 실제 스키마를
//! 조회해 비교합니다. 읽기 전용이며 불일치를 수정하지 않습니다.
//!
//! ```toml
//! [[table]]
//! name = "users"
//!
//! [[column]]
//! table = "users"
//! name = "email"
//! nullable = false
//!
//! [[constraint]]
//! table = "users"
//! name = "users_email_key"
//!
//! [[rows]]
//! table = "plans"
//! min = 3
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::backend::MigrationBackend;
use super::models::{TableRef, RULE_HEAVY, RULE_LIGHT};
use crate::error::{MigrateError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TableExpectation {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ColumnExpectation {
    pub table: String,
    pub name: String,
    /// 지정 시 nullable 여부까지 확인
    pub nullable: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstraintExpectation {
    pub table: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RowExpectation {
    pub table: String,
    pub min: Option<i64>,
    pub exact: Option<i64>,
}

/// 스키마 기대값 목록
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaExpectations {
    #[serde(default, rename = "table")]
    pub tables: Vec<TableExpectation>,
    #[serde(default, rename = "column")]
    pub columns: Vec<ColumnExpectation>,
    #[serde(default, rename = "constraint")]
    pub constraints: Vec<ConstraintExpectation>,
    #[serde(default, rename = "rows")]
    pub rows: Vec<RowExpectation>,
}

impl SchemaExpectations {
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| MigrateError::Config(format!("invalid expectations: {}", e)))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    pub fn len(&self) -> usize {
        self.tables.len() + self.columns.len() + self.constraints.len() + self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 기대값 하나의 검증 결과
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub description: String,
    pub passed: bool,
    /// 실제 관찰값
    pub observed: String,
}

/// 검증 보고서
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationReport {
    pub checks: Vec<CheckResult>,
}

impl VerificationReport {
    pub fn failed(&self) -> usize {
        self.checks.iter().filter(|c| !c.passed).count()
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    /// 실패가 있으면 [`MigrateError::Verification`]
    pub fn into_result(self) -> Result<Self> {
        match self.failed() {
            0 => Ok(self),
            failed => Err(MigrateError::Verification { failed }),
        }
    }

    fn push(&mut self, description: String, passed: bool, observed: impl Into<String>) {
        let observed = observed.into();
        if passed {
            info!(check = %description, observed = %observed, "검증 통과");
        } else {
            warn!(check = %description, observed = %observed, "검증 실패");
        }
        self.checks.push(CheckResult {
            description,
            passed,
            observed,
        });
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", RULE_HEAVY)?;
        writeln!(f, "                      스키마 검증 결과")?;
        writeln!(f, "{}", RULE_HEAVY)?;
        writeln!(f)?;
        for check in &self.checks {
            let icon = if check.passed { "✅" } else { "❌" };
            writeln!(f, "{} {}", icon, check.description)?;
            writeln!(f, "     └ 실제: {}", check.observed)?;
        }
        writeln!(f)?;
        writeln!(f, "{}", RULE_LIGHT)?;
        writeln!(
            f,
            "📊 통과 {} / 실패 {}",
            self.checks.len() - self.failed(),
            self.failed()
        )?;
        writeln!(f, "{}", RULE_HEAVY)
    }
}

/// 스키마 검증기
#[derive(Debug, Default)]
pub struct Verifier;

impl Verifier {
    pub fn new() -> Self {
        Self
    }

    /// 모든 기대값을 조회해 보고서 생성
    pub async fn verify<B: MigrationBackend + ?Sized>(
        &self,
        backend: &mut B,
        expectations: &SchemaExpectations,
    ) -> Result<VerificationReport> {
        let mut report = VerificationReport::default();

        for exp in &expectations.tables {
            let table = TableRef::parse(&exp.name);
            let exists = backend.table_exists(&table).await?;
            report.push(
                format!("table {} exists", table),
                exists,
                if exists { "present" } else { "missing" },
            );
        }

        for exp in &expectations.columns {
            let table = TableRef::parse(&exp.table);
            let nullable = backend.column_nullable(&table, &exp.name).await?;
            let (description, passed) = match exp.nullable {
                Some(want) => (
                    format!(
                        "column {}.{} exists ({})",
                        table,
                        exp.name,
                        if want { "NULL" } else { "NOT NULL" }
                    ),
                    nullable == Some(want),
                ),
                None => (
                    format!("column {}.{} exists", table, exp.name),
                    nullable.is_some(),
                ),
            };
            let observed = match nullable {
                None => "missing",
                Some(true) => "present, NULL",
                Some(false) => "present, NOT NULL",
            };
            report.push(description, passed, observed);
        }

        for exp in &expectations.constraints {
            let table = TableRef::parse(&exp.table);
            let exists = backend.constraint_exists(&table, &exp.name).await?;
            report.push(
                format!("constraint {} on {} exists", exp.name, table),
                exists,
                if exists { "present" } else { "missing" },
            );
        }

        for exp in &expectations.rows {
            let table = TableRef::parse(&exp.table);
            let count = backend.row_count(&table).await?;
            let (description, passed) = match (exp.exact, exp.min) {
                (Some(exact), _) => (
                    format!("table {} has exactly {} rows", table, exact),
                    count == Some(exact),
                ),
                (None, min) => {
                    let min = min.unwrap_or(1);
                    (
                        format!("table {} has at least {} rows", table, min),
                        count.is_some_and(|c| c >= min),
                    )
                }
            };
            let observed = match count {
                Some(c) => format!("{} rows", c),
                None => "table missing".to_string(),
            };
            report.push(description, passed, observed);
        }

        Ok(report)
    }
}
