//! 에러 타입 정의.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// 카탈로그 (마이그레이션 파일 탐색/검증) 에러.
///
/// 모두 치명적이며, 어떤 SQL도 실행되기 전에 전체 실행을 중단합니다.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("migrations directory does not exist: {}", .0.display())]
    MissingDirectory(PathBuf),

    #[error("invalid migration file name '{filename}': expected <4-digit-sequence>_<description>.sql")]
    InvalidFileName { filename: String },

    #[error("duplicate migration sequence {sequence:04}: '{first}' and '{second}'")]
    DuplicateSequence {
        sequence: u32,
        first: String,
        second: String,
    },

    #[error("migration file '{filename}' is empty")]
    Empty { filename: String },

    #[error("migration file '{filename}' ends mid-statement (statement starting at line {line}): '{tail}'")]
    Truncated {
        filename: String,
        line: usize,
        tail: String,
    },

    #[error("migration file '{filename}' has an unterminated dollar-quoted block '{tag}' opened at line {line}")]
    UnbalancedDollarQuote {
        filename: String,
        tag: String,
        line: usize,
    },

    #[error("migration file '{filename}' has an unterminated {kind} opened at line {line}")]
    UnterminatedLiteral {
        filename: String,
        kind: &'static str,
        line: usize,
    },

    #[error("migration sequence exhausted: '{last}' already uses {max}, the highest 4-digit sequence")]
    SequenceExhausted { last: String, max: u32 },

    #[error("invalid metadata for '{filename}': {message}")]
    Metadata { filename: String, message: String },

    #[error("failed to read '{}': {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write '{}': {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl CatalogError {
    /// 관련 파일명 (있는 경우)
    pub fn filename(&self) -> Option<&str> {
        match self {
            Self::InvalidFileName { filename }
            | Self::Empty { filename }
            | Self::Truncated { filename, .. }
            | Self::UnbalancedDollarQuote { filename, .. }
            | Self::UnterminatedLiteral { filename, .. }
            | Self::Metadata { filename, .. } => Some(filename),
            Self::DuplicateSequence { second, .. } => Some(second),
            Self::SequenceExhausted { last, .. } => Some(last),
            Self::MissingDirectory(_) | Self::Read { .. } | Self::Write { .. } => None,
        }
    }
}

/// 마이그레이션 실행 에러
#[derive(Debug, Error)]
pub enum MigrateError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("migration '{filename}' failed at statement {statement}: {message}")]
    Execution {
        filename: String,
        statement: usize,
        message: String,
    },

    #[error("checksum drift for already-applied migration '{filename}': recorded {recorded}, source {current}")]
    Drift {
        filename: String,
        recorded: String,
        current: String,
    },

    #[error("{failed} schema expectation(s) not met")]
    Verification { failed: usize },

    #[error("could not acquire migration lock {key} within {waited:?}")]
    Lock { key: i64, waited: Duration },

    #[error("batch timed out after {0:?}; remaining migrations were not applied")]
    BatchTimeout(Duration),

    #[error("migration '{filename}' is pending but '{latest_applied}' is already applied")]
    OutOfOrder {
        filename: String,
        latest_applied: String,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    /// 프로세스 종료 코드
    ///
    /// 0은 성공 경로에서만 사용되므로 여기서는 반환하지 않습니다.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Catalog(_) => 2,
            Self::Drift { .. } => 3,
            Self::Verification { .. } => 4,
            Self::Lock { .. } => 5,
            Self::Execution { .. }
            | Self::BatchTimeout(_)
            | Self::OutOfOrder { .. }
            | Self::Database(_)
            | Self::Config(_)
            | Self::Io(_) => 1,
        }
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_filename() {
        let e = MigrateError::Execution {
            filename: "0003_bad.sql".into(),
            statement: 2,
            message: "syntax error at or near \"CREAT\"".into(),
        };
        let text = e.to_string();
        assert!(text.contains("0003_bad.sql"));
        assert!(text.contains("statement 2"));

        let e = MigrateError::from(CatalogError::Empty {
            filename: "0007_empty.sql".into(),
        });
        assert_eq!(
            e.to_string(),
            "catalog error: migration file '0007_empty.sql' is empty"
        );
    }

    #[test]
    fn test_exit_codes_follow_taxonomy() {
        let catalog = MigrateError::from(CatalogError::MissingDirectory("nope".into()));
        assert_eq!(catalog.exit_code(), 2);

        let drift = MigrateError::Drift {
            filename: "0001_create_users.sql".into(),
            recorded: "aa".into(),
            current: "bb".into(),
        };
        assert_eq!(drift.exit_code(), 3);
        assert_eq!(MigrateError::Verification { failed: 1 }.exit_code(), 4);
        assert_eq!(
            MigrateError::Lock {
                key: 1,
                waited: Duration::from_secs(1)
            }
            .exit_code(),
            5
        );
        assert_eq!(MigrateError::Config("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_catalog_error_reports_filename() {
        let e = CatalogError::Truncated {
            filename: "0014_comprehensive_column_additions.sql".into(),
            line: 42,
            tail: "IF NOT EXISTS (SELECT 1 FROM informat".into(),
        };
        assert_eq!(
            e.filename(),
            Some("0014_comprehensive_column_additions.sql")
        );
        assert!(e.to_string().contains("line 42"));
    }
}
