//! 스키마 마이그레이션 실행기.
//!
//! 디렉토리의 `NNNN_description.sql` 파일을 읽어 순번대로 정렬하고,
//! 아직 적용되지 않은 파일을 파일당 하나의 트랜잭션으로 실행합니다.
//! 적용 이력은 추적 테이블에 체크섬과 함께 기록됩니다.
//!
//! # 사용 예시
//!
//! ```ignore
//! use forge_core::migration::{Catalog, Migrator, MigrationLinter, PgBackend, RunOptions};
//!
//! let catalog = Catalog::load("migrations")?;
//! let lint = MigrationLinter::new(&catalog).lint();
//! let backend = PgBackend::connect(&config).await?;
//! let mut migrator = Migrator::new(backend, config.runner());
//! let report = migrator.up(&catalog, &RunOptions::default()).await?;
//! ```

pub mod analyzer;
pub mod backend;
pub mod catalog;
pub mod checksum;
pub mod executor;
pub mod guard;
pub mod lexer;
pub mod models;
pub mod runner;
pub(crate) mod tokens;
pub mod tracker;
pub mod validator;
pub mod verifier;

pub use analyzer::MigrationAnalyzer;
#[cfg(any(test, feature = "testing"))]
pub use backend::MemoryBackend;
pub use backend::{MigrationBackend, PgBackend};
pub use catalog::{parse_file_name, scaffold, Catalog};
pub use checksum::checksum;
pub use executor::{apply_migration, ExecutionLimits, ExecutionOutcome};
pub use guard::{detect_guard, Guard};
pub use lexer::{split_statements, SplitEnd};
pub use models::*;
pub use runner::{
    MigrationState, Migrator, RunOptions, RunReport, StatusEntry, StatusReport,
};
pub use tracker::{AppliedState, StateTracker};
pub use validator::MigrationLinter;
pub use verifier::{SchemaExpectations, VerificationReport, Verifier};
