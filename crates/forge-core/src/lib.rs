//! Content forge 백엔드 스키마 마이그레이션 코어.
//!
//! 버전이 매겨진 SQL 파일을 순서대로 검증하고, 트랜잭션 단위로 적용하며,
//! 적용 이력을 추적 테이블에 기록합니다.
//!
//! # 사용 예시
//!
//! ```rust,ignore
//! use forge_core::migration::{Catalog, Migrator, PgBackend, RunOptions};
//! use forge_core::MigrateConfig;
//!
//! let config = MigrateConfig::from_env()?;
//! let catalog = Catalog::load(&config.migrations_dir)?;
//! let backend = PgBackend::connect(&config).await?;
//! let mut migrator = Migrator::new(backend, config.runner());
//! let report = migrator.up(&catalog, &RunOptions::default()).await?;
//! println!("{}", report);
//! ```

pub mod config;
pub mod error;
pub mod migration;

pub use config::MigrateConfig;
pub use error::{CatalogError, MigrateError, Result};
