//! 마이그레이션 CLI 명령어.
//!
//! # 사용법
//!
//! ```bash
//! # 적용 (실패 시 중단, 종료 코드 1)
//! forge migrate up --db-url "postgres://..." --dir migrations
//!
//! # 수정된 적용 완료 파일 승인
//! forge migrate up --accept-drift 0014_add_columns.sql
//!
//! # 적용 후 검증까지
//! forge migrate up --expect schema_expectations.toml
//!
//! # 상태 확인 (JSON)
//! forge migrate status --json
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::info;

use forge_core::migration::{
    scaffold, Catalog, MigrationLinter, Migrator, PgBackend, RunOptions, SchemaExpectations,
};
use forge_core::MigrateConfig;

/// CLI 플래그로 환경변수 설정을 덮어쓰는 값
#[derive(Debug, Clone, Default)]
pub struct ConnectionOverrides {
    pub migrations_dir: Option<PathBuf>,
    pub database_url: Option<String>,
    pub tracking_table: Option<String>,
    pub lock_key: Option<i64>,
    pub lock_timeout_secs: Option<u64>,
    pub statement_timeout_secs: Option<u64>,
    pub batch_timeout_secs: Option<u64>,
}

impl ConnectionOverrides {
    /// 지정된 값만 덮어쓰기
    pub fn apply(self, config: &mut MigrateConfig) {
        if let Some(dir) = self.migrations_dir {
            config.migrations_dir = dir;
        }
        if let Some(url) = self.database_url {
            config.database_url = Some(url);
        }
        if let Some(table) = self.tracking_table {
            config.tracking_table = table;
        }
        if let Some(key) = self.lock_key {
            config.lock_key = key;
        }
        if let Some(secs) = self.lock_timeout_secs {
            config.lock_timeout_secs = secs;
        }
        if let Some(secs) = self.statement_timeout_secs {
            config.statement_timeout_secs = secs;
        }
        if let Some(secs) = self.batch_timeout_secs {
            config.batch_timeout_secs = secs;
        }
    }
}

/// `migrate up` 옵션
#[derive(Debug, Clone, Default)]
pub struct UpArgs {
    pub dry_run: bool,
    pub continue_on_failure: bool,
    pub allow_out_of_order: bool,
    pub accept_drift: Vec<String>,
    pub accept_all_drift: bool,
    pub target: Option<u32>,
    pub expect: Option<PathBuf>,
    pub json: bool,
}

impl UpArgs {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            dry_run: self.dry_run,
            continue_on_failure: self.continue_on_failure,
            allow_out_of_order: self.allow_out_of_order,
            accept_drift: self.accept_drift.iter().cloned().collect(),
            accept_all_drift: self.accept_all_drift,
            target: self.target,
        }
    }
}

/// 환경변수 + CLI 플래그로 설정 구성
fn load_config(overrides: ConnectionOverrides) -> Result<MigrateConfig> {
    let mut config = MigrateConfig::from_env().context("환경변수 설정 로드 실패")?;
    overrides.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// 마이그레이션 적용
pub async fn run_up(overrides: ConnectionOverrides, args: UpArgs) -> Result<()> {
    let config = load_config(overrides)?;

    // 카탈로그 에러는 어떤 DB 작업보다 먼저 중단
    let catalog = Catalog::load(&config.migrations_dir)?;
    if !args.json {
        println!("\n🚀 마이그레이션 적용 시작...\n");
        println!(
            "📁 {} 개 마이그레이션 파일 발견 ({})",
            catalog.len(),
            config.migrations_dir.display()
        );
    }

    let expectations = args
        .expect
        .as_deref()
        .map(SchemaExpectations::load)
        .transpose()?;

    let backend = PgBackend::connect(&config).await?;
    let mut migrator = Migrator::new(backend, config.runner());

    let report = migrator.up(&catalog, &args.run_options()).await?;
    if args.json {
        print_json(&report)?;
    } else {
        println!("{}", report);
    }

    if !report.is_success() {
        bail!(
            "{} 개 마이그레이션 실패 (--continue-on-failure 저하 모드)",
            report.failed.len()
        );
    }

    if let Some(expectations) = expectations {
        if args.dry_run {
            info!("dry-run 에서는 스키마 검증을 건너뜀");
        } else {
            let verification = migrator.verify(&expectations).await?;
            if args.json {
                print_json(&verification)?;
            } else {
                println!("{}", verification);
            }
            verification.into_result()?;
        }
    }

    migrator.backend().pool().close().await;
    Ok(())
}

/// 파일별 상태 출력
pub async fn run_status(overrides: ConnectionOverrides, json: bool) -> Result<()> {
    let config = load_config(overrides)?;
    let catalog = Catalog::load(&config.migrations_dir)?;

    let backend = PgBackend::connect(&config).await?;
    let mut migrator = Migrator::new(backend, config.runner());
    let report = migrator.status(&catalog).await?;

    if json {
        print_json(&report)?;
    } else {
        println!("{}", report);
        let outstanding = report.outstanding();
        if outstanding > 0 {
            println!("\n📝 적용 대기 {} 개: forge migrate up", outstanding);
        }
    }

    migrator.backend().pool().close().await;
    Ok(())
}

/// 스키마 기대값 검증
pub async fn run_verify(overrides: ConnectionOverrides, expect: &Path, json: bool) -> Result<()> {
    let config = load_config(overrides)?;
    let expectations = SchemaExpectations::load(expect)
        .with_context(|| format!("기대값 파일 로드 실패: {}", expect.display()))?;
    if expectations.is_empty() {
        bail!("기대값이 비어 있습니다: {}", expect.display());
    }

    let backend = PgBackend::connect(&config).await?;
    let mut migrator = Migrator::new(backend, config.runner());
    let report = migrator.verify(&expectations).await?;

    if json {
        print_json(&report)?;
    } else {
        println!("{}", report);
    }
    migrator.backend().pool().close().await;

    report.into_result()?;
    Ok(())
}

/// DB 없이 정적 검사
pub fn run_lint(dir: Option<PathBuf>, verbose: bool, json: bool) -> Result<()> {
    let dir = match dir {
        Some(dir) => dir,
        None => MigrateConfig::from_env()?.migrations_dir,
    };
    let catalog = Catalog::load(&dir)?;
    let report = MigrationLinter::new(&catalog).lint();

    if json {
        print_json(&report)?;
    } else {
        println!("\n🔍 마이그레이션 검사 시작...\n");
        println!("📁 {} 개 마이그레이션 파일 발견", catalog.len());

        if verbose {
            for m in catalog.migrations() {
                println!(
                    "   {:04}. {} ({} 문장)",
                    m.sequence,
                    m.name,
                    m.statements.len()
                );
            }
            println!();
        }

        println!("{}", report);

        if verbose {
            println!("\n📊 의존성 그래프 요약");
            println!("  정의된 객체: {} 개", report.graph.definitions.len());
            println!(
                "  파일 의존 관계: {} 개",
                report
                    .graph
                    .file_dependencies
                    .values()
                    .map(|deps| deps.len())
                    .sum::<usize>()
            );
        }
    }

    if !report.is_valid() {
        bail!(
            "검사 실패: 에러 {} 개를 수정한 후 다시 시도하세요",
            report.count(forge_core::migration::Severity::Error)
        );
    }
    Ok(())
}

/// 새 마이그레이션 파일 생성
pub fn run_new(dir: Option<PathBuf>, description: &str) -> Result<()> {
    let dir = match dir {
        Some(dir) => dir,
        None => MigrateConfig::from_env()?.migrations_dir,
    };
    let path = scaffold(&dir, description)?;
    println!("✅ 생성됨: {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_overrides_replace_only_given_values() {
        let mut config = MigrateConfig::default();
        ConnectionOverrides {
            migrations_dir: Some(PathBuf::from("db/migrations")),
            lock_timeout_secs: Some(5),
            ..ConnectionOverrides::default()
        }
        .apply(&mut config);

        assert_eq!(config.migrations_dir, PathBuf::from("db/migrations"));
        assert_eq!(config.lock_timeout_secs, 5);
        assert_eq!(config.tracking_table, "schema_migrations");
        assert_eq!(config.statement_timeout_secs, 60);
    }

    #[test]
    fn test_up_args_to_run_options() {
        let args = UpArgs {
            accept_drift: vec!["0001_a.sql".into()],
            target: Some(3),
            ..UpArgs::default()
        };
        let options = args.run_options();
        assert!(options.accept_drift.contains("0001_a.sql"));
        assert_eq!(options.target, Some(3));
        assert!(!options.dry_run);
    }

    #[test]
    fn test_lint_fails_on_error_severity() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("0001_users.sql"),
            "CREATE TABLE IF NOT EXISTS users (id INT PRIMARY KEY);\n",
        )
        .unwrap();
        assert!(run_lint(Some(dir.path().to_path_buf()), false, true).is_ok());

        fs::write(
            dir.path().join("0002_index.sql"),
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_users_id ON users (id);\n",
        )
        .unwrap();
        assert!(run_lint(Some(dir.path().to_path_buf()), false, true).is_err());
    }

    #[test]
    fn test_new_creates_next_sequence() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("0007_existing.sql"), "SELECT 1;\n").unwrap();

        run_new(Some(dir.path().to_path_buf()), "Add user avatar").unwrap();
        assert!(dir.path().join("0008_add_user_avatar.sql").exists());
    }
}
