//! Content forge 스키마 마이그레이션 CLI.
//!
//! # 사용 예시
//!
//! ```bash
//! # 미적용 마이그레이션 적용
//! forge migrate up --db-url "postgres://..."
//!
//! # 실행 계획만 확인
//! forge migrate up --dry-run
//!
//! # 파일별 상태
//! forge migrate status
//!
//! # 적용 후 스키마 검증
//! forge migrate verify --expect schema_expectations.toml
//!
//! # DB 없이 정적 검사
//! forge migrate lint
//!
//! # 새 마이그레이션 파일 생성
//! forge migrate new add user avatar
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::error;
use tracing_subscriber::EnvFilter;

use forge_core::{CatalogError, MigrateError};

mod commands;

use commands::migrate::{self, ConnectionOverrides, UpArgs};

#[derive(Parser)]
#[command(name = "forge")]
#[command(about = "Content forge 스키마 마이그레이션 도구", long_about = None)]
#[command(version)]
struct Cli {
    /// 로그 출력 형식
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// 스키마 마이그레이션 관리
    Migrate {
        #[command(subcommand)]
        action: MigrateAction,
    },
}

/// DB 연결 관련 공통 옵션 (지정하지 않으면 환경변수 사용)
#[derive(Args, Debug, Clone, Default)]
struct ConnectionArgs {
    /// 마이그레이션 디렉토리 (기본: MIGRATIONS_DIR 또는 migrations)
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// 데이터베이스 URL (기본: DATABASE_URL 환경변수)
    #[arg(long)]
    db_url: Option<String>,

    /// 추적 테이블 이름 (기본: schema_migrations)
    #[arg(long)]
    table: Option<String>,

    /// advisory lock 키
    #[arg(long)]
    lock_key: Option<i64>,

    /// 락 획득 대기 시간 (초)
    #[arg(long)]
    lock_timeout: Option<u64>,

    /// 문장당 제한 시간 (초, 0 = 무제한)
    #[arg(long)]
    statement_timeout: Option<u64>,

    /// 배치 전체 제한 시간 (초, 0 = 무제한)
    #[arg(long)]
    batch_timeout: Option<u64>,
}

impl From<ConnectionArgs> for ConnectionOverrides {
    fn from(args: ConnectionArgs) -> Self {
        Self {
            migrations_dir: args.dir,
            database_url: args.db_url,
            tracking_table: args.table,
            lock_key: args.lock_key,
            lock_timeout_secs: args.lock_timeout,
            statement_timeout_secs: args.statement_timeout,
            batch_timeout_secs: args.batch_timeout,
        }
    }
}

#[derive(Subcommand)]
enum MigrateAction {
    /// 미적용 마이그레이션을 순서대로 적용
    Up {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// 실행 계획만 출력
        #[arg(long)]
        dry_run: bool,

        /// 실패한 마이그레이션을 건너뛰고 계속 진행 (저하 모드)
        #[arg(long)]
        continue_on_failure: bool,

        /// 이미 적용된 것보다 낮은 순번의 마이그레이션 적용 허용
        #[arg(long)]
        allow_out_of_order: bool,

        /// 내용이 바뀐 적용 완료 파일의 체크섬 재기록 (반복 가능)
        #[arg(long, value_name = "FILENAME")]
        accept_drift: Vec<String>,

        /// 모든 drift 승인
        #[arg(long)]
        accept_all_drift: bool,

        /// 이 순번까지만 적용
        #[arg(long, value_name = "SEQUENCE")]
        to: Option<u32>,

        /// 적용 후 스키마 검증 파일
        #[arg(long, value_name = "FILE")]
        expect: Option<PathBuf>,

        /// JSON 으로 결과 출력
        #[arg(long)]
        json: bool,
    },

    /// 파일별 적용 상태 출력
    Status {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// JSON 으로 결과 출력
        #[arg(long)]
        json: bool,
    },

    /// 스키마 기대값 검증
    Verify {
        #[command(flatten)]
        connection: ConnectionArgs,

        /// 기대값 TOML 파일
        #[arg(long, value_name = "FILE", default_value = "schema_expectations.toml")]
        expect: PathBuf,

        /// JSON 으로 결과 출력
        #[arg(long)]
        json: bool,
    },

    /// DB 없이 정적 검사
    Lint {
        /// 마이그레이션 디렉토리
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// 상세 출력 (의존성 요약)
        #[arg(long)]
        verbose: bool,

        /// JSON 으로 결과 출력
        #[arg(long)]
        json: bool,
    },

    /// 다음 순번의 빈 마이그레이션 파일 생성
    New {
        /// 마이그레이션 디렉토리
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// 설명 (파일명에 사용)
        #[arg(required = true, num_args = 1..)]
        description: Vec<String>,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// 에러 체인에서 종료 코드 결정
fn exit_code_for(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<MigrateError>() {
            return e.exit_code();
        }
        if cause.downcast_ref::<CatalogError>().is_some() {
            return 2;
        }
    }
    1
}

#[tokio::main]
async fn main() -> ExitCode {
    // .env 파일 로드 (없어도 에러 안남)
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let result = match cli.command {
        Commands::Migrate { action } => match action {
            MigrateAction::Up {
                connection,
                dry_run,
                continue_on_failure,
                allow_out_of_order,
                accept_drift,
                accept_all_drift,
                to,
                expect,
                json,
            } => {
                let args = UpArgs {
                    dry_run,
                    continue_on_failure,
                    allow_out_of_order,
                    accept_drift,
                    accept_all_drift,
                    target: to,
                    expect,
                    json,
                };
                migrate::run_up(connection.into(), args).await
            }
            MigrateAction::Status { connection, json } => {
                migrate::run_status(connection.into(), json).await
            }
            MigrateAction::Verify {
                connection,
                expect,
                json,
            } => migrate::run_verify(connection.into(), &expect, json).await,
            MigrateAction::Lint { dir, verbose, json } => migrate::run_lint(dir, verbose, json),
            MigrateAction::New { dir, description } => {
                migrate::run_new(dir, &description.join(" "))
            }
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "명령 실패");
            eprintln!("\n❌ {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_up_flags() {
        let cli = Cli::try_parse_from([
            "forge",
            "migrate",
            "up",
            "--dir",
            "db/migrations",
            "--accept-drift",
            "0001_a.sql",
            "--accept-drift",
            "0002_b.sql",
            "--to",
            "7",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::Migrate {
                action:
                    MigrateAction::Up {
                        connection,
                        accept_drift,
                        to,
                        dry_run,
                        ..
                    },
            } => {
                assert_eq!(connection.dir, Some(PathBuf::from("db/migrations")));
                assert_eq!(accept_drift, vec!["0001_a.sql", "0002_b.sql"]);
                assert_eq!(to, Some(7));
                assert!(!dry_run);
            }
            _ => panic!("expected migrate up"),
        }
    }

    #[test]
    fn test_new_joins_description_words() {
        let cli = Cli::try_parse_from(["forge", "migrate", "new", "add", "user", "avatar"]).unwrap();
        match cli.command {
            Commands::Migrate {
                action: MigrateAction::New { description, .. },
            } => assert_eq!(description.join(" "), "add user avatar"),
            _ => panic!("expected migrate new"),
        }
    }

    #[test]
    fn test_exit_code_from_error_chain() {
        let err = anyhow::Error::new(MigrateError::Drift {
            filename: "0001_a.sql".into(),
            recorded: "a".into(),
            current: "b".into(),
        })
        .context("migrate up 실패");
        assert_eq!(exit_code_for(&err), 3);

        let err = anyhow::Error::new(CatalogError::Empty {
            filename: "0002_b.sql".into(),
        });
        assert_eq!(exit_code_for(&err), 2);

        assert_eq!(exit_code_for(&anyhow::anyhow!("other")), 1);
    }
}
