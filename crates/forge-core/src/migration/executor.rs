//! 단일 마이그레이션 실행기.
//!
//! 마이그레이션 하나의 모든 문장을 하나의 트랜잭션으로 실행합니다. 어느 문장이든
//! 실패하면 전체를 롤백하므로 절반만 적용된 마이그레이션은 남지 않습니다.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::backend::MigrationBackend;
use super::guard::{detect_guard, Guard};
use super::models::{Migration, StatementType};
use super::tracker::StateTracker;
use crate::error::{MigrateError, Result};

/// 서버측 statement_timeout 이후 클라이언트가 추가로 기다리는 시간
const CLIENT_TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// 건너뛴 문장
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedStatement {
    /// 1-based 문장 번호
    pub index: usize,
    pub line: usize,
    pub reason: String,
}

/// 실행 결과
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// 실제 실행된 문장 수
    pub executed: usize,
    pub skipped: Vec<SkippedStatement>,
    pub duration: Duration,
}

/// 실행 제한
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionLimits {
    /// 문장당 제한 (서버 + 클라이언트)
    pub statement_timeout: Option<Duration>,
    /// 배치 남은 시간 (마이그레이션 전체 제한)
    pub deadline: Option<Instant>,
}

/// 가드 확인 결과 실행할 SQL (None 이면 건너뜀)
async fn resolve_guard<B: MigrationBackend + ?Sized>(
    backend: &mut B,
    sql: &str,
) -> Result<(Option<String>, Option<String>)> {
    let Some(guard) = detect_guard(sql) else {
        return Ok((Some(sql.to_string()), None));
    };

    match guard {
        Guard::AddConstraint {
            table,
            constraint,
            sql: rewritten,
        } => {
            if backend.constraint_exists(&table, &constraint).await? {
                return Ok((
                    None,
                    Some(format!("constraint {} on {} already exists", constraint, table)),
                ));
            }
            Ok((Some(rewritten), None))
        }
        Guard::DropNotNull { table, column } => {
            if backend.column_nullable(&table, &column).await? == Some(true) {
                return Ok((
                    None,
                    Some(format!("column {}.{} is already nullable", table, column)),
                ));
            }
            Ok((Some(sql.to_string()), None))
        }
        Guard::SetNotNull { table, column } => {
            if backend.column_nullable(&table, &column).await? == Some(false) {
                return Ok((
                    None,
                    Some(format!("column {}.{} is already NOT NULL", table, column)),
                ));
            }
            Ok((Some(sql.to_string()), None))
        }
    }
}

/// DB 에러에서 사용자에게 보여줄 메시지 추출
pub fn database_message(err: &MigrateError) -> String {
    match err {
        MigrateError::Database(sqlx::Error::Database(db)) => db.message().to_string(),
        MigrateError::Database(sqlx::Error::Protocol(msg)) => msg.clone(),
        other => other.to_string(),
    }
}

/// 마이그레이션 하나 적용.
///
/// 성공 기록은 같은 트랜잭션 안에서 남기므로 커밋과 기록이 함께 반영됩니다.
/// 실패 시 롤백 후 [`MigrateError::Execution`] 을 반환하며, 실패 기록은
/// 호출자 책임입니다.
pub async fn apply_migration<B: MigrationBackend + ?Sized>(
    backend: &mut B,
    tracker: &mut StateTracker,
    migration: &Migration,
    limits: ExecutionLimits,
) -> Result<ExecutionOutcome> {
    let started = Instant::now();
    backend.begin(limits.statement_timeout).await?;

    match run_statements(backend, migration, limits).await {
        Ok((executed, skipped)) => {
            let duration = started.elapsed();
            let finished = async {
                tracker
                    .record_success(backend, &migration.filename, &migration.checksum, duration)
                    .await?;
                backend.commit().await
            }
            .await;

            if let Err(e) = finished {
                rollback_quietly(backend, &migration.filename).await;
                return Err(MigrateError::Execution {
                    filename: migration.filename.clone(),
                    statement: migration.statements.len(),
                    message: database_message(&e),
                });
            }

            info!(
                filename = %migration.filename,
                executed,
                skipped = skipped.len(),
                duration_ms = duration.as_millis() as u64,
                "마이그레이션 적용 완료"
            );
            Ok(ExecutionOutcome {
                executed,
                skipped,
                duration,
            })
        }
        Err(e) => {
            rollback_quietly(backend, &migration.filename).await;
            Err(e)
        }
    }
}

async fn rollback_quietly<B: MigrationBackend + ?Sized>(backend: &mut B, filename: &str) {
    if let Err(e) = backend.rollback().await {
        // 커넥션이 끊긴 경우 서버가 트랜잭션을 롤백함
        warn!(filename, error = %e, "롤백 실패");
    }
}

async fn run_statements<B: MigrationBackend + ?Sized>(
    backend: &mut B,
    migration: &Migration,
    limits: ExecutionLimits,
) -> Result<(usize, Vec<SkippedStatement>)> {
    let mut executed = 0;
    let mut skipped = Vec::new();

    for (idx, stmt) in migration.statements.iter().enumerate() {
        let index = idx + 1;
        let fail = |message: String| MigrateError::Execution {
            filename: migration.filename.clone(),
            statement: index,
            message,
        };

        if stmt.statement_type == StatementType::TransactionControl {
            warn!(
                filename = %migration.filename,
                statement = index,
                line = stmt.line_number,
                sql = %stmt.raw_sql,
                "파일 내 트랜잭션 제어문 무시 (실행기가 트랜잭션을 관리함)"
            );
            skipped.push(SkippedStatement {
                index,
                line: stmt.line_number,
                reason: "explicit transaction control".to_string(),
            });
            continue;
        }

        let (sql, reason) = resolve_guard(backend, &stmt.raw_sql)
            .await
            .map_err(|e| fail(database_message(&e)))?;
        let Some(sql) = sql else {
            let reason = reason.unwrap_or_default();
            info!(
                filename = %migration.filename,
                statement = index,
                line = stmt.line_number,
                reason = %reason,
                "이미 목표 상태, 문장 건너뜀"
            );
            skipped.push(SkippedStatement {
                index,
                line: stmt.line_number,
                reason,
            });
            continue;
        };

        let budget = statement_budget(limits, Instant::now());
        if budget == Some(Duration::ZERO) {
            return Err(fail("batch deadline exceeded before statement".to_string()));
        }

        debug!(filename = %migration.filename, statement = index, "문장 실행");
        let result = match budget {
            Some(budget) => match tokio::time::timeout(budget, backend.execute(&sql)).await {
                Ok(result) => result,
                Err(_) => {
                    // 커넥션이 아직 응답 대기 중이라 롤백을 보낼 수 없음
                    backend.abandon();
                    return Err(fail(format!("statement timed out after {:?}", budget)));
                }
            },
            None => backend.execute(&sql).await,
        };
        result.map_err(|e| fail(database_message(&e)))?;
        executed += 1;
    }

    Ok((executed, skipped))
}

/// 문장 하나에 허용된 시간 (문장 제한과 배치 남은 시간 중 작은 값)
fn statement_budget(limits: ExecutionLimits, now: Instant) -> Option<Duration> {
    let per_statement = limits.statement_timeout.map(|t| t + CLIENT_TIMEOUT_GRACE);
    let remaining = limits
        .deadline
        .map(|d| d.saturating_duration_since(now));
    match (per_statement, remaining) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::analyzer::MigrationAnalyzer;
    use crate::migration::backend::MemoryBackend;
    use crate::migration::checksum::checksum;
    use crate::migration::models::{MigrationMeta, MigrationStatus};

    fn migration(filename: &str, sql: &str) -> Migration {
        Migration {
            path: filename.into(),
            filename: filename.into(),
            name: filename.trim_end_matches(".sql").into(),
            sequence: filename[..4].parse().unwrap(),
            content: sql.into(),
            checksum: checksum(sql),
            statements: MigrationAnalyzer::new().parse_statements(sql),
            meta: MigrationMeta::default(),
        }
    }

    #[tokio::test]
    async fn test_failure_rolls_back_whole_migration() {
        let mut backend = MemoryBackend::new();
        let mut tracker = StateTracker::default();
        let m = migration(
            "0001_users.sql",
            "CREATE TABLE users (id INT);\nALTER TABLE users ADD COLUMN email TEXT;\nCREAT TABLE oops (id INT);",
        );

        let err = apply_migration(&mut backend, &mut tracker, &m, ExecutionLimits::default())
            .await
            .unwrap_err();
        match err {
            MigrateError::Execution {
                filename,
                statement,
                message,
            } => {
                assert_eq!(filename, "0001_users.sql");
                assert_eq!(statement, 3);
                assert!(message.contains("CREAT"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!backend.has_table("users"));
        assert!(backend.records().is_empty());
    }

    #[tokio::test]
    async fn test_success_records_completed_in_same_transaction() {
        let mut backend = MemoryBackend::new();
        let mut tracker = StateTracker::default();
        let m = migration("0001_users.sql", "CREATE TABLE users (id INT PRIMARY KEY);");

        let outcome = apply_migration(&mut backend, &mut tracker, &m, ExecutionLimits::default())
            .await
            .unwrap();
        assert_eq!(outcome.executed, 1);
        assert!(backend.has_table("users"));
        let records = backend.records();
        assert_eq!(records[0].status, MigrationStatus::Completed);
        assert_eq!(records[0].checksum, m.checksum);
    }

    #[tokio::test]
    async fn test_guards_skip_satisfied_statements() {
        let mut backend = MemoryBackend::new();
        let mut tracker = StateTracker::default();
        let m = migration(
            "0001_users.sql",
            "BEGIN;
             CREATE TABLE users (id INT, email TEXT, bio TEXT);
             ALTER TABLE users ADD CONSTRAINT IF NOT EXISTS users_email_key UNIQUE (email);
             ALTER TABLE users ADD CONSTRAINT IF NOT EXISTS users_email_key UNIQUE (email);
             ALTER TABLE users ALTER COLUMN bio DROP NOT NULL;
             COMMIT;",
        );

        let outcome = apply_migration(&mut backend, &mut tracker, &m, ExecutionLimits::default())
            .await
            .unwrap();
        assert_eq!(outcome.executed, 2);
        let skipped: Vec<usize> = outcome.skipped.iter().map(|s| s.index).collect();
        assert_eq!(skipped, vec![1, 4, 5, 6]);
        assert!(backend.has_constraint("users", "users_email_key"));

        let executed = backend.executed();
        assert!(executed.iter().all(|sql| !sql.contains("IF NOT EXISTS users_email_key")));
        assert!(!executed.iter().any(|sql| sql.starts_with("BEGIN")));
    }

    #[tokio::test]
    async fn test_statement_timeout_rolls_back() {
        let mut backend = MemoryBackend::new();
        backend.delay_on("pg_sleep", Duration::from_secs(60));
        let mut tracker = StateTracker::default();
        let m = migration(
            "0001_slow.sql",
            "CREATE TABLE a (id INT);\nSELECT pg_sleep(60);",
        );

        let limits = ExecutionLimits {
            statement_timeout: None,
            deadline: Some(Instant::now() + Duration::from_millis(50)),
        };
        let err = apply_migration(&mut backend, &mut tracker, &m, limits)
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Execution { statement: 2, .. }));
        assert!(!backend.has_table("a"));
    }

    #[tokio::test]
    async fn test_batch_deadline_does_not_wait_for_busy_statement() {
        let mut backend = MemoryBackend::new();
        backend.delay_on("pg_sleep", Duration::from_secs(3600));
        let mut tracker = StateTracker::default();
        let m = migration(
            "0001_slow.sql",
            "CREATE TABLE a (id INT);\nSELECT pg_sleep(3600);",
        );

        let limits = ExecutionLimits {
            statement_timeout: None,
            deadline: Some(Instant::now() + Duration::from_millis(100)),
        };
        let started = Instant::now();
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            apply_migration(&mut backend, &mut tracker, &m, limits),
        )
        .await
        .expect("apply_migration should return once the batch deadline passes")
        .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(5));
        match err {
            MigrateError::Execution {
                statement, message, ..
            } => {
                assert_eq!(statement, 2);
                assert!(message.contains("timed out"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!backend.has_table("a"));

        // 버린 트랜잭션 이후에도 같은 세션으로 다음 마이그레이션 적용 가능
        let next = migration("0002_b.sql", "CREATE TABLE b (id INT);");
        apply_migration(&mut backend, &mut tracker, &next, ExecutionLimits::default())
            .await
            .unwrap();
        assert!(backend.has_table("b"));
    }

    #[test]
    fn test_statement_budget() {
        let now = Instant::now();
        let limits = ExecutionLimits {
            statement_timeout: Some(Duration::from_secs(60)),
            deadline: Some(now + Duration::from_secs(10)),
        };
        assert_eq!(statement_budget(limits, now), Some(Duration::from_secs(10)));
        assert_eq!(
            statement_budget(ExecutionLimits::default(), now),
            None
        );
        let only_statement = ExecutionLimits {
            statement_timeout: Some(Duration::from_secs(1)),
            deadline: None,
        };
        assert_eq!(
            statement_budget(only_statement, now),
            Some(Duration::from_secs(6))
        );
    }
}
