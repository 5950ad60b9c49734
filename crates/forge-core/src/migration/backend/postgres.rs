//! PostgreSQL 백엔드 (sqlx).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;
use tracing::{debug, info, warn};

use super::MigrationBackend;
use crate::config::{mask_database_url, MigrateConfig};
use crate::error::{MigrateError, Result};
use crate::migration::models::{MigrationRecord, MigrationStatus, TableRef};

/// advisory lock 재시도 간격
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(500);

type RecordRow = (
    String,
    String,
    String,
    Option<String>,
    Option<i64>,
    DateTime<Utc>,
);

/// PostgreSQL 백엔드.
///
/// advisory lock 은 세션 단위이므로 전용 커넥션 하나에 잡아 두고,
/// 마이그레이션 트랜잭션은 별도 커넥션에서 실행합니다. 트랜잭션 커넥션은
/// 클라이언트 타임아웃 후 풀에 돌려주지 않고 닫을 수 있도록 직접 보관합니다.
pub struct PgBackend {
    pool: PgPool,
    table: String,
    /// BEGIN 이 실행된 커넥션
    tx: Option<PoolConnection<Postgres>>,
    lock_conn: Option<PoolConnection<Postgres>>,
}

impl PgBackend {
    /// 설정으로 커넥션 풀 생성
    pub async fn connect(config: &MigrateConfig) -> Result<Self> {
        let url = config.require_database_url()?;
        info!(
            database_url = %mask_database_url(url),
            max_connections = config.max_connections,
            "데이터베이스 연결 중"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await?;

        Ok(Self::from_pool(pool, &config.tracking_table))
    }

    /// 기존 풀 사용
    pub fn from_pool(pool: PgPool, tracking_table: &str) -> Self {
        Self {
            pool,
            table: tracking_table.to_string(),
            tx: None,
            lock_conn: None,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn no_transaction(op: &str) -> MigrateError {
        MigrateError::Database(sqlx::Error::Protocol(format!(
            "{} called without an open transaction",
            op
        )))
    }
}

/// 식별자 따옴표 처리
/// 열린 트랜잭션 커넥션은 풀로 돌아가지 않도록 닫음
impl Drop for PgBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            drop(tx.detach());
        }
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn record_from_row(row: RecordRow) -> Result<MigrationRecord> {
    let (filename, checksum, status, error_message, execution_time_ms, applied_at) = row;
    let status: MigrationStatus = status.parse().map_err(|e: String| {
        MigrateError::Database(sqlx::Error::ColumnDecode {
            index: "status".to_string(),
            source: e.into(),
        })
    })?;
    Ok(MigrationRecord {
        filename,
        checksum,
        status,
        error_message,
        execution_time_ms,
        applied_at,
    })
}

#[async_trait]
impl MigrationBackend for PgBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn ensure_tracking_table(&mut self) -> Result<()> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                filename TEXT PRIMARY KEY,
                checksum TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'failed')),
                error_message TEXT,
                execution_time_ms BIGINT,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            table = self.table
        );
        sqlx::raw_sql(&ddl).execute(&self.pool).await?;
        debug!(table = %self.table, "추적 테이블 확인 완료");
        Ok(())
    }

    async fn load_records(&mut self) -> Result<Vec<MigrationRecord>> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(&self.table)
            .fetch_one(&self.pool)
            .await?;
        if !exists {
            return Ok(Vec::new());
        }

        let sql = format!(
            r#"
            SELECT filename, checksum, status, error_message, execution_time_ms, applied_at
            FROM {}
            ORDER BY filename
            "#,
            self.table
        );
        let rows: Vec<RecordRow> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(record_from_row).collect()
    }

    async fn upsert_record(&mut self, record: &MigrationRecord) -> Result<()> {
        let sql = format!(
            r#"
            INSERT INTO {} (filename, checksum, status, error_message, execution_time_ms, applied_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (filename) DO UPDATE SET
                checksum = EXCLUDED.checksum,
                status = EXCLUDED.status,
                error_message = EXCLUDED.error_message,
                execution_time_ms = EXCLUDED.execution_time_ms,
                applied_at = EXCLUDED.applied_at
            "#,
            self.table
        );
        let query = sqlx::query(&sql)
            .bind(&record.filename)
            .bind(&record.checksum)
            .bind(record.status.to_string())
            .bind(&record.error_message)
            .bind(record.execution_time_ms)
            .bind(record.applied_at);

        // 트랜잭션 안이면 마이그레이션과 함께 커밋/롤백
        match self.tx.as_mut() {
            Some(tx) => query.execute(&mut **tx).await?,
            None => query.execute(&self.pool).await?,
        };
        Ok(())
    }

    async fn acquire_lock(&mut self, key: i64, timeout: Duration) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let started = Instant::now();
        let mut announced = false;

        loop {
            let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(key)
                .fetch_one(&mut *conn)
                .await?;
            if acquired {
                info!(lock_key = key, "마이그레이션 락 획득");
                self.lock_conn = Some(conn);
                return Ok(());
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(MigrateError::Lock { key, waited });
            }
            if !announced {
                warn!(lock_key = key, "다른 프로세스가 마이그레이션 중, 락 대기");
                announced = true;
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(timeout - waited)).await;
        }
    }

    async fn release_lock(&mut self, key: i64) -> Result<()> {
        let Some(mut conn) = self.lock_conn.take() else {
            return Ok(());
        };
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        if !released {
            warn!(lock_key = key, "해제할 락이 없음");
        } else {
            debug!(lock_key = key, "마이그레이션 락 해제");
        }
        Ok(())
    }

    async fn begin(&mut self, statement_timeout: Option<Duration>) -> Result<()> {
        let mut tx = self.pool.acquire().await?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql("BEGIN")).await?;
        if let Some(timeout) = statement_timeout {
            let sql = format!("SET LOCAL statement_timeout = {}", timeout.as_millis());
            if let Err(e) = sqlx::Executor::execute(&mut *tx, sqlx::raw_sql(&sql)).await {
                drop(tx.detach());
                return Err(e.into());
            }
        }
        self.tx = Some(tx);
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<u64> {
        let tx = self.tx.as_mut().ok_or_else(|| Self::no_transaction("execute"))?;
        let result = sqlx::Executor::execute(&mut **tx, sqlx::raw_sql(sql)).await?;
        Ok(result.rows_affected())
    }

    async fn commit(&mut self) -> Result<()> {
        let mut tx = self.tx.take().ok_or_else(|| Self::no_transaction("commit"))?;
        sqlx::Executor::execute(&mut *tx, sqlx::raw_sql("COMMIT")).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(mut tx) = self.tx.take() {
            if let Err(e) = sqlx::Executor::execute(&mut *tx, sqlx::raw_sql("ROLLBACK")).await {
                // 상태를 알 수 없는 커넥션은 풀에 돌려주지 않음
                drop(tx.detach());
                return Err(e.into());
            }
        }
        Ok(())
    }

    fn abandon(&mut self) {
        if let Some(tx) = self.tx.take() {
            warn!("응답 대기 중인 트랜잭션 커넥션 종료 (서버가 롤백)");
            drop(tx.detach());
        }
    }

    async fn table_exists(&mut self, table: &TableRef) -> Result<bool> {
        let query = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = COALESCE($1::text, current_schema()::text)
                  AND table_name = $2
            )
            "#,
        )
        .bind(&table.schema)
        .bind(&table.name);

        let exists: bool = match self.tx.as_mut() {
            Some(tx) => query.fetch_one(&mut **tx).await?,
            None => query.fetch_one(&self.pool).await?,
        };
        Ok(exists)
    }

    async fn column_nullable(&mut self, table: &TableRef, column: &str) -> Result<Option<bool>> {
        let query = sqlx::query_scalar(
            r#"
            SELECT is_nullable::text FROM information_schema.columns
            WHERE table_schema = COALESCE($1::text, current_schema()::text)
              AND table_name = $2
              AND column_name = $3
            "#,
        )
        .bind(&table.schema)
        .bind(&table.name)
        .bind(column);

        let nullable: Option<String> = match self.tx.as_mut() {
            Some(tx) => query.fetch_optional(&mut **tx).await?,
            None => query.fetch_optional(&self.pool).await?,
        };
        Ok(nullable.map(|v| v.eq_ignore_ascii_case("YES")))
    }

    async fn constraint_exists(&mut self, table: &TableRef, constraint: &str) -> Result<bool> {
        let query = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.table_constraints
                WHERE table_schema = COALESCE($1::text, current_schema()::text)
                  AND table_name = $2
                  AND constraint_name = $3
            )
            "#,
        )
        .bind(&table.schema)
        .bind(&table.name)
        .bind(constraint);

        let exists: bool = match self.tx.as_mut() {
            Some(tx) => query.fetch_one(&mut **tx).await?,
            None => query.fetch_one(&self.pool).await?,
        };
        Ok(exists)
    }

    async fn row_count(&mut self, table: &TableRef) -> Result<Option<i64>> {
        if !self.table_exists(table).await? {
            return Ok(None);
        }

        let target = match &table.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&table.name)),
            None => quote_ident(&table.name),
        };
        let sql = format!("SELECT COUNT(*) FROM {}", target);
        let query = sqlx::query_scalar(&sql);

        let count: i64 = match self.tx.as_mut() {
            Some(tx) => query.fetch_one(&mut **tx).await?,
            None => query.fetch_one(&self.pool).await?,
        };
        Ok(Some(count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("users"), "\"users\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_record_from_row_rejects_unknown_status() {
        let now = Utc::now();
        let ok = record_from_row((
            "0001_a.sql".into(),
            "abc".into(),
            "completed".into(),
            None,
            Some(12),
            now,
        ))
        .unwrap();
        assert_eq!(ok.status, MigrationStatus::Completed);

        let err = record_from_row(("0001_a.sql".into(), "abc".into(), "done".into(), None, None, now));
        assert!(matches!(err, Err(MigrateError::Database(_))));
    }
}
