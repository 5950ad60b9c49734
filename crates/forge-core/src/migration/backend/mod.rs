//! 마이그레이션 실행 백엔드.
//!
//! 러너/실행기/검증기는 이 트레이트만 사용합니다. 운영에서는 [`PgBackend`],
//! 테스트에서는 `testing` feature 의 `MemoryBackend` 를 사용합니다.

#[cfg(any(test, feature = "testing"))]
mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;

#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryBackend;
pub use postgres::PgBackend;

use super::models::{MigrationRecord, TableRef};
use crate::error::Result;

/// 데이터베이스 백엔드 트레이트.
///
/// `begin` 이후 `commit`/`rollback` 전까지의 `execute` 와 조회 메서드는 모두
/// 열린 트랜잭션 안에서 실행되어야 합니다.
#[async_trait]
pub trait MigrationBackend: Send {
    /// 백엔드 이름 (로그용)
    fn name(&self) -> &'static str;

    /// 추적 테이블 생성 (이미 있으면 무시)
    async fn ensure_tracking_table(&mut self) -> Result<()>;

    /// 추적 테이블 전체 조회 (테이블이 없으면 빈 목록)
    async fn load_records(&mut self) -> Result<Vec<MigrationRecord>>;

    /// 추적 레코드 삽입 또는 갱신 (filename 기준)
    async fn upsert_record(&mut self, record: &MigrationRecord) -> Result<()>;

    /// advisory lock 획득 (timeout 동안 재시도)
    async fn acquire_lock(&mut self, key: i64, timeout: Duration) -> Result<()>;

    /// advisory lock 해제
    async fn release_lock(&mut self, key: i64) -> Result<()>;

    /// 트랜잭션 시작
    async fn begin(&mut self, statement_timeout: Option<Duration>) -> Result<()>;

    /// SQL 문장 실행, 영향받은 행 수 반환
    async fn execute(&mut self, sql: &str) -> Result<u64>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    /// 응답을 기다리던 요청이 취소된 트랜잭션을 기다리지 않고 버림.
    ///
    /// 커넥션이 아직 서버 응답을 기다리는 상태이므로 `rollback` 을 보낼 수 없습니다.
    /// 커넥션을 닫고 롤백은 서버의 세션 종료 처리에 맡깁니다.
    fn abandon(&mut self);

    /// 테이블 존재 여부
    async fn table_exists(&mut self, table: &TableRef) -> Result<bool>;

    /// 컬럼 nullable 여부 (컬럼이 없으면 None)
    async fn column_nullable(&mut self, table: &TableRef, column: &str) -> Result<Option<bool>>;

    /// 제약조건 존재 여부
    async fn constraint_exists(&mut self, table: &TableRef, constraint: &str) -> Result<bool>;

    /// 행 수 (테이블이 없으면 None)
    async fn row_count(&mut self, table: &TableRef) -> Result<Option<i64>>;
}
