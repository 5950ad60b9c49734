//! 적용 이력 추적.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use tracing::debug;

use super::backend::MigrationBackend;
use super::catalog::Catalog;
use super::models::{MigrationRecord, MigrationStatus};
use crate::error::Result;

/// 추적 테이블 기준 마이그레이션 상태
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppliedState {
    /// 기록 없음
    NotApplied,
    /// completed 이고 체크섬 일치
    Applied,
    /// completed 이지만 소스 체크섬이 다름
    Drifted { recorded: String },
    /// 이전 실행에서 실패 (롤백됨)
    Failed { error: Option<String> },
    /// pending 으로 남음 (실행 도중 프로세스 종료)
    Interrupted,
}

/// 추적 레코드 캐시와 기록 연산.
///
/// 실행 시작 시 추적 테이블을 다시 읽어 생성하며, 이전 실행이 끝났다고
/// 가정하지 않습니다.
#[derive(Debug, Clone, Default)]
pub struct StateTracker {
    records: BTreeMap<String, MigrationRecord>,
}

impl StateTracker {
    /// 백엔드에서 전체 레코드 로드
    pub async fn load<B: MigrationBackend + ?Sized>(backend: &mut B) -> Result<Self> {
        let records = backend.load_records().await?;
        debug!(count = records.len(), "추적 레코드 로드");
        Ok(Self::from_records(records))
    }

    pub fn from_records(records: impl IntoIterator<Item = MigrationRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|r| (r.filename.clone(), r))
                .collect(),
        }
    }

    pub fn get(&self, filename: &str) -> Option<&MigrationRecord> {
        self.records.get(filename)
    }

    pub fn records(&self) -> impl Iterator<Item = &MigrationRecord> {
        self.records.values()
    }

    /// 파일의 현재 상태 판정
    pub fn check(&self, filename: &str, checksum: &str) -> AppliedState {
        match self.records.get(filename) {
            None => AppliedState::NotApplied,
            Some(r) => match r.status {
                MigrationStatus::Completed if r.checksum == checksum => AppliedState::Applied,
                MigrationStatus::Completed => AppliedState::Drifted {
                    recorded: r.checksum.clone(),
                },
                MigrationStatus::Failed => AppliedState::Failed {
                    error: r.error_message.clone(),
                },
                MigrationStatus::Pending => AppliedState::Interrupted,
            },
        }
    }

    /// completed 이고 체크섬이 정확히 일치할 때만 true
    pub fn is_applied(&self, filename: &str, checksum: &str) -> bool {
        self.check(filename, checksum) == AppliedState::Applied
    }

    /// 가장 큰 순번의 적용 완료 파일명 (카탈로그 기준)
    pub fn latest_completed<'a>(&self, catalog: &'a Catalog) -> Option<&'a str> {
        catalog
            .migrations()
            .iter()
            .rev()
            .find(|m| {
                self.records
                    .get(&m.filename)
                    .is_some_and(|r| r.status == MigrationStatus::Completed)
            })
            .map(|m| m.filename.as_str())
    }

    /// 소스 파일이 없는 레코드
    pub fn orphans<'a>(&'a self, catalog: &Catalog) -> Vec<&'a MigrationRecord> {
        self.records
            .values()
            .filter(|r| catalog.get(&r.filename).is_none())
            .collect()
    }

    /// 실행 시작 기록 (트랜잭션 밖, pending)
    pub async fn record_start<B: MigrationBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        filename: &str,
        checksum: &str,
    ) -> Result<()> {
        self.write(
            backend,
            MigrationRecord {
                filename: filename.to_string(),
                checksum: checksum.to_string(),
                status: MigrationStatus::Pending,
                error_message: None,
                execution_time_ms: None,
                applied_at: Utc::now(),
            },
        )
        .await
    }

    /// 성공 기록. 마이그레이션 트랜잭션 안에서 호출되어 함께 커밋됩니다.
    pub async fn record_success<B: MigrationBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        filename: &str,
        checksum: &str,
        duration: Duration,
    ) -> Result<()> {
        self.write(
            backend,
            MigrationRecord {
                filename: filename.to_string(),
                checksum: checksum.to_string(),
                status: MigrationStatus::Completed,
                error_message: None,
                execution_time_ms: Some(duration.as_millis() as i64),
                applied_at: Utc::now(),
            },
        )
        .await
    }

    /// 실패 기록 (롤백 이후)
    pub async fn record_failure<B: MigrationBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        filename: &str,
        checksum: &str,
        error: &str,
        duration: Duration,
    ) -> Result<()> {
        self.write(
            backend,
            MigrationRecord {
                filename: filename.to_string(),
                checksum: checksum.to_string(),
                status: MigrationStatus::Failed,
                error_message: Some(error.to_string()),
                execution_time_ms: Some(duration.as_millis() as i64),
                applied_at: Utc::now(),
            },
        )
        .await
    }

    /// 승인된 drift: SQL 실행 없이 저장된 체크섬만 갱신
    pub async fn rebaseline<B: MigrationBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        filename: &str,
        checksum: &str,
    ) -> Result<()> {
        let Some(existing) = self.records.get(filename).cloned() else {
            return Ok(());
        };
        self.write(
            backend,
            MigrationRecord {
                checksum: checksum.to_string(),
                ..existing
            },
        )
        .await
    }

    async fn write<B: MigrationBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        record: MigrationRecord,
    ) -> Result<()> {
        backend.upsert_record(&record).await?;
        self.records.insert(record.filename.clone(), record);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::backend::MemoryBackend;

    fn record(filename: &str, checksum: &str, status: MigrationStatus) -> MigrationRecord {
        MigrationRecord {
            filename: filename.into(),
            checksum: checksum.into(),
            status,
            error_message: None,
            execution_time_ms: None,
            applied_at: Utc::now(),
        }
    }

    #[test]
    fn test_check_states() {
        let tracker = StateTracker::from_records([
            record("0001_a.sql", "aaa", MigrationStatus::Completed),
            record("0002_b.sql", "bbb", MigrationStatus::Failed),
            record("0003_c.sql", "ccc", MigrationStatus::Pending),
        ]);

        assert_eq!(tracker.check("0001_a.sql", "aaa"), AppliedState::Applied);
        assert!(tracker.is_applied("0001_a.sql", "aaa"));
        assert_eq!(
            tracker.check("0001_a.sql", "zzz"),
            AppliedState::Drifted {
                recorded: "aaa".into()
            }
        );
        assert!(!tracker.is_applied("0001_a.sql", "zzz"));
        assert!(matches!(
            tracker.check("0002_b.sql", "bbb"),
            AppliedState::Failed { .. }
        ));
        assert_eq!(tracker.check("0003_c.sql", "ccc"), AppliedState::Interrupted);
        assert!(!tracker.is_applied("0003_c.sql", "ccc"));
        assert_eq!(tracker.check("0004_d.sql", "ddd"), AppliedState::NotApplied);
    }

    #[tokio::test]
    async fn test_record_lifecycle_persists() {
        let mut backend = MemoryBackend::new();
        let mut tracker = StateTracker::default();

        tracker
            .record_start(&mut backend, "0001_a.sql", "aaa")
            .await
            .unwrap();
        assert_eq!(backend.records()[0].status, MigrationStatus::Pending);

        tracker
            .record_failure(&mut backend, "0001_a.sql", "aaa", "boom", Duration::from_millis(5))
            .await
            .unwrap();
        let stored = &backend.records()[0];
        assert_eq!(stored.status, MigrationStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("boom"));

        tracker
            .record_success(&mut backend, "0001_a.sql", "aaa", Duration::from_millis(42))
            .await
            .unwrap();
        let reloaded = StateTracker::load(&mut backend).await.unwrap();
        assert!(reloaded.is_applied("0001_a.sql", "aaa"));
        assert_eq!(
            reloaded.get("0001_a.sql").unwrap().execution_time_ms,
            Some(42)
        );

        tracker
            .rebaseline(&mut backend, "0001_a.sql", "bbb")
            .await
            .unwrap();
        let reloaded = StateTracker::load(&mut backend).await.unwrap();
        assert!(reloaded.is_applied("0001_a.sql", "bbb"));
    }
}
