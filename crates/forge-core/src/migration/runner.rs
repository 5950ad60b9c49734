//! 마이그레이션 러너 (`migrate up`, `migrate status`).
//!
//! 실행 순서:
//! 1. advisory lock 획득 (다른 배포 프로세스와 경합 방지)
//! 2. 추적 테이블 확인 및 레코드 재조회
//! 3. 계획 수립: 적용 / 이미 적용 / 비활성 / 대체됨 / drift / 순서 위반
//! 4. 오름차순 실행, 실패 시 중단
//! 5. 락 해제 (성공/실패와 무관하게 항상)

use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use super::backend::MigrationBackend;
use super::catalog::Catalog;
use super::executor::{apply_migration, database_message, ExecutionLimits};
use super::models::{
    MetaStatus, Migration, MigrationRecord, MigrationStatus, RULE_HEAVY, RULE_LIGHT,
};
use super::tracker::{AppliedState, StateTracker};
use super::verifier::{SchemaExpectations, VerificationReport, Verifier};
use crate::config::RunnerConfig;
use crate::error::{MigrateError, Result};

/// `migrate up` 옵션
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// 계획만 출력하고 실행하지 않음
    pub dry_run: bool,
    /// 실패한 마이그레이션을 건너뛰고 계속 진행 (저하 모드)
    pub continue_on_failure: bool,
    /// 이미 적용된 것보다 낮은 순번의 미적용 마이그레이션 허용
    pub allow_out_of_order: bool,
    /// drift 를 승인할 파일명
    pub accept_drift: HashSet<String>,
    /// 모든 drift 승인
    pub accept_all_drift: bool,
    /// 이 순번까지만 적용
    pub target: Option<u32>,
}

impl RunOptions {
    fn drift_accepted(&self, filename: &str) -> bool {
        self.accept_all_drift || self.accept_drift.contains(filename)
    }
}

/// 적용된 마이그레이션
#[derive(Debug, Clone, Serialize)]
pub struct AppliedMigration {
    pub filename: String,
    pub executed_statements: usize,
    pub skipped_statements: usize,
    pub duration_ms: u64,
}

/// 실행하지 않은 마이그레이션과 사유
#[derive(Debug, Clone, Serialize)]
pub struct SkippedMigration {
    pub filename: String,
    pub reason: String,
}

/// 실패한 마이그레이션
#[derive(Debug, Clone, Serialize)]
pub struct FailedMigration {
    pub filename: String,
    pub statement: Option<usize>,
    pub error: String,
}

/// `migrate up` 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub dry_run: bool,
    pub applied: Vec<AppliedMigration>,
    pub already_applied: Vec<String>,
    pub skipped: Vec<SkippedMigration>,
    pub rebaselined: Vec<String>,
    pub failed: Vec<FailedMigration>,
    /// dry-run 에서 적용 예정인 파일
    pub planned: Vec<String>,
    #[serde(skip)]
    pub elapsed: Duration,
}

impl RunReport {
    /// 실패 없이 끝났는지
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// 요약 로그
    pub fn log_summary(&self) {
        info!(
            applied = self.applied.len(),
            already_applied = self.already_applied.len(),
            skipped = self.skipped.len(),
            rebaselined = self.rebaselined.len(),
            failed = self.failed.len(),
            dry_run = self.dry_run,
            elapsed = format!("{:.1}s", self.elapsed.as_secs_f64()),
            "마이그레이션 실행 완료"
        );
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", RULE_HEAVY)?;
        if self.dry_run {
            writeln!(f, "                 마이그레이션 실행 계획 (dry-run)")?;
        } else {
            writeln!(f, "                    마이그레이션 실행 결과")?;
        }
        writeln!(f, "{}", RULE_HEAVY)?;
        writeln!(f)?;

        if self.dry_run {
            writeln!(f, "📋 적용 예정: {} 개", self.planned.len())?;
            for name in &self.planned {
                writeln!(f, "  ▶ {}", name)?;
            }
        } else {
            writeln!(f, "✅ 적용: {} 개", self.applied.len())?;
            for m in &self.applied {
                write!(f, "  ✓ {} ({} ms", m.filename, m.duration_ms)?;
                if m.skipped_statements > 0 {
                    write!(f, ", 건너뛴 문장 {} 개", m.skipped_statements)?;
                }
                writeln!(f, ")")?;
            }
        }
        writeln!(f, "⏭️  이미 적용됨: {} 개", self.already_applied.len())?;

        if !self.rebaselined.is_empty() {
            writeln!(f, "🔁 체크섬 재기록 (drift 승인): {} 개", self.rebaselined.len())?;
            for name in &self.rebaselined {
                writeln!(f, "  ~ {}", name)?;
            }
        }

        if !self.skipped.is_empty() {
            writeln!(f)?;
            writeln!(f, "{}", RULE_LIGHT)?;
            writeln!(f, "⚠️  건너뛴 마이그레이션 (기술 부채)")?;
            writeln!(f, "{}", RULE_LIGHT)?;
            for s in &self.skipped {
                writeln!(f, "  - {}: {}", s.filename, s.reason)?;
            }
        }

        if !self.failed.is_empty() {
            writeln!(f)?;
            writeln!(f, "{}", RULE_LIGHT)?;
            writeln!(f, "❌ 실패")?;
            writeln!(f, "{}", RULE_LIGHT)?;
            for m in &self.failed {
                match m.statement {
                    Some(n) => writeln!(f, "  ✗ {} (문장 {}): {}", m.filename, n, m.error)?,
                    None => writeln!(f, "  ✗ {}: {}", m.filename, m.error)?,
                }
            }
        }

        writeln!(f)?;
        writeln!(f, "⏱️  소요 시간: {:.2}초", self.elapsed.as_secs_f64())?;
        writeln!(f, "{}", RULE_HEAVY)
    }
}

/// `migrate status` 의 파일별 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationState {
    Applied,
    Pending,
    Failed,
    Drift,
    Disabled,
    Superseded,
    Interrupted,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MigrationState::Applied => "applied",
            MigrationState::Pending => "pending",
            MigrationState::Failed => "failed",
            MigrationState::Drift => "drift",
            MigrationState::Disabled => "disabled",
            MigrationState::Superseded => "superseded",
            MigrationState::Interrupted => "interrupted",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusEntry {
    pub sequence: u32,
    pub filename: String,
    pub state: MigrationState,
    pub applied_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
    pub error_message: Option<String>,
    /// 비활성/대체 사유
    pub note: Option<String>,
}

/// `migrate status` 결과
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub entries: Vec<StatusEntry>,
    /// 소스 파일이 없는 추적 레코드
    pub orphans: Vec<MigrationRecord>,
}

impl StatusReport {
    pub fn count(&self, state: MigrationState) -> usize {
        self.entries.iter().filter(|e| e.state == state).count()
    }

    /// 적용이 필요한 파일 수 (pending/failed/interrupted)
    pub fn outstanding(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| {
                matches!(
                    e.state,
                    MigrationState::Pending | MigrationState::Failed | MigrationState::Interrupted
                )
            })
            .count()
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", RULE_HEAVY)?;
        writeln!(f, "                      마이그레이션 상태")?;
        writeln!(f, "{}", RULE_HEAVY)?;
        writeln!(f)?;

        for e in &self.entries {
            let icon = match e.state {
                MigrationState::Applied => "✅",
                MigrationState::Pending => "⏳",
                MigrationState::Failed => "❌",
                MigrationState::Drift => "⚠️ ",
                MigrationState::Disabled | MigrationState::Superseded => "⏭️ ",
                MigrationState::Interrupted => "💥",
            };
            write!(f, "{} {:<12} {}", icon, e.state, e.filename)?;
            if let Some(at) = e.applied_at {
                write!(f, "  [{}]", at.format("%Y-%m-%d %H:%M:%S"))?;
            }
            if let Some(ms) = e.execution_time_ms {
                write!(f, " {} ms", ms)?;
            }
            writeln!(f)?;
            if let Some(note) = &e.note {
                writeln!(f, "     └ {}", note)?;
            }
            if let Some(err) = &e.error_message {
                writeln!(f, "     └ 에러: {}", err)?;
            }
        }

        if !self.orphans.is_empty() {
            writeln!(f)?;
            writeln!(f, "{}", RULE_LIGHT)?;
            writeln!(f, "👻 소스 파일이 없는 기록: {} 개", self.orphans.len())?;
            writeln!(f, "{}", RULE_LIGHT)?;
            for r in &self.orphans {
                writeln!(f, "  - {} ({})", r.filename, r.status)?;
            }
        }

        writeln!(f)?;
        writeln!(
            f,
            "📊 전체 {} 개 | 적용 {} | 대기 {} | 실패 {} | drift {} | 건너뜀 {}",
            self.entries.len(),
            self.count(MigrationState::Applied),
            self.count(MigrationState::Pending) + self.count(MigrationState::Interrupted),
            self.count(MigrationState::Failed),
            self.count(MigrationState::Drift),
            self.count(MigrationState::Disabled) + self.count(MigrationState::Superseded),
        )?;
        writeln!(f, "{}", RULE_HEAVY)
    }
}

/// 계획 단계의 파일별 결정
enum Step<'a> {
    Apply(&'a Migration),
    AlreadyApplied(&'a Migration),
    Skip(&'a Migration, String),
    Rebaseline(&'a Migration),
}

/// 마이그레이션 러너
pub struct Migrator<B: MigrationBackend> {
    backend: B,
    config: RunnerConfig,
}

impl<B: MigrationBackend> Migrator<B> {
    pub fn new(backend: B, config: RunnerConfig) -> Self {
        Self { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    /// 미적용 마이그레이션을 오름차순으로 적용
    pub async fn up(&mut self, catalog: &Catalog, options: &RunOptions) -> Result<RunReport> {
        let started = Instant::now();

        if options.dry_run {
            let tracker = StateTracker::load(&mut self.backend).await?;
            let mut report = RunReport {
                dry_run: true,
                ..RunReport::default()
            };
            let steps = plan(catalog, &tracker, options)?;
            for step in steps {
                match step {
                    Step::Apply(m) => report.planned.push(m.filename.clone()),
                    Step::AlreadyApplied(m) => report.already_applied.push(m.filename.clone()),
                    Step::Skip(m, reason) => report.skipped.push(SkippedMigration {
                        filename: m.filename.clone(),
                        reason,
                    }),
                    Step::Rebaseline(m) => report.rebaselined.push(m.filename.clone()),
                }
            }
            report.elapsed = started.elapsed();
            return Ok(report);
        }

        let key = self.config.lock_key;
        self.backend
            .acquire_lock(key, self.config.lock_timeout)
            .await?;

        let result = self.up_locked(catalog, options, started).await;

        // 락 해제 실패가 원래 결과를 가리지 않도록 로그만 남김
        if let Err(e) = self.backend.release_lock(key).await {
            warn!(lock_key = key, error = %e, "마이그레이션 락 해제 실패");
        }

        if let Ok(report) = &result {
            report.log_summary();
        }
        result
    }

    async fn up_locked(
        &mut self,
        catalog: &Catalog,
        options: &RunOptions,
        started: Instant,
    ) -> Result<RunReport> {
        self.backend.ensure_tracking_table().await?;
        let mut tracker = StateTracker::load(&mut self.backend).await?;

        for orphan in tracker.orphans(catalog) {
            warn!(
                filename = %orphan.filename,
                status = %orphan.status,
                "추적 레코드에 해당하는 마이그레이션 파일이 없음"
            );
        }

        let steps = plan(catalog, &tracker, options)?;
        let deadline = self.config.batch_timeout.map(|t| started + t);
        let mut report = RunReport::default();

        for step in steps {
            let migration = match step {
                Step::AlreadyApplied(m) => {
                    report.already_applied.push(m.filename.clone());
                    continue;
                }
                Step::Skip(m, reason) => {
                    warn!(filename = %m.filename, reason = %reason, "마이그레이션 건너뜀");
                    report.skipped.push(SkippedMigration {
                        filename: m.filename.clone(),
                        reason,
                    });
                    continue;
                }
                Step::Rebaseline(m) => {
                    warn!(
                        filename = %m.filename,
                        checksum = %m.checksum,
                        "drift 승인: SQL 실행 없이 체크섬 재기록"
                    );
                    tracker
                        .rebaseline(&mut self.backend, &m.filename, &m.checksum)
                        .await?;
                    report.rebaselined.push(m.filename.clone());
                    continue;
                }
                Step::Apply(m) => m,
            };

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(self.batch_timeout(&report));
                }
            }

            info!(
                filename = %migration.filename,
                sequence = migration.sequence,
                statements = migration.statements.len(),
                "마이그레이션 적용 시작"
            );
            tracker
                .record_start(&mut self.backend, &migration.filename, &migration.checksum)
                .await?;

            let limits = ExecutionLimits {
                statement_timeout: self.config.statement_timeout,
                deadline,
            };
            let applied_at = Instant::now();
            match apply_migration(&mut self.backend, &mut tracker, migration, limits).await {
                Ok(outcome) => report.applied.push(AppliedMigration {
                    filename: migration.filename.clone(),
                    executed_statements: outcome.executed,
                    skipped_statements: outcome.skipped.len(),
                    duration_ms: outcome.duration.as_millis() as u64,
                }),
                Err(e) => {
                    let (statement, message) = match &e {
                        MigrateError::Execution {
                            statement, message, ..
                        } => (Some(*statement), message.clone()),
                        other => (None, database_message(other)),
                    };
                    error!(
                        filename = %migration.filename,
                        statement = ?statement,
                        error = %message,
                        "마이그레이션 실패, 롤백됨"
                    );
                    tracker
                        .record_failure(
                            &mut self.backend,
                            &migration.filename,
                            &migration.checksum,
                            &message,
                            applied_at.elapsed(),
                        )
                        .await?;
                    report.failed.push(FailedMigration {
                        filename: migration.filename.clone(),
                        statement,
                        error: message,
                    });

                    if deadline.is_some_and(|d| Instant::now() >= d) {
                        return Err(self.batch_timeout(&report));
                    }
                    if !options.continue_on_failure {
                        return Err(e);
                    }
                    warn!(
                        filename = %migration.filename,
                        "--continue-on-failure: 실패한 마이그레이션을 건너뛰고 계속 진행 (저하 모드)"
                    );
                }
            }
        }

        report.elapsed = started.elapsed();
        Ok(report)
    }

    fn batch_timeout(&self, report: &RunReport) -> MigrateError {
        let limit = self.config.batch_timeout.unwrap_or_default();
        error!(
            applied = report.applied.len(),
            limit_secs = limit.as_secs(),
            "배치 제한 시간 초과, 남은 마이그레이션 중단"
        );
        MigrateError::BatchTimeout(limit)
    }

    /// 파일별 상태 조회 (읽기 전용, 락 없음)
    pub async fn status(&mut self, catalog: &Catalog) -> Result<StatusReport> {
        let tracker = StateTracker::load(&mut self.backend).await?;
        let mut report = StatusReport::default();

        for m in catalog.migrations() {
            let record = tracker.get(&m.filename);
            let state = match (m.meta.status, tracker.check(&m.filename, &m.checksum)) {
                (MetaStatus::Disabled, _) => MigrationState::Disabled,
                (MetaStatus::Superseded, _) => MigrationState::Superseded,
                (MetaStatus::Active, AppliedState::Applied) => MigrationState::Applied,
                (MetaStatus::Active, AppliedState::Drifted { .. }) => MigrationState::Drift,
                (MetaStatus::Active, AppliedState::Failed { .. }) => MigrationState::Failed,
                (MetaStatus::Active, AppliedState::Interrupted) => MigrationState::Interrupted,
                (MetaStatus::Active, AppliedState::NotApplied) => MigrationState::Pending,
            };

            report.entries.push(StatusEntry {
                sequence: m.sequence,
                filename: m.filename.clone(),
                state,
                applied_at: record
                    .filter(|r| r.status == MigrationStatus::Completed)
                    .map(|r| r.applied_at),
                execution_time_ms: record.and_then(|r| r.execution_time_ms),
                error_message: record.and_then(|r| r.error_message.clone()),
                note: m.meta.skip_reason(),
            });
        }

        report.orphans = tracker.orphans(catalog).into_iter().cloned().collect();
        Ok(report)
    }

    /// 스키마 기대값 검증 (읽기 전용)
    pub async fn verify(&mut self, expectations: &SchemaExpectations) -> Result<VerificationReport> {
        Verifier::new().verify(&mut self.backend, expectations).await
    }
}

/// 카탈로그와 추적 레코드로 실행 계획 수립.
///
/// 승인되지 않은 drift 와 순서 위반은 어떤 SQL 도 실행하기 전에 에러로 반환합니다.
fn plan<'a>(
    catalog: &'a Catalog,
    tracker: &StateTracker,
    options: &RunOptions,
) -> Result<Vec<Step<'a>>> {
    let latest_completed = tracker
        .latest_completed(catalog)
        .and_then(|f| catalog.get(f));

    let mut steps = Vec::new();
    let mut drift: Option<MigrateError> = None;

    for m in catalog.migrations() {
        if options.target.is_some_and(|t| m.sequence > t) {
            break;
        }

        if let Some(reason) = m.meta.skip_reason() {
            steps.push(Step::Skip(m, reason));
            continue;
        }

        match tracker.check(&m.filename, &m.checksum) {
            AppliedState::Applied => steps.push(Step::AlreadyApplied(m)),
            AppliedState::Drifted { recorded } => {
                if options.drift_accepted(&m.filename) {
                    steps.push(Step::Rebaseline(m));
                } else {
                    error!(
                        filename = %m.filename,
                        recorded = %recorded,
                        current = %m.checksum,
                        "적용된 마이그레이션의 내용이 변경됨 (drift)"
                    );
                    drift.get_or_insert(MigrateError::Drift {
                        filename: m.filename.clone(),
                        recorded,
                        current: m.checksum.clone(),
                    });
                }
            }
            state => {
                if let Some(latest) = latest_completed {
                    if m.sequence < latest.sequence {
                        if !options.allow_out_of_order {
                            return Err(MigrateError::OutOfOrder {
                                filename: m.filename.clone(),
                                latest_applied: latest.filename.clone(),
                            });
                        }
                        warn!(
                            filename = %m.filename,
                            latest_applied = %latest.filename,
                            "순서 위반 마이그레이션 적용 허용"
                        );
                    }
                }
                match state {
                    AppliedState::Interrupted => warn!(
                        filename = %m.filename,
                        "이전 실행이 중단된 마이그레이션, 다시 적용"
                    ),
                    AppliedState::Failed { error } => warn!(
                        filename = %m.filename,
                        previous_error = error.as_deref().unwrap_or(""),
                        "이전에 실패한 마이그레이션, 다시 적용"
                    ),
                    _ => {}
                }
                steps.push(Step::Apply(m));
            }
        }
    }

    match drift {
        Some(e) => Err(e),
        None => Ok(steps),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_report_display() {
        let report = RunReport {
            applied: vec![AppliedMigration {
                filename: "0001_create_users.sql".into(),
                executed_statements: 2,
                skipped_statements: 1,
                duration_ms: 12,
            }],
            skipped: vec![SkippedMigration {
                filename: "0013_broken.sql".into(),
                reason: "disabled: duplicate column".into(),
            }],
            failed: vec![FailedMigration {
                filename: "0003_bad.sql".into(),
                statement: Some(1),
                error: "syntax error".into(),
            }],
            ..RunReport::default()
        };
        let text = report.to_string();
        assert!(text.contains("0001_create_users.sql (12 ms, 건너뛴 문장 1 개)"));
        assert!(text.contains("0013_broken.sql: disabled: duplicate column"));
        assert!(text.contains("0003_bad.sql (문장 1): syntax error"));
        assert!(!report.is_success());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["applied"][0]["filename"], "0001_create_users.sql");
        assert_eq!(json["failed"][0]["statement"], 1);
        assert!(json.get("elapsed").is_none());
    }

    #[test]
    fn test_status_report_counts() {
        let entry = |filename: &str, state| StatusEntry {
            sequence: 1,
            filename: filename.into(),
            state,
            applied_at: None,
            execution_time_ms: None,
            error_message: None,
            note: None,
        };
        let report = StatusReport {
            entries: vec![
                entry("0001_a.sql", MigrationState::Applied),
                entry("0002_b.sql", MigrationState::Failed),
                entry("0003_c.sql", MigrationState::Interrupted),
                entry("0004_d.sql", MigrationState::Pending),
                entry("0005_e.sql", MigrationState::Disabled),
            ],
            orphans: vec![MigrationRecord {
                filename: "0000_gone.sql".into(),
                checksum: "x".into(),
                status: MigrationStatus::Completed,
                error_message: None,
                execution_time_ms: None,
                applied_at: Utc::now(),
            }],
        };
        assert_eq!(report.outstanding(), 3);
        let text = report.to_string();
        assert!(text.contains("0000_gone.sql (completed)"));
        assert!(text.contains("전체 5 개"));
    }
}
