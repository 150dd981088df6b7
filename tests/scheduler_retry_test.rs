//! Scheduler and retry behaviour driven by a scripted settlement runner.

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use modeledger::db::init_db;
use modeledger::exchange::ExchangeError;
use modeledger::settlement::{
    AggregationError, DailyPnlAggregation, ModeKey, RetryConfig, RetryableSettlementService,
    Scheduler, SchedulerConfig, SchedulerError, SettlementError, SettlementFailure,
    SettlementPhase, SettlementResult, SettlementRunner, SettlementStatus, SnapshotError,
    SnapshotResult,
};
use modeledger::{Decimal, Repository, TimeMs, UserId};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum Step {
    Ok,
    Transient,
    Fatal,
    Hang,
    Panic,
}

/// Runner that replays a per-user script; users without a script succeed.
#[derive(Default)]
struct ScriptedRunner {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<(UserId, NaiveDate, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedRunner {
    fn with_script(self, user: &str, steps: &[Step]) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(user.to_string(), steps.iter().copied().collect());
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn calls(&self) -> Vec<(UserId, NaiveDate, String)> {
        self.calls.lock().unwrap().clone()
    }

    fn next_step(&self, user: &UserId) -> Step {
        self.scripts
            .lock()
            .unwrap()
            .get_mut(user.as_str())
            .and_then(|s| s.pop_front())
            .unwrap_or(Step::Ok)
    }
}

fn transient() -> SettlementError {
    SettlementError::Snapshot(SnapshotError::Positions(ExchangeError::NetworkError(
        "connection reset by peer".to_string(),
    )))
}

fn fatal() -> SettlementError {
    SettlementError::Aggregation(AggregationError::EmptyUserId)
}

fn ok_result(user_id: &UserId, date: NaiveDate, timezone: &str) -> SettlementResult {
    SettlementResult {
        user_id: user_id.clone(),
        date,
        timezone: timezone.to_string(),
        snapshot: SnapshotResult {
            user_id: user_id.clone(),
            snapshot_date: date,
            position_count: 0,
            snapshots: vec![],
            total_unrealized_pnl: Decimal::zero(),
            duration_ms: 0,
        },
        aggregation: DailyPnlAggregation {
            user_id: user_id.clone(),
            day_start: TimeMs::new(0),
            day_end: TimeMs::new(0),
            mode_results: BTreeMap::new(),
            total_pnl: Decimal::zero(),
            total_trades: 0,
            duration_ms: 0,
        },
        summaries: vec![],
        rejected: vec![],
        duration_ms: 0,
    }
}

#[async_trait]
impl SettlementRunner for ScriptedRunner {
    async fn run_settlement(
        &self,
        user_id: &UserId,
        date: NaiveDate,
        timezone: &str,
        _token: &CancellationToken,
    ) -> Result<SettlementResult, SettlementError> {
        self.calls
            .lock()
            .unwrap()
            .push((user_id.clone(), date, timezone.to_string()));

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.next_step(user_id) {
            Step::Ok => Ok(ok_result(user_id, date, timezone)),
            Step::Transient => Err(transient()),
            Step::Fatal => Err(fatal()),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ok_result(user_id, date, timezone))
            }
            Step::Panic => panic!("boom"),
        }
    }
}

async fn setup_repo() -> (Arc<Repository>, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    let pool = init_db(&db_path).await.expect("init_db failed");
    (Arc::new(Repository::new(pool)), temp_dir)
}

fn jan(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, day).unwrap()
}

fn no_wait(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        backoff: vec![Duration::ZERO],
    }
}

async fn all_row_status(repo: &Repository, user: &UserId, date: NaiveDate) -> (SettlementStatus, Option<String>) {
    let rows = repo.daily_mode_summaries(user, date).await.unwrap();
    let all = rows.into_iter().find(|r| r.mode == ModeKey::All).unwrap();
    (all.settlement_status, all.settlement_error)
}

// =============================================================================
// Retry
// =============================================================================

#[tokio::test]
async fn test_retry_recovers_from_transient_errors() {
    let (repo, _temp) = setup_repo().await;
    let runner = Arc::new(ScriptedRunner::default().with_script("u1", &[Step::Transient, Step::Transient]));
    let seen: Arc<Mutex<Vec<SettlementFailure>>> = Arc::default();
    let sink = seen.clone();

    let service = RetryableSettlementService::new(runner.clone(), repo.clone(), no_wait(3))
        .with_failure_callback(Arc::new(move |f: &SettlementFailure| {
            sink.lock().unwrap().push(f.clone())
        }));

    let user = UserId::new("u1");
    let result = service
        .run_with_retry(&user, jan(15), "UTC", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.date, jan(15));
    assert_eq!(runner.calls().len(), 3);

    let failures = seen.lock().unwrap().clone();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].attempt, 1);
    assert_eq!(failures[1].attempt, 2);
    assert!(failures.iter().all(|f| f.retryable && f.phase == SettlementPhase::Snapshot));

    // Waiting between attempts is visible in the store
    let (status, _) = all_row_status(&repo, &user, jan(15)).await;
    assert_eq!(status, SettlementStatus::Retrying);
}

#[tokio::test]
async fn test_non_retryable_error_fails_immediately() {
    let (repo, _temp) = setup_repo().await;
    let runner = Arc::new(ScriptedRunner::default().with_script("u1", &[Step::Fatal]));
    let service = RetryableSettlementService::new(runner.clone(), repo.clone(), no_wait(3));

    let user = UserId::new("u1");
    let err = service
        .run_with_retry(&user, jan(15), "UTC", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::Aggregation(_)));
    assert_eq!(runner.calls().len(), 1);

    let (status, error) = all_row_status(&repo, &user, jan(15)).await;
    assert_eq!(status, SettlementStatus::Failed);
    assert_eq!(error.as_deref(), Some(err.to_string().as_str()));
}

#[tokio::test]
async fn test_retries_exhausted() {
    let (repo, _temp) = setup_repo().await;
    let runner = Arc::new(
        ScriptedRunner::default().with_script("u1", &[Step::Transient, Step::Transient, Step::Transient]),
    );
    let service = RetryableSettlementService::new(runner.clone(), repo.clone(), no_wait(2));

    let user = UserId::new("u1");
    let err = service
        .run_with_retry(&user, jan(15), "UTC", &CancellationToken::new())
        .await
        .unwrap_err();
    match &err {
        SettlementError::RetriesExhausted { attempts, .. } => assert_eq!(*attempts, 3),
        other => panic!("expected RetriesExhausted, got {other}"),
    }
    assert!(err.to_string().starts_with("settlement failed after 3 retries"));
    assert_eq!(runner.calls().len(), 3);

    let (status, _) = all_row_status(&repo, &user, jan(15)).await;
    assert_eq!(status, SettlementStatus::Failed);
}

#[tokio::test]
async fn test_cancel_during_backoff() {
    let (repo, _temp) = setup_repo().await;
    let runner = Arc::new(ScriptedRunner::default().with_script("u1", &[Step::Transient]));
    let config = RetryConfig {
        max_retries: 3,
        backoff: vec![Duration::from_secs(60)],
    };
    let service = RetryableSettlementService::new(runner.clone(), repo.clone(), config);

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let user = UserId::new("u1");
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        service.run_with_retry(&user, jan(15), "UTC", &token),
    )
    .await
    .expect("cancellation should end the wait")
    .unwrap_err();
    assert!(matches!(err, SettlementError::Cancelled));
    assert_eq!(runner.calls().len(), 1);

    let (status, error) = all_row_status(&repo, &user, jan(15)).await;
    assert_eq!(status, SettlementStatus::Failed);
    assert_eq!(error.as_deref(), Some("settlement cancelled"));
}

// =============================================================================
// Scheduler
// =============================================================================

#[tokio::test]
async fn test_due_users_settle_and_advance_checkpoint() {
    let (repo, _temp) = setup_repo().await;
    // 20:00 UTC on Jan 15 is Jan 16 in Kolkata
    let now = Utc.with_ymd_and_hms(2026, 1, 15, 20, 0, 0).unwrap();

    repo.upsert_user(&UserId::new("u1"), "Asia/Kolkata").await.unwrap();
    repo.upsert_user(&UserId::new("u2"), "UTC").await.unwrap();
    repo.update_last_settlement_date(&UserId::new("u2"), jan(15)).await.unwrap();
    repo.upsert_user(&UserId::new("u3"), "UTC").await.unwrap();
    repo.update_last_settlement_date(&UserId::new("u3"), jan(14)).await.unwrap();

    let runner = Arc::new(ScriptedRunner::default().with_script("u3", &[Step::Fatal]));
    let scheduler = Scheduler::new(repo.clone(), runner.clone(), SchedulerConfig::default());

    let report = scheduler.run_due_settlements(now).await.unwrap();
    assert_eq!(report.checked, 3);
    assert_eq!(report.due, 2);
    assert_eq!(report.settled, vec![UserId::new("u1")]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, UserId::new("u3"));

    let mut calls = runner.calls();
    calls.sort();
    assert_eq!(
        calls,
        vec![
            (UserId::new("u1"), jan(15), "Asia/Kolkata".to_string()),
            (UserId::new("u3"), jan(14), "UTC".to_string()),
        ]
    );

    let u1 = repo.get_user(&UserId::new("u1")).await.unwrap().unwrap();
    assert_eq!(u1.last_settlement_date, Some(jan(16)));
    let u3 = repo.get_user(&UserId::new("u3")).await.unwrap().unwrap();
    assert_eq!(u3.last_settlement_date, Some(jan(14)));

    // A second pass only retries the user that failed
    let report = scheduler.run_due_settlements(now).await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.settled, vec![UserId::new("u3")]);
}

#[tokio::test]
async fn test_timeout_and_panic_are_contained() {
    let (repo, _temp) = setup_repo().await;
    let now = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
    for user in ["slow", "crashy", "fine"] {
        repo.upsert_user(&UserId::new(user), "UTC").await.unwrap();
    }

    let runner = Arc::new(
        ScriptedRunner::default()
            .with_script("slow", &[Step::Hang])
            .with_script("crashy", &[Step::Panic]),
    );
    let config = SchedulerConfig {
        settlement_timeout: Duration::from_millis(50),
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(repo.clone(), runner, config);

    let report = scheduler.run_due_settlements(now).await.unwrap();
    assert_eq!(report.settled, vec![UserId::new("fine")]);

    let failed: HashMap<String, String> = report
        .failed
        .into_iter()
        .map(|(u, m)| (u.to_string(), m))
        .collect();
    assert_eq!(failed["crashy"], "settlement panicked: boom");
    assert!(failed["slow"].contains("budget"));

    let slow = repo.get_user(&UserId::new("slow")).await.unwrap().unwrap();
    assert_eq!(slow.last_settlement_date, None);
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let (repo, _temp) = setup_repo().await;
    let now = Utc.with_ymd_and_hms(2026, 1, 15, 12, 0, 0).unwrap();
    for i in 0..6 {
        repo.upsert_user(&UserId::new(format!("user-{i}")), "UTC").await.unwrap();
    }

    let runner = Arc::new(ScriptedRunner::default().with_delay(Duration::from_millis(30)));
    let config = SchedulerConfig {
        max_concurrent: 2,
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(repo, runner.clone(), config);

    let report = scheduler.run_due_settlements(now).await.unwrap();
    assert_eq!(report.settled.len(), 6);
    assert!(runner.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test]
async fn test_manual_settlement_uses_user_timezone() {
    let (repo, _temp) = setup_repo().await;
    repo.upsert_user(&UserId::new("u1"), "America/New_York").await.unwrap();

    let runner = Arc::new(ScriptedRunner::default());
    let scheduler = Scheduler::new(repo.clone(), runner.clone(), SchedulerConfig::default());

    scheduler
        .run_manual_settlement(&UserId::new("u1"), jan(10))
        .await
        .unwrap();
    scheduler
        .run_manual_settlement(&UserId::new("stranger"), jan(10))
        .await
        .unwrap();

    let calls = runner.calls();
    assert_eq!(calls[0].2, "America/New_York");
    assert_eq!(calls[1].2, "Asia/Kolkata");

    // Unknown users take the configured default zone
    let utc_default = Scheduler::new(
        repo.clone(),
        runner.clone(),
        SchedulerConfig {
            default_timezone: chrono_tz::Tz::UTC,
            ..SchedulerConfig::default()
        },
    );
    utc_default
        .run_manual_settlement(&UserId::new("stranger"), jan(10))
        .await
        .unwrap();
    assert_eq!(runner.calls()[2].2, "UTC");

    // Manual runs leave the checkpoint alone
    let u1 = repo.get_user(&UserId::new("u1")).await.unwrap().unwrap();
    assert_eq!(u1.last_settlement_date, None);
}

#[tokio::test]
async fn test_settlement_status_reports_next_midnight() {
    let (repo, _temp) = setup_repo().await;
    repo.upsert_user(&UserId::new("u1"), "Asia/Kolkata").await.unwrap();
    repo.update_last_settlement_date(&UserId::new("u1"), jan(16)).await.unwrap();

    let scheduler = Scheduler::new(repo, Arc::new(ScriptedRunner::default()), SchedulerConfig::default());
    let now = Utc.with_ymd_and_hms(2026, 1, 15, 20, 0, 0).unwrap();
    let status = scheduler.settlement_status(now).await.unwrap();

    assert_eq!(status.len(), 1);
    assert!(!status[0].needs_settlement);
    assert_eq!(
        status[0].next_settlement_time,
        Utc.with_ymd_and_hms(2026, 1, 16, 18, 30, 0).unwrap()
    );
}

#[tokio::test]
async fn test_start_stop_lifecycle() {
    let (repo, _temp) = setup_repo().await;
    repo.upsert_user(&UserId::new("u1"), "UTC").await.unwrap();

    let runner = Arc::new(ScriptedRunner::default());
    let config = SchedulerConfig {
        check_interval: Duration::from_millis(20),
        ..SchedulerConfig::default()
    };
    let scheduler = Scheduler::new(repo.clone(), runner.clone(), config);

    scheduler.start().unwrap();
    assert!(scheduler.is_running());
    assert!(matches!(scheduler.start(), Err(SchedulerError::AlreadyRunning)));

    tokio::time::timeout(Duration::from_secs(5), async {
        while runner.calls().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("first tick should settle the user");

    scheduler.stop().await.unwrap();
    assert!(!scheduler.is_running());
    assert!(matches!(scheduler.stop().await, Err(SchedulerError::NotRunning)));

    // Settled once; later ticks found nothing due
    assert_eq!(runner.calls().len(), 1);
}
