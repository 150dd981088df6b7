//! Background loop that settles each user once their local day has rolled over.

use super::service::{SettlementError, SettlementRunner};
use super::{local_date, local_midnight, resolve_timezone, SettlementResult, UserRecord, UserSettlementStatus};
use crate::db::Repository;
use crate::domain::UserId;
use crate::orders::DEFAULT_TIMEZONE;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub check_interval: Duration,
    pub max_concurrent: usize,
    /// Wall-clock budget for one user's settlement.
    pub settlement_timeout: Duration,
    /// Zone for manual settlement of users without a stored row.
    pub default_timezone: Tz,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            max_concurrent: 5,
            settlement_timeout: Duration::from_secs(300),
            default_timezone: DEFAULT_TIMEZONE,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("settlement scheduler already running")]
    AlreadyRunning,
    #[error("settlement scheduler not running")]
    NotRunning,
    #[error("failed to load users for settlement: {0}")]
    Users(#[source] sqlx::Error),
    #[error(transparent)]
    Settlement(#[from] SettlementError),
}

/// Outcome of one scheduler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub checked: usize,
    pub due: usize,
    pub settled: Vec<UserId>,
    pub failed: Vec<(UserId, String)>,
}

struct Inner {
    repo: Arc<Repository>,
    runner: Arc<dyn SettlementRunner>,
    config: SchedulerConfig,
}

struct RunningLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    inner: Arc<Inner>,
    running: Mutex<Option<RunningLoop>>,
}

impl Scheduler {
    pub fn new(repo: Arc<Repository>, runner: Arc<dyn SettlementRunner>, config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                repo,
                runner,
                config,
            }),
            running: Mutex::new(None),
        }
    }

    /// Spawn the loop. It checks immediately and then every `check_interval`.
    ///
    /// # Errors
    /// `AlreadyRunning` if a loop is active.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        let inner = self.inner.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move { inner.run_loop(loop_token).await });

        *running = Some(RunningLoop { token, handle });
        info!(
            interval_secs = self.inner.config.check_interval.as_secs(),
            max_concurrent = self.inner.config.max_concurrent,
            "Settlement scheduler started"
        );
        Ok(())
    }

    /// Cancel the loop and wait for in-flight settlements to finish or observe cancellation.
    ///
    /// # Errors
    /// `NotRunning` if no loop is active.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(SchedulerError::NotRunning)?;

        running.token.cancel();
        if let Err(e) = running.handle.await {
            error!(error = %e, "Settlement scheduler loop ended abnormally");
        }
        info!("Settlement scheduler stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// One scheduler pass at `now`, outside the background loop.
    ///
    /// # Errors
    /// Fails only if the user list cannot be loaded; per-user failures are in the report.
    pub async fn run_due_settlements(&self, now: DateTime<Utc>) -> Result<TickReport, SchedulerError> {
        self.inner
            .run_due_settlements(now, &CancellationToken::new())
            .await
    }

    /// Settle one user's date immediately, without touching the checkpoint.
    ///
    /// # Errors
    /// Returns the settlement error.
    pub async fn run_manual_settlement(
        &self,
        user_id: &UserId,
        date: NaiveDate,
    ) -> Result<SettlementResult, SchedulerError> {
        let timezone = match self.inner.repo.get_user(user_id).await {
            Ok(Some(user)) => user.timezone,
            Ok(None) => self.inner.config.default_timezone.name().to_string(),
            Err(e) => return Err(SchedulerError::Users(e)),
        };
        info!(user = %user_id, date = %date, timezone = %timezone, "Running manual settlement");

        let result = self
            .inner
            .runner
            .run_settlement(user_id, date, &timezone, &CancellationToken::new())
            .await?;
        Ok(result)
    }

    /// Where every user stands relative to their next local midnight.
    ///
    /// # Errors
    /// Fails if the user list cannot be loaded.
    pub async fn settlement_status(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserSettlementStatus>, SchedulerError> {
        let users = self
            .inner
            .repo
            .users_for_settlement_check()
            .await
            .map_err(SchedulerError::Users)?;

        Ok(users
            .into_iter()
            .map(|user| {
                let tz = resolve_timezone(&user.timezone);
                let today = local_date(now, tz);
                let next = today.succ_opt().unwrap_or(today);
                UserSettlementStatus {
                    needs_settlement: needs_settlement(&user, now),
                    next_settlement_time: local_midnight(next, tz),
                    user_id: user.id,
                    timezone: user.timezone,
                    last_settlement_date: user.last_settlement_date,
                }
            })
            .collect())
    }
}

impl Inner {
    async fn run_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Settlement scheduler received stop signal");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_due_settlements(Utc::now(), &token).await {
                        error!(error = %e, "Settlement check failed");
                    }
                }
            }
        }
    }

    async fn run_due_settlements(
        self: &Arc<Self>,
        now: DateTime<Utc>,
        token: &CancellationToken,
    ) -> Result<TickReport, SchedulerError> {
        let users = self
            .repo
            .users_for_settlement_check()
            .await
            .map_err(SchedulerError::Users)?;

        let mut report = TickReport {
            checked: users.len(),
            ..TickReport::default()
        };
        let due: Vec<UserRecord> = users
            .into_iter()
            .filter(|u| needs_settlement(u, now))
            .collect();
        report.due = due.len();
        if due.is_empty() {
            return Ok(report);
        }
        info!(users = due.len(), "Users need settlement");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let mut tasks = JoinSet::new();

        for user in due {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let inner = self.clone();
            let token = token.child_token();
            tasks.spawn(async move {
                let _permit = permit;
                let user_id = user.id.clone();
                let outcome = AssertUnwindSafe(inner.settle_user(user, now, token))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(format!("settlement panicked: {}", panic_message(&panic))));
                (user_id, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((user_id, Ok(()))) => report.settled.push(user_id),
                Ok((user_id, Err(message))) => report.failed.push((user_id, message)),
                Err(e) => error!(error = %e, "Settlement task ended abnormally"),
            }
        }
        report.settled.sort();
        report.failed.sort();

        info!(
            settled = report.settled.len(),
            failed = report.failed.len(),
            "Settlement pass finished"
        );
        Ok(report)
    }

    /// Settle local yesterday and advance the checkpoint to local today on success.
    async fn settle_user(
        &self,
        user: UserRecord,
        now: DateTime<Utc>,
        token: CancellationToken,
    ) -> Result<(), String> {
        let tz = resolve_timezone(&user.timezone);
        let today = local_date(now, tz);
        let Some(yesterday) = today.pred_opt() else {
            return Err(format!("no previous day for {}", today));
        };
        info!(user = %user.id, timezone = %user.timezone, date = %yesterday, "Starting scheduled settlement");

        let budget = self.config.settlement_timeout;
        let run = self
            .runner
            .run_settlement(&user.id, yesterday, &user.timezone, &token);
        let result = match tokio::time::timeout(budget, run).await {
            Ok(result) => result,
            Err(_) => Err(SettlementError::TimedOut(budget)),
        };

        match result {
            Ok(result) => {
                self.repo
                    .update_last_settlement_date(&user.id, today)
                    .await
                    .map_err(|e| {
                        error!(user = %user.id, error = %e, "Failed to advance settlement checkpoint");
                        format!("failed to update last settlement date: {}", e)
                    })?;
                info!(
                    user = %user.id,
                    date = %yesterday,
                    positions = result.snapshot.position_count,
                    trades = result.aggregation.total_trades,
                    duration_ms = result.duration_ms,
                    "Scheduled settlement completed"
                );
                Ok(())
            }
            Err(e) => {
                warn!(user = %user.id, date = %yesterday, error = %e, "Scheduled settlement failed");
                Err(e.to_string())
            }
        }
    }
}

/// Due when never settled or last settled before today in the user's zone.
pub fn needs_settlement(user: &UserRecord, now: DateTime<Utc>) -> bool {
    let today = local_date(now, resolve_timezone(&user.timezone));
    match user.last_settlement_date {
        None => true,
        Some(last) => last < today,
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
