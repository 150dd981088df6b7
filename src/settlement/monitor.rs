//! Watches for settlements stuck in `failed` and raises one alert per user and day.

use super::{format_date, DailyModeSummary};
use crate::db::Repository;
use crate::domain::{TimeMs, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("settlement monitor already running")]
    AlreadyRunning,
    #[error("settlement monitor not running")]
    NotRunning,
    #[error("failed to read settlement status: {0}")]
    Store(#[from] sqlx::Error),
    #[error("failed to send alert: {0}")]
    Alert(String),
}

/// Outbound notification sink (email, chat, pager).
#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn send(&self, subject: &str, body: &str) -> Result<(), MonitorError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub check_interval: Duration,
    /// How long a settlement must have been failed before it is alerted.
    pub alert_threshold: Duration,
    pub enabled: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(15 * 60),
            alert_threshold: Duration::from_secs(60 * 60),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringMetrics {
    pub timestamp: DateTime<Utc>,
    pub total_count: i64,
    pub completed_count: i64,
    pub failed_count: i64,
    pub retrying_count: i64,
    /// Percentage of completed rows, 0 when there are none.
    pub success_rate: f64,
}

struct Inner {
    repo: Arc<Repository>,
    channel: Option<Arc<dyn AlertChannel>>,
    config: MonitorConfig,
}

struct RunningLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct SettlementMonitor {
    inner: Arc<Inner>,
    running: Mutex<Option<RunningLoop>>,
}

impl SettlementMonitor {
    /// Without a channel, alerts are written to the log.
    pub fn new(
        repo: Arc<Repository>,
        channel: Option<Arc<dyn AlertChannel>>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repo,
                channel,
                config,
            }),
            running: Mutex::new(None),
        }
    }

    /// # Errors
    /// `AlreadyRunning` if a loop is active.
    pub fn start(&self) -> Result<(), MonitorError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Err(MonitorError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        let inner = self.inner.clone();
        let loop_token = token.clone();
        let handle = tokio::spawn(async move { inner.run_loop(loop_token).await });
        *running = Some(RunningLoop { token, handle });

        info!(
            interval_secs = self.inner.config.check_interval.as_secs(),
            threshold_secs = self.inner.config.alert_threshold.as_secs(),
            "Settlement monitor started"
        );
        Ok(())
    }

    /// # Errors
    /// `NotRunning` if no loop is active.
    pub async fn stop(&self) -> Result<(), MonitorError> {
        let running = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(MonitorError::NotRunning)?;

        running.token.cancel();
        if let Err(e) = running.handle.await {
            error!(error = %e, "Settlement monitor loop ended abnormally");
        }
        info!("Settlement monitor stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// One monitoring pass at `now`. Returns the number of alerts raised.
    ///
    /// # Errors
    /// Fails only if failed settlements cannot be read; per-alert failures are logged.
    pub async fn check_once(&self, now: DateTime<Utc>) -> Result<usize, MonitorError> {
        self.inner.check(now).await
    }

    /// Status counts over settlements touched in the 24 hours before `now`.
    ///
    /// # Errors
    /// Fails if the store cannot be read.
    pub async fn metrics(&self, now: DateTime<Utc>) -> Result<MonitoringMetrics, MonitorError> {
        let since = TimeMs::from_datetime(&(now - ChronoDuration::hours(24)));
        let counts = self.inner.repo.status_counts_since(since).await?;

        let total = counts.total();
        let success_rate = if total > 0 {
            counts.completed as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        Ok(MonitoringMetrics {
            timestamp: now,
            total_count: total,
            completed_count: counts.completed,
            failed_count: counts.failed,
            retrying_count: counts.retrying,
            success_rate,
        })
    }
}

impl Inner {
    async fn run_loop(self: Arc<Self>, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Settlement monitor received stop signal");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.check(Utc::now()).await {
                        error!(error = %e, "Settlement monitor check failed");
                    }
                }
            }
        }
    }

    async fn check(&self, now: DateTime<Utc>) -> Result<usize, MonitorError> {
        if !self.config.enabled {
            return Ok(0);
        }

        let threshold = ChronoDuration::from_std(self.config.alert_threshold)
            .unwrap_or_else(|_| ChronoDuration::hours(1));
        let cutoff = TimeMs::from_datetime(&(now - threshold));
        let failures = self.repo.failed_settlements(cutoff).await?;
        if failures.is_empty() {
            return Ok(0);
        }

        let mut seen: HashSet<(UserId, NaiveDate)> = HashSet::new();
        let mut alerted = 0;
        for failure in failures {
            if !seen.insert((failure.user_id.clone(), failure.summary_date)) {
                continue;
            }

            if let Err(e) = self.alert(&failure, now).await {
                warn!(user = %failure.user_id, error = %e, "Failed to send settlement alert");
                continue;
            }
            alerted += 1;

            if let Err(e) = self
                .repo
                .mark_settlement_alerted(&failure.user_id, failure.summary_date)
                .await
            {
                error!(user = %failure.user_id, error = %e, "Failed to mark settlement alerted");
            }
        }

        info!(alerts = alerted, "Stalled settlements alerted");
        Ok(alerted)
    }

    async fn alert(&self, failure: &DailyModeSummary, now: DateTime<Utc>) -> Result<(), MonitorError> {
        let (subject, body) = alert_message(failure, now);
        match &self.channel {
            Some(channel) => channel.send(&subject, &body).await,
            None => {
                warn!(
                    user = %failure.user_id,
                    date = %format_date(failure.summary_date),
                    error = %failure.settlement_error.as_deref().unwrap_or("N/A"),
                    "ALERT: settlement failed"
                );
                Ok(())
            }
        }
    }
}

/// Subject and body for one failed (user, date).
pub fn alert_message(failure: &DailyModeSummary, now: DateTime<Utc>) -> (String, String) {
    let date = format_date(failure.summary_date);
    let failed_at = failure.settlement_time.to_datetime();
    let hours = (now - failed_at).num_seconds() as f64 / 3600.0;

    let subject = format!(
        "Settlement Failed: User ...{} - {}",
        failure.user_id.short(),
        date
    );
    let body = format!(
        "Settlement failed and needs manual intervention:\n\n\
         User ID: {}\n\
         Date: {}\n\
         Error: {}\n\
         Failed Since: {} ({:.1} hours ago)\n\n\
         Settlement Status: {}\n\
         User Timezone: {}\n",
        failure.user_id,
        date,
        failure.settlement_error.as_deref().unwrap_or("N/A"),
        failed_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        hours,
        failure.settlement_status,
        failure.user_timezone,
    );
    (subject, body)
}
