//! Error classification and retry with backoff around a settlement runner.

use super::service::{SettlementError, SettlementRunner};
use super::{format_date, ModeKey, SettlementResult, SettlementStatus};
use crate::db::Repository;
use crate::domain::UserId;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use backoff::future::retry_notify;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Substrings (matched lowercased) marking an error as transient.
const RETRYABLE_PATTERNS: &[&str] = &[
    "rate limit",
    "timeout",
    "connection refused",
    "connection reset",
    "temporary failure",
    "service unavailable",
    "gateway timeout",
    "too many requests",
    "429",
    "503",
    "504",
    "deadlock",
    "connection",
    "lock timeout",
    "serialization failure",
];

pub fn is_retryable(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementPhase {
    Snapshot,
    Aggregate,
    Store,
    Validate,
    Unknown,
}

impl SettlementPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementPhase::Snapshot => "snapshot",
            SettlementPhase::Aggregate => "aggregate",
            SettlementPhase::Store => "store",
            SettlementPhase::Validate => "validate",
            SettlementPhase::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SettlementPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase an error came from, judged by its message.
pub fn identify_phase(message: &str) -> SettlementPhase {
    let lower = message.to_lowercase();
    if lower.contains("snapshot") {
        SettlementPhase::Snapshot
    } else if lower.contains("aggregate") || lower.contains("trade") {
        SettlementPhase::Aggregate
    } else if ["save", "store", "database"].iter().any(|p| lower.contains(p)) {
        SettlementPhase::Store
    } else if lower.contains("valid") {
        SettlementPhase::Validate
    } else {
        SettlementPhase::Unknown
    }
}

/// One failed attempt, handed to the failure callback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementFailure {
    pub user_id: UserId,
    pub date: NaiveDate,
    pub phase: SettlementPhase,
    /// 1-based.
    pub attempt: u32,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub retryable: bool,
}

impl fmt::Display for SettlementFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] User {}, Date {}, Phase {}, Attempt {}: {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.user_id,
            format_date(self.date),
            self.phase,
            self.attempt,
            self.error
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff: Vec<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: vec![
                Duration::from_secs(5),
                Duration::from_secs(15),
                Duration::from_secs(45),
            ],
        }
    }
}

impl RetryConfig {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        delay_for(&self.backoff, attempt)
    }
}

/// Wait after the 0-based `attempt`. Attempts past the table reuse its last entry; an
/// empty table means no wait.
pub fn delay_for(backoff: &[Duration], attempt: u32) -> Duration {
    let idx = (attempt as usize).min(backoff.len().saturating_sub(1));
    backoff.get(idx).copied().unwrap_or(Duration::ZERO)
}

/// Walks the backoff table once, yielding `max_retries` waits.
#[derive(Debug, Clone)]
pub struct SettlementBackoff {
    delays: Vec<Duration>,
    max_retries: u32,
    attempt: u32,
}

impl SettlementBackoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            delays: config.backoff.clone(),
            max_retries: config.max_retries,
            attempt: 0,
        }
    }
}

impl Backoff for SettlementBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_retries {
            return None;
        }
        let delay = delay_for(&self.delays, self.attempt);
        self.attempt += 1;
        Some(delay)
    }
}

pub type FailureCallback = Arc<dyn Fn(&SettlementFailure) + Send + Sync>;

/// Runs settlement up to `max_retries + 1` times, retrying only transient failures.
pub struct RetryableSettlementService {
    inner: Arc<dyn SettlementRunner>,
    repo: Arc<Repository>,
    config: RetryConfig,
    on_failure: Option<FailureCallback>,
}

impl RetryableSettlementService {
    pub fn new(inner: Arc<dyn SettlementRunner>, repo: Arc<Repository>, config: RetryConfig) -> Self {
        Self {
            inner,
            repo,
            config,
            on_failure: None,
        }
    }

    pub fn with_failure_callback(mut self, callback: FailureCallback) -> Self {
        self.on_failure = Some(callback);
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Attempts are driven by [`backoff::future::retry_notify`] over a
    /// [`SettlementBackoff`]; the whole loop races the token.
    ///
    /// # Errors
    /// A non-retryable error is returned as is. Exhausted retries return
    /// `RetriesExhausted` wrapping the last error. Cancellation returns `Cancelled`. In
    /// every case `ALL` is first marked `failed`.
    pub async fn run_with_retry(
        &self,
        user_id: &UserId,
        date: NaiveDate,
        timezone: &str,
        token: &CancellationToken,
    ) -> Result<SettlementResult, SettlementError> {
        let mut attempt = 0u32;
        let retries = retry_notify(
            SettlementBackoff::new(&self.config),
            || {
                let current = attempt;
                attempt += 1;
                async move {
                    match self.inner.run_settlement(user_id, date, timezone, token).await {
                        Ok(result) => Ok(result),
                        Err(SettlementError::Cancelled) => {
                            Err(backoff::Error::permanent(SettlementError::Cancelled))
                        }
                        Err(err) => Err(self.on_attempt_failed(user_id, date, current, err).await),
                    }
                }
            },
            |err: SettlementError, delay: Duration| {
                info!(
                    user = %user_id,
                    error = %err,
                    delay_secs = delay.as_secs_f64(),
                    "Waiting before settlement retry"
                );
            },
        );

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(SettlementError::Cancelled),
            outcome = retries => outcome,
        };
        if let Err(SettlementError::Cancelled) = &outcome {
            self.mark_all(user_id, date, SettlementStatus::Failed, "settlement cancelled")
                .await;
        }
        outcome
    }

    /// Report a failed attempt (0-based) and decide whether another one follows.
    async fn on_attempt_failed(
        &self,
        user_id: &UserId,
        date: NaiveDate,
        attempt: u32,
        err: SettlementError,
    ) -> backoff::Error<SettlementError> {
        let message = err.to_string();
        let failure = SettlementFailure {
            user_id: user_id.clone(),
            date,
            phase: identify_phase(&message),
            attempt: attempt + 1,
            error: message.clone(),
            timestamp: Utc::now(),
            retryable: is_retryable(&message),
        };
        warn!(user = %user_id, phase = %failure.phase, retryable = failure.retryable, "{}", failure);
        if let Some(callback) = &self.on_failure {
            callback(&failure);
        }

        if !failure.retryable {
            info!(user = %user_id, "Non-retryable settlement error, marking failed");
            self.mark_all(user_id, date, SettlementStatus::Failed, &message).await;
            return backoff::Error::permanent(err);
        }

        if attempt >= self.config.max_retries {
            let exhausted = SettlementError::RetriesExhausted {
                attempts: self.config.max_retries + 1,
                source: Box::new(err),
            };
            error!(user = %user_id, date = %date, "Settlement retries exhausted");
            self.mark_all(user_id, date, SettlementStatus::Failed, &exhausted.to_string())
                .await;
            return backoff::Error::permanent(exhausted);
        }

        self.mark_all(user_id, date, SettlementStatus::Retrying, &message).await;
        backoff::Error::transient(err)
    }

    async fn mark_all(&self, user_id: &UserId, date: NaiveDate, status: SettlementStatus, message: &str) {
        if let Err(e) = self
            .repo
            .update_settlement_status(user_id, date, ModeKey::All, status, Some(message))
            .await
        {
            error!(user = %user_id, status = %status, error = %e, "Failed to record settlement status");
        }
    }
}

#[async_trait]
impl SettlementRunner for RetryableSettlementService {
    async fn run_settlement(
        &self,
        user_id: &UserId,
        date: NaiveDate,
        timezone: &str,
        token: &CancellationToken,
    ) -> Result<SettlementResult, SettlementError> {
        self.run_with_retry(user_id, date, timezone, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_patterns() {
        assert!(is_retryable("Network error: connection reset by peer"));
        assert!(is_retryable("HTTP error 503: Service Unavailable"));
        assert!(is_retryable("Rate limited: too many requests"));
        assert!(is_retryable("database is locked: lock timeout"));
        assert!(!is_retryable("validation failed for scalp: Negative trade count: -1"));
        assert!(!is_retryable("HTTP error 400: bad symbol"));
    }

    #[test]
    fn test_identify_phase() {
        assert_eq!(identify_phase("snapshot failed to get positions: x"), SettlementPhase::Snapshot);
        assert_eq!(identify_phase("failed to aggregate trades: y"), SettlementPhase::Aggregate);
        assert_eq!(identify_phase("failed to save settlement summaries: z"), SettlementPhase::Store);
        assert_eq!(identify_phase("validation failed for swing: bad"), SettlementPhase::Validate);
        assert_eq!(identify_phase("something odd"), SettlementPhase::Unknown);
    }

    #[test]
    fn test_delay_for_clamps() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for(0), Duration::from_secs(5));
        assert_eq!(config.delay_for(2), Duration::from_secs(45));
        assert_eq!(config.delay_for(7), Duration::from_secs(45));
        assert_eq!(delay_for(&[], 3), Duration::ZERO);
    }

    #[test]
    fn test_backoff_stops_after_max_retries() {
        let mut backoff = SettlementBackoff::new(&RetryConfig::default());
        let waits: Vec<Option<Duration>> = (0..4).map(|_| backoff.next_backoff()).collect();
        assert_eq!(
            waits,
            vec![
                Some(Duration::from_secs(5)),
                Some(Duration::from_secs(15)),
                Some(Duration::from_secs(45)),
                None
            ]
        );

        backoff.reset();
        assert_eq!(backoff.next_backoff(), Some(Duration::from_secs(5)));

        let mut none = SettlementBackoff::new(&RetryConfig {
            max_retries: 0,
            backoff: vec![Duration::from_secs(1)],
        });
        assert_eq!(none.next_backoff(), None);
    }

    #[test]
    fn test_failure_display() {
        let failure = SettlementFailure {
            user_id: UserId::new("u1"),
            date: NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
            phase: SettlementPhase::Store,
            attempt: 2,
            error: "boom".to_string(),
            timestamp: DateTime::parse_from_rfc3339("2026-01-16T00:05:00Z")
                .unwrap()
                .with_timezone(&Utc),
            retryable: false,
        };
        assert_eq!(
            failure.to_string(),
            "[2026-01-16T00:05:00Z] User u1, Date 2026-01-15, Phase store, Attempt 2: boom"
        );
    }
}
