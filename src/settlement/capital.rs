//! Intraday capital sampling and end-of-day capital metrics.
//!
//! Samples are taken from the account endpoint and kept per (user, UTC day) until the
//! day is aggregated. Storage is either a Redis sorted set scored by sample time or a
//! process-local map.

use super::format_date;
use crate::domain::{Decimal, TimeMs, UserId};
use crate::exchange::{ClientFactory, ExchangeError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Samples outlive the day they describe by a day so late aggregation still finds them.
pub const CAPITAL_SAMPLE_TTL_SECS: i64 = 48 * 60 * 60;

pub fn capital_samples_key(user_id: &UserId, date: NaiveDate) -> String {
    format!("capital_samples:{}:{}", user_id, format_date(date))
}

#[derive(Debug, Error)]
pub enum CapitalError {
    #[error("failed to get exchange client: {0}")]
    Client(#[source] ExchangeError),
    #[error("failed to get account info: {0}")]
    Account(#[source] ExchangeError),
    #[error("failed to encode capital sample: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("capital sample store error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("capital sample store unavailable: {0}")]
    Unavailable(String),
    #[error("no samples found for date {0}")]
    NoSamples(NaiveDate),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalSample {
    pub timestamp: TimeMs,
    pub total_balance: Decimal,
    pub used_margin: Decimal,
    pub available_margin: Decimal,
    pub unrealized_pnl: Decimal,
    /// Used margin as a percentage of balance.
    pub utilization: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalMetrics {
    pub starting_balance: Decimal,
    pub ending_balance: Decimal,
    pub max_capital_used: Decimal,
    pub avg_capital_used: Decimal,
    pub peak_balance: Decimal,
    /// Magnitude of the most negative unrealized P&L seen, zero if never negative.
    pub max_drawdown: Decimal,
    pub sample_count: usize,
}

/// Per-(user, day) sample storage, ordered by sample time.
#[async_trait]
pub trait SampleStore: Send + Sync {
    async fn add_sample(
        &self,
        user_id: &UserId,
        date: NaiveDate,
        sample: &CapitalSample,
    ) -> Result<(), CapitalError>;

    async fn samples(&self, user_id: &UserId, date: NaiveDate) -> Result<Vec<CapitalSample>, CapitalError>;

    async fn clear(&self, user_id: &UserId, date: NaiveDate) -> Result<(), CapitalError>;
}

// =============================================================================
// Redis store
// =============================================================================

#[derive(Clone)]
pub struct RedisSampleStore {
    conn: ConnectionManager,
}

impl RedisSampleStore {
    /// # Errors
    /// Returns an error if the URL is invalid or the first connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, CapitalError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Capital sample store connected to Redis at {}", redis_url);
        Ok(Self { conn })
    }
}

#[async_trait]
impl SampleStore for RedisSampleStore {
    async fn add_sample(
        &self,
        user_id: &UserId,
        date: NaiveDate,
        sample: &CapitalSample,
    ) -> Result<(), CapitalError> {
        let key = capital_samples_key(user_id, date);
        let member = serde_json::to_string(sample)?;
        let mut conn = self.conn.clone();

        conn.zadd::<_, _, _, ()>(&key, member, sample.timestamp.as_ms())
            .await?;

        if let Err(e) = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(CAPITAL_SAMPLE_TTL_SECS)
            .query_async::<_, ()>(&mut conn)
            .await
        {
            warn!(key = %key, error = %e, "Failed to set capital sample TTL");
        }
        Ok(())
    }

    async fn samples(&self, user_id: &UserId, date: NaiveDate) -> Result<Vec<CapitalSample>, CapitalError> {
        let key = capital_samples_key(user_id, date);
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.zrange(&key, 0, -1).await?;

        Ok(members
            .iter()
            .filter_map(|m| match serde_json::from_str::<CapitalSample>(m) {
                Ok(sample) => Some(sample),
                Err(e) => {
                    warn!(key = %key, error = %e, "Skipping unreadable capital sample");
                    None
                }
            })
            .collect())
    }

    async fn clear(&self, user_id: &UserId, date: NaiveDate) -> Result<(), CapitalError> {
        let key = capital_samples_key(user_id, date);
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(&key).await?;
        Ok(())
    }
}

// =============================================================================
// In-memory store
// =============================================================================

#[derive(Debug, Default)]
pub struct InMemorySampleStore {
    samples: Mutex<HashMap<String, Vec<CapitalSample>>>,
}

impl InMemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SampleStore for InMemorySampleStore {
    async fn add_sample(
        &self,
        user_id: &UserId,
        date: NaiveDate,
        sample: &CapitalSample,
    ) -> Result<(), CapitalError> {
        let mut samples = self
            .samples
            .lock()
            .map_err(|_| CapitalError::Unavailable("sample store lock poisoned".to_string()))?;
        let day = samples.entry(capital_samples_key(user_id, date)).or_default();
        let idx = day.partition_point(|s| s.timestamp <= sample.timestamp);
        day.insert(idx, sample.clone());
        Ok(())
    }

    async fn samples(&self, user_id: &UserId, date: NaiveDate) -> Result<Vec<CapitalSample>, CapitalError> {
        let samples = self
            .samples
            .lock()
            .map_err(|_| CapitalError::Unavailable("sample store lock poisoned".to_string()))?;
        Ok(samples
            .get(&capital_samples_key(user_id, date))
            .cloned()
            .unwrap_or_default())
    }

    async fn clear(&self, user_id: &UserId, date: NaiveDate) -> Result<(), CapitalError> {
        let mut samples = self
            .samples
            .lock()
            .map_err(|_| CapitalError::Unavailable("sample store lock poisoned".to_string()))?;
        samples.remove(&capital_samples_key(user_id, date));
        Ok(())
    }
}

// =============================================================================
// Tracker
// =============================================================================

pub struct CapitalTracker {
    clients: Arc<dyn ClientFactory>,
    store: Arc<dyn SampleStore>,
}

impl CapitalTracker {
    pub fn new(clients: Arc<dyn ClientFactory>, store: Arc<dyn SampleStore>) -> Self {
        Self { clients, store }
    }

    /// Read the account and record a sample under the UTC date of `now`. A store failure
    /// is logged and the sample still returned.
    ///
    /// # Errors
    /// Fails if the client cannot be resolved or the account cannot be read.
    pub async fn sample(&self, user_id: &UserId, now: DateTime<Utc>) -> Result<CapitalSample, CapitalError> {
        let client = self
            .clients
            .client_for_user(user_id)
            .await
            .map_err(CapitalError::Client)?;
        let account = client.account_info().await.map_err(CapitalError::Account)?;

        let utilization = if account.total_wallet_balance.is_positive() {
            Decimal::percent_of(account.total_initial_margin, account.total_wallet_balance)
        } else {
            Decimal::zero()
        };
        let sample = CapitalSample {
            timestamp: TimeMs::from_datetime(&now),
            total_balance: account.total_wallet_balance,
            used_margin: account.total_initial_margin,
            available_margin: account.available_balance,
            unrealized_pnl: account.total_unrealized_profit,
            utilization,
        };

        if let Err(e) = self.store.add_sample(user_id, now.date_naive(), &sample).await {
            warn!(user = %user_id, error = %e, "Failed to store capital sample");
        } else {
            debug!(user = %user_id, utilization = %sample.utilization, "Capital sampled");
        }
        Ok(sample)
    }

    /// # Errors
    /// Fails if the store cannot be read.
    pub async fn day_samples(&self, user_id: &UserId, date: NaiveDate) -> Result<Vec<CapitalSample>, CapitalError> {
        self.store.samples(user_id, date).await
    }

    /// # Errors
    /// `NoSamples` when the day has none; store errors otherwise.
    pub async fn aggregate(&self, user_id: &UserId, date: NaiveDate) -> Result<CapitalMetrics, CapitalError> {
        let samples = self.store.samples(user_id, date).await?;
        aggregate_samples(&samples).ok_or(CapitalError::NoSamples(date))
    }

    /// Drop a day's samples once aggregated.
    ///
    /// # Errors
    /// Fails if the store cannot be written.
    pub async fn clear_day(&self, user_id: &UserId, date: NaiveDate) -> Result<(), CapitalError> {
        self.store.clear(user_id, date).await
    }
}

/// Metrics over time-ordered samples, `None` when there are none.
pub fn aggregate_samples(samples: &[CapitalSample]) -> Option<CapitalMetrics> {
    let first = samples.first()?;
    let last = samples.last()?;

    let mut max_used = Decimal::zero();
    let mut peak = Decimal::zero();
    let mut min_unrealized = Decimal::zero();
    let mut total_used = Decimal::zero();
    for sample in samples {
        max_used = max_used.max(sample.used_margin);
        peak = peak.max(sample.total_balance);
        min_unrealized = min_unrealized.min(sample.unrealized_pnl);
        total_used += sample.used_margin;
    }

    let count = samples.len();
    Some(CapitalMetrics {
        starting_balance: first.total_balance,
        ending_balance: last.total_balance,
        max_capital_used: max_used,
        avg_capital_used: total_used / Decimal::from_i64(count as i64),
        peak_balance: peak,
        max_drawdown: -min_unrealized,
        sample_count: count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{AccountInfo, MockCall, MockClientFactory, MockExchange};
    use chrono::TimeZone;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn sample(ts: i64, balance: &str, used: &str, unrealized: &str) -> CapitalSample {
        CapitalSample {
            timestamp: TimeMs::new(ts),
            total_balance: d(balance),
            used_margin: d(used),
            available_margin: d(balance) - d(used),
            unrealized_pnl: d(unrealized),
            utilization: Decimal::percent_of(d(used), d(balance)),
        }
    }

    #[test]
    fn test_aggregate_samples() {
        let samples = vec![
            sample(1, "1000", "200", "10"),
            sample(2, "1100", "500", "-75"),
            sample(3, "1050", "300", "-20"),
        ];
        let m = aggregate_samples(&samples).unwrap();
        assert_eq!(m.starting_balance, d("1000"));
        assert_eq!(m.ending_balance, d("1050"));
        assert_eq!(m.max_capital_used, d("500"));
        assert_eq!(m.avg_capital_used, d("1000") / d("3"));
        assert_eq!(m.peak_balance, d("1100"));
        assert_eq!(m.max_drawdown, d("75"));
        assert_eq!(m.sample_count, 3);

        assert!(aggregate_samples(&[]).is_none());
    }

    #[test]
    fn test_no_drawdown_when_always_positive() {
        let m = aggregate_samples(&[sample(1, "1000", "0", "5")]).unwrap();
        assert_eq!(m.max_drawdown, Decimal::zero());
    }

    #[tokio::test]
    async fn test_sample_aggregate_clear() {
        let exchange = Arc::new(MockExchange::new().with_account_info(AccountInfo {
            total_wallet_balance: d("2000"),
            available_balance: d("1500"),
            total_initial_margin: d("500"),
            total_unrealized_profit: d("-30"),
        }));
        let clients = Arc::new(MockClientFactory::new().with_default(exchange.clone()));
        let store = Arc::new(InMemorySampleStore::new());
        let tracker = CapitalTracker::new(clients, store);

        let user = UserId::new("u1");
        let now = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let s = tracker.sample(&user, now).await.unwrap();
        assert_eq!(s.utilization, d("25"));

        exchange.set_account_info(AccountInfo {
            total_wallet_balance: d("2100"),
            available_balance: d("1500"),
            total_initial_margin: d("600"),
            total_unrealized_profit: d("12"),
        });
        tracker
            .sample(&user, now + chrono::Duration::hours(1))
            .await
            .unwrap();

        let date = now.date_naive();
        let m = tracker.aggregate(&user, date).await.unwrap();
        assert_eq!(m.sample_count, 2);
        assert_eq!(m.starting_balance, d("2000"));
        assert_eq!(m.ending_balance, d("2100"));
        assert_eq!(m.avg_capital_used, d("550"));
        assert_eq!(m.max_drawdown, d("30"));

        tracker.clear_day(&user, date).await.unwrap();
        let err = tracker.aggregate(&user, date).await.unwrap_err();
        assert_eq!(err.to_string(), "no samples found for date 2026-01-15");
    }

    #[tokio::test]
    async fn test_zero_balance_has_zero_utilization() {
        let exchange = Arc::new(MockExchange::new());
        let clients = Arc::new(MockClientFactory::new().with_default(exchange));
        let tracker = CapitalTracker::new(clients, Arc::new(InMemorySampleStore::new()));
        let s = tracker.sample(&UserId::new("u1"), Utc::now()).await.unwrap();
        assert_eq!(s.utilization, Decimal::zero());
    }

    #[tokio::test]
    async fn test_account_failure_is_error() {
        let exchange = Arc::new(
            MockExchange::new().failing(MockCall::AccountInfo, ExchangeError::RateLimited),
        );
        let clients = Arc::new(MockClientFactory::new().with_default(exchange));
        let tracker = CapitalTracker::new(clients, Arc::new(InMemorySampleStore::new()));
        let err = tracker.sample(&UserId::new("u1"), Utc::now()).await.unwrap_err();
        assert!(matches!(err, CapitalError::Account(ExchangeError::RateLimited)));
    }

    #[tokio::test]
    async fn test_in_memory_store_orders_by_time() {
        let store = InMemorySampleStore::new();
        let user = UserId::new("u1");
        let date = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        store.add_sample(&user, date, &sample(30, "3", "0", "0")).await.unwrap();
        store.add_sample(&user, date, &sample(10, "1", "0", "0")).await.unwrap();
        store.add_sample(&user, date, &sample(20, "2", "0", "0")).await.unwrap();

        let got = store.samples(&user, date).await.unwrap();
        let times: Vec<i64> = got.iter().map(|s| s.timestamp.as_ms()).collect();
        assert_eq!(times, vec![10, 20, 30]);
        assert_eq!(
            capital_samples_key(&user, date),
            "capital_samples:u1:2026-01-15"
        );
    }
}
