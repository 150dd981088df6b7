//! Atomic daily sequence counter consumed by the client order id generator.
//!
//! The counter is the single source of truth for sequence allocation. It must hand out
//! distinct values per (user, date key) to any number of concurrent callers, including
//! callers in other processes. It is allowed to be unavailable; the generator degrades to
//! fallback identifiers instead of failing.

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod redis;

pub use memory::InMemorySequenceProvider;
pub use self::redis::RedisSequenceProvider;

/// Key TTL for per-day counters. Two days covers any timezone offset.
pub const SEQUENCE_TTL_SECS: i64 = 48 * 60 * 60;

/// Storage key for a user's counter on one calendar day (`date_key` is `YYYYMMDD`).
pub fn sequence_key(user_id: &str, date_key: &str) -> String {
    format!("user:{}:sequence:{}", user_id, date_key)
}

#[async_trait]
pub trait SequenceProvider: Send + Sync {
    /// Atomically increment and return the counter for (user, date key). The first call of
    /// a day returns 1.
    async fn increment_daily_sequence(
        &self,
        user_id: &str,
        date_key: &str,
    ) -> Result<i64, CounterError>;

    /// Cheap health check; an unhealthy provider is skipped without a round trip.
    fn is_healthy(&self) -> bool;
}

#[derive(Debug, Error)]
pub enum CounterError {
    #[error("sequence counter unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Redis(#[from] ::redis::RedisError),
}
