//! Process-local sequence counter for tests and single-instance deployments.

use super::{CounterError, SequenceProvider};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// In-memory counter keyed by (user, date key).
///
/// Availability can be toggled to exercise the fallback path.
#[derive(Debug, Default)]
pub struct InMemorySequenceProvider {
    counters: Mutex<HashMap<String, i64>>,
    unavailable: AtomicBool,
}

impl InMemorySequenceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the counter for a key at `value`; the next increment returns `value + 1`.
    pub fn with_value(self, user_id: &str, date_key: &str, value: i64) -> Self {
        if let Ok(mut counters) = self.counters.lock() {
            counters.insert(super::sequence_key(user_id, date_key), value);
        }
        self
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn current(&self, user_id: &str, date_key: &str) -> Option<i64> {
        self.counters
            .lock()
            .ok()
            .and_then(|c| c.get(&super::sequence_key(user_id, date_key)).copied())
    }
}

#[async_trait]
impl SequenceProvider for InMemorySequenceProvider {
    async fn increment_daily_sequence(
        &self,
        user_id: &str,
        date_key: &str,
    ) -> Result<i64, CounterError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CounterError::Unavailable("connection refused".to_string()));
        }
        let mut counters = self
            .counters
            .lock()
            .map_err(|_| CounterError::Unavailable("counter lock poisoned".to_string()))?;
        let value = counters
            .entry(super::sequence_key(user_id, date_key))
            .or_insert(0);
        *value += 1;
        Ok(*value)
    }

    fn is_healthy(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }
}
