//! Redis-backed sequence counter. `INCR` is atomic across every process sharing the server.

use super::{sequence_key, CounterError, SequenceProvider, SEQUENCE_TTL_SECS};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct RedisSequenceProvider {
    conn: ConnectionManager,
}

impl RedisSequenceProvider {
    /// Connect to Redis at the given URL.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the first connection fails.
    pub async fn connect(redis_url: &str) -> RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Sequence counter connected to Redis at {}", redis_url);
        Ok(Self { conn })
    }
}

#[async_trait]
impl SequenceProvider for RedisSequenceProvider {
    async fn increment_daily_sequence(
        &self,
        user_id: &str,
        date_key: &str,
    ) -> Result<i64, CounterError> {
        let key = sequence_key(user_id, date_key);
        let mut conn = self.conn.clone();

        let value: i64 = conn.incr(&key, 1i64).await?;

        if value == 1 {
            if let Err(e) = redis::cmd("EXPIRE")
                .arg(&key)
                .arg(SEQUENCE_TTL_SECS)
                .query_async::<_, ()>(&mut conn)
                .await
            {
                warn!(key = %key, error = %e, "Failed to set sequence TTL");
            }
        }

        debug!(key = %key, value, "Allocated daily sequence");
        Ok(value)
    }

    /// The connection manager reconnects on its own, so failures surface per call.
    fn is_healthy(&self) -> bool {
        true
    }
}
