//! Generation of structured client order identifiers.
//!
//! Normal ids take their sequence from the shared daily counter. Whenever the counter cannot
//! produce a usable value the generator switches to a fallback id with a random nonce, so
//! order placement never blocks on counter infrastructure.

use super::parser::{
    parse_client_order_id, FALLBACK_MARKER, MAX_CLIENT_ORDER_ID_LENGTH, MONTH_ABBREVIATIONS,
};
use super::types::{LegType, TradingMode};
use crate::counter::SequenceProvider;
use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::warn;

/// Timezone used when a user has none configured.
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Asia::Kolkata;

/// Largest sequence that fits the 5-digit field.
pub const MAX_SEQUENCE: i64 = 99_999;

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("user ID cannot be empty")]
    EmptyUserId,
    #[error("base ID cannot be empty")]
    EmptyBaseId,
    #[error("client order ID exceeds maximum length of 36 characters: '{id}' is {len} characters")]
    TooLong { id: String, len: usize },
    #[error("invalid client order ID format: {0}")]
    InvalidFormat(String),
}

/// A freshly rendered identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedId {
    /// Full id sent to the exchange, e.g. `SCA-15JAN-00001-E`.
    pub client_order_id: String,
    /// Chain base shared by all legs, e.g. `SCA-15JAN-00001`.
    pub chain_id: String,
    pub is_fallback: bool,
}

/// Per-user identifier generator.
pub struct ClientOrderIdGenerator {
    sequence_provider: Option<Arc<dyn SequenceProvider>>,
    user_id: String,
    timezone: Tz,
}

impl ClientOrderIdGenerator {
    /// # Errors
    /// Returns `EmptyUserId` if `user_id` is empty.
    pub fn new(
        sequence_provider: Option<Arc<dyn SequenceProvider>>,
        user_id: impl Into<String>,
        timezone: Option<Tz>,
    ) -> Result<Self, CodecError> {
        let user_id = user_id.into();
        if user_id.is_empty() {
            return Err(CodecError::EmptyUserId);
        }
        Ok(Self {
            sequence_provider,
            user_id,
            timezone: timezone.unwrap_or(DEFAULT_TIMEZONE),
        })
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Generate an id for a new order using the current time.
    pub async fn generate(&self, mode: TradingMode, leg: LegType) -> GeneratedId {
        self.generate_at(mode, leg, Utc::now()).await
    }

    /// Generate an id as of `now`. The sequence is scoped to the calendar day of `now` in the
    /// user's timezone. Never fails.
    pub async fn generate_at(
        &self,
        mode: TradingMode,
        leg: LegType,
        now: DateTime<Utc>,
    ) -> GeneratedId {
        let provider = match &self.sequence_provider {
            Some(p) if p.is_healthy() => p,
            Some(_) => {
                warn!(user = %self.user_id, "Sequence provider unhealthy, using fallback id");
                return self.generate_fallback(mode, leg);
            }
            None => {
                warn!(user = %self.user_id, "No sequence provider, using fallback id");
                return self.generate_fallback(mode, leg);
            }
        };

        let local = now.with_timezone(&self.timezone);
        let date_key = local.format("%Y%m%d").to_string();

        let sequence = match provider
            .increment_daily_sequence(&self.user_id, &date_key)
            .await
        {
            Ok(seq) => seq,
            Err(e) => {
                warn!(user = %self.user_id, error = %e, "Sequence provider error, using fallback id");
                return self.generate_fallback(mode, leg);
            }
        };

        if !(1..=MAX_SEQUENCE).contains(&sequence) {
            warn!(user = %self.user_id, sequence, "Sequence out of range, using fallback id");
            return self.generate_fallback(mode, leg);
        }

        let date_str = format!(
            "{:02}{}",
            local.day(),
            MONTH_ABBREVIATIONS[local.month0() as usize]
        );
        let chain_id = format!("{}-{}-{:05}", mode.code(), date_str, sequence);
        let client_order_id = format!("{}-{}", chain_id, leg.code());

        if client_order_id.len() > MAX_CLIENT_ORDER_ID_LENGTH {
            warn!(id = %client_order_id, "Generated id too long, using fallback id");
            return self.generate_fallback(mode, leg);
        }

        GeneratedId {
            client_order_id,
            chain_id,
            is_fallback: false,
        }
    }

    /// Append a leg suffix to an existing chain base.
    ///
    /// # Errors
    /// Returns `EmptyBaseId` for an empty base and `TooLong` if the result exceeds the cap.
    pub fn generate_related(&self, chain_id: &str, leg: LegType) -> Result<String, CodecError> {
        generate_related(chain_id, leg)
    }

    /// Render a fallback id with a random nonce.
    pub fn generate_fallback(&self, mode: TradingMode, leg: LegType) -> GeneratedId {
        let chain_id = format!("{}-{}-{}", mode.code(), FALLBACK_MARKER, short_unique_id());
        let client_order_id = format!("{}-{}", chain_id, leg.code());
        GeneratedId {
            client_order_id,
            chain_id,
            is_fallback: true,
        }
    }
}

/// Append a leg suffix to an existing chain base.
///
/// # Errors
/// Returns `EmptyBaseId` for an empty base and `TooLong` if the result exceeds the cap.
pub fn generate_related(chain_id: &str, leg: LegType) -> Result<String, CodecError> {
    if chain_id.is_empty() {
        return Err(CodecError::EmptyBaseId);
    }
    let id = format!("{}-{}", chain_id, leg.code());
    if id.len() > MAX_CLIENT_ORDER_ID_LENGTH {
        let len = id.len();
        return Err(CodecError::TooLong { id, len });
    }
    Ok(id)
}

/// Structural check used before handing an id to the exchange: non-empty, within the cap,
/// at least three fields, known mode code.
///
/// # Errors
/// Returns `TooLong` or `InvalidFormat` describing the first violation.
pub fn validate_client_order_id(id: &str) -> Result<(), CodecError> {
    if id.is_empty() {
        return Err(CodecError::InvalidFormat("empty id".to_string()));
    }
    if id.len() > MAX_CLIENT_ORDER_ID_LENGTH {
        return Err(CodecError::TooLong {
            id: id.to_string(),
            len: id.len(),
        });
    }
    let parts: Vec<&str> = id.split('-').collect();
    if parts.len() < 3 {
        return Err(CodecError::InvalidFormat(
            "expected at least 3 parts separated by '-'".to_string(),
        ));
    }
    if TradingMode::from_code(parts[0]).is_none() {
        return Err(CodecError::InvalidFormat(format!(
            "unknown mode code '{}'",
            parts[0]
        )));
    }
    Ok(())
}

/// Strip the leg suffix from a full id. Ids with three fields are already a base.
///
/// # Errors
/// Returns `InvalidFormat` for empty input or fewer than three fields.
pub fn extract_base_id(full_id: &str) -> Result<String, CodecError> {
    if full_id.is_empty() {
        return Err(CodecError::InvalidFormat("empty id".to_string()));
    }
    let parts: Vec<&str> = full_id.split('-').collect();
    match parts.len() {
        0..=2 => Err(CodecError::InvalidFormat(format!(
            "cannot extract base ID from '{}'",
            full_id
        ))),
        3 => Ok(full_id.to_string()),
        _ => Ok(parts[..3].join("-")),
    }
}

pub fn is_fallback_id(id: &str) -> bool {
    parse_client_order_id(id)
        .map(|p| p.is_fallback())
        .unwrap_or(false)
}

/// 8 lowercase hex characters from the OS random source, or from the clock mixed with a
/// process-wide counter if the random source fails.
fn short_unique_id() -> String {
    let mut bytes = [0u8; 4];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => hex::encode(bytes),
        Err(e) => {
            warn!(error = %e, "OS random source failed, using time-derived nonce");
            time_derived_id()
        }
    }
}

fn time_derived_id() -> String {
    let counter = FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let combined = (nanos << 16) | (counter & 0xFFFF);
    format!("{:08x}", combined & 0xFFFF_FFFF)
}
