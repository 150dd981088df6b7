//! Exchange client abstraction consumed by settlement and capital tracking.
//!
//! The concrete futures client lives outside this crate. Settlement only needs the read
//! calls below; every implementation handles its own signing, pagination and rate limits.

use crate::domain::{Decimal, PositionSide, Side, Symbol, TimeMs, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub mod mock;

pub use mock::{MockCall, MockClientFactory, MockExchange};

/// Income type carrying realized P&L, used for symbol discovery.
pub const INCOME_REALIZED_PNL: &str = "REALIZED_PNL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: Symbol,
    pub position_side: PositionSide,
    /// Signed size; negative for shorts in one-way mode.
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_profit: Decimal,
    pub leverage: u32,
    /// `CROSSED` or `ISOLATED`.
    pub margin_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeOrder {
    pub order_id: i64,
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub position_side: PositionSide,
    pub status: String,
    pub time: TimeMs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeTrade {
    pub id: i64,
    pub order_id: i64,
    pub symbol: Symbol,
    pub side: Side,
    pub position_side: PositionSide,
    pub price: Decimal,
    pub qty: Decimal,
    /// Notional in quote currency.
    pub quote_qty: Decimal,
    pub realized_pnl: Decimal,
    pub commission: Decimal,
    pub time: TimeMs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomeRecord {
    pub symbol: Symbol,
    pub income_type: String,
    pub income: Decimal,
    pub time: TimeMs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub total_wallet_balance: Decimal,
    pub available_balance: Decimal,
    pub total_initial_margin: Decimal,
    pub total_unrealized_profit: Decimal,
}

/// Read-only futures account API.
#[async_trait]
pub trait ExchangeClient: Send + Sync + fmt::Debug {
    async fn positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError>;

    async fn open_orders(&self, symbol: &Symbol) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    /// Most recent `limit` orders for a symbol, any status.
    async fn all_orders(
        &self,
        symbol: &Symbol,
        limit: usize,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    /// Orders created within `[from, to]`.
    async fn orders_by_date_range(
        &self,
        symbol: &Symbol,
        from: TimeMs,
        to: TimeMs,
        limit: usize,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError>;

    /// Trades within `[from, to]`. An empty symbol asks for every symbol, which some
    /// venues reject.
    async fn trades_by_date_range(
        &self,
        symbol: &Symbol,
        from: TimeMs,
        to: TimeMs,
        limit: usize,
    ) -> Result<Vec<ExchangeTrade>, ExchangeError>;

    async fn income_history(
        &self,
        income_type: &str,
        from: TimeMs,
        to: TimeMs,
        limit: usize,
    ) -> Result<Vec<IncomeRecord>, ExchangeError>;

    async fn account_info(&self) -> Result<AccountInfo, ExchangeError>;
}

/// Resolves the exchange client holding a user's credentials.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn client_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Arc<dyn ExchangeClient>, ExchangeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// Transport failure (timeout, refused, reset).
    NetworkError(String),
    /// Non-success HTTP status.
    HttpError { status: u16, message: String },
    RateLimited,
    ParseError(String),
    /// No credentials on file for the user.
    NotConfigured(String),
    Other(String),
}

impl fmt::Display for ExchangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            ExchangeError::HttpError { status, message } => {
                write!(f, "HTTP error {}: {}", status, message)
            }
            ExchangeError::RateLimited => write!(f, "Rate limited"),
            ExchangeError::ParseError(msg) => write!(f, "Parse error: {}", msg),
            ExchangeError::NotConfigured(user) => {
                write!(f, "No exchange client configured for user {}", user)
            }
            ExchangeError::Other(msg) => write!(f, "Error: {}", msg),
        }
    }
}

impl std::error::Error for ExchangeError {}

/// Factory for deployments without exchange credentials. Every lookup fails with
/// `NotConfigured`, so settlements fail fast and surface through the monitor.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredClientFactory;

#[async_trait]
impl ClientFactory for UnconfiguredClientFactory {
    async fn client_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Arc<dyn ExchangeClient>, ExchangeError> {
        Err(ExchangeError::NotConfigured(user_id.to_string()))
    }
}
