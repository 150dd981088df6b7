//! Lifecycle of a position from entry fill to full close, one per order chain.

use super::parser::parse_client_order_id;
use super::types::LegType;
use crate::domain::{Decimal, Side, Symbol, TimeMs, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Active,
    /// At least one take-profit has filled.
    Partial,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Active => "ACTIVE",
            PositionStatus::Partial => "PARTIAL",
            PositionStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(PositionStatus::Active),
            "PARTIAL" => Some(PositionStatus::Partial),
            "CLOSED" => Some(PositionStatus::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub id: Option<i64>,
    pub user_id: UserId,
    pub chain_id: String,
    pub symbol: Symbol,
    pub entry_order_id: i64,
    pub entry_client_order_id: String,
    pub entry_side: Side,
    pub entry_price: Decimal,
    pub entry_quantity: Decimal,
    pub entry_value: Decimal,
    pub entry_fees: Decimal,
    pub entry_filled_at: TimeMs,
    pub status: PositionStatus,
    pub remaining_quantity: Decimal,
    pub realized_pnl: Decimal,
    pub created_at: TimeMs,
    pub updated_at: TimeMs,
    pub closed_at: Option<TimeMs>,
}

/// Entry order fill as reported by the exchange.
#[derive(Debug, Clone)]
pub struct EntryFill {
    pub user_id: UserId,
    pub order_id: i64,
    pub client_order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub avg_price: Decimal,
    pub executed_qty: Decimal,
    pub commission: Decimal,
    /// Exchange update time; zero means unknown.
    pub update_time: TimeMs,
}

#[derive(Debug, Clone)]
pub struct PartialClose {
    pub chain_id: String,
    pub closed_qty: Decimal,
    pub close_price: Decimal,
    pub close_pnl: Decimal,
    pub leg_type: LegType,
}

/// Durable storage for position lifecycle rows.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Insert and return the row id.
    async fn create_position(&self, position: &PositionState) -> Result<i64, sqlx::Error>;

    async fn update_position(&self, position: &PositionState) -> Result<(), sqlx::Error>;

    async fn position_by_chain(
        &self,
        user_id: &UserId,
        chain_id: &str,
    ) -> Result<Option<PositionState>, sqlx::Error>;

    async fn positions_by_user(
        &self,
        user_id: &UserId,
        status: PositionStatus,
    ) -> Result<Vec<PositionState>, sqlx::Error>;

    async fn position_by_symbol(
        &self,
        user_id: &UserId,
        symbol: &Symbol,
        status: PositionStatus,
    ) -> Result<Option<PositionState>, sqlx::Error>;
}

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("position not found")]
    PositionNotFound,
    #[error("not an entry order")]
    NotEntryOrder,
    #[error("invalid quantity")]
    InvalidQuantity,
    #[error("failed to {action} position state: {source}")]
    Store {
        action: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

fn cache_key(user_id: &UserId, chain_id: &str) -> String {
    format!("{}:{}", user_id, chain_id)
}

/// Tracks positions per chain. The cache holds only open positions; closed positions are
/// evicted once persisted.
pub struct PositionTracker {
    store: Option<Arc<dyn PositionStore>>,
    cache: Mutex<HashMap<String, PositionState>>,
}

impl PositionTracker {
    pub fn new(store: Option<Arc<dyn PositionStore>>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Open a position from an entry fill. Ids that do not decode are treated as entries of
    /// a synthetic chain `ORDER-{order_id}`.
    ///
    /// # Errors
    /// `NotEntryOrder` for non-entry legs, `InvalidQuantity` for a non-positive fill, or a
    /// store failure.
    pub async fn on_entry_filled(&self, fill: EntryFill) -> Result<PositionState, PositionError> {
        let (chain_id, leg) = match parse_client_order_id(&fill.client_order_id) {
            Some(parsed) => (parsed.chain_id, parsed.leg),
            None => {
                warn!(
                    client_order_id = %fill.client_order_id,
                    "Could not parse client order ID, using fallback chain"
                );
                (format!("ORDER-{}", fill.order_id), LegType::Entry)
            }
        };

        if leg != LegType::Entry {
            return Err(PositionError::NotEntryOrder);
        }
        if !fill.executed_qty.is_positive() {
            return Err(PositionError::InvalidQuantity);
        }

        let now = TimeMs::now();
        let entry_filled_at = if fill.update_time.as_ms() == 0 {
            now
        } else {
            fill.update_time
        };

        let mut position = PositionState {
            id: None,
            user_id: fill.user_id,
            chain_id,
            symbol: fill.symbol,
            entry_order_id: fill.order_id,
            entry_client_order_id: fill.client_order_id,
            entry_side: fill.side,
            entry_price: fill.avg_price,
            entry_quantity: fill.executed_qty,
            entry_value: fill.avg_price * fill.executed_qty,
            entry_fees: fill.commission,
            entry_filled_at,
            status: PositionStatus::Active,
            remaining_quantity: fill.executed_qty,
            realized_pnl: Decimal::zero(),
            created_at: now,
            updated_at: now,
            closed_at: None,
        };

        if let Some(store) = &self.store {
            let id = store.create_position(&position).await.map_err(|e| {
                error!(chain = %position.chain_id, error = %e, "Failed to create position state");
                PositionError::Store {
                    action: "create",
                    source: e,
                }
            })?;
            position.id = Some(id);
        }

        self.cache.lock().await.insert(
            cache_key(&position.user_id, &position.chain_id),
            position.clone(),
        );

        info!(
            chain = %position.chain_id,
            symbol = %position.symbol,
            side = %position.entry_side,
            entry_price = %position.entry_price,
            quantity = %position.entry_quantity,
            "Position state created from entry fill"
        );
        Ok(position)
    }

    /// Reduce a position after a take-profit or other partial exit.
    pub async fn on_partial_close(
        &self,
        user_id: &UserId,
        close: PartialClose,
    ) -> Result<PositionState, PositionError> {
        if !close.closed_qty.is_positive() {
            return Err(PositionError::InvalidQuantity);
        }

        let mut cache = self.cache.lock().await;
        let mut position = self.lookup_locked(&cache, user_id, &close.chain_id).await?;

        position.remaining_quantity -= close.closed_qty;
        position.realized_pnl += close.close_pnl;
        let now = TimeMs::now();
        position.updated_at = now;

        if !position.remaining_quantity.is_positive() {
            position.status = PositionStatus::Closed;
            position.closed_at = Some(now);
            position.remaining_quantity = Decimal::zero();
        } else {
            position.status = PositionStatus::Partial;
        }

        self.persist_update(&position).await?;

        let key = cache_key(user_id, &close.chain_id);
        if position.status == PositionStatus::Closed {
            cache.remove(&key);
        } else {
            cache.insert(key, position.clone());
        }

        info!(
            chain = %close.chain_id,
            leg = %close.leg_type,
            closed_qty = %close.closed_qty,
            close_price = %close.close_price,
            close_pnl = %close.close_pnl,
            remaining_qty = %position.remaining_quantity,
            status = %position.status,
            "Position partially closed"
        );
        Ok(position)
    }

    /// Force-close a position, adding `realized_pnl` to what has already been realized.
    pub async fn on_position_closed(
        &self,
        user_id: &UserId,
        chain_id: &str,
        realized_pnl: Decimal,
        reason: &str,
    ) -> Result<PositionState, PositionError> {
        let mut cache = self.cache.lock().await;
        let mut position = self.lookup_locked(&cache, user_id, chain_id).await?;

        let now = TimeMs::now();
        position.status = PositionStatus::Closed;
        position.closed_at = Some(now);
        position.remaining_quantity = Decimal::zero();
        position.realized_pnl += realized_pnl;
        position.updated_at = now;

        self.persist_update(&position).await?;
        cache.remove(&cache_key(user_id, chain_id));

        info!(
            chain = %chain_id,
            realized_pnl = %position.realized_pnl,
            reason = %reason,
            "Position closed"
        );
        Ok(position)
    }

    async fn lookup_locked(
        &self,
        cache: &HashMap<String, PositionState>,
        user_id: &UserId,
        chain_id: &str,
    ) -> Result<PositionState, PositionError> {
        if let Some(position) = cache.get(&cache_key(user_id, chain_id)) {
            return Ok(position.clone());
        }
        let Some(store) = &self.store else {
            return Err(PositionError::PositionNotFound);
        };
        match store.position_by_chain(user_id, chain_id).await {
            Ok(Some(position)) => Ok(position),
            Ok(None) => Err(PositionError::PositionNotFound),
            Err(e) => {
                error!(chain = %chain_id, error = %e, "Failed to load position state");
                Err(PositionError::Store {
                    action: "load",
                    source: e,
                })
            }
        }
    }

    async fn persist_update(&self, position: &PositionState) -> Result<(), PositionError> {
        if let Some(store) = &self.store {
            store.update_position(position).await.map_err(|e| {
                error!(chain = %position.chain_id, error = %e, "Failed to update position state");
                PositionError::Store {
                    action: "update",
                    source: e,
                }
            })?;
        }
        Ok(())
    }

    /// Cache first, then the store.
    pub async fn get_position_by_chain(
        &self,
        user_id: &UserId,
        chain_id: &str,
    ) -> Result<PositionState, PositionError> {
        let cache = self.cache.lock().await;
        self.lookup_locked(&cache, user_id, chain_id).await
    }

    pub async fn active_positions(
        &self,
        user_id: &UserId,
    ) -> Result<Vec<PositionState>, PositionError> {
        self.positions_by_status(user_id, PositionStatus::Active).await
    }

    /// Store is authoritative when present; otherwise the cache answers.
    pub async fn positions_by_status(
        &self,
        user_id: &UserId,
        status: PositionStatus,
    ) -> Result<Vec<PositionState>, PositionError> {
        if let Some(store) = &self.store {
            return store
                .positions_by_user(user_id, status)
                .await
                .map_err(|e| PositionError::Store {
                    action: "load",
                    source: e,
                });
        }
        Ok(self
            .cache
            .lock()
            .await
            .values()
            .filter(|p| &p.user_id == user_id && p.status == status)
            .cloned()
            .collect())
    }

    /// The active position on `symbol`, if any.
    pub async fn position_by_symbol(
        &self,
        user_id: &UserId,
        symbol: &Symbol,
    ) -> Result<PositionState, PositionError> {
        if let Some(store) = &self.store {
            return store
                .position_by_symbol(user_id, symbol, PositionStatus::Active)
                .await
                .map_err(|e| PositionError::Store {
                    action: "load",
                    source: e,
                })?
                .ok_or(PositionError::PositionNotFound);
        }
        self.cache
            .lock()
            .await
            .values()
            .find(|p| {
                &p.user_id == user_id && &p.symbol == symbol && p.status == PositionStatus::Active
            })
            .cloned()
            .ok_or(PositionError::PositionNotFound)
    }

    /// Warm the cache with a user's active positions after a restart.
    pub async fn load_active_positions(&self, user_id: &UserId) -> Result<usize, PositionError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let positions = store
            .positions_by_user(user_id, PositionStatus::Active)
            .await
            .map_err(|e| PositionError::Store {
                action: "load",
                source: e,
            })?;
        let count = positions.len();

        let mut cache = self.cache.lock().await;
        for position in positions {
            cache.insert(cache_key(&position.user_id, &position.chain_id), position);
        }

        info!(user = %user_id, count, "Loaded active positions into cache");
        Ok(count)
    }

    pub async fn cached_position_count(&self) -> usize {
        self.cache.lock().await.len()
    }

    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }
}
