//! End-of-day snapshots of open exchange positions, attributed to trading modes.

use super::{ModeKey, PositionSnapshot, SnapshotResult, SnapshotSummary};
use crate::db::Repository;
use crate::domain::{Decimal, Symbol, TimeMs, UserId};
use crate::exchange::{ClientFactory, ExchangeClient, ExchangeError, ExchangePosition};
use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Orders scanned from history when no open order identifies the mode.
const ORDER_HISTORY_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("user id cannot be empty for snapshot")]
    EmptyUserId,
    #[error("snapshot failed to get exchange client: {0}")]
    Client(#[source] ExchangeError),
    #[error("snapshot failed to get positions: {0}")]
    Positions(#[source] ExchangeError),
    #[error("failed to save position snapshots: {0}")]
    Store(#[source] sqlx::Error),
    #[error("failed to load snapshot summary: {0}")]
    Summary(#[source] sqlx::Error),
}

pub struct PositionSnapshotService {
    repo: Arc<Repository>,
    clients: Arc<dyn ClientFactory>,
}

impl PositionSnapshotService {
    pub fn new(repo: Arc<Repository>, clients: Arc<dyn ClientFactory>) -> Self {
        Self { repo, clients }
    }

    /// Snapshot every non-zero position, attributing each to the mode of a matching order.
    ///
    /// # Errors
    /// Fails when the client or positions cannot be fetched or the snapshots cannot be
    /// saved. Attribution lookups never fail the snapshot.
    pub async fn snapshot_open_positions(
        &self,
        user_id: &UserId,
        date: NaiveDate,
    ) -> Result<SnapshotResult, SnapshotError> {
        let started = Instant::now();
        let (client, positions) = self.fetch_positions(user_id).await?;

        let mut snapshots = Vec::new();
        for pos in positions.iter().filter(|p| !p.position_amt.is_zero()) {
            let (mode, client_order_id) = attribute_position(client.as_ref(), pos).await;
            snapshots.push(build_snapshot(user_id, date, pos, mode, client_order_id));
        }

        self.finish(user_id, date, snapshots, started).await
    }

    /// Snapshot using caller-supplied client order ids per symbol instead of order lookups.
    ///
    /// # Errors
    /// Same as [`Self::snapshot_open_positions`].
    pub async fn snapshot_with_client_order_ids(
        &self,
        user_id: &UserId,
        date: NaiveDate,
        client_order_ids: &HashMap<Symbol, String>,
    ) -> Result<SnapshotResult, SnapshotError> {
        let started = Instant::now();
        let (_client, positions) = self.fetch_positions(user_id).await?;

        let snapshots = positions
            .iter()
            .filter(|p| !p.position_amt.is_zero())
            .map(|pos| {
                let client_order_id = client_order_ids
                    .get(&pos.symbol)
                    .filter(|id| !id.is_empty())
                    .cloned();
                let mode = client_order_id
                    .as_deref()
                    .map(ModeKey::from_client_order_id)
                    .unwrap_or(ModeKey::Unknown);
                build_snapshot(user_id, date, pos, mode, client_order_id)
            })
            .collect();

        self.finish(user_id, date, snapshots, started).await
    }

    /// Stored snapshots for a date with their per-mode breakdown.
    ///
    /// # Errors
    /// Returns `Summary` if the store cannot be read.
    pub async fn snapshot_summary(
        &self,
        user_id: &UserId,
        date: NaiveDate,
    ) -> Result<SnapshotSummary, SnapshotError> {
        let snapshots = self
            .repo
            .daily_position_snapshots(user_id, date)
            .await
            .map_err(SnapshotError::Summary)?;
        let mode_breakdowns = self
            .repo
            .mode_breakdown_for_date(user_id, date)
            .await
            .map_err(SnapshotError::Summary)?;

        Ok(SnapshotSummary {
            user_id: user_id.clone(),
            snapshot_date: date,
            total_positions: snapshots.len(),
            total_unrealized_pnl: snapshots.iter().map(|s| s.unrealized_pnl).sum(),
            mode_breakdowns,
        })
    }

    async fn fetch_positions(
        &self,
        user_id: &UserId,
    ) -> Result<(Arc<dyn ExchangeClient>, Vec<ExchangePosition>), SnapshotError> {
        if user_id.is_empty() {
            return Err(SnapshotError::EmptyUserId);
        }

        let client = self.clients.client_for_user(user_id).await.map_err(|e| {
            error!(user = %user_id, error = %e, "Failed to get exchange client for snapshot");
            SnapshotError::Client(e)
        })?;

        let positions = client.positions().await.map_err(|e| {
            error!(user = %user_id, error = %e, "Failed to fetch positions for snapshot");
            SnapshotError::Positions(e)
        })?;

        debug!(user = %user_id, count = positions.len(), "Fetched positions");
        Ok((client, positions))
    }

    async fn finish(
        &self,
        user_id: &UserId,
        date: NaiveDate,
        snapshots: Vec<PositionSnapshot>,
        started: Instant,
    ) -> Result<SnapshotResult, SnapshotError> {
        let total_unrealized_pnl: Decimal = snapshots.iter().map(|s| s.unrealized_pnl).sum();

        if snapshots.is_empty() {
            info!(user = %user_id, date = %date, "No open positions to snapshot");
        } else {
            self.repo
                .save_daily_position_snapshots(&snapshots)
                .await
                .map_err(|e| {
                    error!(user = %user_id, error = %e, "Failed to save position snapshots");
                    SnapshotError::Store(e)
                })?;
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            user = %user_id,
            date = %date,
            positions = snapshots.len(),
            total_unrealized_pnl = %total_unrealized_pnl,
            duration_ms,
            "Position snapshot completed"
        );

        Ok(SnapshotResult {
            user_id: user_id.clone(),
            snapshot_date: date,
            position_count: snapshots.len(),
            snapshots,
            total_unrealized_pnl,
            duration_ms,
        })
    }
}

/// Mode of the first order on the same position side whose id decodes, open orders first
/// and then recent history. Lookup failures yield `UNKNOWN`.
async fn attribute_position(
    client: &dyn ExchangeClient,
    pos: &ExchangePosition,
) -> (ModeKey, Option<String>) {
    let open = match client.open_orders(&pos.symbol).await {
        Ok(orders) => orders,
        Err(e) => {
            warn!(symbol = %pos.symbol, error = %e, "Failed to get open orders for attribution");
            return (ModeKey::Unknown, None);
        }
    };
    if let Some(found) = first_known_mode(&open, pos) {
        return found;
    }

    let history = match client.all_orders(&pos.symbol, ORDER_HISTORY_LIMIT).await {
        Ok(orders) => orders,
        Err(e) => {
            warn!(symbol = %pos.symbol, error = %e, "Failed to get order history for attribution");
            return (ModeKey::Unknown, None);
        }
    };
    first_known_mode(&history, pos).unwrap_or((ModeKey::Unknown, None))
}

fn first_known_mode(
    orders: &[crate::exchange::ExchangeOrder],
    pos: &ExchangePosition,
) -> Option<(ModeKey, Option<String>)> {
    orders
        .iter()
        .filter(|o| o.position_side == pos.position_side && !o.client_order_id.is_empty())
        .find_map(|o| match ModeKey::from_client_order_id(&o.client_order_id) {
            ModeKey::Unknown => None,
            mode => Some((mode, Some(o.client_order_id.clone()))),
        })
}

fn build_snapshot(
    user_id: &UserId,
    date: NaiveDate,
    pos: &ExchangePosition,
    mode: ModeKey,
    client_order_id: Option<String>,
) -> PositionSnapshot {
    PositionSnapshot {
        id: uuid::Uuid::new_v4().to_string(),
        user_id: user_id.clone(),
        snapshot_date: date,
        symbol: pos.symbol.clone(),
        position_side: pos.position_side,
        quantity: pos.position_amt.abs(),
        entry_price: pos.entry_price,
        mark_price: pos.mark_price,
        unrealized_pnl: pos.unrealized_profit,
        mode,
        client_order_id,
        leverage: pos.leverage,
        margin_type: pos.margin_type.clone(),
        created_at: TimeMs::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use crate::domain::{PositionSide, Side};
    use crate::exchange::mock::{MockCall, MockClientFactory, MockExchange};
    use crate::exchange::ExchangeOrder;
    use std::str::FromStr;
    use tempfile::TempDir;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 15).unwrap()
    }

    fn position(symbol: &str, side: PositionSide, amt: &str, pnl: &str) -> ExchangePosition {
        ExchangePosition {
            symbol: Symbol::new(symbol),
            position_side: side,
            position_amt: d(amt),
            entry_price: d("100"),
            mark_price: d("105"),
            unrealized_profit: d(pnl),
            leverage: 5,
            margin_type: "isolated".to_string(),
        }
    }

    fn order(id: i64, symbol: &str, side: PositionSide, coid: &str) -> ExchangeOrder {
        ExchangeOrder {
            order_id: id,
            client_order_id: coid.to_string(),
            symbol: Symbol::new(symbol),
            side: Side::Buy,
            position_side: side,
            status: "NEW".to_string(),
            time: TimeMs::new(1_000),
        }
    }

    async fn service(mock: Arc<MockExchange>) -> (TempDir, Arc<Repository>, PositionSnapshotService) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.db").to_string_lossy().to_string();
        let repo = Arc::new(Repository::new(init_db(&path).await.unwrap()));
        let factory = Arc::new(MockClientFactory::new().with_client("u1", mock));
        let svc = PositionSnapshotService::new(repo.clone(), factory);
        (temp_dir, repo, svc)
    }

    #[tokio::test]
    async fn test_snapshot_attributes_modes_and_skips_flat() {
        let mock = Arc::new(
            MockExchange::new()
                .with_position(position("BTCUSDT", PositionSide::Long, "0.5", "25"))
                .with_position(position("ETHUSDT", PositionSide::Short, "-2", "-10"))
                .with_position(position("SOLUSDT", PositionSide::Long, "0", "0"))
                .with_open_order(order(1, "BTCUSDT", PositionSide::Short, "SWI-15JAN-00001-SL"))
                .with_open_order(order(2, "BTCUSDT", PositionSide::Long, "web_manual"))
                .with_open_order(order(3, "BTCUSDT", PositionSide::Long, "SCA-15JAN-00002-TP1"))
                .with_order(order(4, "ETHUSDT", PositionSide::Short, "POS-14JAN-00003-E")),
        );
        let (_dir, repo, svc) = service(mock).await;
        let user = UserId::new("u1");

        let result = svc.snapshot_open_positions(&user, date()).await.unwrap();
        assert_eq!(result.position_count, 2);
        assert_eq!(result.total_unrealized_pnl, d("15"));

        let btc = result.snapshots.iter().find(|s| s.symbol.as_str() == "BTCUSDT").unwrap();
        assert_eq!(btc.mode, ModeKey::Scalp);
        assert_eq!(btc.client_order_id.as_deref(), Some("SCA-15JAN-00002-TP1"));

        let eth = result.snapshots.iter().find(|s| s.symbol.as_str() == "ETHUSDT").unwrap();
        assert_eq!(eth.mode, ModeKey::Position);
        assert_eq!(eth.quantity, d("2"));

        assert_eq!(repo.daily_position_snapshots(&user, date()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_attribution_failure_degrades_to_unknown() {
        let mock = Arc::new(
            MockExchange::new()
                .with_position(position("BTCUSDT", PositionSide::Both, "1", "3"))
                .failing(MockCall::OpenOrders, ExchangeError::RateLimited),
        );
        let (_dir, _repo, svc) = service(mock).await;

        let result = svc.snapshot_open_positions(&UserId::new("u1"), date()).await.unwrap();
        assert_eq!(result.snapshots[0].mode, ModeKey::Unknown);
        assert_eq!(result.snapshots[0].client_order_id, None);
    }

    #[tokio::test]
    async fn test_positions_failure_is_snapshot_error() {
        let mock = Arc::new(MockExchange::new().failing(
            MockCall::Positions,
            ExchangeError::NetworkError("connection reset".to_string()),
        ));
        let (_dir, _repo, svc) = service(mock).await;

        let err = svc.snapshot_open_positions(&UserId::new("u1"), date()).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Positions(_)));
        assert!(err.to_string().contains("snapshot"));
    }

    #[tokio::test]
    async fn test_snapshot_with_supplied_ids_and_summary() {
        let mock = Arc::new(
            MockExchange::new()
                .with_position(position("BTCUSDT", PositionSide::Long, "1", "12.5"))
                .with_position(position("ETHUSDT", PositionSide::Long, "1", "-2.5")),
        );
        let (_dir, _repo, svc) = service(mock.clone()).await;
        let user = UserId::new("u1");

        let mut ids = HashMap::new();
        ids.insert(Symbol::new("BTCUSDT"), "ULT-15JAN-00009-E".to_string());
        let result = svc
            .snapshot_with_client_order_ids(&user, date(), &ids)
            .await
            .unwrap();
        assert_eq!(result.position_count, 2);
        assert_eq!(mock.calls(MockCall::OpenOrders), 0);

        let summary = svc.snapshot_summary(&user, date()).await.unwrap();
        assert_eq!(summary.total_positions, 2);
        assert_eq!(summary.total_unrealized_pnl, d("10"));
        let modes: Vec<ModeKey> = summary.mode_breakdowns.iter().map(|b| b.mode).collect();
        assert_eq!(modes, vec![ModeKey::UltraFast, ModeKey::Unknown]);
    }

    #[tokio::test]
    async fn test_unknown_user_has_no_client() {
        let (_dir, _repo, svc) = service(Arc::new(MockExchange::new())).await;
        let err = svc.snapshot_open_positions(&UserId::new("nobody"), date()).await.unwrap_err();
        assert!(matches!(err, SnapshotError::Client(_)));
    }
}
