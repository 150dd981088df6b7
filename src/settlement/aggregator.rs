//! Realized P&L per trading mode over one local trading day.
//!
//! The exchange knows nothing about modes, so each trade is attributed through the client
//! order id of the order that produced it.

use super::{DailyPnlAggregation, ModeKey, ModePnl};
use crate::domain::{Decimal, Symbol, TimeMs, UserId};
use crate::exchange::{ClientFactory, ExchangeClient, ExchangeError, ExchangeTrade, INCOME_REALIZED_PNL};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const TRADE_LIMIT: usize = 1000;
const ORDER_LIMIT: usize = 500;
const INCOME_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("failed to aggregate trades: user id cannot be empty")]
    EmptyUserId,
    #[error("failed to aggregate trades: no exchange client: {0}")]
    Client(#[source] ExchangeError),
}

pub struct PnlAggregator {
    clients: Arc<dyn ClientFactory>,
}

impl PnlAggregator {
    pub fn new(clients: Arc<dyn ClientFactory>) -> Self {
        Self { clients }
    }

    /// Aggregate trades in `[day_start, day_end]` by mode. The result always holds `ALL`.
    ///
    /// Trade and order lookups degrade rather than fail: a failed all-symbol trade query
    /// falls back to per-symbol discovery, and missing order history leaves trades `UNKNOWN`.
    ///
    /// # Errors
    /// Fails only on an empty user id or when no exchange client is available.
    pub async fn aggregate_by_mode(
        &self,
        user_id: &UserId,
        day_start: TimeMs,
        day_end: TimeMs,
    ) -> Result<DailyPnlAggregation, AggregationError> {
        let started = Instant::now();
        if user_id.is_empty() {
            return Err(AggregationError::EmptyUserId);
        }

        let client = self.clients.client_for_user(user_id).await.map_err(|e| {
            error!(user = %user_id, error = %e, "Failed to get exchange client for aggregation");
            AggregationError::Client(e)
        })?;

        let trades = match client
            .trades_by_date_range(&Symbol::new(""), day_start, day_end, TRADE_LIMIT)
            .await
        {
            Ok(trades) => trades,
            Err(e) => {
                debug!(user = %user_id, error = %e, "All-symbol trade query failed, discovering symbols");
                fetch_trades_per_symbol(client.as_ref(), day_start, day_end).await
            }
        };
        debug!(user = %user_id, count = trades.len(), "Fetched trades");

        let order_ids = if trades.is_empty() {
            HashMap::new()
        } else {
            order_client_ids(client.as_ref(), &trades, day_start, day_end).await
        };

        let mode_results = aggregate_trades(&trades, &order_ids);
        let (total_pnl, total_trades) = mode_results
            .get(&ModeKey::All)
            .map(|all| (all.realized_pnl, all.trade_count))
            .unwrap_or_default();

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            user = %user_id,
            trades = total_trades,
            modes = mode_results.len() - 1,
            total_pnl = %total_pnl,
            duration_ms,
            "P&L aggregation completed"
        );

        Ok(DailyPnlAggregation {
            user_id: user_id.clone(),
            day_start,
            day_end,
            mode_results,
            total_pnl,
            total_trades,
            duration_ms,
        })
    }
}

/// Symbols with realized P&L income in the window plus symbols with open positions,
/// then trades per symbol deduplicated by trade id. Per-symbol failures are skipped.
async fn fetch_trades_per_symbol(
    client: &dyn ExchangeClient,
    from: TimeMs,
    to: TimeMs,
) -> Vec<ExchangeTrade> {
    let mut symbols = BTreeSet::new();

    match client
        .income_history(INCOME_REALIZED_PNL, from, to, INCOME_LIMIT)
        .await
    {
        Ok(records) => symbols.extend(
            records
                .into_iter()
                .filter(|r| !r.symbol.is_empty())
                .map(|r| r.symbol),
        ),
        Err(e) => warn!(error = %e, "Failed to get income history for symbol discovery"),
    }

    match client.positions().await {
        Ok(positions) => symbols.extend(
            positions
                .into_iter()
                .filter(|p| !p.position_amt.is_zero())
                .map(|p| p.symbol),
        ),
        Err(e) => warn!(error = %e, "Failed to get positions for symbol discovery"),
    }

    if symbols.is_empty() {
        debug!("No symbols discovered for trade window");
        return Vec::new();
    }

    let mut trades = Vec::new();
    for symbol in &symbols {
        match client.trades_by_date_range(symbol, from, to, TRADE_LIMIT).await {
            Ok(batch) => trades.extend(batch),
            Err(e) => warn!(symbol = %symbol, error = %e, "Failed to get trades, skipping symbol"),
        }
    }

    let trades = dedupe_trades(trades);
    debug!(trades = trades.len(), symbols = symbols.len(), "Fetched trades per symbol");
    trades
}

fn dedupe_trades(trades: Vec<ExchangeTrade>) -> Vec<ExchangeTrade> {
    let mut seen = HashSet::new();
    trades.into_iter().filter(|t| seen.insert(t.id)).collect()
}

/// `order_id -> client_order_id` from order history of every traded symbol.
async fn order_client_ids(
    client: &dyn ExchangeClient,
    trades: &[ExchangeTrade],
    from: TimeMs,
    to: TimeMs,
) -> HashMap<i64, String> {
    let symbols: BTreeSet<&Symbol> = trades.iter().map(|t| &t.symbol).collect();

    let mut ids = HashMap::new();
    for symbol in symbols {
        match client.orders_by_date_range(symbol, from, to, ORDER_LIMIT).await {
            Ok(orders) => ids.extend(
                orders
                    .into_iter()
                    .filter(|o| !o.client_order_id.is_empty())
                    .map(|o| (o.order_id, o.client_order_id)),
            ),
            Err(e) => warn!(symbol = %symbol, error = %e, "Failed to get orders for attribution"),
        }
    }
    debug!(entries = ids.len(), "Built order to client id map");
    ids
}

/// Group trades by the mode of their order and add the `ALL` roll-up.
pub fn aggregate_trades(
    trades: &[ExchangeTrade],
    order_client_ids: &HashMap<i64, String>,
) -> BTreeMap<ModeKey, ModePnl> {
    let mut modes: BTreeMap<ModeKey, ModePnl> = BTreeMap::new();

    for trade in trades {
        let mode = order_client_ids
            .get(&trade.order_id)
            .map(|id| ModeKey::from_client_order_id(id))
            .unwrap_or(ModeKey::Unknown);
        let pnl = modes.entry(mode).or_insert_with(|| ModePnl::empty(mode));

        pnl.trade_count += 1;
        pnl.realized_pnl += trade.realized_pnl;
        pnl.total_volume += trade.quote_qty;

        if trade.realized_pnl.is_positive() {
            pnl.win_count += 1;
            pnl.largest_win = pnl.largest_win.max(trade.realized_pnl);
        } else if trade.realized_pnl.is_negative() {
            pnl.loss_count += 1;
            pnl.largest_loss = pnl.largest_loss.min(trade.realized_pnl);
        }
    }

    for pnl in modes.values_mut() {
        derive_rates(pnl);
    }

    let mut all = ModePnl::empty(ModeKey::All);
    for pnl in modes.values() {
        all.trade_count += pnl.trade_count;
        all.realized_pnl += pnl.realized_pnl;
        all.win_count += pnl.win_count;
        all.loss_count += pnl.loss_count;
        all.total_volume += pnl.total_volume;
        all.largest_win = all.largest_win.max(pnl.largest_win);
        all.largest_loss = all.largest_loss.min(pnl.largest_loss);
    }
    derive_rates(&mut all);
    modes.insert(ModeKey::All, all);

    modes
}

fn derive_rates(pnl: &mut ModePnl) {
    if pnl.trade_count > 0 {
        let count = Decimal::from_i64(pnl.trade_count);
        pnl.win_rate = Decimal::percent_of(Decimal::from_i64(pnl.win_count), count);
        pnl.avg_trade_size = pnl.total_volume / count;
    }
}
