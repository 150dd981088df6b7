//! Mock exchange for testing without network calls.

use super::{
    AccountInfo, ClientFactory, ExchangeClient, ExchangeError, ExchangeOrder, ExchangePosition,
    ExchangeTrade, IncomeRecord,
};
use crate::domain::{Symbol, TimeMs, UserId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Call sites that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockCall {
    Positions,
    OpenOrders,
    AllOrders,
    OrdersByDateRange,
    /// `trades_by_date_range` with an empty symbol.
    TradesAllSymbols,
    /// `trades_by_date_range` for a specific symbol.
    Trades,
    IncomeHistory,
    AccountInfo,
}

#[derive(Debug, Clone)]
struct Failure {
    /// `None` fails forever.
    remaining: Option<usize>,
    error: ExchangeError,
}

#[derive(Debug, Default)]
struct MockState {
    positions: Vec<ExchangePosition>,
    open_orders: Vec<ExchangeOrder>,
    orders: Vec<ExchangeOrder>,
    trades: Vec<ExchangeTrade>,
    income: Vec<IncomeRecord>,
    account: AccountInfo,
    failures: HashMap<MockCall, Failure>,
    failing_trade_symbols: HashSet<Symbol>,
    calls: HashMap<MockCall, usize>,
}

/// Mock exchange returning predefined data, with per-call failure injection.
#[derive(Debug, Default)]
pub struct MockExchange {
    state: Mutex<MockState>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_position(self, position: ExchangePosition) -> Self {
        self.state().positions.push(position);
        self
    }

    /// Add an order that is both open and part of the order history.
    pub fn with_open_order(self, order: ExchangeOrder) -> Self {
        {
            let mut state = self.state();
            state.open_orders.push(order.clone());
            state.orders.push(order);
        }
        self
    }

    /// Add a historical (non-open) order.
    pub fn with_order(self, order: ExchangeOrder) -> Self {
        self.state().orders.push(order);
        self
    }

    pub fn with_trade(self, trade: ExchangeTrade) -> Self {
        self.state().trades.push(trade);
        self
    }

    pub fn with_trades(self, trades: Vec<ExchangeTrade>) -> Self {
        self.state().trades.extend(trades);
        self
    }

    pub fn with_income(self, record: IncomeRecord) -> Self {
        self.state().income.push(record);
        self
    }

    pub fn with_account_info(self, account: AccountInfo) -> Self {
        self.state().account = account;
        self
    }

    /// Make every call of `call` fail with `error`.
    pub fn failing(self, call: MockCall, error: ExchangeError) -> Self {
        self.set_failure(call, None, error);
        self
    }

    /// Make the next `times` calls of `call` fail, then succeed.
    pub fn failing_times(self, call: MockCall, times: usize, error: ExchangeError) -> Self {
        self.set_failure(call, Some(times), error);
        self
    }

    /// Make per-symbol trade lookups for `symbol` fail.
    pub fn failing_trades_for(self, symbol: &str) -> Self {
        self.state().failing_trade_symbols.insert(Symbol::new(symbol));
        self
    }

    pub fn set_failure(&self, call: MockCall, remaining: Option<usize>, error: ExchangeError) {
        self.state()
            .failures
            .insert(call, Failure { remaining, error });
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    pub fn set_positions(&self, positions: Vec<ExchangePosition>) {
        self.state().positions = positions;
    }

    pub fn set_account_info(&self, account: AccountInfo) {
        self.state().account = account;
    }

    /// Number of times `call` has been invoked.
    pub fn calls(&self, call: MockCall) -> usize {
        self.state().calls.get(&call).copied().unwrap_or(0)
    }

    fn enter(&self, call: MockCall) -> Result<MutexGuard<'_, MockState>, ExchangeError> {
        let mut state = self.state();
        *state.calls.entry(call).or_insert(0) += 1;

        let mut exhausted = false;
        if let Some(failure) = state.failures.get_mut(&call) {
            match failure.remaining.as_mut() {
                None => return Err(failure.error.clone()),
                Some(0) => exhausted = true,
                Some(n) => {
                    *n -= 1;
                    return Err(failure.error.clone());
                }
            }
        }
        if exhausted {
            state.failures.remove(&call);
        }
        Ok(state)
    }
}

fn in_range(time: TimeMs, from: TimeMs, to: TimeMs) -> bool {
    time >= from && time <= to
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let state = self.enter(MockCall::Positions)?;
        Ok(state.positions.clone())
    }

    async fn open_orders(&self, symbol: &Symbol) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let state = self.enter(MockCall::OpenOrders)?;
        Ok(state
            .open_orders
            .iter()
            .filter(|o| &o.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn all_orders(
        &self,
        symbol: &Symbol,
        limit: usize,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let state = self.enter(MockCall::AllOrders)?;
        let matching: Vec<ExchangeOrder> = state
            .orders
            .iter()
            .filter(|o| &o.symbol == symbol)
            .cloned()
            .collect();
        let skip = matching.len().saturating_sub(limit);
        Ok(matching.into_iter().skip(skip).collect())
    }

    async fn orders_by_date_range(
        &self,
        symbol: &Symbol,
        from: TimeMs,
        to: TimeMs,
        limit: usize,
    ) -> Result<Vec<ExchangeOrder>, ExchangeError> {
        let state = self.enter(MockCall::OrdersByDateRange)?;
        Ok(state
            .orders
            .iter()
            .filter(|o| &o.symbol == symbol && in_range(o.time, from, to))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn trades_by_date_range(
        &self,
        symbol: &Symbol,
        from: TimeMs,
        to: TimeMs,
        limit: usize,
    ) -> Result<Vec<ExchangeTrade>, ExchangeError> {
        let call = if symbol.is_empty() {
            MockCall::TradesAllSymbols
        } else {
            MockCall::Trades
        };
        let state = self.enter(call)?;
        if state.failing_trade_symbols.contains(symbol) {
            return Err(ExchangeError::HttpError {
                status: 400,
                message: format!("Invalid symbol {}", symbol),
            });
        }
        Ok(state
            .trades
            .iter()
            .filter(|t| (symbol.is_empty() || &t.symbol == symbol) && in_range(t.time, from, to))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn income_history(
        &self,
        income_type: &str,
        from: TimeMs,
        to: TimeMs,
        limit: usize,
    ) -> Result<Vec<IncomeRecord>, ExchangeError> {
        let state = self.enter(MockCall::IncomeHistory)?;
        Ok(state
            .income
            .iter()
            .filter(|r| r.income_type == income_type && in_range(r.time, from, to))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn account_info(&self) -> Result<AccountInfo, ExchangeError> {
        let state = self.enter(MockCall::AccountInfo)?;
        Ok(state.account.clone())
    }
}

/// Factory handing out mock exchanges per user.
#[derive(Debug, Default)]
pub struct MockClientFactory {
    clients: HashMap<UserId, Arc<MockExchange>>,
    default_client: Option<Arc<MockExchange>>,
}

impl MockClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(mut self, user_id: &str, client: Arc<MockExchange>) -> Self {
        self.clients.insert(UserId::new(user_id), client);
        self
    }

    /// Client returned for users without a dedicated one.
    pub fn with_default(mut self, client: Arc<MockExchange>) -> Self {
        self.default_client = Some(client);
        self
    }
}

#[async_trait]
impl ClientFactory for MockClientFactory {
    async fn client_for_user(
        &self,
        user_id: &UserId,
    ) -> Result<Arc<dyn ExchangeClient>, ExchangeError> {
        self.clients
            .get(user_id)
            .or(self.default_client.as_ref())
            .map(|c| c.clone() as Arc<dyn ExchangeClient>)
            .ok_or_else(|| ExchangeError::NotConfigured(user_id.to_string()))
    }
}
