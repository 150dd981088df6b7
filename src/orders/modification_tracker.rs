//! Append-only audit log of price changes on the legs of an order chain.
//!
//! Every placement, modification, cancellation and fill of a leg becomes one
//! [`ModificationEvent`] carrying a version that is strictly increasing per
//! (user, chain, leg). Chain ids come from per-user daily sequences, so two users can hold
//! the same chain id on the same day; the user is always part of the key.
//! Versions are allocated, persisted and cached under a single lock acquisition so that
//! concurrent writers for the same leg can never reuse a number.

use super::types::LegType;
use crate::domain::{Decimal, Side, TimeMs, UserId};
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
pub enum ModificationEventType {
    Placed,
    Modified,
    Cancelled,
    Filled,
}

impl ModificationEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModificationEventType::Placed => "PLACED",
            ModificationEventType::Modified => "MODIFIED",
            ModificationEventType::Cancelled => "CANCELLED",
            ModificationEventType::Filled => "FILLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PLACED" => Some(ModificationEventType::Placed),
            "MODIFIED" => Some(ModificationEventType::Modified),
            "CANCELLED" => Some(ModificationEventType::Cancelled),
            "FILLED" => Some(ModificationEventType::Filled),
            _ => None,
        }
    }
}

/// Who asked for the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModificationSource {
    LlmAuto,
    UserManual,
    TrailingStop,
}

impl ModificationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModificationSource::LlmAuto => "LLM_AUTO",
            ModificationSource::UserManual => "USER_MANUAL",
            ModificationSource::TrailingStop => "TRAILING_STOP",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LLM_AUTO" => Some(ModificationSource::LlmAuto),
            "USER_MANUAL" => Some(ModificationSource::UserManual),
            "TRAILING_STOP" => Some(ModificationSource::TrailingStop),
            _ => None,
        }
    }
}

impl fmt::Display for ModificationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Effect of a price change from the trader's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImpactDirection {
    /// Target moved to a more profitable level.
    Better,
    /// Target moved to a less profitable level.
    Worse,
    /// Stop moved toward the market.
    Tighter,
    /// Stop moved away from the market.
    Wider,
    /// No prior price to compare against.
    Initial,
}

impl ImpactDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImpactDirection::Better => "BETTER",
            ImpactDirection::Worse => "WORSE",
            ImpactDirection::Tighter => "TIGHTER",
            ImpactDirection::Wider => "WIDER",
            ImpactDirection::Initial => "INITIAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BETTER" => Some(ImpactDirection::Better),
            "WORSE" => Some(ImpactDirection::Worse),
            "TIGHTER" => Some(ImpactDirection::Tighter),
            "WIDER" => Some(ImpactDirection::Wider),
            "INITIAL" => Some(ImpactDirection::Initial),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationEvent {
    /// Store-assigned row id; `None` until persisted.
    pub id: Option<i64>,
    pub user_id: UserId,
    pub chain_id: String,
    pub leg_type: LegType,
    pub exchange_order_id: Option<i64>,
    pub event_type: ModificationEventType,
    /// Absent for fills, which are driven by the market.
    pub source: Option<ModificationSource>,
    pub version: i64,
    pub old_price: Option<Decimal>,
    pub new_price: Decimal,
    pub price_delta: Option<Decimal>,
    pub price_delta_percent: Option<Decimal>,
    pub position_quantity: Decimal,
    pub position_entry_price: Decimal,
    pub dollar_impact: Decimal,
    pub impact_direction: ImpactDirection,
    pub reason: String,
    pub decision_id: Option<String>,
    pub confidence: Option<f64>,
    pub market_context: Option<serde_json::Value>,
    pub created_at: TimeMs,
}

#[derive(Debug, Clone)]
pub struct PlaceOrderEvent {
    pub user_id: UserId,
    pub chain_id: String,
    pub leg_type: LegType,
    pub exchange_order_id: Option<i64>,
    pub price: Decimal,
    pub position_qty: Decimal,
    pub entry_price: Decimal,
    /// Side of the position the leg protects or exits.
    pub side: Side,
    pub source: ModificationSource,
    pub reason: String,
    pub decision_id: Option<String>,
    pub confidence: Option<f64>,
    pub market_context: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ModifyOrderEvent {
    pub user_id: UserId,
    pub chain_id: String,
    pub leg_type: LegType,
    pub exchange_order_id: Option<i64>,
    pub old_price: Decimal,
    pub new_price: Decimal,
    pub position_qty: Decimal,
    pub entry_price: Decimal,
    pub side: Side,
    pub source: ModificationSource,
    pub reason: String,
    pub decision_id: Option<String>,
    pub confidence: Option<f64>,
    pub market_context: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct CancelOrderEvent {
    pub user_id: UserId,
    pub chain_id: String,
    pub leg_type: LegType,
    pub exchange_order_id: Option<i64>,
    pub last_price: Decimal,
    pub position_qty: Decimal,
    pub entry_price: Decimal,
    pub side: Side,
    pub source: ModificationSource,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct FillOrderEvent {
    pub user_id: UserId,
    pub chain_id: String,
    pub leg_type: LegType,
    pub exchange_order_id: Option<i64>,
    pub fill_price: Decimal,
    pub position_qty: Decimal,
    pub entry_price: Decimal,
    pub side: Side,
}

/// Roll-up of one leg's event history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModificationSummary {
    /// Events after the initial placement.
    pub total_modifications: usize,
    pub net_price_change: Decimal,
    pub net_dollar_impact: Decimal,
    pub initial_price: Decimal,
    pub current_price: Decimal,
    pub last_modified_at: TimeMs,
}

/// Durable storage for modification events.
#[async_trait]
pub trait ModificationStore: Send + Sync {
    /// Insert one event and return its row id.
    async fn create_event(&self, event: &ModificationEvent) -> Result<i64, sqlx::Error>;

    /// All events for one user's leg, oldest version first.
    async fn events(
        &self,
        user_id: &UserId,
        chain_id: &str,
        leg_type: LegType,
    ) -> Result<Vec<ModificationEvent>, sqlx::Error>;

    /// Highest stored version for one user's leg, 0 if none.
    async fn latest_version(
        &self,
        user_id: &UserId,
        chain_id: &str,
        leg_type: LegType,
    ) -> Result<i64, sqlx::Error>;

    async fn events_by_user(
        &self,
        user_id: &UserId,
        limit: i64,
    ) -> Result<Vec<ModificationEvent>, sqlx::Error>;

    async fn events_by_source(
        &self,
        user_id: &UserId,
        source: ModificationSource,
        limit: i64,
    ) -> Result<Vec<ModificationEvent>, sqlx::Error>;
}

#[derive(Debug, Error)]
pub enum ModificationError {
    #[error("failed to create {kind} event: {source}")]
    Store {
        kind: &'static str,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to load modification history: {0}")]
    History(#[source] sqlx::Error),
}

fn version_key(user_id: &UserId, chain_id: &str, leg_type: LegType) -> String {
    format!("{}:{}:{}", user_id, chain_id, leg_type.code())
}

pub struct ModificationTracker {
    store: Option<Arc<dyn ModificationStore>>,
    latest_versions: Mutex<HashMap<String, i64>>,
}

impl ModificationTracker {
    /// Without a store the tracker only hands out versions from its cache.
    pub fn new(store: Option<Arc<dyn ModificationStore>>) -> Self {
        Self {
            store,
            latest_versions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn on_placed(
        &self,
        req: PlaceOrderEvent,
    ) -> Result<ModificationEvent, ModificationError> {
        let dollar_impact = initial_impact(req.entry_price, req.price, req.position_qty);
        let event = ModificationEvent {
            id: None,
            user_id: req.user_id,
            chain_id: req.chain_id,
            leg_type: req.leg_type,
            exchange_order_id: req.exchange_order_id,
            event_type: ModificationEventType::Placed,
            source: Some(req.source),
            version: 0,
            old_price: None,
            new_price: req.price,
            price_delta: None,
            price_delta_percent: None,
            position_quantity: req.position_qty,
            position_entry_price: req.entry_price,
            dollar_impact,
            impact_direction: ImpactDirection::Initial,
            reason: req.reason,
            decision_id: req.decision_id,
            confidence: req.confidence,
            market_context: req.market_context,
            created_at: TimeMs::now(),
        };
        let event = self.record(event).await?;
        info!(
            chain = %event.chain_id,
            leg = %event.leg_type,
            source = %req.source,
            price = %event.new_price,
            dollar_impact = %event.dollar_impact,
            "Order placed event logged"
        );
        Ok(event)
    }

    pub async fn on_modified(
        &self,
        req: ModifyOrderEvent,
    ) -> Result<ModificationEvent, ModificationError> {
        let price_delta = req.new_price - req.old_price;
        let price_delta_percent = if req.old_price.is_zero() {
            Decimal::zero()
        } else {
            price_delta / req.old_price * Decimal::hundred()
        };
        let dollar_impact =
            modification_impact(req.entry_price, req.old_price, req.new_price, req.position_qty);
        let direction = impact_direction(req.leg_type, price_delta, req.side);

        let event = ModificationEvent {
            id: None,
            user_id: req.user_id,
            chain_id: req.chain_id,
            leg_type: req.leg_type,
            exchange_order_id: req.exchange_order_id,
            event_type: ModificationEventType::Modified,
            source: Some(req.source),
            version: 0,
            old_price: Some(req.old_price),
            new_price: req.new_price,
            price_delta: Some(price_delta),
            price_delta_percent: Some(price_delta_percent),
            position_quantity: req.position_qty,
            position_entry_price: req.entry_price,
            dollar_impact,
            impact_direction: direction,
            reason: req.reason,
            decision_id: req.decision_id,
            confidence: req.confidence,
            market_context: req.market_context,
            created_at: TimeMs::now(),
        };
        let event = self.record(event).await?;
        info!(
            chain = %event.chain_id,
            leg = %event.leg_type,
            source = %req.source,
            version = event.version,
            old_price = %req.old_price,
            new_price = %event.new_price,
            price_delta = %price_delta,
            dollar_impact = %event.dollar_impact,
            direction = direction.as_str(),
            "Order modified event logged"
        );
        Ok(event)
    }

    pub async fn on_cancelled(
        &self,
        req: CancelOrderEvent,
    ) -> Result<ModificationEvent, ModificationError> {
        let event = ModificationEvent {
            id: None,
            user_id: req.user_id,
            chain_id: req.chain_id,
            leg_type: req.leg_type,
            exchange_order_id: req.exchange_order_id,
            event_type: ModificationEventType::Cancelled,
            source: Some(req.source),
            version: 0,
            old_price: None,
            new_price: req.last_price,
            price_delta: None,
            price_delta_percent: None,
            position_quantity: req.position_qty,
            position_entry_price: req.entry_price,
            dollar_impact: Decimal::zero(),
            impact_direction: ImpactDirection::Initial,
            reason: req.reason,
            decision_id: None,
            confidence: None,
            market_context: None,
            created_at: TimeMs::now(),
        };
        let event = self.record(event).await?;
        info!(
            chain = %event.chain_id,
            leg = %event.leg_type,
            reason = %event.reason,
            "Order cancelled event logged"
        );
        Ok(event)
    }

    pub async fn on_filled(
        &self,
        req: FillOrderEvent,
    ) -> Result<ModificationEvent, ModificationError> {
        let dollar_impact =
            realized_impact(req.entry_price, req.fill_price, req.position_qty, req.side);
        let event = ModificationEvent {
            id: None,
            user_id: req.user_id,
            chain_id: req.chain_id,
            leg_type: req.leg_type,
            exchange_order_id: req.exchange_order_id,
            event_type: ModificationEventType::Filled,
            source: None,
            version: 0,
            old_price: None,
            new_price: req.fill_price,
            price_delta: None,
            price_delta_percent: None,
            position_quantity: req.position_qty,
            position_entry_price: req.entry_price,
            dollar_impact,
            impact_direction: ImpactDirection::Initial,
            reason: "Order filled at market".to_string(),
            decision_id: None,
            confidence: None,
            market_context: None,
            created_at: TimeMs::now(),
        };
        let event = self.record(event).await?;
        info!(
            chain = %event.chain_id,
            leg = %event.leg_type,
            fill_price = %event.new_price,
            dollar_impact = %event.dollar_impact,
            "Order filled event logged"
        );
        Ok(event)
    }

    /// Assign the next version, persist, then cache. The lock is held throughout.
    async fn record(
        &self,
        mut event: ModificationEvent,
    ) -> Result<ModificationEvent, ModificationError> {
        let key = version_key(&event.user_id, &event.chain_id, event.leg_type);
        let mut versions = self.latest_versions.lock().await;

        event.version = match versions.get(&key) {
            Some(v) => v + 1,
            None => {
                self.stored_version(&event.user_id, &event.chain_id, event.leg_type)
                    .await
                    + 1
            }
        };

        if let Some(store) = &self.store {
            match store.create_event(&event).await {
                Ok(id) => event.id = Some(id),
                Err(e) => {
                    error!(
                        chain = %event.chain_id,
                        leg = %event.leg_type,
                        error = %e,
                        "Failed to create modification event"
                    );
                    return Err(ModificationError::Store {
                        kind: event_kind(event.event_type),
                        source: e,
                    });
                }
            }
        }

        versions.insert(key, event.version);
        Ok(event)
    }

    async fn stored_version(&self, user_id: &UserId, chain_id: &str, leg_type: LegType) -> i64 {
        let Some(store) = &self.store else {
            return 0;
        };
        match store.latest_version(user_id, chain_id, leg_type).await {
            Ok(v) if v > 0 => v,
            Ok(_) => 0,
            Err(e) => {
                warn!(
                    user = %user_id,
                    chain = %chain_id,
                    leg = %leg_type,
                    error = %e,
                    "Failed to read latest version"
                );
                0
            }
        }
    }

    /// Event history for one user's leg. Empty without a store.
    pub async fn history(
        &self,
        user_id: &UserId,
        chain_id: &str,
        leg_type: LegType,
    ) -> Result<Vec<ModificationEvent>, ModificationError> {
        match &self.store {
            Some(store) => store
                .events(user_id, chain_id, leg_type)
                .await
                .map_err(ModificationError::History),
            None => Ok(Vec::new()),
        }
    }

    pub async fn events_by_user(
        &self,
        user_id: &UserId,
        limit: i64,
    ) -> Result<Vec<ModificationEvent>, ModificationError> {
        match &self.store {
            Some(store) => store
                .events_by_user(user_id, limit)
                .await
                .map_err(ModificationError::History),
            None => Ok(Vec::new()),
        }
    }

    pub async fn events_by_source(
        &self,
        user_id: &UserId,
        source: ModificationSource,
        limit: i64,
    ) -> Result<Vec<ModificationEvent>, ModificationError> {
        match &self.store {
            Some(store) => store
                .events_by_source(user_id, source, limit)
                .await
                .map_err(ModificationError::History),
            None => Ok(Vec::new()),
        }
    }

    /// Drop cached versions; the next event per leg re-reads the store.
    pub async fn clear_version_cache(&self) {
        self.latest_versions.lock().await.clear();
    }
}

fn event_kind(event_type: ModificationEventType) -> &'static str {
    match event_type {
        ModificationEventType::Placed | ModificationEventType::Modified => "modification",
        ModificationEventType::Cancelled => "cancellation",
        ModificationEventType::Filled => "fill",
    }
}

/// Summarize a leg's history. `None` for an empty history.
pub fn summarize(events: &[ModificationEvent]) -> Option<ModificationSummary> {
    let (first, last) = (events.first()?, events.last()?);
    let rest = &events[1..];
    Some(ModificationSummary {
        total_modifications: rest.len(),
        net_price_change: rest.iter().filter_map(|e| e.price_delta).sum(),
        net_dollar_impact: rest.iter().map(|e| e.dollar_impact).sum(),
        initial_price: first.new_price,
        current_price: last.new_price,
        last_modified_at: last.created_at,
    })
}

/// Distance of the order from entry, in quote currency.
pub fn initial_impact(entry_price: Decimal, order_price: Decimal, quantity: Decimal) -> Decimal {
    (order_price - entry_price).abs() * quantity
}

/// Change in distance from entry, in quote currency. Positive means the leg moved away.
pub fn modification_impact(
    entry_price: Decimal,
    old_price: Decimal,
    new_price: Decimal,
    quantity: Decimal,
) -> Decimal {
    (new_price - entry_price).abs() * quantity - (old_price - entry_price).abs() * quantity
}

pub fn realized_impact(
    entry_price: Decimal,
    fill_price: Decimal,
    quantity: Decimal,
    side: Side,
) -> Decimal {
    if side.is_long() {
        (fill_price - entry_price) * quantity
    } else {
        (entry_price - fill_price) * quantity
    }
}

pub fn impact_direction(leg_type: LegType, price_delta: Decimal, side: Side) -> ImpactDirection {
    let favorable = if side.is_long() {
        price_delta.is_positive()
    } else {
        price_delta.is_negative()
    };
    match (leg_type.is_stop_loss(), favorable) {
        (true, true) => ImpactDirection::Tighter,
        (true, false) => ImpactDirection::Wider,
        (false, true) => ImpactDirection::Better,
        (false, false) => ImpactDirection::Worse,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        Decimal::from_str_canonical(s).unwrap()
    }

    fn modify(leg: LegType, old: &str, new: &str, side: Side) -> ModifyOrderEvent {
        ModifyOrderEvent {
            user_id: UserId::new("u1"),
            chain_id: "SWI-10FEB-00007".to_string(),
            leg_type: leg,
            exchange_order_id: Some(42),
            old_price: d(old),
            new_price: d(new),
            position_qty: d("2"),
            entry_price: d("100"),
            side,
            source: ModificationSource::TrailingStop,
            reason: "trail".to_string(),
            decision_id: None,
            confidence: None,
            market_context: None,
        }
    }

    fn place(leg: LegType, price: &str) -> PlaceOrderEvent {
        PlaceOrderEvent {
            user_id: UserId::new("u1"),
            chain_id: "SWI-10FEB-00007".to_string(),
            leg_type: leg,
            exchange_order_id: None,
            price: d(price),
            position_qty: d("2"),
            entry_price: d("100"),
            side: Side::Buy,
            source: ModificationSource::LlmAuto,
            reason: "initial".to_string(),
            decision_id: Some("dec-1".to_string()),
            confidence: Some(0.9),
            market_context: None,
        }
    }

    #[test]
    fn test_impact_direction_rules() {
        use ImpactDirection::*;
        assert_eq!(impact_direction(LegType::StopLoss, d("1"), Side::Buy), Tighter);
        assert_eq!(impact_direction(LegType::StopLoss, d("-1"), Side::Buy), Wider);
        assert_eq!(impact_direction(LegType::HedgeStopLoss, d("-1"), Side::Sell), Tighter);
        assert_eq!(impact_direction(LegType::StopLoss, d("1"), Side::Sell), Wider);
        assert_eq!(impact_direction(LegType::TakeProfit1, d("1"), Side::Buy), Better);
        assert_eq!(impact_direction(LegType::TakeProfit2, d("-1"), Side::Buy), Worse);
        assert_eq!(impact_direction(LegType::TakeProfit3, d("-1"), Side::Sell), Better);
        assert_eq!(impact_direction(LegType::Dca1, d("0"), Side::Sell), Worse);
    }

    #[test]
    fn test_impact_formulas() {
        assert_eq!(initial_impact(d("100"), d("95"), d("2")), d("10"));
        assert_eq!(modification_impact(d("100"), d("95"), d("97"), d("2")), d("-4"));
        assert_eq!(realized_impact(d("100"), d("110"), d("2"), Side::Buy), d("20"));
        assert_eq!(realized_impact(d("100"), d("110"), d("2"), Side::Sell), d("-20"));
    }

    #[tokio::test]
    async fn test_versions_increase_for_every_event_kind() {
        let tracker = ModificationTracker::new(None);
        let placed = tracker.on_placed(place(LegType::StopLoss, "95")).await.unwrap();
        assert_eq!(placed.version, 1);
        assert_eq!(placed.impact_direction, ImpactDirection::Initial);
        assert_eq!(placed.dollar_impact, d("10"));

        let modified = tracker
            .on_modified(modify(LegType::StopLoss, "95", "97", Side::Buy))
            .await
            .unwrap();
        assert_eq!(modified.version, 2);
        assert_eq!(modified.impact_direction, ImpactDirection::Tighter);
        assert_eq!(modified.price_delta, Some(d("2")));

        let cancelled = tracker
            .on_cancelled(CancelOrderEvent {
                user_id: UserId::new("u1"),
                chain_id: "SWI-10FEB-00007".to_string(),
                leg_type: LegType::StopLoss,
                exchange_order_id: None,
                last_price: d("97"),
                position_qty: d("2"),
                entry_price: d("100"),
                side: Side::Buy,
                source: ModificationSource::UserManual,
                reason: "manual close".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(cancelled.version, 3);
        assert!(cancelled.dollar_impact.is_zero());

        let filled = tracker
            .on_filled(FillOrderEvent {
                user_id: UserId::new("u1"),
                chain_id: "SWI-10FEB-00007".to_string(),
                leg_type: LegType::StopLoss,
                exchange_order_id: None,
                fill_price: d("97"),
                position_qty: d("2"),
                entry_price: d("100"),
                side: Side::Buy,
            })
            .await
            .unwrap();
        assert_eq!(filled.version, 4);
        assert_eq!(filled.source, None);
        assert_eq!(filled.dollar_impact, d("-6"));

        let other_leg = tracker.on_placed(place(LegType::TakeProfit1, "120")).await.unwrap();
        assert_eq!(other_leg.version, 1);
    }

    #[tokio::test]
    async fn test_versions_are_per_user() {
        let tracker = ModificationTracker::new(None);
        let first = tracker.on_placed(place(LegType::StopLoss, "95")).await.unwrap();

        let mut other = place(LegType::StopLoss, "96");
        other.user_id = UserId::new("u2");
        let second = tracker.on_placed(other).await.unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 1);
    }

    #[tokio::test]
    async fn test_delta_percent_zero_old_price() {
        let tracker = ModificationTracker::new(None);
        let event = tracker
            .on_modified(modify(LegType::TakeProfit1, "0", "5", Side::Buy))
            .await
            .unwrap();
        assert_eq!(event.price_delta_percent, Some(Decimal::zero()));

        let event = tracker
            .on_modified(modify(LegType::TakeProfit1, "200", "210", Side::Buy))
            .await
            .unwrap();
        assert_eq!(event.price_delta_percent, Some(d("5")));
    }

    #[tokio::test]
    async fn test_history_without_store_is_empty() {
        let tracker = ModificationTracker::new(None);
        assert!(tracker
            .history(&UserId::new("u1"), "X", LegType::Entry)
            .await
            .unwrap()
            .is_empty());
        assert!(tracker
            .events_by_user(&UserId::new("u1"), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_summary() {
        let tracker = ModificationTracker::new(None);
        let events = vec![
            tracker.on_placed(place(LegType::StopLoss, "95")).await.unwrap(),
            tracker
                .on_modified(modify(LegType::StopLoss, "95", "97", Side::Buy))
                .await
                .unwrap(),
            tracker
                .on_modified(modify(LegType::StopLoss, "97", "99", Side::Buy))
                .await
                .unwrap(),
        ];
        let summary = summarize(&events).unwrap();
        assert_eq!(summary.total_modifications, 2);
        assert_eq!(summary.net_price_change, d("4"));
        assert_eq!(summary.net_dollar_impact, d("-8"));
        assert_eq!(summary.initial_price, d("95"));
        assert_eq!(summary.current_price, d("99"));
        assert!(summarize(&[]).is_none());
    }
}
