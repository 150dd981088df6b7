//! End-of-day settlement: snapshot open positions, aggregate realized P&L per trading mode,
//! reconcile unrealized P&L day over day, validate, persist, retry, schedule and monitor.

pub mod aggregator;
pub mod capital;
pub mod monitor;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod snapshot;
pub mod validation;

use crate::domain::{Decimal, PositionSide, Symbol, TimeMs, UserId};
use crate::orders::{parse_client_order_id, TradingMode};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

pub use aggregator::{AggregationError, PnlAggregator};
pub use capital::{
    CapitalError, CapitalMetrics, CapitalSample, CapitalTracker, InMemorySampleStore,
    RedisSampleStore, SampleStore,
};
pub use monitor::{AlertChannel, MonitorConfig, MonitorError, MonitoringMetrics, SettlementMonitor};
pub use retry::{
    delay_for, identify_phase, is_retryable, RetryConfig, RetryableSettlementService,
    SettlementFailure, SettlementPhase,
};
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerError, TickReport};
pub use service::{SettlementError, SettlementRunner, SettlementService};
pub use snapshot::{PositionSnapshotService, SnapshotError};
pub use validation::{DataValidator, ValidationConfig, ValidationFailure, ValidationResult};

/// Date format used for settlement dates everywhere they are rendered or stored.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Settlement bucket: the four trading modes plus trades nobody can attribute and the
/// synthetic all-modes total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModeKey {
    #[serde(rename = "ultra_fast")]
    UltraFast,
    #[serde(rename = "scalp")]
    Scalp,
    #[serde(rename = "swing")]
    Swing,
    #[serde(rename = "position")]
    Position,
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[serde(rename = "ALL")]
    All,
}

impl ModeKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModeKey::UltraFast => "ultra_fast",
            ModeKey::Scalp => "scalp",
            ModeKey::Swing => "swing",
            ModeKey::Position => "position",
            ModeKey::Unknown => "UNKNOWN",
            ModeKey::All => "ALL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ALL" => Some(ModeKey::All),
            "UNKNOWN" => Some(ModeKey::Unknown),
            other => TradingMode::parse_name(other).map(ModeKey::from),
        }
    }

    /// Mode that placed an order, from its client order id.
    pub fn from_client_order_id(client_order_id: &str) -> Self {
        parse_client_order_id(client_order_id)
            .map(|p| ModeKey::from(p.mode))
            .unwrap_or(ModeKey::Unknown)
    }

    pub fn is_all(&self) -> bool {
        matches!(self, ModeKey::All)
    }
}

impl From<TradingMode> for ModeKey {
    fn from(mode: TradingMode) -> Self {
        match mode {
            TradingMode::UltraFast => ModeKey::UltraFast,
            TradingMode::Scalp => ModeKey::Scalp,
            TradingMode::Swing => ModeKey::Swing,
            TradingMode::Position => ModeKey::Position,
        }
    }
}

impl fmt::Display for ModeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementStatus {
    Completed,
    Failed,
    /// Waiting between retry attempts.
    Retrying,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Completed => "completed",
            SettlementStatus::Failed => "failed",
            SettlementStatus::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(SettlementStatus::Completed),
            "failed" => Some(SettlementStatus::Failed),
            "retrying" => Some(SettlementStatus::Retrying),
            _ => None,
        }
    }
}

impl fmt::Display for SettlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One open position frozen at settlement time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub id: String,
    pub user_id: UserId,
    pub snapshot_date: NaiveDate,
    pub symbol: Symbol,
    pub position_side: PositionSide,
    /// Absolute position size.
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub mode: ModeKey,
    /// Order whose id the mode was read from.
    pub client_order_id: Option<String>,
    pub leverage: u32,
    pub margin_type: String,
    pub created_at: TimeMs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResult {
    pub user_id: UserId,
    pub snapshot_date: NaiveDate,
    pub position_count: usize,
    pub snapshots: Vec<PositionSnapshot>,
    pub total_unrealized_pnl: Decimal,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeBreakdown {
    pub mode: ModeKey,
    pub position_count: i64,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub user_id: UserId,
    pub snapshot_date: NaiveDate,
    pub total_positions: usize,
    pub total_unrealized_pnl: Decimal,
    pub mode_breakdowns: Vec<ModeBreakdown>,
}

/// Realized P&L statistics for one mode over one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModePnl {
    pub mode: ModeKey,
    pub realized_pnl: Decimal,
    pub trade_count: i64,
    /// Trades with positive realized P&L.
    pub win_count: i64,
    /// Trades with negative realized P&L.
    pub loss_count: i64,
    /// Percentage, 0 to 100.
    pub win_rate: Decimal,
    pub largest_win: Decimal,
    /// Most negative single trade, zero without losses.
    pub largest_loss: Decimal,
    pub total_volume: Decimal,
    pub avg_trade_size: Decimal,
}

impl ModePnl {
    pub fn empty(mode: ModeKey) -> Self {
        Self {
            mode,
            realized_pnl: Decimal::zero(),
            trade_count: 0,
            win_count: 0,
            loss_count: 0,
            win_rate: Decimal::zero(),
            largest_win: Decimal::zero(),
            largest_loss: Decimal::zero(),
            total_volume: Decimal::zero(),
            avg_trade_size: Decimal::zero(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyPnlAggregation {
    pub user_id: UserId,
    pub day_start: TimeMs,
    pub day_end: TimeMs,
    /// Always contains `ALL`.
    pub mode_results: BTreeMap<ModeKey, ModePnl>,
    pub total_pnl: Decimal,
    pub total_trades: i64,
    pub duration_ms: u64,
}

/// Persisted per-(user, date, mode) settlement row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyModeSummary {
    pub user_id: UserId,
    pub summary_date: NaiveDate,
    pub mode: ModeKey,
    pub trade_count: i64,
    pub win_count: i64,
    pub loss_count: i64,
    pub win_rate: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_change: Decimal,
    /// Realized plus the day-over-day change in unrealized.
    pub total_pnl: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub total_volume: Decimal,
    pub avg_trade_size: Decimal,
    pub settlement_status: SettlementStatus,
    pub settlement_error: Option<String>,
    pub settlement_time: TimeMs,
    pub user_timezone: String,
    pub data_quality_flag: bool,
    pub data_quality_notes: Option<String>,
    pub alert_sent: bool,
}

impl DailyModeSummary {
    /// Zeroed completed row for one mode.
    pub fn new(user_id: UserId, summary_date: NaiveDate, mode: ModeKey, timezone: &str) -> Self {
        Self {
            user_id,
            summary_date,
            mode,
            trade_count: 0,
            win_count: 0,
            loss_count: 0,
            win_rate: Decimal::zero(),
            realized_pnl: Decimal::zero(),
            unrealized_pnl: Decimal::zero(),
            unrealized_pnl_change: Decimal::zero(),
            total_pnl: Decimal::zero(),
            largest_win: Decimal::zero(),
            largest_loss: Decimal::zero(),
            total_volume: Decimal::zero(),
            avg_trade_size: Decimal::zero(),
            settlement_status: SettlementStatus::Completed,
            settlement_error: None,
            settlement_time: TimeMs::now(),
            user_timezone: timezone.to_string(),
            data_quality_flag: false,
            data_quality_notes: None,
            alert_sent: false,
        }
    }
}

/// Outcome of one successful settlement run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementResult {
    pub user_id: UserId,
    pub date: NaiveDate,
    pub timezone: String,
    pub snapshot: SnapshotResult,
    pub aggregation: DailyPnlAggregation,
    /// Stored rows, `ALL` included.
    pub summaries: Vec<DailyModeSummary>,
    /// Modes that failed hard validation and were recorded as `failed` instead.
    pub rejected: Vec<ValidationFailure>,
    pub duration_ms: u64,
}

/// User row as seen by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub timezone: String,
    pub last_settlement_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettlementStatus {
    pub user_id: UserId,
    pub timezone: String,
    pub last_settlement_date: Option<NaiveDate>,
    pub next_settlement_time: DateTime<Utc>,
    pub needs_settlement: bool,
}

/// Parse an IANA zone name, falling back to UTC.
pub fn resolve_timezone(name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or_else(|_| {
        warn!(timezone = %name, "Invalid timezone, using UTC");
        Tz::UTC
    })
}

/// First instant of `date` in `tz`. Zones whose midnight does not exist on a DST
/// transition day start at 01:00.
pub fn local_midnight(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let naive = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// `[start, end]` of a local calendar day, with `end` one second before the next day's
/// start.
pub fn local_day_bounds(date: NaiveDate, tz: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = local_midnight(date, tz);
    (start, start + Duration::hours(24) - Duration::seconds(1))
}

pub fn local_date(now: DateTime<Utc>, tz: Tz) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

pub fn format_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).ok()
}
