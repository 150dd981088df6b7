//! Daily settlement pipeline for one user and one local calendar day.

use super::aggregator::{AggregationError, PnlAggregator};
use super::snapshot::{PositionSnapshotService, SnapshotError};
use super::validation::{DataValidator, ValidationConfig, ValidationFailure};
use super::{
    format_date, local_day_bounds, resolve_timezone, DailyModeSummary, DailyPnlAggregation,
    ModeKey, PositionSnapshot, SettlementResult, SettlementStatus,
};
use crate::db::Repository;
use crate::domain::{Decimal, TimeMs, UserId};
use crate::exchange::ClientFactory;
use async_trait::async_trait;
use chrono::NaiveDate;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Aggregation(#[from] AggregationError),
    #[error("failed to save settlement summaries: {0}")]
    Store(#[source] sqlx::Error),
    #[error("settlement failed after {attempts} retries: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<SettlementError>,
    },
    #[error("settlement cancelled")]
    Cancelled,
    #[error("settlement exceeded its {0:?} budget")]
    TimedOut(Duration),
}

/// Anything that can settle one user's day. Implemented by the plain service and by the
/// retrying wrapper so the scheduler can drive either.
#[async_trait]
pub trait SettlementRunner: Send + Sync {
    async fn run_settlement(
        &self,
        user_id: &UserId,
        date: NaiveDate,
        timezone: &str,
        token: &CancellationToken,
    ) -> Result<SettlementResult, SettlementError>;
}

pub struct SettlementService {
    repo: Arc<Repository>,
    snapshots: PositionSnapshotService,
    aggregator: PnlAggregator,
    validator: DataValidator,
}

impl SettlementService {
    pub fn new(
        repo: Arc<Repository>,
        clients: Arc<dyn ClientFactory>,
        validation: ValidationConfig,
    ) -> Self {
        Self {
            snapshots: PositionSnapshotService::new(repo.clone(), clients.clone()),
            aggregator: PnlAggregator::new(clients),
            validator: DataValidator::new(validation),
            repo,
        }
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub fn snapshot_service(&self) -> &PositionSnapshotService {
        &self.snapshots
    }

    pub fn aggregator(&self) -> &PnlAggregator {
        &self.aggregator
    }

    /// Snapshot, aggregate, reconcile against yesterday, validate and persist one day.
    ///
    /// Reruns overwrite the same (user, date, mode) rows. A mode that fails hard
    /// validation is recorded as `failed` and listed in [`SettlementResult::rejected`];
    /// the remaining modes and `ALL` are stored.
    ///
    /// # Errors
    /// Snapshot and aggregation failures propagate unchanged. A store failure is first
    /// recorded as `failed` on every mode row of the day.
    pub async fn run_daily_settlement(
        &self,
        user_id: &UserId,
        date: NaiveDate,
        timezone: &str,
    ) -> Result<SettlementResult, SettlementError> {
        self.settle(user_id, date, timezone, &CancellationToken::new())
            .await
    }

    async fn settle(
        &self,
        user_id: &UserId,
        date: NaiveDate,
        timezone: &str,
        token: &CancellationToken,
    ) -> Result<SettlementResult, SettlementError> {
        let started = Instant::now();
        info!(user = %user_id, date = %date, timezone = %timezone, "Starting settlement");

        let tz = resolve_timezone(timezone);
        let (day_start, day_end) = local_day_bounds(date, tz);

        let snapshot = until_cancelled(
            token,
            self.snapshots.snapshot_open_positions(user_id, date),
        )
        .await?;
        let aggregation = until_cancelled(
            token,
            self.aggregator.aggregate_by_mode(
                user_id,
                TimeMs::from_datetime(&day_start),
                TimeMs::from_datetime(&day_end),
            ),
        )
        .await?;

        let yesterday = self.yesterday_unrealized(user_id, date).await;
        let today = unrealized_by_mode(&snapshot.snapshots);
        let summaries = build_summaries(user_id, date, timezone, &aggregation, &today, &yesterday);

        // Past this point the day is written, so cancellation is no longer observed
        let (summaries, rejected) = self.store_validated(user_id, date, summaries).await?;

        let duration_ms = started.elapsed().as_millis() as u64;
        info!(
            user = %user_id,
            date = %date,
            modes = summaries.len(),
            rejected = rejected.len(),
            trades = aggregation.total_trades,
            total_pnl = %aggregation.total_pnl,
            duration_ms,
            "Settlement completed"
        );

        Ok(SettlementResult {
            user_id: user_id.clone(),
            date,
            timezone: timezone.to_string(),
            snapshot,
            aggregation,
            summaries,
            rejected,
            duration_ms,
        })
    }

    /// Store the summaries that pass validation, then mark each rejected mode failed with
    /// its own errors.
    async fn store_validated(
        &self,
        user_id: &UserId,
        date: NaiveDate,
        summaries: Vec<DailyModeSummary>,
    ) -> Result<(Vec<DailyModeSummary>, Vec<ValidationFailure>), SettlementError> {
        let (accepted, rejected) = self.validate(summaries);

        if let Err(e) = self.repo.save_daily_mode_summaries(&accepted).await {
            let err = SettlementError::Store(e);
            let modes = accepted
                .iter()
                .map(|s| s.mode)
                .chain(rejected.iter().map(|f| f.mode))
                .collect::<Vec<ModeKey>>();
            self.mark_failed(user_id, date, modes, &err.to_string()).await;
            return Err(err);
        }

        for failure in &rejected {
            self.mark_failed(user_id, date, [failure.mode], &failure.to_string())
                .await;
        }
        Ok((accepted, rejected))
    }

    /// Split summaries into accepted rows, with warnings applied, and hard failures.
    fn validate(
        &self,
        summaries: Vec<DailyModeSummary>,
    ) -> (Vec<DailyModeSummary>, Vec<ValidationFailure>) {
        let mut accepted = Vec::with_capacity(summaries.len());
        let mut rejected = Vec::new();
        for mut summary in summaries {
            match self.validator.validate_and_apply(&mut summary) {
                Ok(_) => {
                    if summary.data_quality_flag {
                        warn!(
                            user = %summary.user_id,
                            mode = %summary.mode,
                            notes = ?summary.data_quality_notes,
                            "Settlement summary flagged for review"
                        );
                    }
                    accepted.push(summary);
                }
                Err(failure) => {
                    warn!(
                        user = %summary.user_id,
                        mode = %summary.mode,
                        errors = ?failure.errors,
                        "Settlement summary rejected"
                    );
                    rejected.push(failure);
                }
            }
        }
        (accepted, rejected)
    }

    /// Previous day's unrealized P&L per mode; empty if none is stored or the read fails.
    async fn yesterday_unrealized(
        &self,
        user_id: &UserId,
        date: NaiveDate,
    ) -> HashMap<ModeKey, Decimal> {
        let Some(yesterday) = date.pred_opt() else {
            return HashMap::new();
        };
        self.repo
            .unrealized_by_mode(user_id, yesterday)
            .await
            .unwrap_or_else(|e| {
                warn!(
                    user = %user_id,
                    date = %format_date(yesterday),
                    error = %e,
                    "Failed to load previous unrealized P&L, assuming none"
                );
                HashMap::new()
            })
    }

    async fn mark_failed(
        &self,
        user_id: &UserId,
        date: NaiveDate,
        modes: impl IntoIterator<Item = ModeKey>,
        message: &str,
    ) {
        for mode in modes {
            if let Err(e) = self
                .repo
                .update_settlement_status(user_id, date, mode, SettlementStatus::Failed, Some(message))
                .await
            {
                error!(user = %user_id, mode = %mode, error = %e, "Failed to mark settlement failed");
            }
        }
    }
}

#[async_trait]
impl SettlementRunner for SettlementService {
    async fn run_settlement(
        &self,
        user_id: &UserId,
        date: NaiveDate,
        timezone: &str,
        token: &CancellationToken,
    ) -> Result<SettlementResult, SettlementError> {
        if token.is_cancelled() {
            return Err(SettlementError::Cancelled);
        }
        self.settle(user_id, date, timezone, token).await
    }
}

/// Race one exchange-bound step against the token.
async fn until_cancelled<T, E>(
    token: &CancellationToken,
    step: impl Future<Output = Result<T, E>>,
) -> Result<T, SettlementError>
where
    SettlementError: From<E>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(SettlementError::Cancelled),
        result = step => result.map_err(SettlementError::from),
    }
}

/// Unrealized P&L per mode plus the `ALL` total.
fn unrealized_by_mode(snapshots: &[PositionSnapshot]) -> HashMap<ModeKey, Decimal> {
    let mut by_mode: HashMap<ModeKey, Decimal> = HashMap::new();
    let mut total = Decimal::zero();
    for snap in snapshots {
        *by_mode.entry(snap.mode).or_default() += snap.unrealized_pnl;
        total += snap.unrealized_pnl;
    }
    by_mode.insert(ModeKey::All, total);
    by_mode
}

/// Modes with trades first, then modes holding only overnight positions, then `ALL` if it
/// is still missing.
fn build_summaries(
    user_id: &UserId,
    date: NaiveDate,
    timezone: &str,
    aggregation: &DailyPnlAggregation,
    today: &HashMap<ModeKey, Decimal>,
    yesterday: &HashMap<ModeKey, Decimal>,
) -> Vec<DailyModeSummary> {
    let settlement_time = TimeMs::now();
    let unrealized = |mode: ModeKey| {
        let today_value = today.get(&mode).copied().unwrap_or_default();
        let change = today_value - yesterday.get(&mode).copied().unwrap_or_default();
        (today_value, change)
    };
    let base = |mode: ModeKey| {
        let mut s = DailyModeSummary::new(user_id.clone(), date, mode, timezone);
        s.settlement_time = settlement_time;
        let (today_value, change) = unrealized(mode);
        s.unrealized_pnl = today_value;
        s.unrealized_pnl_change = change;
        s.total_pnl = change;
        s
    };

    let mut summaries = Vec::new();
    let mut seen = BTreeSet::new();

    for (mode, pnl) in &aggregation.mode_results {
        let mut s = base(*mode);
        s.trade_count = pnl.trade_count;
        s.win_count = pnl.win_count;
        s.loss_count = pnl.loss_count;
        s.win_rate = pnl.win_rate;
        s.realized_pnl = pnl.realized_pnl;
        s.total_pnl = pnl.realized_pnl + s.unrealized_pnl_change;
        s.largest_win = pnl.largest_win;
        s.largest_loss = pnl.largest_loss;
        s.total_volume = pnl.total_volume;
        s.avg_trade_size = pnl.avg_trade_size;
        summaries.push(s);
        seen.insert(*mode);
    }

    let mut overnight: Vec<ModeKey> = today
        .keys()
        .copied()
        .filter(|m| !m.is_all() && !seen.contains(m))
        .collect();
    overnight.sort();
    for mode in overnight {
        summaries.push(base(mode));
        seen.insert(mode);
    }

    if !seen.contains(&ModeKey::All) {
        summaries.push(base(ModeKey::All));
    }

    summaries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::aggregator::aggregate_trades;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 15).unwrap()
    }

    fn aggregation(modes: std::collections::BTreeMap<ModeKey, crate::settlement::ModePnl>) -> DailyPnlAggregation {
        DailyPnlAggregation {
            user_id: UserId::new("u1"),
            day_start: TimeMs::new(0),
            day_end: TimeMs::new(1),
            total_pnl: modes[&ModeKey::All].realized_pnl,
            total_trades: modes[&ModeKey::All].trade_count,
            mode_results: modes,
            duration_ms: 0,
        }
    }

    #[test]
    fn test_overnight_swing_position() {
        let agg = aggregation(aggregate_trades(&[], &HashMap::new()));
        let today = HashMap::from([(ModeKey::Swing, d("350")), (ModeKey::All, d("350"))]);
        let yesterday = HashMap::from([(ModeKey::Swing, d("200")), (ModeKey::All, d("200"))]);

        let summaries = build_summaries(&UserId::new("u1"), date(), "UTC", &agg, &today, &yesterday);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].mode, ModeKey::All);
        assert_eq!(summaries[0].total_pnl, d("150"));

        let swing = &summaries[1];
        assert_eq!(swing.mode, ModeKey::Swing);
        assert_eq!(swing.trade_count, 0);
        assert_eq!(swing.realized_pnl, d("0"));
        assert_eq!(swing.unrealized_pnl, d("350"));
        assert_eq!(swing.unrealized_pnl_change, d("150"));
        assert_eq!(swing.total_pnl, d("150"));
    }

    #[test]
    fn test_realized_plus_unrealized_change() {
        let mut modes = aggregate_trades(&[], &HashMap::new());
        let mut scalp = crate::settlement::ModePnl::empty(ModeKey::Scalp);
        scalp.trade_count = 1;
        scalp.win_count = 1;
        scalp.realized_pnl = d("40");
        modes.insert(ModeKey::Scalp, scalp);

        let agg = aggregation(modes);
        let today = HashMap::from([(ModeKey::Scalp, d("-5"))]);
        let summaries =
            build_summaries(&UserId::new("u1"), date(), "UTC", &agg, &today, &HashMap::new());
        let scalp = summaries.iter().find(|s| s.mode == ModeKey::Scalp).unwrap();
        assert_eq!(scalp.total_pnl, d("35"));
        assert_eq!(scalp.settlement_status, SettlementStatus::Completed);
    }

    async fn service_with_store() -> (tempfile::TempDir, Arc<Repository>, SettlementService) {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("test.db").to_string_lossy().to_string();
        let repo = Arc::new(Repository::new(crate::db::init_db(&path).await.unwrap()));
        let clients = Arc::new(crate::exchange::MockClientFactory::new());
        let service = SettlementService::new(repo.clone(), clients, ValidationConfig::default());
        (temp_dir, repo, service)
    }

    #[tokio::test]
    async fn test_rejected_mode_does_not_block_the_rest() {
        let (_dir, repo, service) = service_with_store().await;
        let user = UserId::new("u1");

        let mut modes = aggregate_trades(&[], &HashMap::new());
        let mut scalp = crate::settlement::ModePnl::empty(ModeKey::Scalp);
        scalp.trade_count = 1;
        scalp.win_count = 1;
        scalp.loss_count = 1;
        modes.insert(ModeKey::Scalp, scalp);
        let mut swing = crate::settlement::ModePnl::empty(ModeKey::Swing);
        swing.trade_count = 1;
        swing.win_count = 1;
        swing.win_rate = d("100");
        swing.realized_pnl = d("50");
        swing.largest_win = d("50");
        modes.insert(ModeKey::Swing, swing);

        let agg = aggregation(modes);
        let summaries =
            build_summaries(&user, date(), "UTC", &agg, &HashMap::new(), &HashMap::new());
        let (stored, rejected) = service
            .store_validated(&user, date(), summaries)
            .await
            .unwrap();

        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].mode, ModeKey::Scalp);
        let stored_modes: Vec<ModeKey> = stored.iter().map(|s| s.mode).collect();
        assert!(stored_modes.contains(&ModeKey::Swing));
        assert!(stored_modes.contains(&ModeKey::All));

        let rows = repo.daily_mode_summaries(&user, date()).await.unwrap();
        let row = |mode: ModeKey| rows.iter().find(|r| r.mode == mode).unwrap();
        assert_eq!(row(ModeKey::Swing).settlement_status, SettlementStatus::Completed);
        assert_eq!(row(ModeKey::Swing).realized_pnl, d("50"));
        assert_eq!(row(ModeKey::All).settlement_status, SettlementStatus::Completed);
        assert_eq!(row(ModeKey::Scalp).settlement_status, SettlementStatus::Failed);
        assert!(row(ModeKey::Scalp)
            .settlement_error
            .as_deref()
            .unwrap()
            .starts_with("validation failed for scalp"));
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_exchange_calls() {
        let (_dir, repo, service) = service_with_store().await;
        let token = CancellationToken::new();
        token.cancel();
        let err = service
            .run_settlement(&UserId::new("u1"), date(), "UTC", &token)
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Cancelled));
        assert!(repo
            .daily_mode_summaries(&UserId::new("u1"), date())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_slow_step() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });
        let slow = async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, SnapshotError>(())
        };
        let err = until_cancelled(&token, slow).await.unwrap_err();
        assert!(matches!(err, SettlementError::Cancelled));
    }

    #[test]
    fn test_unrealized_by_mode_includes_all() {
        let by_mode = unrealized_by_mode(&[]);
        assert_eq!(by_mode.get(&ModeKey::All), Some(&Decimal::zero()));
    }
}
