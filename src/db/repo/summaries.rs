//! Per-mode daily settlement rows and their status transitions.

use super::{date_col, decimal_col, Repository};
use crate::domain::{TimeMs, UserId};
use crate::settlement::{format_date, DailyModeSummary, ModeKey, SettlementStatus};
use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Row counts per settlement status over a time window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub completed: i64,
    pub failed: i64,
    pub retrying: i64,
}

impl StatusCounts {
    pub fn total(&self) -> i64 {
        self.completed + self.failed + self.retrying
    }
}

const SUMMARY_COLUMNS: &str = r#"
    user_id, summary_date, mode, trade_count, win_count, loss_count, win_rate, realized_pnl,
    unrealized_pnl, unrealized_pnl_change, total_pnl, largest_win, largest_loss, total_volume,
    avg_trade_size, settlement_status, settlement_error, settlement_time_ms, user_timezone,
    data_quality_flag, data_quality_notes, alert_sent
"#;

impl Repository {
    // =========================================================================
    // Summary operations
    // =========================================================================

    /// Upsert all summaries in one transaction keyed by (user, date, mode).
    ///
    /// A rerun for the same day overwrites the earlier rows and resets the alert flag.
    ///
    /// # Errors
    /// Returns an error if any upsert fails; nothing is written in that case.
    pub async fn save_daily_mode_summaries(
        &self,
        summaries: &[DailyModeSummary],
    ) -> Result<(), sqlx::Error> {
        if summaries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for s in summaries {
            sqlx::query(
                r#"
                INSERT INTO daily_mode_summaries (
                    user_id, summary_date, mode, trade_count, win_count, loss_count, win_rate,
                    realized_pnl, unrealized_pnl, unrealized_pnl_change, total_pnl, largest_win,
                    largest_loss, total_volume, avg_trade_size, settlement_status,
                    settlement_error, settlement_time_ms, updated_at_ms, user_timezone,
                    data_quality_flag, data_quality_notes, alert_sent
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(user_id, summary_date, mode) DO UPDATE SET
                    trade_count = excluded.trade_count,
                    win_count = excluded.win_count,
                    loss_count = excluded.loss_count,
                    win_rate = excluded.win_rate,
                    realized_pnl = excluded.realized_pnl,
                    unrealized_pnl = excluded.unrealized_pnl,
                    unrealized_pnl_change = excluded.unrealized_pnl_change,
                    total_pnl = excluded.total_pnl,
                    largest_win = excluded.largest_win,
                    largest_loss = excluded.largest_loss,
                    total_volume = excluded.total_volume,
                    avg_trade_size = excluded.avg_trade_size,
                    settlement_status = excluded.settlement_status,
                    settlement_error = excluded.settlement_error,
                    settlement_time_ms = excluded.settlement_time_ms,
                    updated_at_ms = excluded.updated_at_ms,
                    user_timezone = excluded.user_timezone,
                    data_quality_flag = excluded.data_quality_flag,
                    data_quality_notes = excluded.data_quality_notes,
                    alert_sent = excluded.alert_sent
                "#,
            )
            .bind(s.user_id.as_str())
            .bind(format_date(s.summary_date))
            .bind(s.mode.as_str())
            .bind(s.trade_count)
            .bind(s.win_count)
            .bind(s.loss_count)
            .bind(s.win_rate.to_canonical_string())
            .bind(s.realized_pnl.to_canonical_string())
            .bind(s.unrealized_pnl.to_canonical_string())
            .bind(s.unrealized_pnl_change.to_canonical_string())
            .bind(s.total_pnl.to_canonical_string())
            .bind(s.largest_win.to_canonical_string())
            .bind(s.largest_loss.to_canonical_string())
            .bind(s.total_volume.to_canonical_string())
            .bind(s.avg_trade_size.to_canonical_string())
            .bind(s.settlement_status.as_str())
            .bind(s.settlement_error.as_deref())
            .bind(s.settlement_time.as_ms())
            .bind(s.settlement_time.as_ms())
            .bind(&s.user_timezone)
            .bind(s.data_quality_flag)
            .bind(s.data_quality_notes.as_deref())
            .bind(s.alert_sent)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(count = summaries.len(), "Saved daily mode summaries");
        Ok(())
    }

    /// Summaries for one user and date, ordered by mode name.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn daily_mode_summaries(
        &self,
        user_id: &UserId,
        date: NaiveDate,
    ) -> Result<Vec<DailyModeSummary>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM daily_mode_summaries WHERE user_id = ? AND summary_date = ? ORDER BY mode ASC",
            SUMMARY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.as_str())
            .bind(format_date(date))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(summary_from_row).collect())
    }

    /// Per-mode unrealized P&L recorded for a date. Empty when nothing was settled.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn unrealized_by_mode(
        &self,
        user_id: &UserId,
        date: NaiveDate,
    ) -> Result<HashMap<ModeKey, crate::domain::Decimal>, sqlx::Error> {
        let summaries = self.daily_mode_summaries(user_id, date).await?;
        Ok(summaries
            .into_iter()
            .map(|s| (s.mode, s.unrealized_pnl))
            .collect())
    }

    /// Set the status of one (user, date, mode) row, creating a zeroed row if none exists.
    ///
    /// A new row takes now as its settlement time. An existing row keeps its settlement
    /// time and only moves `updated_at_ms`, so a day that keeps failing still ages toward
    /// the alert threshold.
    ///
    /// # Errors
    /// Returns an error if the upsert fails.
    pub async fn update_settlement_status(
        &self,
        user_id: &UserId,
        date: NaiveDate,
        mode: ModeKey,
        status: SettlementStatus,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        let now = TimeMs::now().as_ms();
        sqlx::query(
            r#"
            INSERT INTO daily_mode_summaries (
                user_id, summary_date, mode, settlement_status, settlement_error,
                settlement_time_ms, updated_at_ms, user_timezone
            ) VALUES (?, ?, ?, ?, ?, ?, ?, COALESCE((SELECT timezone FROM users WHERE id = ?), 'UTC'))
            ON CONFLICT(user_id, summary_date, mode) DO UPDATE SET
                settlement_status = excluded.settlement_status,
                settlement_error = excluded.settlement_error,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(user_id.as_str())
        .bind(format_date(date))
        .bind(mode.as_str())
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(user_id.as_str())
        .execute(&self.pool)
        .await?;

        debug!(
            user = %user_id,
            date = %date,
            mode = %mode,
            status = %status,
            "Updated settlement status"
        );
        Ok(())
    }

    /// Failed settlements not yet alerted whose settlement time is at or before `cutoff`.
    ///
    /// Ordered oldest first.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn failed_settlements(
        &self,
        cutoff: TimeMs,
    ) -> Result<Vec<DailyModeSummary>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {} FROM daily_mode_summaries
            WHERE settlement_status = 'failed' AND alert_sent = 0 AND settlement_time_ms <= ?
            ORDER BY settlement_time_ms ASC, user_id ASC, summary_date ASC, mode ASC
            "#,
            SUMMARY_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff.as_ms())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(summary_from_row).collect())
    }

    /// Flag every mode row of (user, date) as alerted.
    ///
    /// # Errors
    /// Returns an error if the update fails.
    pub async fn mark_settlement_alerted(
        &self,
        user_id: &UserId,
        date: NaiveDate,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE daily_mode_summaries SET alert_sent = 1 WHERE user_id = ? AND summary_date = ?",
        )
        .bind(user_id.as_str())
        .bind(format_date(date))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Status counts over rows last written at or after `since`.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn status_counts_since(&self, since: TimeMs) -> Result<StatusCounts, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT settlement_status, COUNT(*) AS n
            FROM daily_mode_summaries
            WHERE updated_at_ms >= ?
            GROUP BY settlement_status
            "#,
        )
        .bind(since.as_ms())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = StatusCounts::default();
        for row in &rows {
            let status: String = row.get("settlement_status");
            let n: i64 = row.get("n");
            match SettlementStatus::parse(&status) {
                Some(SettlementStatus::Completed) => counts.completed = n,
                Some(SettlementStatus::Failed) => counts.failed = n,
                Some(SettlementStatus::Retrying) => counts.retrying = n,
                None => warn!(status = %status, "Unknown settlement status in store"),
            }
        }
        Ok(counts)
    }
}

fn summary_from_row(row: &SqliteRow) -> DailyModeSummary {
    let mode: String = row.get("mode");
    let status: String = row.get("settlement_status");

    DailyModeSummary {
        user_id: UserId::new(row.get::<String, _>("user_id")),
        summary_date: date_col(row, "summary_date"),
        mode: ModeKey::parse(&mode).unwrap_or(ModeKey::Unknown),
        trade_count: row.get("trade_count"),
        win_count: row.get("win_count"),
        loss_count: row.get("loss_count"),
        win_rate: decimal_col(row, "win_rate"),
        realized_pnl: decimal_col(row, "realized_pnl"),
        unrealized_pnl: decimal_col(row, "unrealized_pnl"),
        unrealized_pnl_change: decimal_col(row, "unrealized_pnl_change"),
        total_pnl: decimal_col(row, "total_pnl"),
        largest_win: decimal_col(row, "largest_win"),
        largest_loss: decimal_col(row, "largest_loss"),
        total_volume: decimal_col(row, "total_volume"),
        avg_trade_size: decimal_col(row, "avg_trade_size"),
        settlement_status: SettlementStatus::parse(&status).unwrap_or(SettlementStatus::Failed),
        settlement_error: row.get("settlement_error"),
        settlement_time: TimeMs::new(row.get("settlement_time_ms")),
        user_timezone: row.get("user_timezone"),
        data_quality_flag: row.get("data_quality_flag"),
        data_quality_notes: row.get("data_quality_notes"),
        alert_sent: row.get("alert_sent"),
    }
}
