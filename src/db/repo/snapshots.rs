//! Daily position snapshot operations.

use super::{date_col, decimal_col, Repository};
use crate::domain::{PositionSide, Symbol, TimeMs, UserId};
use crate::settlement::{format_date, ModeBreakdown, ModeKey, PositionSnapshot};
use chrono::NaiveDate;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::debug;

impl Repository {
    // =========================================================================
    // Snapshot operations
    // =========================================================================

    /// Save snapshots in one transaction.
    ///
    /// Re-snapshotting the same (user, date, symbol, side) replaces the previous row.
    ///
    /// # Errors
    /// Returns an error if any insert fails; nothing is written in that case.
    pub async fn save_daily_position_snapshots(
        &self,
        snapshots: &[PositionSnapshot],
    ) -> Result<(), sqlx::Error> {
        if snapshots.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for snap in snapshots {
            sqlx::query(
                r#"
                INSERT INTO daily_position_snapshots (
                    id, user_id, snapshot_date, symbol, position_side, quantity,
                    entry_price, mark_price, unrealized_pnl, mode, client_order_id,
                    leverage, margin_type, created_at_ms
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(user_id, snapshot_date, symbol, position_side) DO UPDATE SET
                    quantity = excluded.quantity,
                    entry_price = excluded.entry_price,
                    mark_price = excluded.mark_price,
                    unrealized_pnl = excluded.unrealized_pnl,
                    mode = excluded.mode,
                    client_order_id = excluded.client_order_id,
                    leverage = excluded.leverage,
                    margin_type = excluded.margin_type,
                    created_at_ms = excluded.created_at_ms
                "#,
            )
            .bind(&snap.id)
            .bind(snap.user_id.as_str())
            .bind(format_date(snap.snapshot_date))
            .bind(snap.symbol.as_str())
            .bind(snap.position_side.as_str())
            .bind(snap.quantity.to_canonical_string())
            .bind(snap.entry_price.to_canonical_string())
            .bind(snap.mark_price.to_canonical_string())
            .bind(snap.unrealized_pnl.to_canonical_string())
            .bind(snap.mode.as_str())
            .bind(snap.client_order_id.as_deref())
            .bind(i64::from(snap.leverage))
            .bind(&snap.margin_type)
            .bind(snap.created_at.as_ms())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(count = snapshots.len(), "Saved position snapshots");
        Ok(())
    }

    /// Snapshots for one user and date, ordered by symbol then side.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn daily_position_snapshots(
        &self,
        user_id: &UserId,
        date: NaiveDate,
    ) -> Result<Vec<PositionSnapshot>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, snapshot_date, symbol, position_side, quantity, entry_price,
                   mark_price, unrealized_pnl, mode, client_order_id, leverage, margin_type,
                   created_at_ms
            FROM daily_position_snapshots
            WHERE user_id = ? AND snapshot_date = ?
            ORDER BY symbol ASC, position_side ASC
            "#,
        )
        .bind(user_id.as_str())
        .bind(format_date(date))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(snapshot_from_row).collect())
    }

    /// Position count and unrealized P&L per mode for one snapshot date.
    ///
    /// Summed in Rust so decimal strings are added without float rounding.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn mode_breakdown_for_date(
        &self,
        user_id: &UserId,
        date: NaiveDate,
    ) -> Result<Vec<ModeBreakdown>, sqlx::Error> {
        let snapshots = self.daily_position_snapshots(user_id, date).await?;

        let mut by_mode: BTreeMap<ModeKey, ModeBreakdown> = BTreeMap::new();
        for snap in &snapshots {
            let entry = by_mode.entry(snap.mode).or_insert_with(|| ModeBreakdown {
                mode: snap.mode,
                position_count: 0,
                unrealized_pnl: Default::default(),
            });
            entry.position_count += 1;
            entry.unrealized_pnl += snap.unrealized_pnl;
        }

        Ok(by_mode.into_values().collect())
    }
}

fn snapshot_from_row(row: &SqliteRow) -> PositionSnapshot {
    let side: String = row.get("position_side");
    let mode: String = row.get("mode");
    let leverage: i64 = row.get("leverage");

    PositionSnapshot {
        id: row.get("id"),
        user_id: UserId::new(row.get::<String, _>("user_id")),
        snapshot_date: date_col(row, "snapshot_date"),
        symbol: Symbol::new(row.get::<String, _>("symbol")),
        position_side: PositionSide::parse(&side).unwrap_or(PositionSide::Both),
        quantity: decimal_col(row, "quantity"),
        entry_price: decimal_col(row, "entry_price"),
        mark_price: decimal_col(row, "mark_price"),
        unrealized_pnl: decimal_col(row, "unrealized_pnl"),
        mode: ModeKey::parse(&mode).unwrap_or(ModeKey::Unknown),
        client_order_id: row.get("client_order_id"),
        leverage: u32::try_from(leverage).unwrap_or(1),
        margin_type: row.get("margin_type"),
        created_at: TimeMs::new(row.get("created_at_ms")),
    }
}
