//! Position lifecycle storage.

use super::{decimal_col, Repository};
use crate::domain::{Side, Symbol, TimeMs, UserId};
use crate::orders::{PositionState, PositionStatus, PositionStore};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

const POSITION_COLUMNS: &str = r#"
    id, user_id, chain_id, symbol, entry_order_id, entry_client_order_id, entry_side,
    entry_price, entry_quantity, entry_value, entry_fees, entry_filled_at_ms, status,
    remaining_quantity, realized_pnl, created_at_ms, updated_at_ms, closed_at_ms
"#;

#[async_trait]
impl PositionStore for Repository {
    async fn create_position(&self, p: &PositionState) -> Result<i64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO position_states (
                user_id, chain_id, symbol, entry_order_id, entry_client_order_id, entry_side,
                entry_price, entry_quantity, entry_value, entry_fees, entry_filled_at_ms,
                status, remaining_quantity, realized_pnl, created_at_ms, updated_at_ms,
                closed_at_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(p.user_id.as_str())
        .bind(&p.chain_id)
        .bind(p.symbol.as_str())
        .bind(p.entry_order_id)
        .bind(&p.entry_client_order_id)
        .bind(p.entry_side.as_str())
        .bind(p.entry_price.to_canonical_string())
        .bind(p.entry_quantity.to_canonical_string())
        .bind(p.entry_value.to_canonical_string())
        .bind(p.entry_fees.to_canonical_string())
        .bind(p.entry_filled_at.as_ms())
        .bind(p.status.as_str())
        .bind(p.remaining_quantity.to_canonical_string())
        .bind(p.realized_pnl.to_canonical_string())
        .bind(p.created_at.as_ms())
        .bind(p.updated_at.as_ms())
        .bind(p.closed_at.map(|t| t.as_ms()))
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn update_position(&self, p: &PositionState) -> Result<(), sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE position_states SET
                status = ?,
                remaining_quantity = ?,
                realized_pnl = ?,
                updated_at_ms = ?,
                closed_at_ms = ?
            WHERE user_id = ? AND chain_id = ?
            "#,
        )
        .bind(p.status.as_str())
        .bind(p.remaining_quantity.to_canonical_string())
        .bind(p.realized_pnl.to_canonical_string())
        .bind(p.updated_at.as_ms())
        .bind(p.closed_at.map(|t| t.as_ms()))
        .bind(p.user_id.as_str())
        .bind(&p.chain_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }

    async fn position_by_chain(
        &self,
        user_id: &UserId,
        chain_id: &str,
    ) -> Result<Option<PositionState>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM position_states WHERE user_id = ? AND chain_id = ?",
            POSITION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id.as_str())
            .bind(chain_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(position_from_row))
    }

    async fn positions_by_user(
        &self,
        user_id: &UserId,
        status: PositionStatus,
    ) -> Result<Vec<PositionState>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM position_states WHERE user_id = ? AND status = ? ORDER BY created_at_ms ASC, id ASC",
            POSITION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.as_str())
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(position_from_row).collect())
    }

    async fn position_by_symbol(
        &self,
        user_id: &UserId,
        symbol: &Symbol,
        status: PositionStatus,
    ) -> Result<Option<PositionState>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {} FROM position_states
            WHERE user_id = ? AND symbol = ? AND status = ?
            ORDER BY created_at_ms DESC, id DESC
            LIMIT 1
            "#,
            POSITION_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id.as_str())
            .bind(symbol.as_str())
            .bind(status.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(position_from_row))
    }
}

fn position_from_row(row: &SqliteRow) -> PositionState {
    let side: String = row.get("entry_side");
    let status: String = row.get("status");
    let closed_at: Option<i64> = row.get("closed_at_ms");

    PositionState {
        id: Some(row.get("id")),
        user_id: UserId::new(row.get::<String, _>("user_id")),
        chain_id: row.get("chain_id"),
        symbol: Symbol::new(row.get::<String, _>("symbol")),
        entry_order_id: row.get("entry_order_id"),
        entry_client_order_id: row.get("entry_client_order_id"),
        entry_side: Side::parse(&side).unwrap_or(Side::Buy),
        entry_price: decimal_col(row, "entry_price"),
        entry_quantity: decimal_col(row, "entry_quantity"),
        entry_value: decimal_col(row, "entry_value"),
        entry_fees: decimal_col(row, "entry_fees"),
        entry_filled_at: TimeMs::new(row.get("entry_filled_at_ms")),
        status: PositionStatus::parse(&status).unwrap_or(PositionStatus::Active),
        remaining_quantity: decimal_col(row, "remaining_quantity"),
        realized_pnl: decimal_col(row, "realized_pnl"),
        created_at: TimeMs::new(row.get("created_at_ms")),
        updated_at: TimeMs::new(row.get("updated_at_ms")),
        closed_at: closed_at.map(TimeMs::new),
    }
}
