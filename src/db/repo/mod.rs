//! Repository layer for settlement persistence.
//!
//! Methods are organized across submodules by table:
//! - `snapshots.rs` - daily position snapshots
//! - `summaries.rs` - per-mode settlement rows and their status
//! - `modifications.rs` - order modification audit log
//! - `positions.rs` - position lifecycle rows
//!
//! Decimals are stored as canonical strings so SQLite never rounds them.

mod modifications;
mod positions;
mod snapshots;
mod summaries;

pub use summaries::StatusCounts;

use crate::domain::{Decimal, UserId};
use crate::settlement::{format_date, parse_date, UserRecord};
use chrono::NaiveDate;
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use tracing::warn;

/// Repository for database operations.
#[derive(Debug, Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    /// Create a new repository with the given connection pool.
    pub fn new(pool: SqlitePool) -> Self {
        Repository { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // =========================================================================
    // User operations
    // =========================================================================

    /// Register a user or update their timezone. The settlement checkpoint is untouched.
    ///
    /// # Errors
    /// Returns an error if the upsert fails.
    pub async fn upsert_user(&self, user_id: &UserId, timezone: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO users (id, timezone, created_at_ms)
            VALUES (?, ?, strftime('%s', 'now') * 1000)
            ON CONFLICT(id) DO UPDATE SET timezone = excluded.timezone
            "#,
        )
        .bind(user_id.as_str())
        .bind(timezone)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All users the scheduler should consider, ordered by id.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn users_for_settlement_check(&self) -> Result<Vec<UserRecord>, sqlx::Error> {
        let rows = sqlx::query(
            "SELECT id, timezone, last_settlement_date FROM users ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(user_from_row).collect())
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn get_user(&self, user_id: &UserId) -> Result<Option<UserRecord>, sqlx::Error> {
        let row = sqlx::query("SELECT id, timezone, last_settlement_date FROM users WHERE id = ?")
            .bind(user_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(user_from_row))
    }

    /// Advance the settlement checkpoint.
    ///
    /// # Errors
    /// Returns `RowNotFound` if the user does not exist.
    pub async fn update_last_settlement_date(
        &self,
        user_id: &UserId,
        date: NaiveDate,
    ) -> Result<(), sqlx::Error> {
        let result = sqlx::query("UPDATE users SET last_settlement_date = ? WHERE id = ?")
            .bind(format_date(date))
            .bind(user_id.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(sqlx::Error::RowNotFound);
        }
        Ok(())
    }
}

fn user_from_row(row: &SqliteRow) -> UserRecord {
    let last: Option<String> = row.get("last_settlement_date");
    UserRecord {
        id: UserId::new(row.get::<String, _>("id")),
        timezone: row.get("timezone"),
        last_settlement_date: last.as_deref().and_then(parse_date),
    }
}

/// Read a decimal column, logging and defaulting to zero on a malformed value.
pub(crate) fn decimal_col(row: &SqliteRow, column: &str) -> Decimal {
    let raw: String = row.get(column);
    Decimal::from_str(&raw).unwrap_or_else(|e| {
        warn!(column = %column, value = %raw, error = %e, "Failed to parse decimal column, using default");
        Decimal::default()
    })
}

pub(crate) fn opt_decimal_col(row: &SqliteRow, column: &str) -> Option<Decimal> {
    let raw: Option<String> = row.get(column);
    raw.map(|raw| {
        Decimal::from_str(&raw).unwrap_or_else(|e| {
            warn!(column = %column, value = %raw, error = %e, "Failed to parse decimal column, using default");
            Decimal::default()
        })
    })
}

/// Read a date column, logging and defaulting to the epoch date on a malformed value.
pub(crate) fn date_col(row: &SqliteRow, column: &str) -> NaiveDate {
    let raw: String = row.get(column);
    parse_date(&raw).unwrap_or_else(|| {
        warn!(column = %column, value = %raw, "Failed to parse date column, using default");
        NaiveDate::default()
    })
}
