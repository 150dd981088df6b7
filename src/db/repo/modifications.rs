//! Order modification audit log storage.

use super::{decimal_col, opt_decimal_col, Repository};
use crate::domain::{TimeMs, UserId};
use crate::orders::{
    ImpactDirection, LegType, ModificationEvent, ModificationEventType, ModificationSource,
    ModificationStore,
};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::warn;

const EVENT_COLUMNS: &str = r#"
    id, user_id, chain_id, leg_type, exchange_order_id, event_type, modification_source,
    version, old_price, new_price, price_delta, price_delta_percent, position_quantity,
    position_entry_price, dollar_impact, impact_direction, modification_reason, decision_id,
    confidence, market_context, created_at_ms
"#;

#[async_trait]
impl ModificationStore for Repository {
    async fn create_event(&self, event: &ModificationEvent) -> Result<i64, sqlx::Error> {
        let market_context = event.market_context.as_ref().map(|v| v.to_string());

        let result = sqlx::query(
            r#"
            INSERT INTO order_modification_events (
                user_id, chain_id, leg_type, exchange_order_id, event_type, modification_source,
                version, old_price, new_price, price_delta, price_delta_percent,
                position_quantity, position_entry_price, dollar_impact, impact_direction,
                modification_reason, decision_id, confidence, market_context, created_at_ms
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.user_id.as_str())
        .bind(&event.chain_id)
        .bind(event.leg_type.code())
        .bind(event.exchange_order_id)
        .bind(event.event_type.as_str())
        .bind(event.source.map(|s| s.as_str()))
        .bind(event.version)
        .bind(event.old_price.map(|p| p.to_canonical_string()))
        .bind(event.new_price.to_canonical_string())
        .bind(event.price_delta.map(|p| p.to_canonical_string()))
        .bind(event.price_delta_percent.map(|p| p.to_canonical_string()))
        .bind(event.position_quantity.to_canonical_string())
        .bind(event.position_entry_price.to_canonical_string())
        .bind(event.dollar_impact.to_canonical_string())
        .bind(event.impact_direction.as_str())
        .bind(&event.reason)
        .bind(event.decision_id.as_deref())
        .bind(event.confidence)
        .bind(market_context)
        .bind(event.created_at.as_ms())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn events(
        &self,
        user_id: &UserId,
        chain_id: &str,
        leg_type: LegType,
    ) -> Result<Vec<ModificationEvent>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {} FROM order_modification_events
            WHERE user_id = ? AND chain_id = ? AND leg_type = ?
            ORDER BY version ASC
            "#,
            EVENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.as_str())
            .bind(chain_id)
            .bind(leg_type.code())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().filter_map(event_from_row).collect())
    }

    async fn latest_version(
        &self,
        user_id: &UserId,
        chain_id: &str,
        leg_type: LegType,
    ) -> Result<i64, sqlx::Error> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(version), 0) AS latest
            FROM order_modification_events
            WHERE user_id = ? AND chain_id = ? AND leg_type = ?
            "#,
        )
        .bind(user_id.as_str())
        .bind(chain_id)
        .bind(leg_type.code())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("latest"))
    }

    async fn events_by_user(
        &self,
        user_id: &UserId,
        limit: i64,
    ) -> Result<Vec<ModificationEvent>, sqlx::Error> {
        let sql = format!(
            "SELECT {} FROM order_modification_events WHERE user_id = ? ORDER BY created_at_ms DESC, id DESC LIMIT ?",
            EVENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().filter_map(event_from_row).collect())
    }

    async fn events_by_source(
        &self,
        user_id: &UserId,
        source: ModificationSource,
        limit: i64,
    ) -> Result<Vec<ModificationEvent>, sqlx::Error> {
        let sql = format!(
            r#"
            SELECT {} FROM order_modification_events
            WHERE user_id = ? AND modification_source = ?
            ORDER BY created_at_ms DESC, id DESC
            LIMIT ?
            "#,
            EVENT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.as_str())
            .bind(source.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().filter_map(event_from_row).collect())
    }
}

/// Rows with an unknown leg or event type are skipped with a warning.
fn event_from_row(row: &SqliteRow) -> Option<ModificationEvent> {
    let id: i64 = row.get("id");
    let leg: String = row.get("leg_type");
    let event_type: String = row.get("event_type");

    let (Some(leg_type), Some(event_type)) =
        (LegType::from_code(&leg), ModificationEventType::parse(&event_type))
    else {
        warn!(id, leg = %leg, event_type = %event_type, "Skipping unreadable modification event");
        return None;
    };

    let source: Option<String> = row.get("modification_source");
    let direction: String = row.get("impact_direction");
    let market_context: Option<String> = row.get("market_context");

    Some(ModificationEvent {
        id: Some(id),
        user_id: UserId::new(row.get::<String, _>("user_id")),
        chain_id: row.get("chain_id"),
        leg_type,
        exchange_order_id: row.get("exchange_order_id"),
        event_type,
        source: source.as_deref().and_then(ModificationSource::parse),
        version: row.get("version"),
        old_price: opt_decimal_col(row, "old_price"),
        new_price: decimal_col(row, "new_price"),
        price_delta: opt_decimal_col(row, "price_delta"),
        price_delta_percent: opt_decimal_col(row, "price_delta_percent"),
        position_quantity: decimal_col(row, "position_quantity"),
        position_entry_price: decimal_col(row, "position_entry_price"),
        dollar_impact: decimal_col(row, "dollar_impact"),
        impact_direction: ImpactDirection::parse(&direction).unwrap_or(ImpactDirection::Initial),
        reason: row.get("modification_reason"),
        decision_id: row.get("decision_id"),
        confidence: row.get("confidence"),
        market_context: market_context.and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: TimeMs::new(row.get("created_at_ms")),
    })
}
