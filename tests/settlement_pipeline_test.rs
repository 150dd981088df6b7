//! Settlement against a mock exchange and a real SQLite store, across consecutive days.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use modeledger::db::init_db;
use modeledger::exchange::{
    ExchangeOrder, ExchangePosition, ExchangeTrade, MockCall, MockClientFactory, MockExchange,
};
use modeledger::settlement::{
    ModeKey, SettlementError, SettlementService, SettlementStatus, ValidationConfig,
};
use modeledger::{Decimal, ExchangeError, PositionSide, Repository, Side, Symbol, TimeMs, UserId};
use std::str::FromStr;
use std::sync::Arc;
use tempfile::TempDir;

const KOLKATA: &str = "Asia/Kolkata";

fn d(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

fn jan(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 1, day).unwrap()
}

fn at(dt: DateTime<Utc>) -> TimeMs {
    TimeMs::from_datetime(&dt)
}

fn swing_position(unrealized: &str) -> ExchangePosition {
    ExchangePosition {
        symbol: Symbol::new("BTCUSDT"),
        position_side: PositionSide::Long,
        position_amt: d("0.2"),
        entry_price: d("40000"),
        mark_price: d("41750"),
        unrealized_profit: d(unrealized),
        leverage: 10,
        margin_type: "cross".to_string(),
    }
}

fn order(order_id: i64, symbol: &str, side: PositionSide, coid: &str, time: TimeMs) -> ExchangeOrder {
    ExchangeOrder {
        order_id,
        client_order_id: coid.to_string(),
        symbol: Symbol::new(symbol),
        side: Side::Sell,
        position_side: side,
        status: "FILLED".to_string(),
        time,
    }
}

fn trade(id: i64, order_id: i64, symbol: &str, pnl: &str, quote: &str, time: TimeMs) -> ExchangeTrade {
    ExchangeTrade {
        id,
        order_id,
        symbol: Symbol::new(symbol),
        side: Side::Sell,
        position_side: PositionSide::Both,
        price: d("100"),
        qty: d("1"),
        quote_qty: d(quote),
        realized_pnl: d(pnl),
        commission: d("0.1"),
        time,
    }
}

async fn setup(mock: Arc<MockExchange>) -> (Arc<Repository>, SettlementService, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir
        .path()
        .join("test.db")
        .to_string_lossy()
        .to_string();
    let pool = init_db(&db_path).await.expect("init_db failed");
    let repo = Arc::new(Repository::new(pool));
    let clients = Arc::new(MockClientFactory::new().with_default(mock));
    let service = SettlementService::new(repo.clone(), clients, ValidationConfig::default());
    (repo, service, temp_dir)
}

#[tokio::test]
async fn test_two_day_settlement_with_overnight_position() {
    let user = UserId::new("user-1");
    // 06:00 UTC on Jan 15 is 11:30 local, well inside the Kolkata day
    let mid_day = at(Utc.with_ymd_and_hms(2026, 1, 15, 6, 0, 0).unwrap());
    // 20:00 UTC on Jan 15 is already Jan 16 locally
    let after_midnight = at(Utc.with_ymd_and_hms(2026, 1, 15, 20, 0, 0).unwrap());

    let mock = Arc::new(
        MockExchange::new()
            .with_position(swing_position("200"))
            .with_open_order(order(1, "BTCUSDT", PositionSide::Long, "SWI-13JAN-00001-SL", mid_day))
            .with_order(order(10, "ETHUSDT", PositionSide::Both, "SCA-15JAN-00001-TP1", mid_day))
            .with_order(order(11, "ETHUSDT", PositionSide::Both, "SCA-15JAN-00002-SL", mid_day))
            .with_order(order(12, "ETHUSDT", PositionSide::Both, "SCA-15JAN-00003-TP1", mid_day))
            .with_order(order(13, "SOLUSDT", PositionSide::Both, "web_abc", mid_day))
            .with_trades(vec![
                trade(1, 10, "ETHUSDT", "100", "1000", mid_day),
                trade(2, 11, "ETHUSDT", "-40", "500", mid_day),
                trade(3, 12, "ETHUSDT", "25", "300", mid_day),
                trade(4, 13, "SOLUSDT", "-10", "200", mid_day),
                trade(5, 10, "ETHUSDT", "999", "1", after_midnight),
            ]),
    );
    let (repo, service, _temp) = setup(mock.clone()).await;

    // Jan 14: no trades, swing position carried with +200
    let first = service.run_daily_settlement(&user, jan(14), KOLKATA).await.unwrap();
    assert_eq!(first.snapshot.position_count, 1);
    assert_eq!(first.snapshot.snapshots[0].mode, ModeKey::Swing);
    assert_eq!(first.aggregation.total_trades, 0);

    // Jan 15: swing unrealized rises to +350, scalp and unknown trades close
    mock.set_positions(vec![swing_position("350")]);
    let result = service.run_daily_settlement(&user, jan(15), KOLKATA).await.unwrap();
    assert_eq!(result.aggregation.total_trades, 4);
    assert_eq!(result.aggregation.total_pnl, d("75"));

    let stored = repo.daily_mode_summaries(&user, jan(15)).await.unwrap();
    let by_mode = |mode: ModeKey| stored.iter().find(|s| s.mode == mode).unwrap();

    let scalp = by_mode(ModeKey::Scalp);
    assert_eq!(scalp.trade_count, 3);
    assert_eq!(scalp.win_count, 2);
    assert_eq!(scalp.loss_count, 1);
    assert_eq!(scalp.realized_pnl, d("85"));
    assert_eq!(scalp.total_volume, d("1800"));
    assert_eq!(scalp.settlement_status, SettlementStatus::Completed);

    let unknown = by_mode(ModeKey::Unknown);
    assert_eq!(unknown.realized_pnl, d("-10"));

    let swing = by_mode(ModeKey::Swing);
    assert_eq!(swing.trade_count, 0);
    assert_eq!(swing.unrealized_pnl, d("350"));
    assert_eq!(swing.unrealized_pnl_change, d("150"));
    assert_eq!(swing.total_pnl, d("150"));

    let all = by_mode(ModeKey::All);
    assert_eq!(all.realized_pnl, d("75"));
    assert_eq!(all.unrealized_pnl_change, d("150"));
    assert_eq!(all.total_pnl, d("225"));
    assert_eq!(all.user_timezone, KOLKATA);

    // Rerunning the same day overwrites rather than duplicates
    service.run_daily_settlement(&user, jan(15), KOLKATA).await.unwrap();
    let rerun = repo.daily_mode_summaries(&user, jan(15)).await.unwrap();
    assert_eq!(rerun.len(), stored.len());
}

#[tokio::test]
async fn test_entry_fill_and_exit_settle_together() {
    let user = UserId::new("user-1");
    let mid_day = at(Utc.with_ymd_and_hms(2026, 1, 15, 6, 0, 0).unwrap());
    let mock = Arc::new(
        MockExchange::new()
            .with_order(order(10, "BTCUSDT", PositionSide::Both, "SWI-14JAN-00003-TP1", mid_day))
            .with_order(order(11, "ETHUSDT", PositionSide::Both, "SCA-15JAN-00001-E", mid_day))
            .with_trades(vec![
                trade(1, 10, "BTCUSDT", "50", "400", mid_day),
                trade(2, 11, "ETHUSDT", "0", "100", mid_day),
            ]),
    );
    let (repo, service, _temp) = setup(mock).await;

    let result = service
        .run_daily_settlement(&user, jan(15), KOLKATA)
        .await
        .unwrap();
    assert!(result.rejected.is_empty());

    let stored = repo.daily_mode_summaries(&user, jan(15)).await.unwrap();
    let by_mode = |mode: ModeKey| stored.iter().find(|s| s.mode == mode).unwrap();

    let swing = by_mode(ModeKey::Swing);
    assert_eq!(swing.settlement_status, SettlementStatus::Completed);
    assert_eq!(swing.realized_pnl, d("50"));

    // The entry fill realizes nothing and counts as neither a win nor a loss
    let scalp = by_mode(ModeKey::Scalp);
    assert_eq!(scalp.settlement_status, SettlementStatus::Completed);
    assert_eq!(scalp.trade_count, 1);
    assert_eq!(scalp.win_count + scalp.loss_count, 0);

    let all = by_mode(ModeKey::All);
    assert_eq!(all.settlement_status, SettlementStatus::Completed);
    assert_eq!(all.trade_count, 2);
    assert_eq!(all.realized_pnl, d("50"));
}

#[tokio::test]
async fn test_snapshot_failure_stops_pipeline() {
    let user = UserId::new("user-1");
    let mock = Arc::new(MockExchange::new().failing(
        MockCall::Positions,
        ExchangeError::HttpError {
            status: 503,
            message: "Service Unavailable".to_string(),
        },
    ));
    let (repo, service, _temp) = setup(mock.clone()).await;

    let err = service
        .run_daily_settlement(&user, jan(15), KOLKATA)
        .await
        .unwrap_err();
    assert!(matches!(err, SettlementError::Snapshot(_)));
    assert!(err.to_string().contains("snapshot"));
    assert_eq!(mock.calls(MockCall::TradesAllSymbols), 0);
    assert!(repo.daily_mode_summaries(&user, jan(15)).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_quiet_day_still_writes_all_row() {
    let user = UserId::new("user-1");
    let (repo, service, _temp) = setup(Arc::new(MockExchange::new())).await;

    let result = service.run_daily_settlement(&user, jan(15), "UTC").await.unwrap();
    assert_eq!(result.summaries.len(), 1);
    assert_eq!(result.summaries[0].mode, ModeKey::All);

    let stored = repo.daily_mode_summaries(&user, jan(15)).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].total_pnl, Decimal::zero());
}
