pub mod config;
pub mod counter;
pub mod db;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod orders;
pub mod settlement;

pub use config::Config;
pub use db::{init_db, Repository};
pub use domain::{Decimal, PositionSide, Side, Symbol, TimeMs, UserId};
pub use error::AppError;
pub use exchange::{ClientFactory, ExchangeClient, ExchangeError};
pub use settlement::{
    RetryableSettlementService, Scheduler, SettlementMonitor, SettlementRunner, SettlementService,
};
