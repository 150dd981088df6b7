use crate::config::ConfigError;
use crate::settlement::{MonitorError, SchedulerError};
use thiserror::Error;

/// Failures while bringing the service up or down.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),
    #[error("Signal handling error: {0}")]
    Signal(#[from] std::io::Error),
}
