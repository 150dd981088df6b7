use modeledger::exchange::UnconfiguredClientFactory;
use modeledger::settlement::SettlementFailure;
use modeledger::{
    config::Config, db::init_db, AppError, ClientFactory, Repository, RetryableSettlementService,
    Scheduler, SettlementMonitor, SettlementRunner, SettlementService,
};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    if let Err(e) = run().await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let config = Config::from_env()?;

    let pool = init_db(&config.database_path).await?;
    let repo = Arc::new(Repository::new(pool));

    // The exchange client is supplied by the embedding deployment.
    let clients: Arc<dyn ClientFactory> = Arc::new(UnconfiguredClientFactory);

    let service = Arc::new(SettlementService::new(
        repo.clone(),
        clients,
        config.validation(),
    ));
    let retrying = RetryableSettlementService::new(service, repo.clone(), config.retry())
        .with_failure_callback(Arc::new(|failure: &SettlementFailure| {
            tracing::warn!(phase = %failure.phase, "Settlement attempt failed: {}", failure);
        }));
    let runner: Arc<dyn SettlementRunner> = Arc::new(retrying);

    let scheduler = Scheduler::new(repo.clone(), runner, config.scheduler());
    let monitor = SettlementMonitor::new(repo, None, config.monitor());

    scheduler.start()?;
    monitor.start()?;
    tracing::info!(
        default_timezone = %config.default_timezone.name(),
        "Settlement daemon running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    scheduler.stop().await?;
    monitor.stop().await?;
    Ok(())
}
