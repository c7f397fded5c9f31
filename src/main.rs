use anyhow::Context;
use ledgerkeeper::processor::ProcessorClient;
use ledgerkeeper::{
    api, config::Config, db::init_db, BatchRunner, EventStore, HttpProcessorClient,
    PeriodicScheduler, ReconciliationService, Repository, TracingSink,
};
use std::net::SocketAddr;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let config = Config::from_env().context("Configuration error")?;
    let port = config.port;

    let pool = init_db(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    let repo = Repository::new(pool);

    let processor: Option<Arc<dyn ProcessorClient>> = match &config.processor_api_url {
        Some(url) => Some(Arc::new(HttpProcessorClient::new(
            url.clone(),
            config.processor_api_key.clone(),
        ))),
        None => {
            tracing::info!("No processor API configured; external balance checks are skipped");
            None
        }
    };

    let sink = Arc::new(TracingSink);
    let service = Arc::new(ReconciliationService::new(
        repo.clone(),
        config.reconcile_settings(),
        processor,
        sink.clone(),
    ));
    let runner = BatchRunner::new(service, sink);

    let scheduler = PeriodicScheduler::new(
        runner.clone(),
        EventStore::new(repo.clone()),
        config.reconcile_interval,
        config.cleanup_interval,
        config.event_retention_days,
        config.auto_correct_enabled,
    );
    let scheduler_task = tokio::spawn(scheduler.clone().start());

    let app = api::create_router(api::AppState::new(Arc::new(repo), config, runner));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        })
        .await
        .context("Server error")?;

    tracing::info!("Shutting down scheduler");
    scheduler.stop();
    scheduler_task.await.context("Scheduler task panicked")?;
    Ok(())
}
