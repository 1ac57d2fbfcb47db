use chain_event_indexer::{cache::SqliteCache, config::Config, db, AppState, Indexer};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting chain-event-indexer");

    let config = Config::from_env().load_descriptors()?;
    info!(
        "Configuration loaded: {} chains, {} indexes, polling every {}s",
        config.chains.len(),
        config.indexes.len(),
        config.polling_interval_secs
    );
    let tracked = config.tracked_environments();
    if tracked.is_empty() {
        warn!("No index references a configured chain, nothing will be scanned");
    } else {
        info!("Tracking environments: {}", tracked.join(", "));
    }

    let db_pool = db::connection::establish_connection(&config.database_url).await?;
    info!("Database connection established");

    let polling_interval = Duration::from_secs(config.polling_interval_secs);
    let durable_cache = SqliteCache::new(db_pool.clone());
    let state = Arc::new(AppState::new(config, db_pool));
    let indexer = Indexer::new(state);
    indexer.bootstrap();

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutdown signal received");
        signal_token.cancel();
    });

    let mut ticker = interval(polling_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let results = indexer.run_all().await;
                let failed = results.iter().filter(|r| r.is_err()).count();
                let events: usize = results.iter().flatten().map(|summary| summary.events).sum();
                info!("Scan round finished: {} units, {} events, {} failed", results.len(), events, failed);

                match durable_cache.purge_expired().await {
                    Ok(purged) if purged > 0 => debug!("Purged {} expired cache entries", purged),
                    Ok(_) => {}
                    Err(e) => warn!("Failed to purge expired cache entries: {}", e),
                }
            }
            _ = shutdown.cancelled() => {
                info!("Shutting down indexer");
                break;
            }
        }
    }

    Ok(())
}
