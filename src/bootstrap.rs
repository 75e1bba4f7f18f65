use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::audit::{AuditPublisher, EventSink, HttpSink, NullSink};
use crate::chains::{AdapterRegistry, CosmosAdapter, EvmAdapter};
use crate::config::Config;
use crate::error::AppResult;
use crate::monitor::registry::MonitorRegistry;
use crate::monitor::writer::StatusWriter;
use crate::monitor::MonitorSettings;
use crate::scheduler::RateLimitedScheduler;
use crate::store::postgres::PgTxStore;
use crate::store::watcher::{spawn_watcher, WatchSettings};
use crate::store::TxStore;

/// Wires every component together and runs the reconciler until the change
/// stream closes or the process is interrupted.
pub async fn run(config: Config) -> AppResult<()> {
    info!("Initializing reconciler components ...");

    let pool = initialize_database(&config.database_url).await?;
    let store: Arc<dyn TxStore> = Arc::new(PgTxStore::new(pool));

    // Replacer credential validation is fatal: a mismatched key must never
    // get a chance to sign anything.
    let evm = Arc::new(EvmAdapter::new(&config.evm, config.confirmation_needed)?);
    let _head_refresh = evm.spawn_head_refresh();
    info!("✅ EVM adapter initialized (chain id {})", config.evm.chain_id);

    let cosmos = Arc::new(CosmosAdapter::new(&config.cosmos));
    info!("✅ Cosmos adapter initialized");

    let adapters = Arc::new(AdapterRegistry::new(evm, cosmos));
    let scheduler = Arc::new(RateLimitedScheduler::new(config.fetch_interval));
    info!(
        "✅ Scheduler initialized ({}ms between upstream calls)",
        config.fetch_interval.as_millis()
    );

    let sink: Arc<dyn EventSink> = match config.audit.endpoint.clone() {
        Some(endpoint) => Arc::new(HttpSink::new(endpoint)),
        None => {
            if config.audit.enabled {
                warn!("AUDIT_ENABLED set without AUDIT_ENDPOINT, events will be dropped");
            }
            Arc::new(NullSink)
        }
    };
    let publisher = Arc::new(AuditPublisher::new(config.audit.clone(), sink));
    let writer = StatusWriter::new(store.clone(), publisher, scheduler.clone());

    let (change_tx, change_rx) = mpsc::channel(256);
    let _watcher = spawn_watcher(
        store,
        WatchSettings {
            statuses: config.watch_statuses.clone(),
            max_in_queue: config.max_tx_in_queue,
            poll_interval: config.watch_interval,
        },
        change_tx,
    );
    info!(
        "✅ Store watcher started (statuses: {:?}, every {}ms)",
        config.watch_statuses,
        config.watch_interval.as_millis()
    );

    let registry = MonitorRegistry::new(
        adapters,
        scheduler,
        writer,
        MonitorSettings::from_config(&config),
        config.monitor_mode,
    );
    info!("🚀 Reconciler running in {:?} mode", config.monitor_mode);

    registry.run(change_rx).await;
    info!("Reconciler shut down");
    Ok(())
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(database_url)
        .await?;

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await.map_err(sqlx::Error::from)?;

    info!("✓ Database initialized");
    Ok(pool)
}
