mod audit;
mod bootstrap;
mod chains;
mod config;
mod error;
mod monitor;
mod scheduler;
mod store;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,monitor=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("🚀 Starting transaction status reconciler");

    dotenv::dotenv().ok();
    let config = config::Config::from_env()?;

    bootstrap::run(config).await?;

    Ok(())
}
