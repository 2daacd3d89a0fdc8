//! # Herald Server
//!
//! Pushes messages to named subscribers over server-sent events.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! herald
//!
//! # Run with environment overrides
//! HERALD_PORT=8181 HERALD_HOST=0.0.0.0 herald
//!
//! # Subscribe, then deliver from another terminal
//! curl -N http://127.0.0.1:8181/handshake/alice
//! curl -X POST --data 'hello' http://127.0.0.1:8181/message/alice
//! ```

mod config;
mod handlers;
mod metrics;
mod stream;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_server=debug,herald_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Herald server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
