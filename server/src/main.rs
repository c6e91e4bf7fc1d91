use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tunnel_broker::{router, AppState, Config, InternalClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let client = Arc::new(InternalClient::new(&config.api_url)?);
    let state = AppState::new(config.broker(), client.hooks(), client.clone());
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    info!("🚇 Tunnel Broker listening on {}", config.listen);

    axum::serve(listener, app).await?;
    Ok(())
}
