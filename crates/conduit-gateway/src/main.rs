use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

mod app;
mod http;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conduit_gateway=info,tower_http=debug".into()),
        )
        .init();

    let config_path = std::env::var("CONDUIT_CONFIG").ok();
    let config = conduit_core::config::ConduitConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!("config load failed ({}), using defaults", e);
        conduit_core::config::ConduitConfig::default()
    });

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(app::AppState::build(config)?);

    state.fleet.start_heartbeat_monitor(std::time::Duration::from_secs(15));
    state.tracker.spawn_sweeper(std::time::Duration::from_secs(60));

    let router = app::build_router(state);

    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    info!("conduit gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}
