//! HTTP server entry point. Tracing init, config load, store connection,
//! and router assembly follow `tinyzkp_api::main()`'s shape: logging first,
//! then config, then the long-lived collaborators, then the router.

use std::sync::Arc;

use privhouse::clock::SystemClock;
use privhouse::metrics::install_prometheus;
use privhouse::noise::CryptoNoiseSource;
use privhouse::store::PgStore;
use privhouse::{http, AppContext, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "privhouse=info,tower_http=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    tracing::info!("starting privhouse server");

    let config = Config::from_env()?;
    let store = PgStore::connect(&config.database_url, config.database_max_connections).await?;
    store.ensure_schema().await?;

    let metrics = install_prometheus()?;

    let ctx = AppContext::new(
        store,
        Arc::new(SystemClock),
        Arc::new(CryptoNoiseSource),
        metrics,
        Arc::new(config.clone()),
    );

    let addr = config.server_addr;
    let app = http::build_router(ctx);

    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
