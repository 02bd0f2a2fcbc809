mod handlers;
mod metrics;
mod routes;

use axum::Router;
use gradebox_common::config::Config;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

const DEFAULT_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_MAX_SOURCE_BYTES: usize = 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub redis: ConnectionManager,
    pub result_ttl_secs: u64,
    /// Upper bound for submitted source and harness text
    pub max_source_bytes: usize,
}

#[tokio::main]
async fn main() {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false);

    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }

    info!("Gradebox API booting...");

    let config = Config::from_env();
    let redis_conn = config.connect().await.expect("Failed to connect to Redis");

    info!("Connected to Redis: {}", config.redis_url);

    let max_source_bytes = std::env::var("GRADEBOX_MAX_SOURCE_BYTES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_SOURCE_BYTES);

    let state = Arc::new(AppState {
        redis: redis_conn,
        result_ttl_secs: config.result_ttl_secs,
        max_source_bytes,
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let addr = std::env::var("GRADEBOX_API_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = TcpListener::bind(&addr).await.expect("Failed to bind to address");

    info!("HTTP server listening on {}", addr);
    info!(max_source_bytes, "Ready to accept submissions");

    axum::serve(listener, app).await.expect("Server error");
}
