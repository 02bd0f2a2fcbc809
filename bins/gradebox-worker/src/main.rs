mod artifacts;
mod config;
mod normalizer;
mod orchestrator;
mod sandbox;
mod workspace;
mod worker;


use config::WorkerConfig;
use orchestrator::Orchestrator;
use sandbox::DockerSandbox;
use tokio::signal;
use tracing::{error, info, warn};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var("LOG_FORMAT").map(|v| v == "json").unwrap_or(false) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!("Gradebox worker booting...");

    let config = WorkerConfig::load_default().map_err(|e| {
        error!("Failed to load worker configuration: {}", e);
        e
    })?;

    info!(
        image = %config.sandbox.image,
        workspace_root = %config.paths.workspace_root.display(),
        bind_root = %config.paths.bind_root.display(),
        content_root = %config.paths.content_root.display(),
        "Worker configured"
    );

    let sandbox = DockerSandbox::new(&config)?;
    let orchestrator = Orchestrator::new(Box::new(sandbox), config.clone());

    let shared = gradebox_common::config::Config::from_env();
    let mut redis_conn = shared.connect().await?;
    info!("Connected to Redis: {}", shared.redis_url);

    // Setup graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install CTRL+C signal handler");
            std::future::pending::<()>().await;
        }
        warn!("Received shutdown signal, stopping...");
    };

    tokio::select! {
        result = worker::worker_loop(&mut redis_conn, &orchestrator, &config, shared.result_ttl_secs) => {
            result?;
        },
        _ = shutdown => {},
    }

    info!("Worker shutdown complete");
    Ok(())
}
