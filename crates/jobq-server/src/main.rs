use clap::Parser;
use jobq_engine::Dispatcher;
use jobq_server::{api::create_rest_api, build_pool, ServerConfig};
use jobq_store::JobStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "jobqd")]
#[command(about = "Priority job dispatcher for slow worker backends", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "jobqd.yaml")]
    config: String,

    /// API host
    #[arg(long)]
    host: Option<String>,

    /// API port
    #[arg(long)]
    port: Option<u16>,

    /// Job store directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config_found = std::path::Path::new(&args.config).exists();
    let mut config = if config_found {
        ServerConfig::from_file(&args.config)?
    } else {
        ServerConfig::default()
    };

    // Override with CLI args
    if let Some(host) = args.host {
        config.api.host = host;
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(data_dir) = args.data_dir {
        config.store.data_dir = Some(data_dir);
    }
    let json_logs = args.json || config.monitoring.json_logs;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.monitoring.log_level)),
        )
        .with(json_logs.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer().with_target(false)))
        .init();

    if !config_found {
        tracing::warn!("Config file {} not found, using defaults", args.config);
    }
    tracing::info!("Starting jobqd with config: {:?}", config);

    let store = Arc::new(JobStore::open(config.to_store_config())?);
    let pool = build_pool(&config.workers)?;
    let dispatcher = Arc::new(Dispatcher::from_config(
        config.dispatcher.clone(),
        pool,
        store,
    )?);
    let scheduler = dispatcher.start();

    let app = create_rest_api(
        dispatcher.clone(),
        Duration::from_secs(config.api.max_wait_secs),
    );
    let addr = format!("{}:{}", config.api.host, config.api.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("REST API listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let grace = Duration::from_secs(config.api.shutdown_grace_secs);
    if !dispatcher.shutdown(grace).await {
        tracing::warn!("Exiting with attempts still in flight; they resume on next start");
    }
    scheduler.await?;

    tracing::info!("jobqd stopped");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => {
            tracing::error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
