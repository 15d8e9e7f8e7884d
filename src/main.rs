use anyhow::{Context, Result};
use axum::Router;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use log_collector::collect::{JobManager, JobParams, JobResults, Pipeline, PipelineOptions};
use log_collector::fs::FileServiceSelector;
use log_collector::storage::Catalog;
use log_collector::utils::{self, config::Config};
use log_collector::{api, web};

#[derive(Parser, Debug)]
#[command(name = "log-collector", version, about = "Collects, filters and packages log files")]
struct Args {
    /// Locations and patterns file, overrides the configured one
    #[arg(long, env = "LOG_COLLECTOR_CATALOG_PATH")]
    catalog: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Serve the HTTP and WebSocket API (default)
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
    /// Run one job described by a JSON file and print its summary
    Run { job: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    utils::logging::init_tracing();

    let args = Args::parse();
    let mut config = Config::load()?;
    if let Some(path) = args.catalog {
        config.catalog_path = path;
    }

    info!("Starting log-collector v{}", env!("CARGO_PKG_VERSION"));
    info!("CPU cores available: {}", num_cpus::get());

    match args.command {
        Some(Cmd::Run { job }) => run_once(config, job).await,
        Some(Cmd::Serve { port }) => {
            if let Some(port) = port {
                config.port = port;
            }
            serve(config).await
        }
        None => serve(config).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    let catalog = match Catalog::load(&config.catalog_path) {
        Ok(catalog) => catalog,
        Err(e) => {
            warn!("{:#}. Starting with an empty catalog", e);
            Catalog::default()
        }
    };
    let catalog = Arc::new(catalog);
    let manager = JobManager::new(&config, catalog.clone(), catalog);

    let app = Router::new()
        .nest("/api", api::routes())
        .nest("/ws", web::websocket::routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(manager);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped gracefully");
    Ok(())
}

async fn run_once(config: Config, job: PathBuf) -> Result<()> {
    let raw = tokio::fs::read_to_string(&job)
        .await
        .with_context(|| format!("Failed to read job file {}", job.display()))?;
    let params: JobParams = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid job file {}", job.display()))?;

    let catalog = Arc::new(Catalog::load(&config.catalog_path)?);
    let pipeline = Pipeline::new(
        catalog.clone(),
        catalog,
        Arc::new(FileServiceSelector::with_timeout(config.remote_timeout())),
        JobResults::new(config.max_results),
        PipelineOptions::from_config(&config),
    );

    // Ctrl+C drains the job instead of killing it
    let results = pipeline.results().clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        results.request_stop();
    });

    let summary = tokio::task::spawn_blocking(move || pipeline.run_job(&params)).await??;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
