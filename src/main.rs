use clap::Parser;
use pdfpress::api::{self, AppState};
use pdfpress::config::{Limits, QualityPreset};
use pdfpress::gs::Ghostscript;
use pdfpress::jobs::JobManager;
use pdfpress::metrics::MetricsCollector;
use pdfpress::upload::UploadManager;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info, Level};

#[derive(Parser, Debug)]
#[command(name = "pdfpress")]
#[command(about = "Chunked-upload PDF compression service")]
struct Args {
    /// Server port
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Maximum total artifact size in bytes
    #[arg(long, default_value_t = pdfpress::config::MAX_TOTAL_SIZE)]
    max_total_size: u64,

    /// Maximum size of a single chunk in bytes
    #[arg(long, default_value_t = pdfpress::config::MAX_CHUNK_SIZE)]
    max_chunk_size: usize,

    /// Maximum number of chunks per upload
    #[arg(long, default_value_t = pdfpress::config::MAX_CHUNK_COUNT)]
    max_chunk_count: u32,

    /// Default quality preset when the client does not pick one
    #[arg(short, long, value_enum, default_value_t = QualityPreset::Medium)]
    quality: QualityPreset,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    info!("pdfpress - PDF compression service");
    info!(
        "Limits: total {} bytes, chunk {} bytes, {} chunks max",
        args.max_total_size, args.max_chunk_size, args.max_chunk_count
    );
    info!("Default quality: {}", args.quality.as_str());

    let limits = Limits {
        max_total_size: args.max_total_size,
        max_chunk_size: args.max_chunk_size,
        max_chunk_count: args.max_chunk_count,
        default_quality: args.quality,
    };

    let metrics = Arc::new(MetricsCollector::new());
    let uploads = Arc::new(UploadManager::new(limits));
    let jobs = Arc::new(JobManager::new(Arc::new(Ghostscript), metrics.clone()));

    // Bound the lifetime of abandoned sessions and unclaimed jobs
    uploads.clone().start_sweeper();
    jobs.clone().start_sweeper();

    let app = api::routes(AppState {
        uploads: uploads.clone(),
        jobs: jobs.clone(),
        metrics,
    })
    .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    info!("Server listening on {}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("Server error: {}", e);
    }

    // Release every scratch directory still on the books before exit.
    info!("Shutting down, purging session and job registries...");
    uploads.purge_all();
    jobs.purge_all();
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to create SIGINT handler");
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to create SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down gracefully...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down gracefully...");
    }
}
