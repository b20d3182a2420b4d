use clap::Parser;
use contentdb_api::{HttpExtractor, HttpHost, RestApi};
use contentdb_search::{SearchService, ServiceConfig, ZScoreRanker};
use contentdb_storage::StorageManager;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

/// Content-based image retrieval server
#[derive(Parser, Debug)]
#[command(name = "contentdb")]
#[command(about = "Relevance-feedback image search over feature ledgers", long_about = None)]
struct Args {
    /// Path to the data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// HTTP API port
    #[arg(long, default_value_t = 6333)]
    http_port: u16,

    /// Base URL of the host platform
    #[arg(long)]
    host_url: String,

    /// Base URL of the feature extraction service
    #[arg(long)]
    extractor_url: String,

    /// JSON service configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting ContentDB v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {:?}", args.data_dir);
    info!("HTTP API port: {}", args.http_port);

    let config = match &args.config {
        Some(path) => ServiceConfig::from_file(path)?,
        None => ServiceConfig::default(),
    };
    let registry = config.registry()?;
    info!(
        "Feature sets: {}",
        registry.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(", ")
    );

    let storage = Arc::new(StorageManager::new(&args.data_dir, registry)?);
    info!("Storage initialized with {} ledgers", storage.list_ledgers().len());

    let service = Arc::new(SearchService::new(
        storage,
        Arc::new(HttpHost::new(args.host_url.clone())),
        Arc::new(HttpExtractor::new(args.extractor_url.clone())),
        Arc::new(ZScoreRanker::new()),
        config,
    )?);
    info!("Host platform: {}", args.host_url);
    info!("Extraction service: {}", args.extractor_url);

    let http_port = args.http_port;
    let http_handle = std::thread::spawn(move || {
        info!("Starting HTTP server on port {}", http_port);
        let sys = actix_web::rt::System::new();
        sys.block_on(async {
            if let Err(e) = RestApi::start(service, http_port).await {
                error!("HTTP server error: {}", e);
            }
        })
    });

    info!("ContentDB started successfully");
    info!("HTTP API: http://localhost:{}/", args.http_port);

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        _ = tokio::task::spawn_blocking(move || {
            http_handle.join().ok();
        }) => {
            info!("HTTP server stopped");
        }
    }

    info!("Shutting down...");
    Ok(())
}
