use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::config::{FloodgateConfig, LogFormat, LoggingConfig};
use floodgate::pipeline::{RequestPipeline, UpstreamForwarder};
use floodgate::proxy::HttpServer;
use floodgate::ratelimit::{ClientWindowStore, RateLimiter};

/// Command-line arguments. Flags override values from the config file.
#[derive(Parser, Debug)]
#[command(name = "floodgate", version)]
#[command(about = "Per-client rate limiting reverse proxy")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Upstream base URL admitted requests are forwarded to
    #[arg(short, long)]
    upstream: Option<String>,

    /// Max requests per client per window (< 1 disables limiting)
    #[arg(long, allow_negative_numbers = true)]
    request_limit: Option<i64>,

    /// Window length in seconds (< 1 disables limiting)
    #[arg(long, allow_negative_numbers = true)]
    time_window_seconds: Option<i64>,
}

impl Args {
    fn apply(&self, config: &mut FloodgateConfig) {
        if let Some(listen) = self.listen {
            config.server.listen_addr = listen;
        }
        if let Some(ref upstream) = self.upstream {
            config.server.upstream_url = upstream.clone();
        }
        if let Some(limit) = self.request_limit {
            config.rate_limiting.request_limit = limit;
        }
        if let Some(window) = self.time_window_seconds {
            config.rate_limiting.time_window_seconds = window;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match args.config {
        Some(ref path) => FloodgateConfig::from_file(path)?,
        None => FloodgateConfig::default(),
    };
    args.apply(&mut config);

    init_tracing(&config.logging);

    info!("Starting Floodgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Shared per-client history, owned here and handed to the limiter
    let store = Arc::new(ClientWindowStore::new());
    let limiter = RateLimiter::from_config(&config.rate_limiting, Arc::clone(&store));

    let evictor = match limiter.quota() {
        Some(quota) => {
            info!(
                limit = quota.max_requests(),
                window_secs = quota.window().as_secs(),
                missing_client = ?limiter.missing_client_policy(),
                "Rate limiting enabled"
            );
            config.rate_limiting.eviction_interval().map(|every| {
                ClientWindowStore::spawn_evictor(Arc::clone(&store), quota.window(), every)
            })
        }
        None => {
            warn!(
                request_limit = config.rate_limiting.request_limit,
                time_window_seconds = config.rate_limiting.time_window_seconds,
                "Rate limiting disabled; RequestLimit and TimeWindowSeconds must both be at least 1"
            );
            None
        }
    };

    let forwarder = UpstreamForwarder::new(
        config.server.upstream_url.as_str(),
        config.server.upstream_timeout(),
    )?;
    info!(upstream = %forwarder.base_url(), "Forwarding admitted requests");

    let pipeline = RequestPipeline::new(Arc::new(limiter), Arc::new(forwarder));
    let server = HttpServer::new(config.server.listen_addr, pipeline)
        .with_max_body_bytes(config.server.max_body_bytes);

    info!("Starting HTTP server on {}", config.server.listen_addr);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(evictor) = evictor {
        evictor.abort();
    }

    info!("Floodgate stopped");
    Ok(())
}

/// Initialize tracing. `RUST_LOG` takes precedence over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
