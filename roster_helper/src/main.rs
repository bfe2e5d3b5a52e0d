use anyhow::Result;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use roster_helper::daemon::{self, DaemonOptions, DEFAULT_STATUS_INTERVAL};
use shared_utils::config::Config;
use shared_utils::logging::init_logging_from_config;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the configuration file
    #[clap(short, long, value_name = "FILE", default_value_os_t = Config::default_path())]
    config: PathBuf,

    /// Log level (trace|debug|info|warn|error); overrides the config file
    #[clap(short, long)]
    log_level: Option<String>,

    /// Override Prometheus listen address (e.g. 0.0.0.0:9100)
    #[clap(long)]
    metrics_listen: Option<String>,

    /// Enable or disable metrics exporter via CLI
    #[clap(long)]
    metrics_enabled: Option<bool>,

    /// Use an in-memory device instead of touching the kernel
    #[clap(long)]
    dry_run: bool,

    /// Write a JSON status snapshot here and keep it current
    #[clap(long, value_name = "FILE")]
    status_file: Option<PathBuf>,

    /// Seconds between status snapshot rewrites
    #[clap(long, value_name = "SECS", default_value_t = DEFAULT_STATUS_INTERVAL.as_secs())]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logging is configured from the file, so load it first.
    let config = Config::load(&args.config)?;

    let _guard = init_logging_from_config(&config, args.log_level.as_deref());
    info!("Starting wgroster helper");
    debug!(config = %args.config.display(), dry_run = args.dry_run);

    let metrics_enabled = args.metrics_enabled.unwrap_or(config.metrics.enabled);
    let metrics_listen = args
        .metrics_listen
        .clone()
        .unwrap_or_else(|| config.metrics.listen_addr.clone());

    if metrics_enabled {
        let listen_addr: SocketAddr = metrics_listen
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid metrics listen address: {}", e))?;
        PrometheusBuilder::new()
            .with_http_listener(listen_addr)
            .install()
            .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;
        info!("Prometheus metrics endpoint listening on {}", listen_addr);
    }

    let options = DaemonOptions {
        dry_run: args.dry_run,
        status_file: args.status_file,
        status_interval: Duration::from_secs(args.status_interval.max(1)),
    };

    if let Err(err) = daemon::run(config, options).await {
        error!("Helper terminated with error: {:#}", err);
        return Err(err);
    }
    Ok(())
}
