mod config;
mod identity;
mod ingest;
mod probe;
mod reading;
mod scheduler;
mod sensor_cache;
mod system_metrics;
mod token;

use crate::config::{Config, Overrides};
use crate::identity::HostIdentity;
use crate::ingest::IngestClient;
use crate::reading::ReadingAssembler;
use crate::scheduler::{BatchScheduler, StreamStats};
use crate::sensor_cache::SensorCache;
use crate::system_metrics::SystemMetrics;
use crate::token::TokenSource;
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const EXIT_OK: i32 = 0;
const EXIT_STARTUP_FAILURE: i32 = 1;
const EXIT_RUNTIME_FAILURE: i32 = 2;

#[derive(Debug, Parser)]
#[command(
    name = "thermal-forwarder",
    about = "Streams environmental sensor rows from this host to a cloud ingest pipe"
)]
struct Cli {
    /// Path to the JSON configuration document.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Readings per batch; overrides the config file.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Seconds between batches; overrides the config file.
    #[arg(long)]
    interval: Option<f64>,

    /// Use the fast intra-batch pacing profile (50 ms between readings).
    #[arg(long)]
    fast: bool,

    /// Enable debug logging.
    #[arg(long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) -> Result<()> {
    let default_filter = if verbose {
        "debug,thermal_forwarder=debug"
    } else {
        "info,thermal_forwarder=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut terminate) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = terminate.recv() => {}
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "SIGTERM handler unavailable");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("shutdown signal received");
        cancel.cancel();
    });
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    if let Err(err) = init_tracing(cli.verbose) {
        eprintln!("failed to initialize logging: {err}");
        return EXIT_STARTUP_FAILURE;
    }

    let overrides = Overrides {
        batch_size: cli.batch_size,
        interval_seconds: cli.interval,
        fast: cli.fast,
    };
    let config = match Config::load(&cli.config, overrides) {
        Ok(config) => config,
        Err(err) => {
            tracing::error!("invalid configuration: {err:#}");
            return EXIT_STARTUP_FAILURE;
        }
    };
    tracing::info!(
        channel = %config.channel_name,
        batch_size = config.batch_size,
        interval_s = config.interval_seconds,
        fast = config.fast,
        "starting thermal forwarder"
    );

    let identity = HostIdentity::resolve();

    let cache = match SensorCache::start(
        probe::default_probes(),
        config.sensor_refresh(),
        config.sensor_stale_after(),
    ) {
        Ok(cache) => Arc::new(cache),
        Err(err) => {
            tracing::error!("failed to start sensor cache: {err:#}");
            return EXIT_STARTUP_FAILURE;
        }
    };
    let metrics = Arc::new(SystemMetrics::new(config.system_refresh()));

    let http = match ingest::build_http_client() {
        Ok(http) => http,
        Err(err) => {
            tracing::error!("failed to build HTTP client: {err:#}");
            cache.shutdown();
            return EXIT_STARTUP_FAILURE;
        }
    };
    let token = match TokenSource::from_config(&config, http.clone()) {
        Ok(token) => token,
        Err(err) => {
            tracing::error!("failed to initialize credentials: {err:#}");
            cache.shutdown();
            return EXIT_STARTUP_FAILURE;
        }
    };

    let client = match IngestClient::connect(&config, token, http).await {
        Ok(client) => client,
        Err(err) => {
            tracing::error!(error = %err, "failed to establish streaming channel");
            cache.shutdown();
            return EXIT_STARTUP_FAILURE;
        }
    };

    let assembler = ReadingAssembler::new(cache.clone(), metrics, identity);
    let stats = Arc::new(StreamStats::new());
    let stale_cache = cache.clone();
    let mut scheduler = BatchScheduler::new(
        assembler,
        client,
        stats,
        config.batch_size,
        config.interval(),
        config.intra_batch_delay(),
        Box::new(move || stale_cache.stale()),
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let result = scheduler.run(cancel.clone()).await;

    scheduler.shutdown().await;
    cache.shutdown();

    match result {
        Ok(()) => {
            tracing::info!("shutdown complete");
            EXIT_OK
        }
        Err(err) => {
            tracing::error!(error = %err, "exiting after fatal runtime failure");
            EXIT_RUNTIME_FAILURE
        }
    }
}
