//! Tripwire ingest daemon.
//!
//! Tails the sensor's event log and indexes every new record into
//! Elasticsearch, resuming from a persisted cursor after restarts.
//!
//! # Usage
//!
//! ```bash
//! tripwire-ingest --log-path ./logs/attacks.jsonl \
//!     --elasticsearch-url http://localhost:9200
//! ```
//!
//! # Graceful Shutdown
//!
//! On SIGINT/SIGTERM the pump finishes the record in flight, commits the
//! cursor at the last processed record, and exits.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use tripwire_core::metrics::{start_metrics_server, try_init_metrics};
use tripwire_core::{DEFAULT_ATTACK_INDEX, ElasticConfig, ElasticEngine};
use tripwire_ingest::{
    CursorStore, Indexer, IndexerConfig, LogTailer, Pump, PumpConfig, TailerConfig,
};

/// Tripwire ingest daemon.
#[derive(Parser, Debug)]
#[command(name = "tripwire-ingest")]
#[command(about = "Tail the attack event log into the search index")]
#[command(version)]
struct Args {
    /// Event log written by the sensor
    #[arg(long, env = "TRIPWIRE_LOG_PATH", default_value = "./logs/attacks.jsonl")]
    log_path: PathBuf,

    /// Cursor file (default: <log-path>.cursor)
    #[arg(long, env = "TRIPWIRE_CURSOR_PATH")]
    cursor_path: Option<PathBuf>,

    /// Elasticsearch base URL
    #[arg(long, env = "ELASTICSEARCH_URL", default_value = "http://localhost:9200")]
    elasticsearch_url: String,

    /// Elasticsearch basic-auth user
    #[arg(long, env = "ELASTICSEARCH_USERNAME")]
    elasticsearch_username: Option<String>,

    /// Elasticsearch basic-auth password
    #[arg(long, env = "ELASTICSEARCH_PASSWORD", hide_env_values = true)]
    elasticsearch_password: Option<String>,

    /// Target index
    #[arg(long, env = "TRIPWIRE_INDEX", default_value = DEFAULT_ATTACK_INDEX)]
    index: String,

    /// Seconds between pump cycles
    #[arg(long, env = "TRIPWIRE_POLL_SECS", default_value = "5")]
    poll_secs: u64,

    /// Timeout for a single upsert, in seconds
    #[arg(long, env = "TRIPWIRE_SUBMIT_TIMEOUT_SECS", default_value = "10")]
    submit_timeout_secs: u64,

    /// Upper bound on bytes read per cycle
    #[arg(long, env = "TRIPWIRE_MAX_BATCH_BYTES", default_value = "1048576")]
    max_batch_bytes: usize,

    /// Longest log line kept in memory; longer lines are skipped
    #[arg(long, env = "TRIPWIRE_MAX_LINE_BYTES", default_value = "4194304")]
    max_line_bytes: usize,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "TRIPWIRE_METRICS_PORT", default_value = "9091")]
    metrics_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tripwire_ingest=debug")),
        )
        .init();

    let args = Args::parse();

    tracing::info!("Tripwire ingest daemon starting...");

    if args.metrics_port > 0
        && let Some(handle) = try_init_metrics()
    {
        start_metrics_server(args.metrics_port, handle).await?;
    }

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        running_clone.store(false, Ordering::SeqCst);
    })
    .context("Failed to set Ctrl+C handler")?;

    let submit_timeout = Duration::from_secs(args.submit_timeout_secs.max(1));
    let engine = ElasticEngine::new(ElasticConfig {
        url: args.elasticsearch_url.clone(),
        timeout: submit_timeout,
        username: args.elasticsearch_username.clone(),
        password: args.elasticsearch_password.clone(),
    })
    .context("invalid Elasticsearch configuration")?;

    let store = match &args.cursor_path {
        Some(path) => CursorStore::new(path),
        None => CursorStore::for_log(&args.log_path),
    };

    let pump = Pump::new(
        LogTailer::new(TailerConfig {
            path: args.log_path.clone(),
            max_batch_bytes: args.max_batch_bytes,
            max_line_bytes: args.max_line_bytes,
        }),
        Indexer::new(
            engine,
            IndexerConfig {
                index: args.index.clone(),
                submit_timeout,
            },
        ),
        store,
        PumpConfig {
            poll_interval: Duration::from_secs(args.poll_secs.max(1)),
        },
        running,
    )
    .context("failed to load cursor")?;

    // Create the index up front when the engine is already up; otherwise the
    // first cycle that reaches it does.
    if pump.indexer().is_available().await {
        pump.indexer()
            .ensure_schema()
            .await
            .context("failed to create index")?;
    } else {
        tracing::warn!(
            url = %args.elasticsearch_url,
            "Elasticsearch unreachable at startup, will retry"
        );
    }

    pump.run().await?;

    let stats = pump.indexer().stats();
    tracing::info!(
        indexed = stats.indexed,
        failed = stats.failed,
        malformed = stats.malformed,
        "Tripwire ingest daemon stopped"
    );
    Ok(())
}
