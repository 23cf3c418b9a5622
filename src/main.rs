//! Historian binary entry point.
//!
//! Loads and validates configuration, wires the acquisition pipeline, and
//! runs the worker loop until SIGINT/SIGTERM. Exits non-zero only on
//! unrecoverable startup errors.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use historian::{
    cache::TagCache,
    config::AppConfig,
    fanout::ChannelProducer,
    ingest::IngestionPipeline,
    sink::BatchSink,
    spool::Spool,
    storage::{self, MetadataRepository, SqlValueStore},
    subscription::{SimulatorTransport, SubscriptionManager},
    worker::Worker,
};

/// Capacity of the subscription → ingestion channel.
const SAMPLE_CHANNEL_CAPACITY: usize = 8192;

/// Historian - OPC UA data-acquisition worker
#[derive(Parser, Debug)]
#[command(name = "historian", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "configs/historian.yaml",
        env = "HISTORIAN_CONFIG"
    )]
    config: String,

    /// Storage connection string (overrides config file)
    #[arg(long, env = "HISTORIAN_DB_URL")]
    db_url: Option<String>,

    /// Use the synthetic subscription source (overrides config file)
    #[arg(long, env = "HISTORIAN_SIMULATOR")]
    simulator: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,historian=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Historian - OPC UA data-acquisition worker");

    let cli = Cli::parse();

    tracing::info!("Loading configuration from: {}", cli.config);
    let mut config = AppConfig::load(&cli.config)?;

    // CLI > ENV > config file
    if let Some(dsn) = cli.db_url {
        config.storage.connection_string = dsn;
    }
    if cli.simulator {
        config.opc.use_simulator = true;
    }

    if !config.opc.use_simulator {
        return Err(
            "no OPC UA transport is linked into this binary; set opc.use_simulator \
             or embed one via historian::subscription::OpcTransport"
                .into(),
        );
    }

    tracing::info!(
        store = %config.storage.connection_string,
        spool = %config.resilience.store_forward_path.display(),
        "Initializing storage"
    );

    let pool = storage::connect(&config.storage.connection_string).await?;
    storage::schema::init_schema(&pool).await?;

    let repository = Arc::new(MetadataRepository::new(pool.clone()));
    let cache = Arc::new(TagCache::new(Arc::clone(&repository)));
    let spool = Arc::new(Spool::new(
        &config.resilience.store_forward_path,
        config.resilience.max_local_storage_records,
    )?);
    let store = Arc::new(SqlValueStore::new(pool.clone()));

    let mut sink = BatchSink::new(store, spool)
        .with_auto_flush_threshold(config.batch.auto_flush_threshold)
        .with_max_chunk(config.batch.max_chunk);
    if config.event_bus.enabled {
        tracing::info!(
            capacity = config.event_bus.channel_capacity,
            "Event-bus fan-out enabled"
        );
        sink = sink.with_fanout(Arc::new(ChannelProducer::new(
            config.event_bus.channel_capacity,
        )));
    }
    let sink = Arc::new(sink);

    let pipeline = IngestionPipeline::new(cache, Arc::clone(&sink));

    let (tx, rx) = mpsc::channel(SAMPLE_CHANNEL_CAPACITY);
    let manager = Arc::new(SubscriptionManager::new(
        repository,
        Arc::new(SimulatorTransport::new()),
        config.monitoring_settings(),
        tx,
    ));

    let worker = Worker::new(
        manager,
        pipeline,
        Arc::clone(&sink),
        config.flush_interval(),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    tracing::info!("Press Ctrl+C to shutdown");
    worker.run(rx, shutdown).await?;

    pool.close().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Cancel the token on Ctrl+C or SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal");
        }
    }

    shutdown.cancel();
}
