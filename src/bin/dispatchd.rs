//! dispatchd daemon.
//!
//! Wires the durable stores, the scheduling engine, the worker pool and
//! the HTTP API together, recovers persisted triggers, and serves until
//! interrupted.

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;

use dispatchd::api::routes::AppState;
use dispatchd::api::server::{self, HttpConfig};
use dispatchd::clock::SystemClock;
use dispatchd::config::Config;
use dispatchd::engine::workers::WorkerPool;
use dispatchd::engine::{EngineConfig, SchedulerEngine};
use dispatchd::executor::FireExecutor;
use dispatchd::publish::{LogPublisher, RecordPublisher, RetryPolicy, RetryingPublisher};
use dispatchd::service::JobService;
use dispatchd::store::{Database, JobStore, SqliteTenantRecords, TriggerStore};

#[derive(Parser, Debug)]
#[command(name = "dispatchd", version, about = "Timezone-aware tenant data dispatch scheduler")]
struct Args {
    /// Listen port (overrides API_PORT)
    #[arg(long)]
    port: Option<u16>,

    /// SQLite database path (overrides DATABASE_PATH)
    #[arg(long)]
    database: Option<std::path::PathBuf>,

    /// Kafka bootstrap servers (overrides KAFKA_BOOTSTRAP_SERVERS)
    #[arg(long)]
    brokers: Option<String>,

    /// Bus topic (overrides BUS_TOPIC)
    #[arg(long)]
    topic: Option<String>,

    /// Default IANA zone for requests that omit one (overrides DEFAULT_ZONE)
    #[arg(long)]
    default_zone: Option<String>,

    /// Worker pool size (overrides WORKER_COUNT)
    #[arg(long)]
    workers: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let mut config = Config::from_env().context("loading configuration")?;
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(database) = args.database {
        config.database.path = Some(database);
    }
    if let Some(brokers) = args.brokers {
        config.bus.brokers = Some(brokers);
    }
    if let Some(topic) = args.topic {
        config.bus.topic = topic;
    }
    if let Some(zone) = args.default_zone {
        config.scheduler.default_zone = zone;
    }
    if let Some(workers) = args.workers {
        config.scheduler.workers = workers;
    }
    config.validate().context("validating configuration")?;

    let db_path = config
        .database
        .path
        .clone()
        .unwrap_or_else(Database::default_path);
    tracing::info!(path = %db_path.display(), "opening job store");
    let db = Database::open(&db_path).context("opening database")?;

    let jobs = JobStore::new(db.clone());
    let triggers = TriggerStore::new(db.clone());
    let records = Arc::new(SqliteTenantRecords::new(db.clone()));
    let clock = Arc::new(SystemClock);

    let publisher = build_publisher(&config)?;

    let engine_config = EngineConfig {
        fire_channel_capacity: config.scheduler.queue_capacity,
        ..EngineConfig::default()
    };
    let (engine, fire_rx) = SchedulerEngine::new(engine_config, clock.clone(), triggers);
    let executor = Arc::new(FireExecutor::new(
        jobs.clone(),
        records,
        publisher,
        clock.clone(),
    ));
    let pool = WorkerPool::start(config.scheduler.workers, fire_rx, executor, engine.clone());

    let recovered = engine
        .rehydrate()
        .await
        .context("recovering persisted triggers")?;
    tracing::info!(recovered, "scheduler recovered from durable state");

    let service = Arc::new(JobService::new(
        db,
        jobs,
        engine.clone(),
        clock,
        config.scheduler.default_zone.clone(),
    ));

    let state = AppState {
        service,
        engine: engine.clone(),
        started_at: Instant::now(),
    };
    let http = HttpConfig {
        bind_address: config.api.host.clone(),
        port: config.api.port,
        ..HttpConfig::default()
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    };
    server::serve(&http, state, shutdown).await?;

    pool.shutdown();
    engine.shutdown();
    Ok(())
}

#[cfg(feature = "kafka")]
fn build_publisher(config: &Config) -> anyhow::Result<Arc<dyn RecordPublisher>> {
    use dispatchd::publish::KafkaPublisher;
    use std::time::Duration;

    match &config.bus.brokers {
        Some(brokers) => {
            tracing::info!(brokers = %brokers, topic = %config.bus.topic, "using kafka publisher");
            let kafka = KafkaPublisher::new(
                brokers,
                config.bus.topic.clone(),
                Duration::from_millis(config.bus.send_timeout_ms),
            )
            .context("initializing kafka producer")?;
            Ok(Arc::new(RetryingPublisher::new(
                kafka,
                RetryPolicy::default(),
            )))
        }
        None => {
            tracing::warn!("no brokers configured, publishing to the log backend");
            Ok(Arc::new(RetryingPublisher::new(
                LogPublisher,
                RetryPolicy::default(),
            )))
        }
    }
}

#[cfg(not(feature = "kafka"))]
fn build_publisher(config: &Config) -> anyhow::Result<Arc<dyn RecordPublisher>> {
    if config.bus.brokers.is_some() {
        tracing::warn!("built without the `kafka` feature; brokers setting ignored");
    }
    tracing::info!("publishing to the log backend");
    Ok(Arc::new(RetryingPublisher::new(
        LogPublisher,
        RetryPolicy::default(),
    )))
}
