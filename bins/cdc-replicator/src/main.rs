//! # cdc-replicator - Pipeline Orchestrator
//!
//! Loads a YAML pipeline configuration, wires a producer and a sink per
//! configured stream through the transformation engine, and runs the
//! pipeline until a shutdown signal or a fatal stream error.
//!
//! ## Usage
//!
//! ```bash
//! cdc-replicator --config replicator.yaml
//! cdc-replicator --config replicator.yaml --channel-capacity 1000
//! RUST_LOG=debug cdc-replicator --config replicator.yaml --fail-on-stream-error
//! ```
//!
//! ## Startup order
//!
//! position store ready -> producers created and loaded from the position
//! store -> sinks created and connected -> `start` called on every producer
//! -> admin/metrics server bound. Shutdown is the reverse: cancel producers,
//! drain the dispatch loop up to a deadline, flush final positions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use cdc_core::{
    EventRx, EventTx, PositionConfig, PositionStore, Producer, ReplicatorConfig, Sink, SourceConfig, StreamConfig,
    TargetConfig,
};
use cdc_io::position_mongo::MongoPositionStore;
use cdc_io::sink_document::DocumentStoreSink;
use cdc_io::sink_kafka::KafkaSink;
use cdc_io::sink_relational::RelationalSink;
use cdc_io::sink_search::SearchIndexSink;
use cdc_io::sink_stdout::StdoutSink;
use cdc_io::source_changefeed::ChangeFeedProducer;
use cdc_io::source_changestream::ChangeStreamProducer;
use cdc_io::source_kafka::KafkaProducer;
use cdc_tx::TransformEngine;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::{
    signal,
    sync::{mpsc, RwLock},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "cdc-replicator")]
#[command(about = "Change-data-capture replicator pipeline runner")]
struct Args {
    /// Path to the pipeline YAML/JSON configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Bounded-channel capacity between each producer and its dispatch loop.
    #[arg(long, default_value_t = cdc_core::DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,

    /// Exit with a non-zero status if any stream's producer fails.
    /// Otherwise a single stream's failure is logged and the remaining
    /// streams keep running.
    #[arg(long, default_value_t = false)]
    fail_on_stream_error: bool,
}

struct AdminState {
    prometheus: metrics_exporter_prometheus::PrometheusHandle,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = ReplicatorConfig::load(&args.config).context("loading pipeline configuration")?;
    config.validate_streams().context("validating stream configuration")?;

    init_logging(&config.logging);

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("installing prometheus metrics recorder")?;

    let position_store = build_position_store(&config.position).await?;
    position_store.health_check().await.context("position store health check")?;

    let cancel = CancellationToken::new();
    let mut stream_errors = false;
    let mut handles = Vec::new();

    for stream in config.streams.iter().filter(|s| s.enabled) {
        let stream = stream.clone();
        let position_store = position_store.clone();
        let cancel = cancel.clone();
        let channel_capacity = args.channel_capacity;

        match run_stream(stream, position_store, channel_capacity, cancel).await {
            Ok(stream_handles) => handles.extend(stream_handles),
            Err(e) => {
                error!(error = %e, "failed to start stream");
                stream_errors = true;
            }
        }
    }

    if stream_errors && args.fail_on_stream_error {
        cancel.cancel();
        for handle in handles {
            let _ = handle.await;
        }
        anyhow::bail!("one or more streams failed to start");
    }

    let admin = build_admin_router(prometheus);
    let listener = tokio::net::TcpListener::bind((config.server.host.as_str(), config.server.port))
        .await
        .context("binding admin/metrics server")?;
    info!(host = %config.server.host, port = config.server.port, "admin server listening");
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, admin)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
        }
        _ = wait_all(&mut handles) => {
            warn!("all stream tasks exited on their own");
        }
    }

    cancel.cancel();
    let drained = tokio::time::timeout(SHUTDOWN_DRAIN, wait_all(&mut handles)).await;
    if drained.is_err() {
        warn!("shutdown drain deadline exceeded, some tasks may still be running");
    }
    let _ = server_handle.await;

    Ok(())
}

async fn wait_all(handles: &mut Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles.drain(..) {
        if let Err(e) = handle.await {
            error!(error = %e, "stream task panicked");
        }
    }
}

fn init_logging(logging: &cdc_core::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(logging.level.clone()));
    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn build_position_store(config: &PositionConfig) -> Result<Arc<dyn PositionStore>> {
    match config {
        PositionConfig::File { directory, enable_backup, backup_count } => {
            Ok(Arc::new(cdc_core::FilePositionStore::new(directory, *enable_backup, *backup_count)))
        }
        PositionConfig::Mongo { uri, database, collection } => {
            let store = MongoPositionStore::connect(uri, database, collection)
                .await
                .context("connecting mongo position store")?;
            Ok(Arc::new(store))
        }
    }
}

fn build_producer(stream_name: &str, source: &SourceConfig) -> Result<Box<dyn Producer>> {
    match source {
        SourceConfig::Binlog { .. } => {
            anyhow::bail!(
                "stream {stream_name:?}: binlog source requires a concrete BinlogStream transport to be wired in by the deployment"
            )
        }
        SourceConfig::ChangeStream { uri, database, collection } => Ok(Box::new(ChangeStreamProducer::new(
            stream_name,
            uri.clone(),
            database.clone(),
            collection.clone(),
        ))),
        SourceConfig::Kafka { host, port, options } => {
            let brokers = format!("{host}:{port}");
            let group_id = options.get("group_id").cloned().unwrap_or_else(|| format!("{stream_name}-group"));
            let topic = options.get("topic").cloned().unwrap_or_else(|| stream_name.to_string());
            Ok(Box::new(KafkaProducer::new(stream_name, brokers, group_id, topic)))
        }
        SourceConfig::ChangeFeed { uri, database, .. } => {
            Ok(Box::new(ChangeFeedProducer::new(stream_name, uri.clone(), database.clone())))
        }
    }
}

async fn build_sink(stream_name: &str, target: &TargetConfig) -> Result<Box<dyn Sink>> {
    match target {
        TargetConfig::Kafka { host, port } => {
            let brokers = format!("{host}:{port}");
            let sink = KafkaSink::new(stream_name, &brokers, format!("{stream_name}-out"))
                .map_err(|e| anyhow::anyhow!(e))?;
            Ok(Box::new(sink))
        }
        TargetConfig::SearchIndex { uri } => Ok(Box::new(SearchIndexSink::new(stream_name, uri.clone(), stream_name, false))),
        TargetConfig::DocumentStore { uri, database } => {
            let sink = DocumentStoreSink::connect(stream_name, uri, database, stream_name)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            Ok(Box::new(sink))
        }
        TargetConfig::Relational { host, port, database, username, password } => {
            let uri = format!("postgres://{username}:{password}@{host}:{port}/{database}");
            let sink = RelationalSink::connect(stream_name, stream_name, &uri)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            Ok(Box::new(sink))
        }
        TargetConfig::Stdout => Ok(Box::new(StdoutSink::new(stream_name))),
    }
}

async fn run_stream(
    stream: StreamConfig,
    position_store: Arc<dyn PositionStore>,
    channel_capacity: usize,
    cancel: CancellationToken,
) -> Result<Vec<tokio::task::JoinHandle<()>>> {
    let mut producer = build_producer(&stream.name, &stream.source)?;
    let sink = build_sink(&stream.name, &stream.target).await?;

    if let Ok((position, _metadata)) = position_store.load(&stream.name).await {
        producer.set_checkpoint(position);
    }

    let engine = if stream.transformation.enabled {
        Arc::new(TransformEngine::with_rules(stream.transformation.rules.clone())?)
    } else {
        Arc::new(TransformEngine::new())
    };

    let (tx, rx): (EventTx, EventRx) = mpsc::channel(channel_capacity);
    let mut handles = Vec::new();

    // Shared behind a lock rather than moved into the spawned task below so
    // the flush ticker can keep reading `checkpoint()` for the stream's
    // lifetime; `start` only holds the write lock as long as it takes to
    // spawn its own ingestion task (the binlog producer is the one
    // exception, see `source_binlog.rs`).
    let producer = Arc::new(RwLock::new(producer));

    let producer_cancel = cancel.child_token();
    let stream_name = stream.name.clone();
    let start_producer = producer.clone();
    let producer_handle = tokio::spawn(async move {
        if let Err(e) = start_producer.write().await.start(tx, producer_cancel).await {
            error!(stream = %stream_name, error = %e, "producer terminated with an error");
        }
    });
    handles.push(producer_handle);

    let flush_cancel = cancel.child_token();
    let flush_producer = producer.clone();
    let flush_store = position_store.clone();
    let flush_name = stream.name.clone();
    let flush_interval = Duration::from_millis(stream.update_interval_ms);
    let flush_handle = tokio::spawn(flush_position_loop(flush_producer, flush_store, flush_name, flush_interval, flush_cancel));
    handles.push(flush_handle);

    let dispatch_cancel = cancel.child_token();
    let stream_name = stream.name.clone();
    let dispatch_handle = tokio::spawn(dispatch_loop(rx, sink, engine, stream_name, dispatch_cancel));
    handles.push(dispatch_handle);

    Ok(handles)
}

/// Saves the producer's current cursor to the position store every
/// `interval`, and once more after cancellation so the final position
/// isn't lost to the flush cadence.
async fn flush_position_loop(
    producer: Arc<RwLock<Box<dyn Producer>>>,
    position_store: Arc<dyn PositionStore>,
    stream_name: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // first tick fires immediately; nothing to flush yet

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                flush_checkpoint(&producer, &position_store, &stream_name).await;
            }
        }
    }
    flush_checkpoint(&producer, &position_store, &stream_name).await;
}

async fn flush_checkpoint(producer: &Arc<RwLock<Box<dyn Producer>>>, position_store: &Arc<dyn PositionStore>, stream_name: &str) {
    let Some(position) = producer.read().await.checkpoint() else { return };
    if let Err(e) = position_store.save(stream_name, &position, HashMap::new()).await {
        warn!(stream = %stream_name, error = %e, "failed to flush position");
    }
}

async fn dispatch_loop(
    mut rx: EventRx,
    sink: Box<dyn Sink>,
    engine: Arc<TransformEngine>,
    stream_name: String,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                let result = engine.transform(event).await;
                if !result.success {
                    warn!(stream = %stream_name, errors = ?result.errors, "transform reported errors for event");
                }
                if let Err(e) = sink.write_event(&result.event).await {
                    error!(stream = %stream_name, sink = sink.name(), error = %e, "sink write failed");
                }
                metrics::counter!("cdc_records_sent_total", "stream" => stream_name.clone()).increment(1);
            }
        }
    }
    let _ = sink.close().await;
}

async fn metrics_handler(State(state): State<Arc<AdminState>>) -> String {
    state.prometheus.render()
}

async fn health_handler() -> &'static str {
    "ok"
}

fn build_admin_router(prometheus: metrics_exporter_prometheus::PrometheusHandle) -> Router {
    let state = Arc::new(AdminState { prometheus });
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}
