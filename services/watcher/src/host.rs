//! Process wiring: logging, configuration, AWS clients and signal handling.
//!
//! The container demultiplexer and the video codec are supplied by the
//! embedding binary; everything else is built from [`WatcherConfig`].

use crate::config::{LoggingConfig, WatcherConfig};
use crate::frame::StreamSession;
use crate::kinesis::KinesisChunkSource;
use crate::persister::{FrameDecoder, SamplingPersister};
use crate::s3_uploader::{BlobStore, S3BlobStore};
use crate::source::{ChunkSource, Demuxer};
use crate::watcher::{SessionReport, StreamWatcher, WatchError, WatchPolicy};
use anyhow::Context;
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Load configuration from files, falling back to the environment, and validate it.
pub fn load_config() -> anyhow::Result<WatcherConfig> {
    let config = WatcherConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        WatcherConfig::from_env()
    })?;

    config.validate()?;
    Ok(config)
}

/// Initialize the tracing/logging subsystem.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("film_watcher={}", level).parse()?)
        .add_directive("aws_config=warn".parse()?)
        .add_directive("aws_smithy_runtime=warn".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(fmt::layer().json()).try_init()?;
    } else {
        subscriber.with(fmt::layer().pretty()).try_init()?;
    }

    Ok(())
}

/// Assemble a watcher from already constructed collaborators.
///
/// The sampling persister is the only sink added here; the diagnostic sink is
/// always inserted ahead of it.
pub fn assemble(
    config: &WatcherConfig,
    source: Arc<dyn ChunkSource>,
    demuxer: Arc<dyn Demuxer>,
    decoder: Arc<dyn FrameDecoder>,
    store: Arc<dyn BlobStore>,
) -> Result<StreamWatcher, WatchError> {
    let session = StreamSession::new(
        config.stream.name.clone(),
        config.stream.region.clone(),
        config.stream.start.into(),
    );

    let persister = SamplingPersister::new(
        config.sampling.every_nth(),
        config.sampling.bucket.clone(),
        &config.sampling.folder_prefix,
        decoder,
        store,
    )
    .with_jpeg_quality(config.sampling.jpeg_quality);

    info!(
        stream = %session,
        bucket = %config.sampling.bucket,
        folder = %persister.folder(),
        every_nth = config.sampling.save_nth_frame,
        "Sampling persister configured"
    );

    StreamWatcher::builder(session)
        .source(source)
        .demuxer(demuxer)
        .sink(persister)
        .policy(WatchPolicy::from(&config.polling))
        .build()
}

/// Build a watcher backed by Kinesis Video Streams and S3.
pub async fn build_watcher(
    config: &WatcherConfig,
    demuxer: Arc<dyn Demuxer>,
    decoder: Arc<dyn FrameDecoder>,
) -> anyhow::Result<StreamWatcher> {
    let source = KinesisChunkSource::connect(&config.stream)
        .await
        .context("Failed to connect to Kinesis Video stream")?;
    let store = S3BlobStore::new(&config.sampling, &config.stream.region).await;

    assemble(
        config,
        Arc::new(source),
        demuxer,
        decoder,
        Arc::new(store),
    )
    .context("Failed to assemble stream watcher")
}

/// Run `watcher` until it ends on its own or `shutdown` resolves.
pub async fn supervise<F>(
    watcher: &StreamWatcher,
    begin_on_start: bool,
    shutdown: F,
) -> anyhow::Result<SessionReport>
where
    F: Future<Output = ()>,
{
    watcher.start().context("Failed to start stream watcher")?;
    if begin_on_start {
        watcher.begin();
    }

    let report = tokio::select! {
        report = watcher.wait() => report,
        _ = shutdown => {
            info!("Initiating graceful shutdown...");
            watcher.stop().await
        }
    };

    info!(
        stream = %report.stream,
        status = ?report.status,
        frames_dispatched = report.stats.frames_dispatched,
        "Watcher finished"
    );

    Ok(report)
}

/// Build and run a watcher until a termination signal arrives.
///
/// The report's [`exit_code`](crate::watcher::SessionStatus::exit_code) is the
/// status the host process should exit with.
pub async fn run(
    config: WatcherConfig,
    demuxer: Arc<dyn Demuxer>,
    decoder: Arc<dyn FrameDecoder>,
) -> anyhow::Result<SessionReport> {
    info!(
        service = "film-watcher",
        version = env!("CARGO_PKG_VERSION"),
        stream = %config.stream.name,
        "Starting stream watcher service"
    );

    let watcher = build_watcher(&config, demuxer, decoder).await?;
    supervise(&watcher, config.polling.begin_on_start, shutdown_signal()).await
}

/// Resolve when the process receives Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Received shutdown signal");
}
