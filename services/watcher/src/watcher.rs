//! Stream poll driver.
//!
//! A [`StreamWatcher`] owns one stream session and a single background worker.
//! The worker repeatedly waits on the [`PlaybackGate`], fetches the next media
//! chunk, demultiplexes it lazily and hands every frame to the sink fan-out.
//! Polls that yield no frames are followed by a constant backoff sleep.
//!
//! The worker ends on shutdown ([`StreamWatcher::stop`]) or on the first fatal
//! error. Either way the session produces exactly one [`SessionReport`].

use crate::config::{FailurePolicy, PollingConfig};
use crate::fanout::FanOut;
use crate::frame::{MediaChunk, ReadPosition, StreamSession};
use crate::gate::PlaybackGate;
use crate::sink::{DiagnosticSink, FrameError, FrameSink};
use crate::source::{ChunkSource, DemuxError, Demuxer, SourceError};
use backoff::backoff::{Backoff, Constant};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Errors raised by the watcher.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Initialization failed: {0}")]
    Init(String),

    #[error("Watcher already started")]
    AlreadyStarted,

    #[error("Stream read failed: {0}")]
    Source(#[from] SourceError),

    #[error("Demultiplexing failed: {0}")]
    Demux(#[from] DemuxError),

    #[error("Frame processing failed: {0}")]
    Frame(#[from] FrameError),
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    /// Shut down on request.
    Stopped,
    /// Ended by a fatal error.
    Failed { reason: String },
}

impl SessionStatus {
    /// Process exit status for this outcome: 0 when stopped, 1 when failed.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionStatus::Stopped => 0,
            SessionStatus::Failed { .. } => 1,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, SessionStatus::Failed { .. })
    }
}

/// Counters accumulated over one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub chunks_polled: u64,
    pub empty_polls: u64,
    pub frames_dispatched: u64,
    pub fragments_skipped: u64,
    pub sink_failures_skipped: u64,
}

/// Final outcome of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub stream: String,
    pub status: SessionStatus,
    pub stats: SessionStats,
}

/// Poll loop behavior.
#[derive(Debug, Clone)]
pub struct WatchPolicy {
    pub retry_interval: Duration,
    pub fragment_errors: FailurePolicy,
    pub sink_errors: FailurePolicy,
}

impl Default for WatchPolicy {
    fn default() -> Self {
        Self::from(&PollingConfig::default())
    }
}

impl From<&PollingConfig> for WatchPolicy {
    fn from(config: &PollingConfig) -> Self {
        Self {
            retry_interval: config.retry_interval(),
            fragment_errors: config.fragment_errors,
            sink_errors: config.sink_errors,
        }
    }
}

/// Builder for [`StreamWatcher`].
pub struct StreamWatcherBuilder {
    session: StreamSession,
    policy: WatchPolicy,
    source: Option<Arc<dyn ChunkSource>>,
    demuxer: Option<Arc<dyn Demuxer>>,
    sinks: Vec<Box<dyn FrameSink>>,
}

impl StreamWatcherBuilder {
    pub fn source(mut self, source: Arc<dyn ChunkSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn demuxer(mut self, demuxer: Arc<dyn Demuxer>) -> Self {
        self.demuxer = Some(demuxer);
        self
    }

    /// Append a sink. Sinks run in the order they are added, after the
    /// diagnostic sink.
    pub fn sink(mut self, sink: impl FrameSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn policy(mut self, policy: WatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Result<StreamWatcher, WatchError> {
        let source = self
            .source
            .ok_or_else(|| WatchError::Init("no chunk source configured".to_string()))?;
        let demuxer = self
            .demuxer
            .ok_or_else(|| WatchError::Init("no demuxer configured".to_string()))?;

        if self.policy.retry_interval.is_zero() {
            return Err(WatchError::Init("retry interval must be positive".to_string()));
        }

        let gate = PlaybackGate::new();
        let shutdown = CancellationToken::new();
        let (report_tx, report_rx) = watch::channel(None);

        let poll_loop = PollLoop {
            session: self.session.clone(),
            policy: self.policy,
            source,
            demuxer,
            dispatcher: build_dispatcher(self.sinks),
            gate: gate.clone(),
            shutdown: shutdown.clone(),
            stats: SessionStats::default(),
        };

        Ok(StreamWatcher {
            session: self.session,
            gate,
            shutdown,
            pending: Mutex::new(Some(poll_loop)),
            report_tx: Arc::new(report_tx),
            report_rx,
        })
    }
}

fn build_dispatcher(sinks: Vec<Box<dyn FrameSink>>) -> FanOut {
    let mut dispatcher = FanOut::new(Vec::with_capacity(sinks.len() + 1));
    dispatcher.push(Box::new(DiagnosticSink::default()));
    for sink in sinks {
        dispatcher.push(sink);
    }
    dispatcher
}

/// Drives one stream session on a background worker.
pub struct StreamWatcher {
    session: StreamSession,
    gate: PlaybackGate,
    shutdown: CancellationToken,
    pending: Mutex<Option<PollLoop>>,
    report_tx: Arc<watch::Sender<Option<SessionReport>>>,
    report_rx: watch::Receiver<Option<SessionReport>>,
}

impl StreamWatcher {
    pub fn builder(session: StreamSession) -> StreamWatcherBuilder {
        StreamWatcherBuilder {
            session,
            policy: WatchPolicy::default(),
            source: None,
            demuxer: None,
            sinks: Vec::new(),
        }
    }

    pub fn session(&self) -> &StreamSession {
        &self.session
    }

    /// Handle to the playback gate, for controllers living elsewhere.
    pub fn gate(&self) -> &PlaybackGate {
        &self.gate
    }

    /// Spawn the poll worker. The gate stays closed until [`begin`](Self::begin).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), WatchError> {
        let poll_loop = self.pending.lock().take().ok_or(WatchError::AlreadyStarted)?;

        info!(stream = %self.session, "Starting stream watcher");

        let report_tx = self.report_tx.clone();
        let gate = self.gate.clone();
        let stream = self.session.name().to_string();

        tokio::spawn(async move {
            let report = match tokio::spawn(poll_loop.run()).await {
                Ok(report) => report,
                Err(e) => {
                    gate.end();
                    error!(stream = %stream, error = %e, "Poll worker aborted");
                    SessionReport {
                        stream,
                        status: SessionStatus::Failed {
                            reason: format!("poll worker aborted: {}", e),
                        },
                        stats: SessionStats::default(),
                    }
                }
            };
            report_tx.send_replace(Some(report));
        });

        Ok(())
    }

    /// Open the playback gate.
    pub fn begin(&self) {
        info!(stream = %self.session, "Begin watching");
        self.gate.begin();
    }

    /// Close the playback gate. The worker pauses at its next iteration.
    pub fn end(&self) {
        info!(stream = %self.session, "End watching");
        self.gate.end();
    }

    /// Whether the session has produced its report.
    pub fn is_finished(&self) -> bool {
        self.report_rx.borrow().is_some()
    }

    /// Wait for the session to end.
    ///
    /// Does not return for a watcher that was never started until
    /// [`stop`](Self::stop) is called.
    pub async fn wait(&self) -> SessionReport {
        let mut rx = self.report_rx.clone();
        if let Ok(report) = rx.wait_for(Option::is_some).await {
            if let Some(report) = report.as_ref() {
                return report.clone();
            }
        }
        // The sender lives in `self`, so the channel cannot close while we wait.
        self.stopped_report()
    }

    /// Request shutdown and wait for the session to end.
    ///
    /// Safe to call after the session has already ended on its own.
    pub async fn stop(&self) -> SessionReport {
        info!(stream = %self.session, "Stopping stream watcher");
        self.shutdown.cancel();
        self.gate.end();

        if self.pending.lock().take().is_some() {
            let report = self.stopped_report();
            self.report_tx.send_if_modified(|current| {
                if current.is_none() {
                    *current = Some(report);
                    true
                } else {
                    false
                }
            });
        }

        self.wait().await
    }

    fn stopped_report(&self) -> SessionReport {
        SessionReport {
            stream: self.session.name().to_string(),
            status: SessionStatus::Stopped,
            stats: SessionStats::default(),
        }
    }
}

impl Drop for StreamWatcher {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.gate.end();
    }
}

/// The worker's state. Owned by exactly one task once started.
struct PollLoop {
    session: StreamSession,
    policy: WatchPolicy,
    source: Arc<dyn ChunkSource>,
    demuxer: Arc<dyn Demuxer>,
    dispatcher: FanOut,
    gate: PlaybackGate,
    shutdown: CancellationToken,
    stats: SessionStats,
}

impl PollLoop {
    async fn run(mut self) -> SessionReport {
        info!(
            stream = %self.session,
            sinks = ?self.dispatcher.sink_names(),
            "Poll worker started"
        );

        let status = match self.poll().await {
            Ok(()) => SessionStatus::Stopped,
            Err(e) => {
                error!(stream = %self.session, error = %e, "Stream session terminated");
                SessionStatus::Failed {
                    reason: e.to_string(),
                }
            }
        };

        self.gate.end();

        info!(
            stream = %self.session,
            chunks_polled = self.stats.chunks_polled,
            empty_polls = self.stats.empty_polls,
            frames_dispatched = self.stats.frames_dispatched,
            fragments_skipped = self.stats.fragments_skipped,
            sink_failures_skipped = self.stats.sink_failures_skipped,
            "Finished watching stream"
        );

        SessionReport {
            stream: self.session.name().to_string(),
            status,
            stats: self.stats,
        }
    }

    async fn poll(&mut self) -> Result<(), WatchError> {
        let mut position = self.session.start().clone();
        let mut retry = Constant::new(self.policy.retry_interval);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = self.gate.acquire() => {}
            }

            debug!(stream = %self.session, position = ?position, "Fetching media");
            let chunk = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                chunk = self.source.fetch(&self.session, &position) => chunk?,
            };
            self.stats.chunks_polled += 1;
            metrics::counter!("watcher.chunks.polled").increment(1);

            if self.drain(&chunk, &mut position).await? > 0 {
                continue;
            }

            self.stats.empty_polls += 1;
            let delay = retry.next_backoff().unwrap_or(self.policy.retry_interval);
            debug!(
                stream = %self.session,
                delay_secs = delay.as_secs(),
                "Nothing to read from stream, sleeping"
            );
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Dispatch every frame of `chunk`, returning how many were dispatched.
    async fn drain(
        &mut self,
        chunk: &MediaChunk,
        position: &mut ReadPosition,
    ) -> Result<u64, WatchError> {
        if chunk.is_empty() {
            return Ok(0);
        }

        let demuxer = self.demuxer.clone();
        let mut dispatched = 0;

        for item in demuxer.frames(chunk) {
            let frame = match item {
                Ok(frame) => frame,
                Err(e) if e.is_fragment_local() => match self.policy.fragment_errors {
                    FailurePolicy::Skip => {
                        warn!(stream = %self.session, error = %e, "Skipping malformed fragment");
                        self.stats.fragments_skipped += 1;
                        metrics::counter!("watcher.fragments.skipped").increment(1);
                        continue;
                    }
                    FailurePolicy::Terminate => return Err(e.into()),
                },
                Err(e) => return Err(e.into()),
            };

            if let Err(e) = self.dispatcher.process(&frame).await {
                match self.policy.sink_errors {
                    FailurePolicy::Skip => {
                        warn!(stream = %self.session, error = %e, "Frame not fully processed");
                        self.stats.sink_failures_skipped += 1;
                    }
                    FailurePolicy::Terminate => return Err(e.into()),
                }
            }

            dispatched += 1;
            self.stats.frames_dispatched += 1;
            metrics::counter!("watcher.frames.dispatched").increment(1);

            if let Some(token) = frame.continuation_token() {
                *position = ReadPosition::ContinuationToken(token.to_string());
            }
        }

        Ok(dispatched)
    }
}
