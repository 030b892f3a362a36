//! Kinesis Video Streams chunk source.
//!
//! One `GetMedia` response body stays open across fetches. Each fetch returns
//! the fragments completed since the previous one, so chunks are contiguous
//! and fragment-aligned. A new `GetMedia` call is made from the caller's read
//! position only after the body ends or fails.

use crate::config::StreamConfig;
use crate::frame::{MediaChunk, ReadPosition, StreamSession};
use crate::source::{ChunkSource, SourceError};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_kinesisvideo::error::DisplayErrorContext;
use aws_sdk_kinesisvideo::types::ApiName;
use aws_sdk_kinesisvideo::Client as ControlClient;
use aws_sdk_kinesisvideomedia::config::Builder as MediaConfigBuilder;
use aws_sdk_kinesisvideomedia::primitives::{ByteStream, DateTime};
use aws_sdk_kinesisvideomedia::types::{StartSelector, StartSelectorType};
use aws_sdk_kinesisvideomedia::Client as MediaClient;
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

/// Errors raised while setting up the Kinesis client.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("GetDataEndpoint for stream {stream} failed after {attempts} attempts: {message}")]
    Unavailable {
        stream: String,
        attempts: u32,
        message: String,
    },

    #[error("GetDataEndpoint for stream {0} returned no endpoint")]
    Missing(String),
}

/// Chunk source reading one stream through `GetMedia`.
pub struct KinesisChunkSource {
    client: MediaClient,
    read_timeout: Duration,
    max_chunk_bytes: usize,
    reader: Mutex<Option<FragmentReader>>,
}

impl KinesisChunkSource {
    /// Resolve the media endpoint for the configured stream and build a client.
    pub async fn connect(config: &StreamConfig) -> Result<Self, EndpointError> {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let endpoint = match config.endpoint_url {
            Some(ref endpoint_url) => {
                info!(endpoint = %endpoint_url, "Using pre-defined Kinesis Video endpoint");
                endpoint_url.clone()
            }
            None => {
                let control = ControlClient::new(&sdk_config);
                resolve_endpoint(&control, &config.name, config.endpoint_attempts).await?
            }
        };

        let media_config = MediaConfigBuilder::from(&sdk_config)
            .endpoint_url(&endpoint)
            .build();

        info!(
            stream = %config.name,
            region = %config.region,
            endpoint = %endpoint,
            "Kinesis Video media client initialized"
        );

        Ok(Self {
            client: MediaClient::from_conf(media_config),
            read_timeout: config.read_timeout(),
            max_chunk_bytes: config.max_chunk_bytes,
            reader: Mutex::new(None),
        })
    }

    /// Wrap an already configured media client.
    pub fn from_client(client: MediaClient, read_timeout: Duration, max_chunk_bytes: usize) -> Self {
        Self {
            client,
            read_timeout,
            max_chunk_bytes,
            reader: Mutex::new(None),
        }
    }
}

async fn resolve_endpoint(
    control: &ControlClient,
    stream: &str,
    max_attempts: u32,
) -> Result<String, EndpointError> {
    let mut backoff = ExponentialBackoff {
        max_elapsed_time: None,
        ..Default::default()
    };
    let mut attempts = 0u32;

    loop {
        let result = control
            .get_data_endpoint()
            .stream_name(stream)
            .api_name(ApiName::GetMedia)
            .send()
            .await;

        match result {
            Ok(output) => {
                let endpoint = output
                    .data_endpoint()
                    .ok_or_else(|| EndpointError::Missing(stream.to_string()))?;
                debug!(stream = %stream, endpoint = %endpoint, "Resolved GetMedia endpoint");
                return Ok(endpoint.to_string());
            }
            Err(e) => {
                attempts += 1;
                let message = DisplayErrorContext(&e).to_string();

                if attempts >= max_attempts.max(1) {
                    error!(stream = %stream, attempts = attempts, error = %message, "Could not resolve GetMedia endpoint");
                    return Err(EndpointError::Unavailable {
                        stream: stream.to_string(),
                        attempts,
                        message,
                    });
                }

                if let Some(delay) = backoff.next_backoff() {
                    warn!(
                        stream = %stream,
                        attempt = attempts,
                        delay_ms = delay.as_millis(),
                        error = %message,
                        "GetDataEndpoint failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                } else {
                    backoff.reset();
                }
            }
        }
    }
}

/// Map a read position onto a `GetMedia` start selector.
pub fn start_selector(position: &ReadPosition) -> Result<StartSelector, SourceError> {
    let builder = StartSelector::builder();
    let builder = match position {
        ReadPosition::Now => builder.start_selector_type(StartSelectorType::Now),
        ReadPosition::Earliest => builder.start_selector_type(StartSelectorType::Earliest),
        ReadPosition::FragmentNumber(number) => builder
            .start_selector_type(StartSelectorType::FragmentNumber)
            .after_fragment_number(number),
        ReadPosition::ProducerTimestamp(at) => builder
            .start_selector_type(StartSelectorType::ProducerTimestamp)
            .start_timestamp(DateTime::from_millis(at.timestamp_millis())),
        ReadPosition::ServerTimestamp(at) => builder
            .start_selector_type(StartSelectorType::ServerTimestamp)
            .start_timestamp(DateTime::from_millis(at.timestamp_millis())),
        ReadPosition::ContinuationToken(token) => builder
            .start_selector_type(StartSelectorType::ContinuationToken)
            .continuation_token(token),
    };

    builder
        .build()
        .map_err(|e| SourceError::InvalidPosition(e.to_string()))
}

/// Start of every fragment `GetMedia` emits: the EBML header element ID.
const FRAGMENT_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];

/// Body of an open `GetMedia` response.
#[async_trait]
pub trait MediaPayload: Send {
    /// Next piece of the body, or `None` once the service closes it.
    async fn next_bytes(&mut self) -> Option<Result<Bytes, SourceError>>;
}

#[async_trait]
impl MediaPayload for ByteStream {
    async fn next_bytes(&mut self) -> Option<Result<Bytes, SourceError>> {
        self.next()
            .await
            .map(|read| read.map_err(|e| SourceError::Transport(e.to_string())))
    }
}

/// Offset of the last fragment start in `buf[from..]`, ignoring offset 0.
fn last_fragment_start(buf: &[u8], from: usize) -> Option<usize> {
    let from = from.max(1);
    let last = buf.len().checked_sub(FRAGMENT_MAGIC.len())?;
    (from..=last)
        .rev()
        .find(|&i| buf[i..].starts_with(&FRAGMENT_MAGIC))
}

/// Cuts an open `GetMedia` body into chunks of whole fragments.
///
/// Bytes after the last fragment start are held back until the next fragment
/// begins or the body ends, so consecutive chunks are contiguous and never
/// overlap.
pub struct FragmentReader {
    payload: Box<dyn MediaPayload>,
    pending: BytesMut,
    finished: bool,
}

impl FragmentReader {
    pub fn new(payload: Box<dyn MediaPayload>) -> Self {
        Self {
            payload,
            pending: BytesMut::new(),
            finished: false,
        }
    }

    /// Whether the body has ended or failed. A finished reader yields nothing more.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Read until at least one fragment is complete.
    ///
    /// Returns an empty chunk when no data arrives within `read_timeout`; the
    /// partial fragment stays buffered. A single fragment growing past
    /// `max_bytes` is flushed as is.
    pub async fn next_chunk(
        &mut self,
        read_timeout: Duration,
        max_bytes: usize,
    ) -> Result<MediaChunk, SourceError> {
        loop {
            let read = match tokio::time::timeout(read_timeout, self.payload.next_bytes()).await {
                Ok(read) => read,
                Err(_) => {
                    debug!(held_bytes = self.pending.len(), "No media within read timeout");
                    return Ok(MediaChunk::empty());
                }
            };

            match read {
                None => {
                    self.finished = true;
                    return Ok(MediaChunk::new(self.pending.split().freeze()));
                }
                Some(Err(e)) => {
                    self.finished = true;
                    self.pending.clear();
                    return Err(e);
                }
                Some(Ok(bytes)) => {
                    // A fragment start may straddle the previous read.
                    let from = self.pending.len().saturating_sub(FRAGMENT_MAGIC.len() - 1);
                    self.pending.extend_from_slice(&bytes);

                    if let Some(end) = last_fragment_start(&self.pending, from) {
                        return Ok(MediaChunk::new(self.pending.split_to(end).freeze()));
                    }

                    if self.pending.len() >= max_bytes {
                        warn!(
                            size_bytes = self.pending.len(),
                            "Fragment exceeds chunk size ceiling, flushing it incomplete"
                        );
                        return Ok(MediaChunk::new(self.pending.split().freeze()));
                    }
                }
            }
        }
    }
}

impl KinesisChunkSource {
    async fn open(
        &self,
        session: &StreamSession,
        position: &ReadPosition,
    ) -> Result<ByteStream, SourceError> {
        let selector = start_selector(position)?;
        info!(position = ?position, "Opening GetMedia stream");

        let output = self
            .client
            .get_media()
            .stream_name(session.name())
            .start_selector(selector)
            .send()
            .await
            .map_err(|e| SourceError::Transport(DisplayErrorContext(&e).to_string()))?;

        Ok(output.payload)
    }
}

#[async_trait]
impl ChunkSource for KinesisChunkSource {
    /// `position` is only used to open a new `GetMedia` stream. While a body
    /// is open, chunks continue from where the previous one ended.
    #[instrument(skip(self, session), fields(stream = %session.name()))]
    async fn fetch(
        &self,
        session: &StreamSession,
        position: &ReadPosition,
    ) -> Result<MediaChunk, SourceError> {
        let mut slot = self.reader.lock().await;

        let mut reader = match slot.take() {
            Some(reader) => reader,
            None => FragmentReader::new(Box::new(self.open(session, position).await?)),
        };

        let chunk = reader
            .next_chunk(self.read_timeout, self.max_chunk_bytes)
            .await?;

        if reader.is_finished() {
            debug!("GetMedia stream ended, next fetch reconnects");
        } else {
            *slot = Some(reader);
        }

        debug!(size_bytes = chunk.len(), "GetMedia chunk received");
        Ok(chunk)
    }
}
