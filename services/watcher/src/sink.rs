//! Frame sinks: consumers invoked once per decoded frame.

use crate::frame::DecodedFrame;
use crate::persister::DecodeError;
use crate::s3_uploader::StoreError;
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

/// Errors a sink can raise while processing a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Could not save frame: {0}")]
    Upload(#[from] StoreError),

    #[error("Sink {sink} failed: {reason}")]
    Sink { sink: String, reason: String },
}

/// One consumer of decoded frames.
#[async_trait]
pub trait FrameSink: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Handle one frame. The frame must not be retained past this call.
    async fn process(&mut self, frame: &DecodedFrame) -> Result<(), FrameError>;
}

/// Sink that records frame and fragment descriptions in the log.
///
/// Performs no fallible work, so it never prevents later sinks from running.
pub struct DiagnosticSink {
    name: String,
}

impl DiagnosticSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    fn log_frame(&self, frame: &DecodedFrame) {
        let fragment = frame.fragment.as_deref();
        debug!(
            sink = %self.name,
            track = frame.track.track_number,
            codec = %frame.track.codec_id,
            size_bytes = frame.data.len(),
            key_frame = frame.key_frame,
            timecode = frame.timecode,
            fragment = fragment.map(|f| f.fragment_number.as_str()),
            millis_behind_now = fragment.and_then(|f| f.millis_behind_now),
            tags = fragment.map(|f| f.tags.len()).unwrap_or(0),
            "Frame received"
        );
    }
}

impl Default for DiagnosticSink {
    fn default() -> Self {
        Self::new("diagnostic")
    }
}

#[async_trait]
impl FrameSink for DiagnosticSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&mut self, frame: &DecodedFrame) -> Result<(), FrameError> {
        self.log_frame(frame);
        Ok(())
    }
}
