//! Interfaces the poll driver reads the stream through.
//!
//! The chunk source talks to the remote service; the demultiplexer turns a
//! chunk into frames. Neither is implemented by the core beyond the Kinesis
//! chunk source in [`crate::kinesis`].

use crate::frame::{DecodedFrame, MediaChunk, ReadPosition, StreamSession};
use async_trait::async_trait;
use thiserror::Error;

/// Errors reaching the remote stream. Always fatal for the session.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid read position: {0}")]
    InvalidPosition(String),
}

/// Errors raised while demultiplexing a chunk.
#[derive(Debug, Error)]
pub enum DemuxError {
    /// A single malformed fragment; the rest of the stream is still readable.
    #[error("Fragment {fragment} could not be decoded: {reason}")]
    Fragment { fragment: String, reason: String },

    /// The container stream itself is unreadable.
    #[error("Container stream corrupted: {0}")]
    Stream(String),
}

impl DemuxError {
    pub fn fragment(fragment: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fragment {
            fragment: fragment.into(),
            reason: reason.into(),
        }
    }

    /// Whether the error only affects one fragment.
    pub fn is_fragment_local(&self) -> bool {
        matches!(self, Self::Fragment { .. })
    }
}

/// Fetches chunks of an always-appending remote stream.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    /// Fetch the next chunk starting at `position`.
    ///
    /// Returns an empty chunk rather than an error when the stream has no new
    /// data yet.
    async fn fetch(
        &self,
        session: &StreamSession,
        position: &ReadPosition,
    ) -> Result<MediaChunk, SourceError>;
}

/// Lazy, finite sequence of frames produced from one chunk.
pub type FrameIter<'a> = Box<dyn Iterator<Item = Result<DecodedFrame, DemuxError>> + Send + 'a>;

/// Splits a chunk into frames, in the order they occur in the chunk.
pub trait Demuxer: Send + Sync {
    fn frames<'a>(&'a self, chunk: &'a MediaChunk) -> FrameIter<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_error_is_local() {
        let err = DemuxError::fragment("42", "truncated cluster");
        assert!(err.is_fragment_local());
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_stream_error_is_not_local() {
        let err = DemuxError::Stream("bad EBML header".to_string());
        assert!(!err.is_fragment_local());
    }
}
