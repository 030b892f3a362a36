//! Film watcher: live video stream consumer that samples frames to blob storage.
//!
//! # Architecture
//!
//! ```text
//!                    PlaybackGate (begin / end)
//!                          |
//! Kinesis GetMedia -> ChunkSource -> Demuxer -> FanOut -> DiagnosticSink
//!                                                      -> SamplingPersister -> S3
//! ```
//!
//! A [`StreamWatcher`] polls one stream on a background worker while the
//! playback gate is open. Every decoded frame goes to each sink in order;
//! the sampling persister keeps every Nth frame as a JPEG.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with WATCHER_)
//!
//! The container demultiplexer and video codec are provided by the embedding
//! binary through [`Demuxer`] and [`FrameDecoder`]. See [`host::run`].

pub mod config;
pub mod fanout;
pub mod frame;
pub mod gate;
pub mod host;
pub mod kinesis;
pub mod persister;
pub mod s3_uploader;
pub mod sink;
pub mod source;
pub mod watcher;

#[cfg(test)]
mod testing;

pub use config::{FailurePolicy, WatcherConfig};
pub use fanout::FanOut;
pub use frame::{DecodedFrame, FragmentMetadata, MediaChunk, ReadPosition, StreamSession, TrackInfo};
pub use gate::{GateState, PlaybackGate};
pub use persister::{FrameDecoder, SamplingPersister};
pub use sink::{DiagnosticSink, FrameError, FrameSink};
pub use source::{ChunkSource, DemuxError, Demuxer, FrameIter, SourceError};
pub use watcher::{SessionReport, SessionStatus, StreamWatcher, WatchError};
