//! Fakes shared by the unit tests.

use crate::frame::{
    DecodedFrame, FragmentMetadata, FragmentTag, MediaChunk, ReadPosition, StreamSession,
    TrackInfo, CONTINUATION_TOKEN_TAG,
};
use crate::s3_uploader::{BlobStore, StoreError, UploadRecord};
use crate::sink::{FrameError, FrameSink};
use crate::source::{ChunkSource, DemuxError, Demuxer, FrameIter, SourceError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;

pub fn create_test_track() -> Arc<TrackInfo> {
    Arc::new(TrackInfo {
        track_number: 1,
        codec_id: "V_MPEG4/ISO/AVC".to_string(),
        codec_private: Bytes::from_static(&[0x01, 0x64, 0x00, 0x1f]),
        pixel_width: Some(640),
        pixel_height: Some(480),
    })
}

pub fn create_test_frame(data: &[u8]) -> DecodedFrame {
    DecodedFrame {
        data: Bytes::copy_from_slice(data),
        key_frame: true,
        timecode: 0,
        track: create_test_track(),
        fragment: None,
    }
}

/// Sink that appends `name:data` to a shared log for every frame it sees.
pub struct RecordingSink {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    fail_on: Option<Vec<u8>>,
}

impl RecordingSink {
    pub fn new(name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            log,
            fail_on: None,
        }
    }

    /// Fail (after logging) on frames whose data equals `data`.
    pub fn failing_on(mut self, data: &[u8]) -> Self {
        self.fail_on = Some(data.to_vec());
        self
    }
}

#[async_trait]
impl FrameSink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&mut self, frame: &DecodedFrame) -> Result<(), FrameError> {
        self.log.lock().push(format!(
            "{}:{}",
            self.name,
            String::from_utf8_lossy(&frame.data)
        ));

        if self.fail_on.as_deref() == Some(&frame.data[..]) {
            return Err(FrameError::Sink {
                sink: self.name.clone(),
                reason: "rejected frame".to_string(),
            });
        }
        Ok(())
    }
}

/// Blob store that keeps every upload in memory.
#[derive(Default)]
pub struct RecordingStore {
    uploads: Mutex<Vec<(UploadRecord, Bytes)>>,
    fail: bool,
}

impl RecordingStore {
    pub fn failing() -> Self {
        Self {
            uploads: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn uploads(&self) -> Vec<(UploadRecord, Bytes)> {
        self.uploads.lock().clone()
    }
}

#[async_trait]
impl BlobStore for RecordingStore {
    async fn put(&self, record: &UploadRecord, body: Bytes) -> Result<(), StoreError> {
        if self.fail {
            return Err(StoreError::Upload {
                bucket: record.bucket.clone(),
                key: record.key.clone(),
                message: "service unavailable".to_string(),
            });
        }
        self.uploads.lock().push((record.clone(), body));
        Ok(())
    }
}

/// Chunk source replaying a script, then returning empty chunks forever.
#[derive(Default)]
pub struct ScriptedSource {
    script: Mutex<VecDeque<Result<MediaChunk, SourceError>>>,
    fetches: Mutex<Vec<(ReadPosition, Instant)>>,
}

impl ScriptedSource {
    pub fn new(script: Vec<Result<MediaChunk, SourceError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fetches: Mutex::new(Vec::new()),
        }
    }

    pub fn fetches(&self) -> Vec<(ReadPosition, Instant)> {
        self.fetches.lock().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().len()
    }
}

#[async_trait]
impl ChunkSource for ScriptedSource {
    async fn fetch(
        &self,
        _session: &StreamSession,
        position: &ReadPosition,
    ) -> Result<MediaChunk, SourceError> {
        self.fetches.lock().push((position.clone(), Instant::now()));
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(MediaChunk::empty()))
    }
}

pub fn chunk(frames: &[u8]) -> Result<MediaChunk, SourceError> {
    Ok(MediaChunk::new(frames.to_vec()))
}

pub fn transport_error() -> Result<MediaChunk, SourceError> {
    Err(SourceError::Transport("connection reset".to_string()))
}

/// Demultiplexer treating every payload byte as one frame.
///
/// `!` yields a fragment-local error and `#` a stream error. Each frame's
/// fragment carries a continuation token `token-<byte>`.
pub struct ByteDemuxer;

impl Demuxer for ByteDemuxer {
    fn frames<'a>(&'a self, chunk: &'a MediaChunk) -> FrameIter<'a> {
        let track = create_test_track();
        Box::new(chunk.payload().iter().map(move |&byte| match byte {
            b'!' => Err(DemuxError::fragment("bad", "truncated cluster")),
            b'#' => Err(DemuxError::Stream("bad EBML header".to_string())),
            _ => Ok(DecodedFrame {
                data: Bytes::copy_from_slice(&[byte]),
                key_frame: true,
                timecode: 0,
                track: track.clone(),
                fragment: Some(Arc::new(FragmentMetadata {
                    fragment_number: (byte as char).to_string(),
                    tags: vec![FragmentTag::new(
                        CONTINUATION_TOKEN_TAG,
                        format!("token-{}", byte as char),
                    )],
                    ..Default::default()
                })),
            }),
        }))
    }
}
