//! Data model shared by the chunk source, the demultiplexer and the sinks.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;

/// Fragment tag carrying the location the frame was captured at.
pub const LOCATION_TAG: &str = "LOCATION";

/// Fragment tag Kinesis Video attaches so a reader can resume after a fragment.
pub const CONTINUATION_TOKEN_TAG: &str = "AWS_KINESISVIDEO_CONTINUATION_TOKEN";

/// Where in the remote stream a read starts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ReadPosition {
    /// Only data produced after the request.
    #[default]
    Now,
    /// The oldest fragment still retained.
    Earliest,
    /// A specific fragment number.
    FragmentNumber(String),
    /// First fragment at or after the producer timestamp.
    ProducerTimestamp(DateTime<Utc>),
    /// First fragment at or after the server timestamp.
    ServerTimestamp(DateTime<Utc>),
    /// Resume token handed out with a previously read fragment.
    ContinuationToken(String),
}

/// Identifies the remote stream. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSession {
    name: String,
    region: String,
    start: ReadPosition,
}

impl StreamSession {
    pub fn new(name: impl Into<String>, region: impl Into<String>, start: ReadPosition) -> Self {
        Self {
            name: name.into(),
            region: region.into(),
            start,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn start(&self) -> &ReadPosition {
        &self.start
    }
}

impl fmt::Display for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.region)
    }
}

/// Opaque payload returned by one poll of the stream.
#[derive(Debug, Clone, Default)]
pub struct MediaChunk {
    payload: Bytes,
}

impl MediaChunk {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// A chunk with no data, returned when the stream has nothing new yet.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Per-track codec description needed to decode frames of that track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub track_number: u64,
    pub codec_id: String,
    pub codec_private: Bytes,
    pub pixel_width: Option<u32>,
    pub pixel_height: Option<u32>,
}

/// A single `name=value` tag attached to a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentTag {
    pub name: String,
    pub value: String,
}

impl FragmentTag {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Fragment-level metadata shared by every frame of the fragment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentMetadata {
    pub fragment_number: String,
    pub server_timestamp_ms: Option<u64>,
    pub producer_timestamp_ms: Option<u64>,
    /// How far behind the head of the stream the fragment was when delivered.
    pub millis_behind_now: Option<u64>,
    pub tags: Vec<FragmentTag>,
}

impl FragmentMetadata {
    /// First tag whose name matches exactly (case-sensitive).
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.name == name)
            .map(|tag| tag.value.as_str())
    }

    pub fn location(&self) -> Option<&str> {
        self.tag(LOCATION_TAG)
    }

    pub fn continuation_token(&self) -> Option<&str> {
        self.tag(CONTINUATION_TOKEN_TAG)
    }
}

/// One frame emitted by the demultiplexer.
///
/// Sinks receive it by reference and must not keep it past their own
/// `process` call.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub data: Bytes,
    pub key_frame: bool,
    /// Timecode relative to the enclosing cluster.
    pub timecode: i64,
    pub track: Arc<TrackInfo>,
    pub fragment: Option<Arc<FragmentMetadata>>,
}

impl DecodedFrame {
    pub fn location(&self) -> Option<&str> {
        self.fragment.as_deref().and_then(FragmentMetadata::location)
    }

    pub fn continuation_token(&self) -> Option<&str> {
        self.fragment
            .as_deref()
            .and_then(FragmentMetadata::continuation_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_fragment(tags: Vec<FragmentTag>) -> FragmentMetadata {
        FragmentMetadata {
            fragment_number: "91343852333181432392682062607743920146264440885".to_string(),
            server_timestamp_ms: Some(1_700_000_000_000),
            producer_timestamp_ms: Some(1_700_000_000_000),
            millis_behind_now: Some(120),
            tags,
        }
    }

    #[test]
    fn test_tag_lookup_is_case_sensitive() {
        let fragment = create_test_fragment(vec![
            FragmentTag::new("location", "lowercase"),
            FragmentTag::new("LOCATION", "Warehouse-3"),
        ]);

        assert_eq!(fragment.location(), Some("Warehouse-3"));
        assert_eq!(fragment.tag("Location"), None);
    }

    #[test]
    fn test_frame_without_fragment_has_no_location() {
        let frame = DecodedFrame {
            data: Bytes::from_static(b"frame"),
            key_frame: true,
            timecode: 0,
            track: Arc::new(TrackInfo {
                track_number: 1,
                codec_id: "V_MPEG4/ISO/AVC".to_string(),
                codec_private: Bytes::new(),
                pixel_width: Some(640),
                pixel_height: Some(480),
            }),
            fragment: None,
        };

        assert_eq!(frame.location(), None);
        assert_eq!(frame.continuation_token(), None);
    }

    #[test]
    fn test_continuation_token() {
        let fragment = create_test_fragment(vec![FragmentTag::new(
            CONTINUATION_TOKEN_TAG,
            "token-42",
        )]);
        assert_eq!(fragment.continuation_token(), Some("token-42"));
    }

    #[test]
    fn test_empty_chunk() {
        assert!(MediaChunk::empty().is_empty());
        assert_eq!(MediaChunk::new(vec![1u8, 2, 3]).len(), 3);
    }

    #[test]
    fn test_session_display() {
        let session = StreamSession::new("traffic-guard", "eu-central-1", ReadPosition::Now);
        assert_eq!(session.to_string(), "traffic-guard@eu-central-1");
        assert_eq!(session.start(), &ReadPosition::Now);
    }
}
