//! Sampling persister: stores every Nth observed frame as a JPEG in blob storage.
//!
//! Frames are indexed from 0 in the order they are observed. The frame at
//! index `i` is persisted iff `i % every_nth == 0`, so the first frame is
//! always persisted and `L` frames produce `ceil(L / every_nth)` uploads.

use crate::frame::{DecodedFrame, TrackInfo};
use crate::s3_uploader::{BlobStore, UploadRecord, JPEG_CONTENT_TYPE};
use crate::sink::{FrameError, FrameSink};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::num::NonZeroU64;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, trace};
use uuid::Uuid;

/// Error returned by the codec decoder.
#[derive(Debug, Error)]
#[error("Cannot decode {codec} frame: {reason}")]
pub struct DecodeError {
    pub codec: String,
    pub reason: String,
}

/// Turns a compressed frame into a raster image.
#[cfg_attr(test, mockall::automock)]
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, data: &[u8], track: &TrackInfo) -> Result<RgbImage, DecodeError>;
}

/// Folder for one process lifetime: `<prefix>-<ddMM>` of the given UTC date.
pub fn dated_folder(prefix: &str, date: DateTime<Utc>) -> String {
    format!("{}-{}", prefix, date.format("%d%m"))
}

/// Frame sink persisting a deterministic sample of frames.
pub struct SamplingPersister {
    name: String,
    every_nth: NonZeroU64,
    observed: u64,
    bucket: String,
    folder: String,
    jpeg_quality: u8,
    decoder: Arc<dyn FrameDecoder>,
    store: Arc<dyn BlobStore>,
}

impl SamplingPersister {
    /// Create a persister whose folder is derived from today's UTC date.
    pub fn new(
        every_nth: NonZeroU64,
        bucket: impl Into<String>,
        folder_prefix: &str,
        decoder: Arc<dyn FrameDecoder>,
        store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            name: "sampling-persister".to_string(),
            every_nth,
            observed: 0,
            bucket: bucket.into(),
            folder: dated_folder(folder_prefix, Utc::now()),
            jpeg_quality: 90,
            decoder,
            store,
        }
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    /// Number of frames seen so far, persisted or not.
    pub fn frames_observed(&self) -> u64 {
        self.observed
    }

    fn encode_jpeg(&self, image: &RgbImage) -> Result<Vec<u8>, FrameError> {
        let mut buf = Vec::new();
        JpegEncoder::new_with_quality(&mut buf, self.jpeg_quality).encode_image(image)?;
        Ok(buf)
    }

    fn upload_record(&self, frame: &DecodedFrame, content_length: usize) -> UploadRecord {
        UploadRecord {
            bucket: self.bucket.clone(),
            key: format!("{}/{}.jpg", self.folder, Uuid::new_v4()),
            content_type: JPEG_CONTENT_TYPE,
            content_length: content_length as u64,
            location: frame.location().map(str::to_string),
        }
    }

    async fn persist(&self, frame: &DecodedFrame) -> Result<UploadRecord, FrameError> {
        let image = self.decoder.decode(&frame.data, &frame.track)?;
        let jpeg = self.encode_jpeg(&image)?;
        let record = self.upload_record(frame, jpeg.len());

        if let Some(ref location) = record.location {
            debug!(location = %location, "Location tag found");
        }

        self.store.put(&record, Bytes::from(jpeg)).await?;
        Ok(record)
    }
}

#[async_trait]
impl FrameSink for SamplingPersister {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(&mut self, frame: &DecodedFrame) -> Result<(), FrameError> {
        let index = self.observed;
        self.observed += 1;

        if index % self.every_nth.get() != 0 {
            trace!(frame = index, "Frame not sampled");
            return Ok(());
        }

        debug!(frame = index, bucket = %self.bucket, "Saving frame");
        match self.persist(frame).await {
            Ok(record) => {
                metrics::counter!("watcher.frames.uploaded").increment(1);
                debug!(frame = index, key = %record.key, size_bytes = record.content_length, "Frame saved");
                Ok(())
            }
            Err(e) => {
                error!(frame = index, error = %e, "Could not save frame");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FragmentMetadata, FragmentTag};
    use crate::testing::{create_test_frame, RecordingStore};
    use chrono::TimeZone;

    fn decoder_expecting(times: usize) -> Arc<dyn FrameDecoder> {
        let mut decoder = MockFrameDecoder::new();
        decoder
            .expect_decode()
            .times(times)
            .returning(|_, _| Ok(RgbImage::from_pixel(8, 8, image::Rgb([200, 30, 30]))));
        Arc::new(decoder)
    }

    fn create_test_persister(
        every_nth: u64,
        decoder: Arc<dyn FrameDecoder>,
        store: Arc<RecordingStore>,
    ) -> SamplingPersister {
        SamplingPersister::new(
            NonZeroU64::new(every_nth).unwrap(),
            "traffic-frames",
            "source-images",
            decoder,
            store,
        )
    }

    fn tagged_frame(tags: Vec<FragmentTag>) -> DecodedFrame {
        let mut frame = create_test_frame(b"f");
        frame.fragment = Some(Arc::new(FragmentMetadata {
            fragment_number: "7".to_string(),
            tags,
            ..Default::default()
        }));
        frame
    }

    #[test]
    fn test_dated_folder() {
        let date = Utc.with_ymd_and_hms(2024, 3, 7, 23, 59, 0).unwrap();
        assert_eq!(dated_folder("source-images", date), "source-images-0703");
    }

    #[tokio::test]
    async fn test_every_third_of_seven_frames() {
        let store = Arc::new(RecordingStore::default());
        let mut persister = create_test_persister(3, decoder_expecting(3), store.clone());

        for _ in 0..7 {
            persister.process(&create_test_frame(b"f")).await.unwrap();
        }

        // Indices 0, 3 and 6 are persisted.
        assert_eq!(store.uploads().len(), 3);
        assert_eq!(persister.frames_observed(), 7);
    }

    #[tokio::test]
    async fn test_every_frame_when_n_is_one() {
        let store = Arc::new(RecordingStore::default());
        let mut persister = create_test_persister(1, decoder_expecting(5), store.clone());

        for _ in 0..5 {
            persister.process(&create_test_frame(b"f")).await.unwrap();
        }

        assert_eq!(store.uploads().len(), 5);
    }

    #[tokio::test]
    async fn test_skipped_frames_are_not_decoded() {
        let store = Arc::new(RecordingStore::default());
        // 10 frames at N=4 decode only indices 0, 4, 8.
        let mut persister = create_test_persister(4, decoder_expecting(3), store.clone());

        for _ in 0..10 {
            persister.process(&create_test_frame(b"f")).await.unwrap();
        }

        assert_eq!(store.uploads().len(), 3);
    }

    #[tokio::test]
    async fn test_upload_record_shape() {
        let store = Arc::new(RecordingStore::default());
        let mut persister = create_test_persister(1, decoder_expecting(1), store.clone());
        let folder = persister.folder().to_string();

        persister.process(&create_test_frame(b"f")).await.unwrap();

        let uploads = store.uploads();
        let (record, body) = &uploads[0];
        assert_eq!(record.bucket, "traffic-frames");
        assert_eq!(record.content_type, "image/jpeg");
        assert_eq!(record.content_length, body.len() as u64);
        assert_eq!(&body[..2], &[0xFF, 0xD8]);

        let file = record
            .key
            .strip_prefix(&format!("{}/", folder))
            .expect("key should live under the dated folder");
        let id = file.strip_suffix(".jpg").expect("key should end in .jpg");
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn test_location_tag_becomes_metadata() {
        let store = Arc::new(RecordingStore::default());
        let mut persister = create_test_persister(1, decoder_expecting(3), store.clone());

        persister
            .process(&tagged_frame(vec![FragmentTag::new("LOCATION", "Warehouse-3")]))
            .await
            .unwrap();
        persister.process(&tagged_frame(vec![])).await.unwrap();
        persister
            .process(&tagged_frame(vec![FragmentTag::new("location", "ignored")]))
            .await
            .unwrap();

        let uploads = store.uploads();
        assert_eq!(uploads[0].0.location.as_deref(), Some("Warehouse-3"));
        assert_eq!(uploads[1].0.location, None);
        assert_eq!(uploads[2].0.location, None);
    }

    #[tokio::test]
    async fn test_same_frame_twice_gives_distinct_keys() {
        let store = Arc::new(RecordingStore::default());
        let mut persister = create_test_persister(1, decoder_expecting(2), store.clone());
        let frame = create_test_frame(b"f");

        persister.process(&frame).await.unwrap();
        persister.process(&frame).await.unwrap();

        let uploads = store.uploads();
        assert_ne!(uploads[0].0.key, uploads[1].0.key);
    }

    #[tokio::test]
    async fn test_upload_failure_is_raised() {
        let store = Arc::new(RecordingStore::failing());
        let mut persister = create_test_persister(2, decoder_expecting(2), store.clone());

        let result = persister.process(&create_test_frame(b"f")).await;
        assert!(matches!(result, Err(FrameError::Upload(_))));

        // Counter still advances: index 1 is skipped, index 2 is attempted again.
        assert!(persister.process(&create_test_frame(b"f")).await.is_ok());
        assert!(persister.process(&create_test_frame(b"f")).await.is_err());
        assert_eq!(persister.frames_observed(), 3);
    }

    #[tokio::test]
    async fn test_decode_failure_is_raised() {
        let mut decoder = MockFrameDecoder::new();
        decoder.expect_decode().times(1).returning(|_, track| {
            Err(DecodeError {
                codec: track.codec_id.clone(),
                reason: "missing SPS".to_string(),
            })
        });
        let store = Arc::new(RecordingStore::default());
        let mut persister = create_test_persister(1, Arc::new(decoder), store.clone());

        let result = persister.process(&create_test_frame(b"f")).await;
        assert!(matches!(result, Err(FrameError::Decode(_))));
        assert!(store.uploads().is_empty());
    }

    #[test]
    fn test_jpeg_quality_is_clamped() {
        let store = Arc::new(RecordingStore::default());
        let persister = create_test_persister(1, decoder_expecting(0), store).with_jpeg_quality(0);
        assert_eq!(persister.jpeg_quality, 1);
    }
}
