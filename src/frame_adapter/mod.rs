//! FrameAdapter - Frame acquisition and detection seam
//!
//! ## Responsibilities
//!
//! - `FrameSource`: pull the next captured frame for one source
//! - `Detector`: frame -> set of (label, confidence)
//! - `AdapterFactory`: open both for a source descriptor
//!
//! Timeouts are applied by the stream worker, not by the adapters.

mod http;
mod replay;

pub use http::{HttpDetector, HttpSnapshotSource};
pub use replay::{EmbeddedDetector, ReplayFrameSource, ReplayLine};

use crate::config_store::{AdapterDescriptor, Source};
use crate::error::Result;
use crate::models::Detection;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// One captured frame
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub source_id: String,
    pub seq: u64,
    pub captured_at: DateTime<Utc>,
    pub pixels: Bytes,
}

/// Frame acquisition for one source
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame. `Ok(None)` means the source has ended.
    async fn next_frame(&mut self) -> Result<Option<CapturedFrame>>;
}

/// Detection model adapter
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, frame: &CapturedFrame) -> Result<Vec<Detection>>;
}

/// Opened frame source + detector pair
pub struct OpenedAdapter {
    pub frames: Box<dyn FrameSource>,
    pub detector: Arc<dyn Detector>,
}

/// Opens adapters for sources (SourceUnavailable on failure)
#[async_trait]
pub trait AdapterFactory: Send + Sync {
    async fn open(&self, source: &Source) -> Result<OpenedAdapter>;
}

/// Factory for the built-in descriptor kinds
pub struct DefaultAdapterFactory {
    client: reqwest::Client,
}

impl DefaultAdapterFactory {
    pub fn new(http_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(http_timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AdapterFactory for DefaultAdapterFactory {
    async fn open(&self, source: &Source) -> Result<OpenedAdapter> {
        match &source.adapter {
            AdapterDescriptor::Replay {
                path,
                frame_interval_ms,
                loop_playback,
            } => {
                let frames = ReplayFrameSource::open(
                    &source.id,
                    path,
                    Duration::from_millis(*frame_interval_ms),
                    *loop_playback,
                )
                .await?;
                Ok(OpenedAdapter {
                    frames: Box::new(frames),
                    detector: Arc::new(EmbeddedDetector),
                })
            }
            AdapterDescriptor::Http {
                snapshot_url,
                inference_url,
                frame_interval_ms,
            } => {
                let frames = HttpSnapshotSource::open(
                    self.client.clone(),
                    &source.id,
                    snapshot_url,
                    Duration::from_millis(*frame_interval_ms),
                )
                .await?;
                let detector = HttpDetector::new(self.client.clone(), inference_url.clone());
                Ok(OpenedAdapter {
                    frames: Box::new(frames),
                    detector: Arc::new(detector),
                })
            }
        }
    }
}
