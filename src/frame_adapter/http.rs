//! HTTP adapter
//!
//! - `HttpSnapshotSource`: polls a camera snapshot URL (JPEG)
//! - `HttpDetector`: posts the frame to an inference server as multipart

use super::{CapturedFrame, Detector, FrameSource};
use crate::error::{Error, Result};
use crate::models::Detection;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Snapshot polling source
pub struct HttpSnapshotSource {
    client: reqwest::Client,
    source_id: String,
    url: String,
    seq: u64,
    ticker: Interval,
}

impl HttpSnapshotSource {
    /// Open the source; one snapshot request must succeed
    pub async fn open(
        client: reqwest::Client,
        source_id: &str,
        url: &str,
        frame_interval: Duration,
    ) -> Result<Self> {
        let unavailable = |message: String| Error::SourceUnavailable {
            source_id: source_id.to_string(),
            message,
        };

        let resp = client
            .get(url)
            .send()
            .await
            .map_err(|e| unavailable(format!("first fetch {}: {}", url, e)))?;
        if !resp.status().is_success() {
            return Err(unavailable(format!("first fetch {}: HTTP {}", url, resp.status())));
        }

        let mut ticker = interval(frame_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(source_id = %source_id, url = %url, "HTTP snapshot source opened");

        Ok(Self {
            client,
            source_id: source_id.to_string(),
            url: url.to_string(),
            seq: 0,
            ticker,
        })
    }
}

#[async_trait]
impl FrameSource for HttpSnapshotSource {
    async fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
        self.ticker.tick().await;

        let resp = self.client.get(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Detection(format!(
                "snapshot {} returned HTTP {}",
                self.url,
                resp.status()
            )));
        }
        let captured_at = Utc::now();
        let pixels = resp.bytes().await?;
        self.seq += 1;

        tracing::debug!(
            source_id = %self.source_id,
            seq = self.seq,
            size = pixels.len(),
            "Snapshot captured"
        );

        Ok(Some(CapturedFrame {
            source_id: self.source_id.clone(),
            seq: self.seq,
            captured_at,
            pixels,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct InferResponse {
    #[serde(default)]
    detections: Vec<Detection>,
}

/// Remote inference server client
pub struct HttpDetector {
    client: reqwest::Client,
    url: String,
}

impl HttpDetector {
    pub fn new(client: reqwest::Client, url: String) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl Detector for HttpDetector {
    async fn detect(&self, frame: &CapturedFrame) -> Result<Vec<Detection>> {
        let form = Form::new()
            .part(
                "image",
                Part::bytes(frame.pixels.to_vec())
                    .file_name("frame.jpg")
                    .mime_str("image/jpeg")?,
            )
            .text("source_id", frame.source_id.clone())
            .text("captured_at", frame.captured_at.to_rfc3339());

        let resp = self.client.post(&self.url).multipart(form).send().await?;
        if !resp.status().is_success() {
            return Err(Error::Detection(format!(
                "inference failed: HTTP {}",
                resp.status()
            )));
        }

        let result: InferResponse = resp.json().await?;
        Ok(result.detections)
    }
}
