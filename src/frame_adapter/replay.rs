//! Replay adapter
//!
//! Plays back a JSON-lines file of pre-computed detections, one frame per
//! line. The frame payload carries the detections and `EmbeddedDetector`
//! decodes them, so the pipeline runs exactly as with a live model.

use super::{CapturedFrame, Detector, FrameSource};
use crate::error::{Error, Result};
use crate::models::Detection;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// One line of a replay file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayLine {
    #[serde(default)]
    pub detections: Vec<Detection>,
}

/// Replay frame source
pub struct ReplayFrameSource {
    source_id: String,
    frames: Vec<Bytes>,
    cursor: usize,
    seq: u64,
    loop_playback: bool,
    ticker: Interval,
}

impl ReplayFrameSource {
    /// Open and validate a replay file
    pub async fn open(
        source_id: &str,
        path: &Path,
        frame_interval: Duration,
        loop_playback: bool,
    ) -> Result<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| Error::SourceUnavailable {
            source_id: source_id.to_string(),
            message: format!("{}: {}", path.display(), e),
        })?;

        let mut frames = Vec::new();
        for (lineno, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed: ReplayLine =
                serde_json::from_str(line).map_err(|e| Error::SourceUnavailable {
                    source_id: source_id.to_string(),
                    message: format!("{}:{}: {}", path.display(), lineno + 1, e),
                })?;
            frames.push(Bytes::from(serde_json::to_vec(&parsed.detections)?));
        }

        let mut ticker = interval(frame_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            source_id = %source_id,
            path = %path.display(),
            frames = frames.len(),
            loop_playback = loop_playback,
            "Replay source opened"
        );

        Ok(Self {
            source_id: source_id.to_string(),
            frames,
            cursor: 0,
            seq: 0,
            loop_playback,
            ticker,
        })
    }
}

#[async_trait]
impl FrameSource for ReplayFrameSource {
    async fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
        if self.cursor >= self.frames.len() {
            if !self.loop_playback || self.frames.is_empty() {
                return Ok(None);
            }
            self.cursor = 0;
        }

        self.ticker.tick().await;

        let pixels = self.frames[self.cursor].clone();
        self.cursor += 1;
        self.seq += 1;

        Ok(Some(CapturedFrame {
            source_id: self.source_id.clone(),
            seq: self.seq,
            captured_at: Utc::now(),
            pixels,
        }))
    }
}

/// Decodes detections carried in the frame payload
pub struct EmbeddedDetector;

#[async_trait]
impl Detector for EmbeddedDetector {
    async fn detect(&self, frame: &CapturedFrame) -> Result<Vec<Detection>> {
        serde_json::from_slice(&frame.pixels)
            .map_err(|e| Error::Detection(format!("frame {} payload: {}", frame.seq, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_fixture(contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("watchpost-replay-{}.jsonl", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, contents).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_replay_plays_lines_in_order() {
        let path = write_fixture(
            r#"{"detections": [{"label": "fight", "confidence": 0.8}]}

{"detections": []}
"#,
        )
        .await;

        let mut source = ReplayFrameSource::open("cam1", &path, Duration::from_millis(1), false)
            .await
            .unwrap();

        let first = source.next_frame().await.unwrap().unwrap();
        assert_eq!(first.seq, 1);
        let detections = EmbeddedDetector.detect(&first).await.unwrap();
        assert_eq!(detections, vec![Detection::new("fight", 0.8)]);

        let second = source.next_frame().await.unwrap().unwrap();
        assert!(EmbeddedDetector.detect(&second).await.unwrap().is_empty());

        assert!(source.next_frame().await.unwrap().is_none());
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn test_replay_loops() {
        let path = write_fixture("{\"detections\": []}\n").await;
        let mut source = ReplayFrameSource::open("cam1", &path, Duration::from_millis(1), true)
            .await
            .unwrap();
        for expected in 1..=3 {
            let frame = source.next_frame().await.unwrap().unwrap();
            assert_eq!(frame.seq, expected);
        }
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test]
    async fn test_missing_file_is_source_unavailable() {
        let result = ReplayFrameSource::open(
            "cam1",
            Path::new("/nonexistent/watchpost.jsonl"),
            Duration::from_millis(1),
            false,
        )
        .await;
        assert!(matches!(result, Err(Error::SourceUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_malformed_line_is_source_unavailable() {
        let path = write_fixture("not json\n").await;
        let result = ReplayFrameSource::open("cam1", &path, Duration::from_millis(1), false).await;
        assert!(matches!(result, Err(Error::SourceUnavailable { .. })));
        tokio::fs::remove_file(&path).await.ok();
    }
}
