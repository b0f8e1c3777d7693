//! SnapshotStore - Best frame of each event
//!
//! ## Responsibilities
//!
//! - Track the highest-confidence image frame of a source's open event
//! - Save it as `{snapshot_dir}/{source_id}/{event_id}.{jpg|png}` when the event closes
//! - Read saved snapshots back for the API
//!
//! Frames whose payload is not an encoded image (replay payloads) are never
//! kept.

use crate::error::{Error, Result};
use crate::models::Event;
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const PNG_MAGIC: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// File extension for an encoded image, by magic bytes
pub fn image_extension(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(JPEG_MAGIC) {
        Some("jpg")
    } else if data.starts_with(PNG_MAGIC) {
        Some("png")
    } else {
        None
    }
}

/// MIME type for a stored snapshot path
pub fn content_type(path: &str) -> &'static str {
    if path.ends_with(".png") {
        "image/png"
    } else {
        "image/jpeg"
    }
}

struct BestFrame {
    event_id: Uuid,
    confidence: f32,
    pixels: Bytes,
}

/// Highest-confidence frame of the currently open event
#[derive(Default)]
pub struct BestFrameTracker {
    current: Option<BestFrame>,
}

impl BestFrameTracker {
    /// Offer a qualifying frame; returns true if it became the best one
    pub fn offer(&mut self, event_id: Uuid, confidence: f32, pixels: &Bytes) -> bool {
        if image_extension(pixels).is_none() {
            return false;
        }
        if let Some(best) = &self.current {
            if best.event_id == event_id && confidence <= best.confidence {
                return false;
            }
        }
        self.current = Some(BestFrame {
            event_id,
            confidence,
            pixels: pixels.clone(),
        });
        true
    }

    pub fn pixels_for(&self, event_id: Uuid) -> Option<Bytes> {
        self.current
            .as_ref()
            .filter(|best| best.event_id == event_id)
            .map(|best| best.pixels.clone())
    }

    /// Remove the tracked frame; returns it if it belongs to `event_id`
    pub fn take(&mut self, event_id: Uuid) -> Option<Bytes> {
        self.current
            .take()
            .filter(|best| best.event_id == event_id)
            .map(|best| best.pixels)
    }
}

/// Filesystem store for event snapshots
pub struct SnapshotStore {
    dir: Option<PathBuf>,
}

impl SnapshotStore {
    /// `None` keeps snapshots in memory only (attached to alerts, never saved)
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    pub fn disabled() -> Self {
        Self { dir: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// Save an event's best frame; returns the path relative to the store
    pub async fn save(&self, event: &Event, pixels: &[u8]) -> Result<Option<String>> {
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        let extension = image_extension(pixels).ok_or_else(|| {
            Error::Validation(format!("snapshot for event {} is not an image", event.id))
        })?;

        let folder = sanitize(&event.source_id);
        let relative = format!("{}/{}.{}", folder, event.id, extension);
        fs::create_dir_all(dir.join(&folder)).await?;
        fs::write(dir.join(&relative), pixels).await?;

        tracing::debug!(
            event_id = %event.id,
            path = %relative,
            size = pixels.len(),
            "Saved event snapshot"
        );
        Ok(Some(relative))
    }

    /// Read a snapshot by the relative path recorded on the event
    pub async fn load(&self, relative: &str) -> Result<Bytes> {
        let dir = self
            .dir
            .as_ref()
            .ok_or_else(|| Error::SnapshotNotFound(relative.to_string()))?;

        let path = Path::new(relative);
        if !path.components().all(|c| matches!(c, Component::Normal(_))) {
            return Err(Error::Validation(format!("invalid snapshot path: {}", relative)));
        }

        match fs::read(dir.join(path)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::SnapshotNotFound(relative.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Source ids become directory names
fn sanitize(source_id: &str) -> String {
    source_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
