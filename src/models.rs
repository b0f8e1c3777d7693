//! Shared models and types for watchpost
//!
//! This module contains types shared across multiple modules
//! to avoid circular dependencies.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Standard API response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_sec: u64,
    pub active_streams: usize,
    pub db_connected: bool,
}

/// One (label, confidence) pair from the detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f32,
}

impl Detection {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
        }
    }
}

/// Detection result for one captured frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionFrame {
    pub source_id: String,
    pub captured_at: DateTime<Utc>,
    pub detections: Vec<Detection>,
}

/// Event status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Active,
    Closed,
    Resolved,
    FalsePositive,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Resolved => "resolved",
            Self::FalsePositive => "false_positive",
        }
    }

    /// resolved / false_positive
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Resolved | Self::FalsePositive)
    }
}

impl std::str::FromStr for EventStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "closed" => Ok(Self::Closed),
            "resolved" => Ok(Self::Resolved),
            "false_positive" => Ok(Self::FalsePositive),
            other => Err(crate::Error::Validation(format!(
                "unknown event status: {}",
                other
            ))),
        }
    }
}

/// Why an event was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    CooldownExpired,
    StreamStopped,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CooldownExpired => "cooldown_expired",
            Self::StreamStopped => "stream_stopped",
        }
    }
}

impl std::str::FromStr for CloseReason {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cooldown_expired" => Ok(Self::CooldownExpired),
            "stream_stopped" => Ok(Self::StreamStopped),
            other => Err(crate::Error::Validation(format!(
                "unknown close reason: {}",
                other
            ))),
        }
    }
}

/// Incident record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub source_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: EventStatus,
    pub max_confidence: f32,
    pub mean_confidence: f32,
    pub labels: BTreeSet<String>,
    pub frame_count: u64,
    pub close_reason: Option<CloseReason>,
    /// Best frame of the event, relative to the snapshot directory
    #[serde(default)]
    pub snapshot_path: Option<String>,
}

impl Event {
    /// Open a new active event
    pub fn open(
        source_id: impl Into<String>,
        start_time: DateTime<Utc>,
        confidence: f32,
        labels: BTreeSet<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_id: source_id.into(),
            start_time,
            end_time: None,
            status: EventStatus::Active,
            max_confidence: confidence,
            mean_confidence: confidence,
            labels,
            frame_count: 1,
            close_reason: None,
            snapshot_path: None,
        }
    }

    /// Attribute one more qualifying frame
    pub fn extend(&mut self, confidence: f32, labels: &BTreeSet<String>) {
        self.frame_count += 1;
        if confidence > self.max_confidence {
            self.max_confidence = confidence;
        }
        // Running mean over attributed frames
        self.mean_confidence +=
            (confidence - self.mean_confidence) / self.frame_count as f32;
        self.labels.extend(labels.iter().cloned());
    }

    /// Close the event; end_time is clamped so it never precedes start_time
    pub fn close(&mut self, end_time: DateTime<Utc>, reason: CloseReason) {
        if self.end_time.is_some() {
            return;
        }
        self.end_time = Some(end_time.max(self.start_time));
        self.status = EventStatus::Closed;
        self.close_reason = Some(reason);
    }

    /// Duration in milliseconds (None while open)
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

/// Aggregator transition kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Opened,
    Extended,
    Closed,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Extended => "extended",
            Self::Closed => "closed",
        }
    }
}

/// Event transition pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventTransition {
    pub kind: TransitionKind,
    pub event: Event,
    pub at: DateTime<Utc>,
    /// Encoded best frame for sinks that attach an image (never serialized)
    #[serde(skip)]
    pub snapshot: Option<Bytes>,
}

impl EventTransition {
    pub fn new(kind: TransitionKind, event: Event, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            event,
            at,
            snapshot: None,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.event.source_id
    }
}
