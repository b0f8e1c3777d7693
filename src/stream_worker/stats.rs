//! Per-stream throughput statistics

use crate::event_aggregator::AggregatorState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Worker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Running,
    Errored,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Errored => "errored",
            Self::Stopped => "stopped",
        }
    }
}

/// Stream statistics snapshot
#[derive(Debug, Clone, Serialize)]
pub struct StreamStats {
    pub source_id: String,
    pub state: WorkerState,
    pub active: bool,
    pub frame_count: u64,
    /// Frames that met the threshold
    pub detection_count: u64,
    pub fps: f64,
    pub frames_dropped: u64,
    pub consecutive_timeouts: u32,
    pub has_active_event: bool,
    pub aggregator_state: AggregatorState,
    pub last_frame_at: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl StreamStats {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            state: WorkerState::Running,
            active: true,
            frame_count: 0,
            detection_count: 0,
            fps: 0.0,
            frames_dropped: 0,
            consecutive_timeouts: 0,
            has_active_event: false,
            aggregator_state: AggregatorState::Idle,
            last_frame_at: None,
            started_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn set_state(&mut self, state: WorkerState) {
        self.state = state;
        self.active = state == WorkerState::Running;
    }
}

/// Sliding-window frame rate
pub struct FpsWindow {
    window: Duration,
    ticks: VecDeque<Instant>,
}

impl FpsWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_millis(1)),
            ticks: VecDeque::new(),
        }
    }

    /// Record a frame at `now` and return the current rate
    pub fn record(&mut self, now: Instant) -> f64 {
        self.ticks.push_back(now);
        self.rate(now)
    }

    pub fn rate(&mut self, now: Instant) -> f64 {
        while let Some(front) = self.ticks.front() {
            if now.saturating_duration_since(*front) > self.window {
                self.ticks.pop_front();
            } else {
                break;
            }
        }
        self.ticks.len() as f64 / self.window.as_secs_f64()
    }
}
