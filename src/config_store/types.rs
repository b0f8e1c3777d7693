//! ConfigStore types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Sustain / cooldown window
///
/// Measured either in frames or in capture-time milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSpec {
    Frames(u32),
    Millis(u64),
}

impl WindowSpec {
    /// Whether the window is satisfied after `count` frames spanning `elapsed`
    pub fn reached(&self, count: u32, elapsed: chrono::Duration) -> bool {
        match self {
            Self::Frames(n) => count >= *n,
            Self::Millis(ms) => elapsed.num_milliseconds() >= *ms as i64,
        }
    }
}

/// Frame adapter descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdapterDescriptor {
    /// JSON-lines file of pre-computed detections, one frame per line
    Replay {
        path: PathBuf,
        #[serde(default = "default_frame_interval_ms")]
        frame_interval_ms: u64,
        #[serde(default)]
        loop_playback: bool,
    },
    /// HTTP snapshot endpoint + HTTP inference server
    Http {
        snapshot_url: String,
        inference_url: String,
        #[serde(default = "default_frame_interval_ms")]
        frame_interval_ms: u64,
    },
}

fn default_frame_interval_ms() -> u64 {
    100
}

fn default_threshold() -> f32 {
    0.5
}

fn default_sustain() -> WindowSpec {
    WindowSpec::Frames(2)
}

fn default_cooldown() -> WindowSpec {
    WindowSpec::Frames(3)
}

/// Source configuration
///
/// Immutable while a worker runs against it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub adapter: AdapterDescriptor,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_sustain")]
    pub sustain: WindowSpec,
    #[serde(default = "default_cooldown")]
    pub cooldown: WindowSpec,
    /// Label allowlist (empty = all labels)
    #[serde(default)]
    pub labels: Vec<String>,
    /// Start a worker at process start
    #[serde(default)]
    pub autostart: bool,
}

impl Source {
    /// Display name (falls back to id)
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Validate ranges
    pub fn validate(&self) -> crate::Result<()> {
        if self.id.is_empty() || self.id.len() > 64 {
            return Err(crate::Error::Validation(
                "source id must be 1-64 characters".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(crate::Error::Validation(format!(
                "threshold {} for source {} must be within 0.0-1.0",
                self.threshold, self.id
            )));
        }
        if let WindowSpec::Frames(0) = self.cooldown {
            return Err(crate::Error::Validation(format!(
                "cooldown for source {} must be at least 1 frame",
                self.id
            )));
        }
        Ok(())
    }
}

/// Stream worker policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPolicy {
    pub frame_timeout_ms: u64,
    pub detect_timeout_ms: u64,
    pub max_consecutive_timeouts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub fps_window_sec: u64,
    pub stop_timeout_ms: u64,
    /// Bound on one snapshot or event-store write made by a worker
    pub store_write_timeout_ms: u64,
}

impl Default for WorkerPolicy {
    fn default() -> Self {
        Self {
            frame_timeout_ms: 5000,
            detect_timeout_ms: 5000,
            max_consecutive_timeouts: 5,
            backoff_base_ms: 200,
            backoff_max_ms: 5000,
            fps_window_sec: 5,
            stop_timeout_ms: 5000,
            store_write_timeout_ms: 1500,
        }
    }
}

impl WorkerPolicy {
    pub fn frame_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_timeout_ms)
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_millis(self.detect_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Write bound, at most a third of `stop_timeout` so the stop path
    /// (snapshot + finalize) always completes before the stop deadline
    pub fn write_timeout(&self) -> Duration {
        let ceiling = (self.stop_timeout_ms / 3).max(1);
        Duration::from_millis(self.store_write_timeout_ms.clamp(1, ceiling))
    }

    pub fn fps_window(&self) -> Duration {
        Duration::from_secs(self.fps_window_sec.max(1))
    }

    /// Exponential backoff for the n-th consecutive failure (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        exponential_backoff(self.backoff_base_ms, self.backoff_max_ms, attempt)
    }
}

/// Notification dispatch policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPolicy {
    /// Minimum interval between alerts for one source (sinks)
    pub min_interval_sec: u64,
    /// Forward `extended` transitions
    pub notify_on_extend: bool,
    /// Minimum interval between `extended` transitions per event
    pub extend_interval_sec: u64,
    pub sink_max_attempts: u32,
    pub sink_backoff_base_ms: u64,
    pub sink_backoff_max_ms: u64,
    pub queue_capacity: usize,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            min_interval_sec: 10,
            notify_on_extend: false,
            extend_interval_sec: 5,
            sink_max_attempts: 3,
            sink_backoff_base_ms: 500,
            sink_backoff_max_ms: 4000,
            queue_capacity: 1024,
        }
    }
}

impl DispatchPolicy {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_sec)
    }

    pub fn extend_interval(&self) -> Duration {
        Duration::from_secs(self.extend_interval_sec)
    }

    pub fn sink_backoff(&self, attempt: u32) -> Duration {
        exponential_backoff(self.sink_backoff_base_ms, self.sink_backoff_max_ms, attempt)
    }
}

/// Finalize retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub queue_capacity: usize,
    /// Events kept for reconciliation; the oldest is dropped beyond this
    pub reconciliation_capacity: usize,
    /// Periodic reconciliation pass, 0 disables it
    pub reconcile_interval_sec: u64,
}

impl Default for StoreRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            queue_capacity: 256,
            reconciliation_capacity: 1000,
            reconcile_interval_sec: 60,
        }
    }
}

impl StoreRetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        exponential_backoff(self.backoff_base_ms, self.backoff_max_ms, attempt)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_sec.max(1))
    }
}

/// base * 2^(attempt-1), capped at max
pub fn exponential_backoff(base_ms: u64, max_ms: u64, attempt: u32) -> Duration {
    let shift = attempt.saturating_sub(1).min(20);
    let ms = base_ms.saturating_mul(1u64 << shift).min(max_ms);
    Duration::from_millis(ms)
}
