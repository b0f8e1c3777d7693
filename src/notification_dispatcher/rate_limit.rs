//! Per-source alert rate limiting

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Admits at most one alert per source per `min_interval`
pub struct AlertRateLimiter {
    min_interval: Duration,
    last_sent: HashMap<String, Instant>,
}

impl AlertRateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: HashMap::new(),
        }
    }

    /// Returns true and records `now` if an alert may be sent
    pub fn try_admit(&mut self, source_id: &str, now: Instant) -> bool {
        if let Some(last) = self.last_sent.get(source_id) {
            if now.saturating_duration_since(*last) < self.min_interval {
                return false;
            }
        }
        self.last_sent.insert(source_id.to_string(), now);
        true
    }
}
