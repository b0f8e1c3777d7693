//! EventAggregator - Per-source temporal debouncing
//!
//! ## Responsibilities
//!
//! - Turn per-frame detection results into event open/extend/close transitions
//! - Suppress single-frame flicker (SUSTAINING) and brief dropouts (COOLDOWN)
//!
//! ## Design
//!
//! One instance per source, owned by that source's stream worker. It is plain
//! synchronous state with no locking; every call returns at most one
//! transition for the caller to persist and dispatch.
//!
//! ```text
//! IDLE --q--> SUSTAINING --q (sustain reached)--> ACTIVE --!q--> COOLDOWN
//!  ^              |                                 ^  q            |
//!  +------!q------+                                 +---------------+
//!  ^                                                                |
//!  +-------------------------- cooldown elapsed ---------------------+
//! ```

use crate::config_store::{Source, WindowSpec};
use crate::models::{CloseReason, Detection, DetectionFrame, Event, EventTransition, TransitionKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Externally visible aggregator state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregatorState {
    Idle,
    Sustaining,
    Active,
    Cooldown,
}

/// Thresholds and windows taken from the source
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    pub threshold: f32,
    pub sustain: WindowSpec,
    pub cooldown: WindowSpec,
    pub labels: Vec<String>,
}

impl From<&Source> for AggregatorConfig {
    fn from(source: &Source) -> Self {
        Self {
            threshold: source.threshold,
            sustain: source.sustain,
            cooldown: source.cooldown,
            labels: source.labels.clone(),
        }
    }
}

impl AggregatorConfig {
    /// Max qualifying confidence and the qualifying labels, or None
    pub fn qualify(&self, detections: &[Detection]) -> Option<(f32, BTreeSet<String>)> {
        let mut best: Option<f32> = None;
        let mut labels = BTreeSet::new();

        for d in detections {
            if d.confidence.is_nan()
                || d.confidence < self.threshold
                || !self.accepts_label(&d.label)
            {
                continue;
            }
            best = Some(best.map_or(d.confidence, |b| b.max(d.confidence)));
            labels.insert(d.label.clone());
        }

        best.map(|c| (c, labels))
    }

    /// Empty allowlist accepts every label
    fn accepts_label(&self, label: &str) -> bool {
        self.labels.is_empty() || self.labels.iter().any(|l| l == label)
    }
}

/// Internal phase with per-state data
#[derive(Debug, Clone)]
enum Phase {
    Idle,
    Sustaining {
        started_at: DateTime<Utc>,
        count: u32,
    },
    Active {
        event: Event,
        last_qualifying_at: DateTime<Utc>,
    },
    Cooldown {
        event: Event,
        provisional_end: DateTime<Utc>,
        entered_at: DateTime<Utc>,
        quiet_frames: u32,
    },
}

/// EventAggregator instance
pub struct EventAggregator {
    source_id: String,
    config: AggregatorConfig,
    phase: Phase,
}

impl EventAggregator {
    /// Create aggregator for a source
    pub fn new(source: &Source) -> Self {
        Self::with_config(source.id.clone(), AggregatorConfig::from(source))
    }

    pub fn with_config(source_id: impl Into<String>, config: AggregatorConfig) -> Self {
        Self {
            source_id: source_id.into(),
            config,
            phase: Phase::Idle,
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn state(&self) -> AggregatorState {
        match self.phase {
            Phase::Idle => AggregatorState::Idle,
            Phase::Sustaining { .. } => AggregatorState::Sustaining,
            Phase::Active { .. } => AggregatorState::Active,
            Phase::Cooldown { .. } => AggregatorState::Cooldown,
        }
    }

    /// The open event (ACTIVE or COOLDOWN)
    pub fn open_event(&self) -> Option<&Event> {
        match &self.phase {
            Phase::Active { event, .. } | Phase::Cooldown { event, .. } => Some(event),
            _ => None,
        }
    }

    /// The frame's qualifying confidence under the source's threshold/allowlist
    pub fn qualifying_confidence(&self, frame: &DetectionFrame) -> Option<f32> {
        self.config.qualify(&frame.detections).map(|(confidence, _)| confidence)
    }

    /// Feed one detection frame (capture order)
    pub fn observe(&mut self, frame: &DetectionFrame) -> Option<EventTransition> {
        let now = frame.captured_at;
        let qualified = self.config.qualify(&frame.detections);
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);

        let (next, transition) = match (phase, qualified) {
            (Phase::Idle, None) => (Phase::Idle, None),
            (Phase::Idle, Some((confidence, labels))) => {
                self.sustain_or_promote(now, 1, now, confidence, labels)
            }
            (Phase::Sustaining { started_at, count }, Some((confidence, labels))) => {
                self.sustain_or_promote(started_at, count + 1, now, confidence, labels)
            }
            (Phase::Sustaining { count, .. }, None) => {
                tracing::debug!(
                    source_id = %self.source_id,
                    candidate_frames = count,
                    "Candidate discarded before sustain window"
                );
                (Phase::Idle, None)
            }
            (Phase::Active { mut event, .. }, Some((confidence, labels)))
            | (Phase::Cooldown { mut event, .. }, Some((confidence, labels))) => {
                event.extend(confidence, &labels);
                let transition =
                    EventTransition::new(TransitionKind::Extended, event.clone(), now);
                (
                    Phase::Active {
                        event,
                        last_qualifying_at: now,
                    },
                    Some(transition),
                )
            }
            (Phase::Active { event, last_qualifying_at }, None) => {
                tracing::debug!(
                    source_id = %self.source_id,
                    event_id = %event.id,
                    "Event entering cooldown"
                );
                (
                    Phase::Cooldown {
                        event,
                        provisional_end: last_qualifying_at,
                        entered_at: now,
                        quiet_frames: 0,
                    },
                    None,
                )
            }
            (
                Phase::Cooldown {
                    mut event,
                    provisional_end,
                    entered_at,
                    quiet_frames,
                },
                None,
            ) => {
                let quiet_frames = quiet_frames + 1;
                if self.config.cooldown.reached(quiet_frames, now - entered_at) {
                    event.close(provisional_end, CloseReason::CooldownExpired);
                    tracing::info!(
                        source_id = %self.source_id,
                        event_id = %event.id,
                        frame_count = event.frame_count,
                        max_confidence = event.max_confidence,
                        "Event closed (cooldown expired)"
                    );
                    (
                        Phase::Idle,
                        Some(EventTransition::new(TransitionKind::Closed, event, now)),
                    )
                } else {
                    (
                        Phase::Cooldown {
                            event,
                            provisional_end,
                            entered_at,
                            quiet_frames,
                        },
                        None,
                    )
                }
            }
        };

        self.phase = next;
        transition
    }

    /// Close any open event with `stream_stopped`
    ///
    /// A pending candidate is discarded. The event's end_time is its last
    /// qualifying frame.
    pub fn force_close(&mut self, at: DateTime<Utc>) -> Option<EventTransition> {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        let (mut event, end) = match phase {
            Phase::Active {
                event,
                last_qualifying_at,
            } => (event, last_qualifying_at),
            Phase::Cooldown {
                event,
                provisional_end,
                ..
            } => (event, provisional_end),
            Phase::Idle | Phase::Sustaining { .. } => return None,
        };

        event.close(end, CloseReason::StreamStopped);
        tracing::info!(
            source_id = %self.source_id,
            event_id = %event.id,
            frame_count = event.frame_count,
            "Event closed (stream stopped)"
        );
        Some(EventTransition::new(TransitionKind::Closed, event, at))
    }

    fn sustain_or_promote(
        &self,
        started_at: DateTime<Utc>,
        count: u32,
        now: DateTime<Utc>,
        confidence: f32,
        labels: BTreeSet<String>,
    ) -> (Phase, Option<EventTransition>) {
        if !self.config.sustain.reached(count, now - started_at) {
            return (Phase::Sustaining { started_at, count }, None);
        }

        let event = Event::open(self.source_id.clone(), started_at, confidence, labels);
        tracing::info!(
            source_id = %self.source_id,
            event_id = %event.id,
            confidence = confidence,
            labels = ?event.labels,
            "Event opened"
        );
        let transition = EventTransition::new(TransitionKind::Opened, event.clone(), now);
        (
            Phase::Active {
                event,
                last_qualifying_at: now,
            },
            Some(transition),
        )
    }
}
