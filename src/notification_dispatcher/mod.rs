//! NotificationDispatcher - Event transition fan-out
//!
//! ## Responsibilities
//!
//! - Non-blocking `notify` for stream workers (bounded queue)
//! - Live subscribers via RealtimeHub (opened / closed, throttled extended)
//! - External alert sinks, each with its own ordered queue and retry
//! - Per-source alert rate limiting; `closed` follows only delivered `opened`
//!
//! Nothing here ever blocks or fails the detection path; delivery problems
//! are logged and counted. Per-event bookkeeping is keyed by source (a
//! source has at most one open event), so a `closed` lost to a full queue
//! is superseded by the source's next `opened`.

mod rate_limit;
mod telegram;
mod webhook;

pub use rate_limit::AlertRateLimiter;
pub use telegram::{format_message, TelegramSink};
pub use webhook::WebhookSink;

use crate::config_store::DispatchPolicy;
use crate::error::{Error, Result};
use crate::models::{EventTransition, TransitionKind};
use crate::realtime_hub::{HubMessage, RealtimeHub};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use uuid::Uuid;

/// External alert destination
#[async_trait]
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(&self, transition: &EventTransition) -> Result<()>;
}

#[derive(Default)]
struct DispatchCounters {
    enqueued: AtomicU64,
    live_pushed: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    suppressed: AtomicU64,
}

/// Dispatcher counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub enqueued: u64,
    pub live_pushed: u64,
    pub delivered: u64,
    pub failed: u64,
    pub suppressed: u64,
}

pub struct NotificationDispatcher {
    tx: mpsc::Sender<EventTransition>,
    counters: Arc<DispatchCounters>,
    sink_names: Vec<String>,
}

impl NotificationDispatcher {
    /// Create the dispatcher and spawn its router and sink workers
    pub fn spawn(
        hub: Arc<RealtimeHub>,
        sinks: Vec<Arc<dyn AlertSink>>,
        policy: DispatchPolicy,
    ) -> Self {
        let (tx, rx) = mpsc::channel(policy.queue_capacity.max(1));
        let counters = Arc::new(DispatchCounters::default());
        let sink_names = sinks.iter().map(|s| s.name().to_string()).collect();

        let sink_queues = sinks
            .into_iter()
            .map(|sink| spawn_sink_worker(sink, policy.clone(), counters.clone()))
            .collect();

        let router = Router::new(hub, sink_queues, policy, counters.clone());
        tokio::spawn(router.run(rx));

        Self {
            tx,
            counters,
            sink_names,
        }
    }

    /// Enqueue a transition; never blocks
    pub fn notify(&self, transition: EventTransition) {
        match self.tx.try_send(transition) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                let (reason, transition) = match err {
                    mpsc::error::TrySendError::Full(t) => ("queue full", t),
                    mpsc::error::TrySendError::Closed(t) => ("dispatcher stopped", t),
                };
                tracing::warn!(
                    source_id = %transition.source_id(),
                    event_id = %transition.event.id,
                    kind = transition.kind.as_str(),
                    reason = reason,
                    "Notification dropped"
                );
            }
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            live_pushed: self.counters.live_pushed.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            suppressed: self.counters.suppressed.load(Ordering::Relaxed),
        }
    }

    pub fn sink_names(&self) -> &[String] {
        &self.sink_names
    }
}

struct SinkQueue {
    name: String,
    tx: mpsc::Sender<EventTransition>,
}

struct Router {
    hub: Arc<RealtimeHub>,
    sink_queues: Vec<SinkQueue>,
    limiter: AlertRateLimiter,
    /// Per source: the event whose `opened` alert went to the sinks
    alerted: HashMap<String, Uuid>,
    /// Per source: last live `extended` push of its open event
    last_extend_push: HashMap<String, (Uuid, Instant)>,
    policy: DispatchPolicy,
    counters: Arc<DispatchCounters>,
}

impl Router {
    fn new(
        hub: Arc<RealtimeHub>,
        sink_queues: Vec<SinkQueue>,
        policy: DispatchPolicy,
        counters: Arc<DispatchCounters>,
    ) -> Self {
        Self {
            hub,
            sink_queues,
            limiter: AlertRateLimiter::new(policy.min_interval()),
            alerted: HashMap::new(),
            last_extend_push: HashMap::new(),
            policy,
            counters,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<EventTransition>) {
        while let Some(transition) = rx.recv().await {
            self.route_live(&transition).await;
            self.route_sinks(transition);
        }
        tracing::debug!("Notification router stopped");
    }

    async fn route_live(&mut self, transition: &EventTransition) {
        let event_id = transition.event.id;
        let source_id = transition.source_id();
        let forward = match transition.kind {
            TransitionKind::Opened => {
                self.last_extend_push.remove(source_id);
                true
            }
            TransitionKind::Closed => {
                if matches!(self.last_extend_push.get(source_id), Some((id, _)) if *id == event_id) {
                    self.last_extend_push.remove(source_id);
                }
                true
            }
            TransitionKind::Extended => {
                if !self.policy.notify_on_extend {
                    false
                } else {
                    let now = Instant::now();
                    let due = match self.last_extend_push.get(source_id) {
                        Some((id, last)) if *id == event_id => {
                            now.saturating_duration_since(*last) >= self.policy.extend_interval()
                        }
                        _ => true,
                    };
                    if due {
                        self.last_extend_push
                            .insert(source_id.to_string(), (event_id, now));
                    }
                    due
                }
            }
        };

        if forward {
            self.hub
                .broadcast(HubMessage::from_transition(transition.clone()))
                .await;
            self.counters.live_pushed.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn route_sinks(&mut self, transition: EventTransition) {
        if self.sink_queues.is_empty() {
            return;
        }

        let source_id = transition.source_id();
        let send = match transition.kind {
            TransitionKind::Opened => {
                // Any previous entry is an event whose `closed` never arrived
                if let Some(stale) = self.alerted.remove(source_id) {
                    tracing::debug!(
                        source_id = %source_id,
                        event_id = %stale,
                        "Dropping alert state of superseded event"
                    );
                }
                if self.limiter.try_admit(source_id, Instant::now()) {
                    self.alerted.insert(source_id.to_string(), transition.event.id);
                    true
                } else {
                    self.counters.suppressed.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        source_id = %source_id,
                        event_id = %transition.event.id,
                        min_interval_sec = self.policy.min_interval_sec,
                        "Alert suppressed by rate limit"
                    );
                    false
                }
            }
            TransitionKind::Closed => {
                let alerted = self.alerted.get(source_id) == Some(&transition.event.id);
                if alerted {
                    self.alerted.remove(source_id);
                }
                alerted
            }
            TransitionKind::Extended => false,
        };

        if !send {
            return;
        }

        for queue in &self.sink_queues {
            if queue.tx.try_send(transition.clone()).is_err() {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    sink = %queue.name,
                    event_id = %transition.event.id,
                    "Sink queue full, alert dropped"
                );
            }
        }
    }
}

fn spawn_sink_worker(
    sink: Arc<dyn AlertSink>,
    policy: DispatchPolicy,
    counters: Arc<DispatchCounters>,
) -> SinkQueue {
    let (tx, mut rx) = mpsc::channel::<EventTransition>(policy.queue_capacity.max(1));
    let name = sink.name().to_string();

    tokio::spawn(async move {
        while let Some(transition) = rx.recv().await {
            match deliver_with_retry(sink.as_ref(), &transition, &policy).await {
                Ok(attempts) => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        sink = %sink.name(),
                        event_id = %transition.event.id,
                        kind = transition.kind.as_str(),
                        attempts = attempts,
                        "Alert delivered"
                    );
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        sink = %sink.name(),
                        event_id = %transition.event.id,
                        kind = transition.kind.as_str(),
                        error = %e,
                        "Alert delivery failed"
                    );
                }
            }
        }
    });

    SinkQueue { name, tx }
}

/// Returns the number of attempts used
async fn deliver_with_retry(
    sink: &dyn AlertSink,
    transition: &EventTransition,
    policy: &DispatchPolicy,
) -> Result<u32> {
    let max_attempts = policy.sink_max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match sink.deliver(transition).await {
            Ok(()) => return Ok(attempt),
            Err(e) => {
                tracing::warn!(
                    sink = %sink.name(),
                    event_id = %transition.event.id,
                    attempt = attempt,
                    error = %e,
                    "Alert delivery attempt failed"
                );
                last_error = e.to_string();
                if attempt < max_attempts {
                    tokio::time::sleep(policy.sink_backoff(attempt)).await;
                }
            }
        }
    }

    Err(Error::NotificationDeliveryFailure {
        sink: sink.name().to_string(),
        message: format!("{} attempts exhausted: {}", max_attempts, last_error),
    })
}
