//! StreamWorker - One running source
//!
//! ## Responsibilities
//!
//! - Pull frames with a bounded timeout and exponential backoff
//! - Run detection behind a single-slot drop-oldest buffer
//! - Drive the source's EventAggregator in capture order
//! - Keep the best frame of the open event and save it on close
//! - Persist closed events and hand every transition to the dispatcher
//! - Maintain StreamStats
//!
//! ## Design
//!
//! One tokio task per source. Acquisition and detection are two futures
//! joined inside that task; the aggregator belongs to the detection side.
//! Both observe the same shutdown `watch` channel. Whatever ends the worker
//! (stop, end of stream, escalation) the open event is finalized with
//! `stream_stopped` before the task completes. Snapshot and event-store
//! writes are each bounded by `WorkerPolicy::write_timeout`, so a slow
//! store hands the event to the retry queue instead of holding up stop.
//!
//! Acquisition and detection failures are counted separately. Each count
//! is reset by its own side's next success and either one reaching
//! `max_consecutive_timeouts` escalates the worker.

mod backpressure;
mod stats;

pub use backpressure::{InFlightGauge, InFlightGuard, LatestSlot};
pub use stats::{FpsWindow, StreamStats, WorkerState};

use crate::config_store::{Source, WorkerPolicy};
use crate::error::{Error, Result};
use crate::event_aggregator::EventAggregator;
use crate::event_store::EventStore;
use crate::frame_adapter::{CapturedFrame, Detector, FrameSource, OpenedAdapter};
use crate::models::{DetectionFrame, EventTransition, TransitionKind};
use crate::notification_dispatcher::NotificationDispatcher;
use crate::realtime_hub::{HubMessage, RealtimeHub, StreamStatusMessage};
use crate::snapshot_store::{BestFrameTracker, SnapshotStore};
use bytes::Bytes;
use chrono::Utc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

/// Shared collaborators for every worker
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<EventStore>,
    pub snapshots: Arc<SnapshotStore>,
    pub dispatcher: Arc<NotificationDispatcher>,
    pub hub: Arc<RealtimeHub>,
    /// Process-wide limit on concurrent detections
    pub inference_gate: Arc<Semaphore>,
    pub policy: WorkerPolicy,
}

/// How a worker ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    Stopped,
    SourceEnded,
    Errored {
        consecutive_failures: u32,
        last_error: String,
    },
}

impl WorkerExit {
    /// Exit error surfaced for an errored worker
    pub fn error(&self, source_id: &str) -> Option<Error> {
        match self {
            Self::Errored {
                consecutive_failures,
                ..
            } => Some(Error::DetectorTimeout {
                source_id: source_id.to_string(),
                consecutive: *consecutive_failures,
            }),
            _ => None,
        }
    }
}

/// Handle to a running worker task
pub struct WorkerHandle {
    source_id: String,
    shutdown: Arc<watch::Sender<bool>>,
    stats: Arc<RwLock<StreamStats>>,
    gauge: Arc<InFlightGauge>,
    join: JoinHandle<WorkerExit>,
    policy: WorkerPolicy,
}

impl WorkerHandle {
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub async fn stats(&self) -> StreamStats {
        self.stats.read().await.clone()
    }

    /// Live statistics, readable after the handle is consumed by `stop`
    pub fn shared_stats(&self) -> Arc<RwLock<StreamStats>> {
        self.stats.clone()
    }

    pub fn in_flight(&self) -> &InFlightGauge {
        &self.gauge
    }

    /// True once the worker task has completed
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal shutdown and wait for the task to finalize
    pub async fn stop(self) -> Result<WorkerExit> {
        self.shutdown.send_replace(true);

        let stop_timeout = self.policy.stop_timeout();
        let abort = self.join.abort_handle();
        match timeout(stop_timeout, self.join).await {
            Ok(Ok(exit)) => {
                tracing::info!(source_id = %self.source_id, exit = ?exit, "Stream worker stopped");
                Ok(exit)
            }
            Ok(Err(e)) => Err(Error::Internal(format!(
                "worker for {} panicked: {}",
                self.source_id, e
            ))),
            Err(_) => {
                abort.abort();
                tracing::error!(
                    source_id = %self.source_id,
                    timeout_ms = stop_timeout.as_millis() as u64,
                    "Stream worker did not stop in time, aborted"
                );
                Err(Error::Internal(format!(
                    "worker for {} did not stop within {} ms",
                    self.source_id,
                    stop_timeout.as_millis()
                )))
            }
        }
    }
}

/// Which half of the worker a failure came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureSide {
    Acquire,
    Detect,
}

/// State shared by the acquisition and detection halves
struct WorkerShared {
    source_id: String,
    deps: WorkerDeps,
    shutdown: Arc<watch::Sender<bool>>,
    stats: Arc<RwLock<StreamStats>>,
    gauge: Arc<InFlightGauge>,
    slot: LatestSlot<CapturedFrame>,
    acquire_failures: AtomicU32,
    detect_failures: AtomicU32,
}

impl WorkerShared {
    fn counter(&self, side: FailureSide) -> &AtomicU32 {
        match side {
            FailureSide::Acquire => &self.acquire_failures,
            FailureSide::Detect => &self.detect_failures,
        }
    }

    fn failures(&self, side: FailureSide) -> u32 {
        self.counter(side).load(Ordering::SeqCst)
    }

    fn worst_failures(&self) -> u32 {
        self.failures(FailureSide::Acquire)
            .max(self.failures(FailureSide::Detect))
    }

    async fn record_success(&self, side: FailureSide) {
        if self.counter(side).swap(0, Ordering::SeqCst) > 0 {
            self.stats.write().await.consecutive_timeouts = self.worst_failures();
        }
    }

    /// Count a failure; returns true when it trips the escalation threshold
    async fn record_failure(&self, side: FailureSide, error: &Error) -> bool {
        let failures = self.counter(side).fetch_add(1, Ordering::SeqCst) + 1;
        let max = self.deps.policy.max_consecutive_timeouts.max(1);
        let tripped = failures >= max;

        {
            let mut stats = self.stats.write().await;
            stats.consecutive_timeouts = self.worst_failures();
            stats.last_error = Some(error.to_string());
            if tripped {
                stats.set_state(WorkerState::Errored);
            }
        }

        if tripped {
            tracing::error!(
                source_id = %self.source_id,
                side = ?side,
                consecutive_failures = failures,
                error = %error,
                "Stream worker errored"
            );
            self.shutdown.send_replace(true);
        } else {
            tracing::warn!(
                source_id = %self.source_id,
                side = ?side,
                consecutive_failures = failures,
                error = %error,
                "Frame failure, retrying"
            );
        }
        tripped
    }

    /// `snapshot` is the best frame of the transition's event so far
    async fn handle_transition(&self, mut transition: EventTransition, snapshot: Option<Bytes>) {
        let write_timeout = self.deps.policy.write_timeout();

        if transition.kind == TransitionKind::Closed {
            if let Some(pixels) = &snapshot {
                let saved =
                    timeout(write_timeout, self.deps.snapshots.save(&transition.event, pixels)).await;
                match saved {
                    Ok(Ok(path)) => transition.event.snapshot_path = path,
                    Ok(Err(e)) => tracing::warn!(
                        source_id = %self.source_id,
                        event_id = %transition.event.id,
                        error = %e,
                        "Snapshot save failed"
                    ),
                    Err(_) => tracing::warn!(
                        source_id = %self.source_id,
                        event_id = %transition.event.id,
                        timeout_ms = write_timeout.as_millis() as u64,
                        "Snapshot save timed out"
                    ),
                }
            }
            self.deps
                .store
                .finalize_or_retry(transition.event.clone(), write_timeout)
                .await;
        }

        if transition.kind != TransitionKind::Extended {
            transition.snapshot = snapshot;
        }
        self.deps.dispatcher.notify(transition);
    }
}

/// Spawn a worker for an opened adapter
pub fn spawn(source: Source, adapter: OpenedAdapter, deps: WorkerDeps) -> WorkerHandle {
    let (shutdown_tx, _) = watch::channel(false);
    let shutdown = Arc::new(shutdown_tx);
    let stats = Arc::new(RwLock::new(StreamStats::new(&source.id)));
    let gauge = Arc::new(InFlightGauge::default());
    let policy = deps.policy.clone();

    let shared = Arc::new(WorkerShared {
        source_id: source.id.clone(),
        deps,
        shutdown: shutdown.clone(),
        stats: stats.clone(),
        gauge: gauge.clone(),
        slot: LatestSlot::new(),
        acquire_failures: AtomicU32::new(0),
        detect_failures: AtomicU32::new(0),
    });

    tracing::info!(
        source_id = %source.id,
        threshold = source.threshold,
        sustain = ?source.sustain,
        cooldown = ?source.cooldown,
        "Stream worker started"
    );

    let join = tokio::spawn(run(source.clone(), adapter, shared));

    WorkerHandle {
        source_id: source.id,
        shutdown,
        stats,
        gauge,
        join,
        policy,
    }
}

async fn run(source: Source, adapter: OpenedAdapter, shared: Arc<WorkerShared>) -> WorkerExit {
    let OpenedAdapter { frames, detector } = adapter;

    let (source_ended, ()) = tokio::join!(
        acquisition_loop(&shared, frames),
        detection_loop(&shared, &source, detector),
    );

    let mut stats = shared.stats.write().await;
    let exit = if stats.state == WorkerState::Errored {
        WorkerExit::Errored {
            consecutive_failures: stats.consecutive_timeouts,
            last_error: stats.last_error.clone().unwrap_or_default(),
        }
    } else {
        stats.set_state(WorkerState::Stopped);
        if source_ended {
            WorkerExit::SourceEnded
        } else {
            WorkerExit::Stopped
        }
    };
    stats.has_active_event = false;
    let state = stats.state;
    let last_error = stats.last_error.clone();
    drop(stats);

    if state == WorkerState::Errored {
        shared
            .deps
            .hub
            .broadcast(HubMessage::StreamStatus(StreamStatusMessage {
                source_id: shared.source_id.clone(),
                state: state.as_str().to_string(),
                error: last_error,
                timestamp: Utc::now().to_rfc3339(),
            }))
            .await;
    }

    exit
}

/// Returns true if the source reported end of stream
async fn acquisition_loop(shared: &WorkerShared, mut frames: Box<dyn FrameSource>) -> bool {
    let policy = &shared.deps.policy;
    let mut shutdown = shared.shutdown.subscribe();
    let mut fps = FpsWindow::new(policy.fps_window());
    let mut source_ended = false;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = tokio::select! {
            _ = shutdown.changed() => break,
            result = timeout(policy.frame_timeout(), frames.next_frame()) => result,
        };

        let failure = match next {
            Ok(Ok(Some(frame))) => {
                let captured_at = frame.captured_at;
                shared.slot.put(frame);
                shared.record_success(FailureSide::Acquire).await;

                let mut stats = shared.stats.write().await;
                stats.frame_count += 1;
                stats.fps = fps.record(Instant::now());
                stats.frames_dropped = shared.slot.dropped();
                stats.last_frame_at = Some(captured_at);
                continue;
            }
            Ok(Ok(None)) => {
                tracing::info!(source_id = %shared.source_id, "Source ended");
                source_ended = true;
                break;
            }
            Ok(Err(e)) => e,
            Err(_) => Error::DetectorTimeout {
                source_id: shared.source_id.clone(),
                consecutive: shared.failures(FailureSide::Acquire) + 1,
            },
        };

        shared.stats.write().await.fps = fps.rate(Instant::now());
        if shared.record_failure(FailureSide::Acquire, &failure).await {
            break;
        }

        let attempt = shared.failures(FailureSide::Acquire);
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(policy.backoff(attempt)) => {}
        }
    }

    shared.slot.close();
    source_ended
}

async fn detection_loop(shared: &WorkerShared, source: &Source, detector: Arc<dyn Detector>) {
    let policy = &shared.deps.policy;
    let mut shutdown = shared.shutdown.subscribe();
    let mut aggregator = EventAggregator::new(source);
    let mut best = BestFrameTracker::default();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = shared.slot.take() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let result = {
            let _permit = tokio::select! {
                _ = shutdown.changed() => break,
                permit = shared.deps.inference_gate.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let _in_flight = shared.gauge.enter();
            tokio::select! {
                _ = shutdown.changed() => break,
                result = timeout(policy.detect_timeout(), detector.detect(&frame)) => result,
            }
        };

        let outcome = match result {
            Ok(Ok(detections)) => Ok(detections),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Detection(format!(
                "detection timed out after {} ms",
                policy.detect_timeout_ms
            ))),
        };
        let detections = match outcome {
            Ok(detections) => detections,
            Err(e) => {
                if shared.record_failure(FailureSide::Detect, &e).await {
                    break;
                }
                let attempt = shared.failures(FailureSide::Detect);
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = tokio::time::sleep(policy.backoff(attempt)) => {}
                }
                continue;
            }
        };
        shared.record_success(FailureSide::Detect).await;

        let detection_frame = DetectionFrame {
            source_id: frame.source_id,
            captured_at: frame.captured_at,
            detections,
        };
        let confidence = aggregator.qualifying_confidence(&detection_frame);
        let transition = aggregator.observe(&detection_frame);

        let open_id = aggregator.open_event().map(|event| event.id);
        if let (Some(confidence), Some(event_id)) = (confidence, open_id) {
            best.offer(event_id, confidence, &frame.pixels);
        }

        {
            let mut stats = shared.stats.write().await;
            if confidence.is_some() {
                stats.detection_count += 1;
            }
            stats.has_active_event = open_id.is_some();
            stats.aggregator_state = aggregator.state();
        }

        tracing::debug!(
            source_id = %shared.source_id,
            seq = frame.seq,
            qualifying = confidence.is_some(),
            state = ?aggregator.state(),
            "Frame processed"
        );

        if let Some(transition) = transition {
            let snapshot = match transition.kind {
                TransitionKind::Closed => best.take(transition.event.id),
                _ => best.pixels_for(transition.event.id),
            };
            shared.handle_transition(transition, snapshot).await;
        }
    }

    if let Some(transition) = aggregator.force_close(Utc::now()) {
        tracing::info!(
            source_id = %shared.source_id,
            event_id = %transition.event.id,
            "Open event finalized on stream stop"
        );
        let snapshot = best.take(transition.event.id);
        shared.handle_transition(transition, snapshot).await;
    }

    let mut stats = shared.stats.write().await;
    stats.has_active_event = false;
    stats.aggregator_state = aggregator.state();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::{AdapterDescriptor, DispatchPolicy, StoreRetryPolicy, WindowSpec};
    use crate::event_store::{EventFilter, EventRepository, MemoryEventRepository, PageCursor};
    use crate::models::{CloseReason, Detection, Event, EventStatus};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{DateTime, TimeZone};
    use std::time::Duration;

    /// Emits scripted confidences, then ends, hangs or loops
    struct ScriptedFrames {
        source_id: String,
        script: Vec<f32>,
        cursor: usize,
        interval: Duration,
        after: AfterScript,
        base: DateTime<Utc>,
        /// Prefix payloads with a JPEG header
        jpeg: bool,
    }

    #[derive(Clone, Copy)]
    enum AfterScript {
        End,
        Hang,
        Repeat,
    }

    impl ScriptedFrames {
        fn new(script: Vec<f32>, after: AfterScript) -> Self {
            Self {
                source_id: "cam1".into(),
                script,
                cursor: 0,
                interval: Duration::from_millis(100),
                after,
                base: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                jpeg: false,
            }
        }
    }

    const JPEG_HEADER: &[u8] = &[0xFF, 0xD8, 0xFF];

    #[async_trait]
    impl FrameSource for ScriptedFrames {
        async fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
            if self.cursor >= self.script.len() {
                match self.after {
                    AfterScript::End => return Ok(None),
                    AfterScript::Hang => std::future::pending::<()>().await,
                    AfterScript::Repeat => {}
                }
            }
            tokio::time::sleep(self.interval).await;
            let confidence = self.script[self.cursor % self.script.len()];
            self.cursor += 1;
            let detections = vec![Detection::new("fight", confidence)];
            let mut pixels = if self.jpeg { JPEG_HEADER.to_vec() } else { Vec::new() };
            pixels.extend(serde_json::to_vec(&detections).unwrap());
            Ok(Some(CapturedFrame {
                source_id: self.source_id.clone(),
                seq: self.cursor as u64,
                captured_at: self.base + chrono::Duration::milliseconds(self.cursor as i64 * 100),
                pixels: Bytes::from(pixels),
            }))
        }
    }

    /// Decodes the payload after a delay, or fails
    struct ScriptedDetector {
        delay: Duration,
        fail: bool,
    }

    #[async_trait]
    impl Detector for ScriptedDetector {
        async fn detect(&self, frame: &CapturedFrame) -> Result<Vec<Detection>> {
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::Detection("model crashed".into()));
            }
            let payload = frame.pixels.strip_prefix(JPEG_HEADER).unwrap_or(&frame.pixels);
            Ok(serde_json::from_slice(payload)?)
        }
    }

    fn source() -> Source {
        Source {
            id: "cam1".into(),
            name: None,
            adapter: AdapterDescriptor::Replay {
                path: "unused.jsonl".into(),
                frame_interval_ms: 100,
                loop_playback: false,
            },
            threshold: 0.7,
            sustain: WindowSpec::Frames(2),
            cooldown: WindowSpec::Frames(3),
            labels: Vec::new(),
            autostart: false,
        }
    }

    fn deps(policy: WorkerPolicy) -> WorkerDeps {
        deps_with_store(policy, Arc::new(EventStore::in_memory()))
    }

    fn deps_with_store(policy: WorkerPolicy, store: Arc<EventStore>) -> WorkerDeps {
        let hub = Arc::new(RealtimeHub::new());
        WorkerDeps {
            store,
            snapshots: Arc::new(SnapshotStore::disabled()),
            dispatcher: Arc::new(NotificationDispatcher::spawn(
                hub.clone(),
                Vec::new(),
                DispatchPolicy::default(),
            )),
            hub,
            inference_gate: Arc::new(Semaphore::new(4)),
            policy,
        }
    }

    fn adapter(frames: ScriptedFrames, detector: ScriptedDetector) -> OpenedAdapter {
        OpenedAdapter {
            frames: Box::new(frames),
            detector: Arc::new(detector),
        }
    }

    fn fast_detector() -> ScriptedDetector {
        ScriptedDetector {
            delay: Duration::from_millis(1),
            fail: false,
        }
    }

    /// Every insert takes `delay`
    struct SlowRepository {
        inner: MemoryEventRepository,
        delay: Duration,
    }

    #[async_trait]
    impl EventRepository for SlowRepository {
        async fn insert(&self, event: &Event) -> Result<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.insert(event).await
        }
        async fn get(&self, id: uuid::Uuid) -> Result<Option<Event>> {
            self.inner.get(id).await
        }
        async fn update_status(&self, id: uuid::Uuid, status: EventStatus) -> Result<bool> {
            self.inner.update_status(id, status).await
        }
        async fn delete(&self, id: uuid::Uuid) -> Result<bool> {
            self.inner.delete(id).await
        }
        async fn list_page(
            &self,
            filter: &EventFilter,
            after: Option<PageCursor>,
            limit: u32,
        ) -> Result<Vec<Event>> {
            self.inner.list_page(filter, after, limit).await
        }
        async fn source_ids(&self) -> Result<Vec<String>> {
            self.inner.source_ids().await
        }
        async fn count(&self) -> Result<u64> {
            self.inner.count().await
        }
    }

    /// Every other call outlasts any frame timeout
    struct GappyFrames {
        calls: u64,
    }

    #[async_trait]
    impl FrameSource for GappyFrames {
        async fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
            self.calls += 1;
            if self.calls % 2 == 1 {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
            let detections = vec![Detection::new("fight", 0.1)];
            Ok(Some(CapturedFrame {
                source_id: "cam1".into(),
                seq: self.calls,
                captured_at: Utc::now(),
                pixels: Bytes::from(serde_json::to_vec(&detections).unwrap()),
            }))
        }
    }

    async fn wait_finished(handle: &WorkerHandle) {
        while !handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_scripted_stream_produces_one_closed_event() {
        let deps = deps(WorkerPolicy::default());
        let store = deps.store.clone();
        let frames = ScriptedFrames::new(vec![0.8, 0.9, 0.2, 0.1, 0.1, 0.1], AfterScript::End);
        let handle = spawn(source(), adapter(frames, fast_detector()), deps);

        wait_finished(&handle).await;
        let stats = handle.stats().await;
        assert_eq!(stats.frame_count, 6);
        assert_eq!(stats.detection_count, 2);
        assert_eq!(stats.state, WorkerState::Stopped);
        assert_eq!(handle.stop().await.unwrap(), WorkerExit::SourceEnded);

        let events = store.list_limited(EventFilter::default(), 10).await.unwrap();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.status, EventStatus::Closed);
        assert_eq!(event.close_reason, Some(CloseReason::CooldownExpired));
        assert_eq!(event.frame_count, 2);
        assert!((event.max_confidence - 0.9).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_finalizes_open_event() {
        let deps = deps(WorkerPolicy::default());
        let store = deps.store.clone();
        let frames = ScriptedFrames::new(vec![0.9], AfterScript::Repeat);
        let handle = spawn(source(), adapter(frames, fast_detector()), deps);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.stats().await.has_active_event);

        let exit = handle.stop().await.unwrap();
        assert_eq!(exit, WorkerExit::Stopped);

        // Finalized before stop returned
        let events = store.list_limited(EventFilter::default(), 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].close_reason, Some(CloseReason::StreamStopped));
        assert!(events[0].end_time.unwrap() >= events[0].start_time);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_timeouts_escalate_to_errored() {
        let policy = WorkerPolicy {
            frame_timeout_ms: 200,
            max_consecutive_timeouts: 3,
            ..Default::default()
        };
        let deps = deps(policy);
        let store = deps.store.clone();
        let frames = ScriptedFrames::new(vec![0.9, 0.9, 0.9], AfterScript::Hang);
        let handle = spawn(source(), adapter(frames, fast_detector()), deps);

        wait_finished(&handle).await;
        let stats = handle.stats().await;
        assert_eq!(stats.state, WorkerState::Errored);
        assert_eq!(stats.consecutive_timeouts, 3);
        assert!(!stats.has_active_event);

        let exit = handle.stop().await.unwrap();
        assert!(matches!(
            exit.error("cam1"),
            Some(Error::DetectorTimeout { consecutive: 3, .. })
        ));

        let events = store.list_limited(EventFilter::default(), 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].close_reason, Some(CloseReason::StreamStopped));
        assert_eq!(events[0].frame_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_failures_escalate() {
        let policy = WorkerPolicy {
            max_consecutive_timeouts: 2,
            ..Default::default()
        };
        let detector = ScriptedDetector {
            delay: Duration::from_millis(1),
            fail: true,
        };
        let frames = ScriptedFrames::new(vec![0.9], AfterScript::Repeat);
        let handle = spawn(source(), adapter(frames, detector), deps(policy));

        wait_finished(&handle).await;
        let exit = handle.stop().await.unwrap();
        assert!(matches!(exit, WorkerExit::Errored { consecutive_failures: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_detector_keeps_one_in_flight_and_drops_frames() {
        let detector = ScriptedDetector {
            delay: Duration::from_millis(450),
            fail: false,
        };
        let frames = ScriptedFrames::new(vec![0.9, 0.1], AfterScript::Repeat);
        let handle = spawn(source(), adapter(frames, detector), deps(WorkerPolicy::default()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let stats = handle.stats().await;
        assert_eq!(handle.in_flight().peak(), 1);
        assert!(stats.frames_dropped > 0);
        assert!(stats.frame_count > stats.frames_dropped);
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_write_does_not_lose_event_on_stop() {
        let repo = Arc::new(SlowRepository {
            inner: MemoryEventRepository::new(),
            delay: Duration::from_secs(6),
        });
        let store = Arc::new(EventStore::new(repo, StoreRetryPolicy::default()));
        let policy = WorkerPolicy::default();
        assert!(policy.write_timeout() < policy.stop_timeout());

        let frames = ScriptedFrames::new(vec![0.9], AfterScript::Repeat);
        let handle = spawn(
            source(),
            adapter(frames, fast_detector()),
            deps_with_store(policy, store.clone()),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(handle.stats().await.has_active_event);

        // The worker finishes inside stop_timeout; the event waits in the retry queue
        assert_eq!(handle.stop().await.unwrap(), WorkerExit::Stopped);
        assert_eq!(store.pending_retries(), 1);

        while store.pending_retries() > 0 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let events = store.list_limited(EventFilter::default(), 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].close_reason, Some(CloseReason::StreamStopped));
        assert!(store.reconciliation_needed().await.is_empty());
    }

    #[tokio::test]
    async fn test_best_frame_is_saved_with_event() {
        let dir = std::env::temp_dir().join(format!("watchpost-worker-{}", uuid::Uuid::new_v4()));
        let snapshots = Arc::new(SnapshotStore::new(Some(dir.clone())));
        let mut deps = deps(WorkerPolicy::default());
        deps.snapshots = snapshots.clone();
        let store = deps.store.clone();

        let mut frames =
            ScriptedFrames::new(vec![0.8, 0.95, 0.9, 0.1, 0.1, 0.1], AfterScript::End);
        frames.jpeg = true;
        let handle = spawn(source(), adapter(frames, fast_detector()), deps);
        wait_finished(&handle).await;

        let events = store.list_limited(EventFilter::default(), 10).await.unwrap();
        assert_eq!(events.len(), 1);
        let path = events[0].snapshot_path.clone().unwrap();
        assert!(path.ends_with(".jpg"));

        let saved = snapshots.load(&path).await.unwrap();
        let mut expected = JPEG_HEADER.to_vec();
        expected.extend(serde_json::to_vec(&vec![Detection::new("fight", 0.95)]).unwrap());
        assert_eq!(saved.as_ref(), expected.as_slice());

        tokio::fs::remove_dir_all(&dir).await.ok();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fps_decays_while_frames_time_out() {
        let policy = WorkerPolicy {
            frame_timeout_ms: 1000,
            max_consecutive_timeouts: 100,
            fps_window_sec: 1,
            ..Default::default()
        };
        let frames = ScriptedFrames::new(vec![0.1; 5], AfterScript::Hang);
        let handle = spawn(source(), adapter(frames, fast_detector()), deps(policy));

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(handle.stats().await.fps > 0.0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let stats = handle.stats().await;
        assert_eq!(stats.state, WorkerState::Running);
        assert!(stats.consecutive_timeouts > 0);
        assert_eq!(stats.fps, 0.0);
        handle.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_detection_failures_back_off() {
        let policy = WorkerPolicy {
            max_consecutive_timeouts: 5,
            ..Default::default()
        };
        let detector = ScriptedDetector {
            delay: Duration::from_millis(1),
            fail: true,
        };
        let frames = ScriptedFrames::new(vec![0.9], AfterScript::Repeat);
        let handle = spawn(source(), adapter(frames, detector), deps(policy));

        // Backoff of 200 + 400 + 800 ms keeps it below the threshold here
        tokio::time::sleep(Duration::from_secs(1)).await;
        let stats = handle.stats().await;
        assert_eq!(stats.state, WorkerState::Running);
        assert!(stats.consecutive_timeouts >= 1 && stats.consecutive_timeouts < 5);

        wait_finished(&handle).await;
        assert!(matches!(
            handle.stop().await.unwrap(),
            WorkerExit::Errored { consecutive_failures: 5, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovered_acquisition_resets_its_failure_count() {
        let policy = WorkerPolicy {
            frame_timeout_ms: 200,
            detect_timeout_ms: 10_000,
            max_consecutive_timeouts: 2,
            ..Default::default()
        };
        // Detection never completes inside the observed period
        let detector = ScriptedDetector {
            delay: Duration::from_secs(9),
            fail: false,
        };
        let frames = OpenedAdapter {
            frames: Box::new(GappyFrames { calls: 0 }),
            detector: Arc::new(detector),
        };
        let handle = spawn(source(), frames, deps(policy));

        tokio::time::sleep(Duration::from_secs(5)).await;
        let stats = handle.stats().await;
        assert_eq!(stats.state, WorkerState::Running);
        assert!(stats.frame_count >= 3);
        assert!(stats.consecutive_timeouts <= 1);
        assert_eq!(handle.stop().await.unwrap(), WorkerExit::Stopped);
    }
}
