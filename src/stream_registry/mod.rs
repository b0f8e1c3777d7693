//! StreamRegistry - Process-wide stream worker map
//!
//! ## Responsibilities
//!
//! - Single worker per source id
//! - Per-stream and system-wide statistics
//! - Autostart at boot and teardown of every worker at shutdown
//!
//! The map lock is only held for map updates. A source being started or
//! stopped holds a placeholder entry while its adapter opens or its worker
//! drains, so other sources' calls never wait on it.
//!
//! A worker that has ended on its own (errored, end of stream) keeps its
//! entry so its stats stay visible. Starting that source replaces the entry.

use crate::config_store::ConfigStore;
use crate::error::{Error, Result};
use crate::event_store::EventStore;
use crate::frame_adapter::AdapterFactory;
use crate::notification_dispatcher::{DispatchStats, NotificationDispatcher};
use crate::realtime_hub::{HubMessage, RealtimeHub, StreamStatusMessage};
use crate::stream_worker::{self, StreamStats, WorkerDeps, WorkerExit, WorkerHandle, WorkerState};
use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::RwLock;

/// System-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub active_streams: usize,
    pub registered_streams: usize,
    pub errored_streams: usize,
    pub active_events: usize,
    pub sources_with_history: usize,
    pub frames_total: u64,
    pub frames_dropped_total: u64,
    pub stored_events: u64,
    pub pending_store_retries: usize,
    pub reconciliation_needed: usize,
    pub websocket_clients: u64,
    pub notifications: DispatchStats,
}

/// Registry slot of one source
enum WorkerEntry {
    /// Adapter is being opened by the `start` call holding this token
    Starting(u64),
    /// `stop` is draining the worker; its stats stay readable
    Stopping(Arc<RwLock<StreamStats>>),
    Running(WorkerHandle),
}

impl WorkerEntry {
    /// `Some(token)` matches that start's placeholder, `None` a stop's
    fn is_placeholder(&self, token: Option<u64>) -> bool {
        match (self, token) {
            (Self::Starting(own), Some(token)) => *own == token,
            (Self::Stopping(_), None) => true,
            _ => false,
        }
    }

    fn stats(&self) -> Option<Arc<RwLock<StreamStats>>> {
        match self {
            Self::Starting(_) => None,
            Self::Stopping(stats) => Some(stats.clone()),
            Self::Running(handle) => Some(handle.shared_stats()),
        }
    }
}

type WorkerMap = Mutex<HashMap<String, WorkerEntry>>;

fn lock(workers: &WorkerMap) -> MutexGuard<'_, HashMap<String, WorkerEntry>> {
    // Entries stay consistent across a panicked holder; nothing awaits under it
    workers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a placeholder entry unless disarmed (error or cancellation)
struct PlaceholderGuard<'a> {
    workers: &'a WorkerMap,
    source_id: &'a str,
    token: Option<u64>,
    armed: bool,
}

impl Drop for PlaceholderGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut workers = lock(self.workers);
        if workers
            .get(self.source_id)
            .map_or(false, |entry| entry.is_placeholder(self.token))
        {
            workers.remove(self.source_id);
        }
    }
}

pub struct StreamRegistry {
    workers: WorkerMap,
    next_start: AtomicU64,
    config: Arc<ConfigStore>,
    factory: Arc<dyn AdapterFactory>,
    deps: WorkerDeps,
}

impl StreamRegistry {
    pub fn new(config: Arc<ConfigStore>, factory: Arc<dyn AdapterFactory>, deps: WorkerDeps) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            next_start: AtomicU64::new(0),
            config,
            factory,
            deps,
        }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.deps.store
    }

    pub fn dispatcher(&self) -> &Arc<NotificationDispatcher> {
        &self.deps.dispatcher
    }

    pub fn hub(&self) -> &Arc<RealtimeHub> {
        &self.deps.hub
    }

    /// Start a worker for a configured source
    pub async fn start(&self, source_id: &str) -> Result<StreamStats> {
        let source = self.config.require(source_id).await?;
        let token = self.next_start.fetch_add(1, Ordering::Relaxed);

        let finished = {
            let mut workers = lock(&self.workers);
            let finished = match workers.remove(source_id) {
                None => None,
                Some(WorkerEntry::Running(handle)) if handle.is_finished() => Some(handle),
                Some(busy) => {
                    workers.insert(source_id.to_string(), busy);
                    return Err(Error::StreamAlreadyActive(source_id.to_string()));
                }
            };
            workers.insert(source_id.to_string(), WorkerEntry::Starting(token));
            finished
        };
        let mut guard = PlaceholderGuard {
            workers: &self.workers,
            source_id,
            token: Some(token),
            armed: true,
        };

        // A finished worker's entry is replaced
        if let Some(finished) = finished {
            let exit = finished.stop().await;
            tracing::debug!(source_id = %source_id, exit = ?exit, "Replacing finished worker");
        }

        let adapter = self.factory.open(&source).await.map_err(|e| match e {
            Error::SourceUnavailable { .. } => e,
            other => Error::SourceUnavailable {
                source_id: source_id.to_string(),
                message: other.to_string(),
            },
        })?;

        let handle = stream_worker::spawn(source, adapter, self.deps.clone());
        let stats = handle.stats().await;

        let orphan = {
            let mut workers = lock(&self.workers);
            let owned = workers
                .get(source_id)
                .map_or(false, |entry| entry.is_placeholder(Some(token)));
            if owned {
                workers.insert(source_id.to_string(), WorkerEntry::Running(handle));
                guard.armed = false;
                None
            } else {
                // Placeholder was cleared by shutdown_all
                Some(handle)
            }
        };
        if let Some(handle) = orphan {
            tracing::warn!(source_id = %source_id, "Registry shut down during start, stopping worker");
            let exit = handle.stop().await;
            tracing::debug!(source_id = %source_id, exit = ?exit, "Orphaned worker stopped");
            return Err(Error::StreamNotActive(source_id.to_string()));
        }

        self.broadcast_status(source_id, WorkerState::Running, None).await;
        Ok(stats)
    }

    /// Stop a worker; its open event is finalized before this returns
    pub async fn stop(&self, source_id: &str) -> Result<WorkerExit> {
        let handle = {
            let mut workers = lock(&self.workers);
            match workers.remove(source_id) {
                Some(WorkerEntry::Running(handle)) => {
                    workers.insert(
                        source_id.to_string(),
                        WorkerEntry::Stopping(handle.shared_stats()),
                    );
                    handle
                }
                Some(placeholder) => {
                    workers.insert(source_id.to_string(), placeholder);
                    return Err(Error::StreamNotActive(source_id.to_string()));
                }
                None => return Err(Error::StreamNotActive(source_id.to_string())),
            }
        };
        let guard = PlaceholderGuard {
            workers: &self.workers,
            source_id,
            token: None,
            armed: true,
        };

        let exit = handle.stop().await;
        drop(guard);

        let error = exit.as_ref().err().map(|e| e.to_string());
        self.broadcast_status(source_id, WorkerState::Stopped, error).await;
        exit
    }

    pub async fn status(&self, source_id: &str) -> Result<StreamStats> {
        let stats = lock(&self.workers).get(source_id).and_then(WorkerEntry::stats);
        match stats {
            Some(stats) => Ok(stats.read().await.clone()),
            None => Err(Error::StreamNotActive(source_id.to_string())),
        }
    }

    /// True for a running worker, including one that is being stopped
    pub async fn is_active(&self, source_id: &str) -> bool {
        match lock(&self.workers).get(source_id) {
            Some(WorkerEntry::Running(handle)) => !handle.is_finished(),
            Some(WorkerEntry::Stopping(_)) => true,
            Some(WorkerEntry::Starting(_)) | None => false,
        }
    }

    /// Stats for every registered worker, ordered by source id
    pub async fn list(&self) -> Vec<StreamStats> {
        let shared: Vec<Arc<RwLock<StreamStats>>> = lock(&self.workers)
            .values()
            .filter_map(WorkerEntry::stats)
            .collect();
        let mut all = Vec::with_capacity(shared.len());
        for stats in shared {
            all.push(stats.read().await.clone());
        }
        all.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        all
    }

    pub async fn system_stats(&self) -> Result<SystemStats> {
        let streams = self.list().await;
        let store = &self.deps.store;

        let mut history: BTreeSet<String> = store.sources_with_history().await?;
        history.extend(
            streams
                .iter()
                .filter(|s| s.has_active_event)
                .map(|s| s.source_id.clone()),
        );

        Ok(SystemStats {
            active_streams: streams.iter().filter(|s| s.state == WorkerState::Running).count(),
            registered_streams: streams.len(),
            errored_streams: streams.iter().filter(|s| s.state == WorkerState::Errored).count(),
            active_events: streams.iter().filter(|s| s.has_active_event).count(),
            sources_with_history: history.len(),
            frames_total: streams.iter().map(|s| s.frame_count).sum(),
            frames_dropped_total: streams.iter().map(|s| s.frames_dropped).sum(),
            stored_events: store.count().await?,
            pending_store_retries: store.pending_retries(),
            reconciliation_needed: store.reconciliation_needed().await.len(),
            websocket_clients: self.deps.hub.connection_count(),
            notifications: self.deps.dispatcher.stats(),
        })
    }

    /// Start every source flagged `autostart`; failures are logged
    pub async fn autostart(&self) -> usize {
        let mut started = 0;
        for source_id in self.config.autostart_ids().await {
            match self.start(&source_id).await {
                Ok(_) => started += 1,
                Err(e) => {
                    tracing::warn!(source_id = %source_id, error = %e, "Autostart failed")
                }
            }
        }
        started
    }

    /// Stop every worker; in-flight starts are abandoned
    pub async fn shutdown_all(&self) {
        let handles: Vec<WorkerHandle> = {
            let mut workers = lock(&self.workers);
            let ids: Vec<String> = workers.keys().cloned().collect();
            let mut handles = Vec::new();
            for id in ids {
                match workers.remove(&id) {
                    Some(WorkerEntry::Running(handle)) => {
                        workers.insert(id, WorkerEntry::Stopping(handle.shared_stats()));
                        handles.push(handle);
                    }
                    // In-flight stops keep their placeholder until they finish
                    Some(stopping @ WorkerEntry::Stopping(_)) => {
                        workers.insert(id, stopping);
                    }
                    Some(WorkerEntry::Starting(_)) | None => {}
                }
            }
            handles
        };
        let count = handles.len();

        let results = futures::future::join_all(handles.into_iter().map(|handle| async move {
            let source_id = handle.source_id().to_string();
            (source_id, handle.stop().await)
        }))
        .await;

        let mut workers = lock(&self.workers);
        for (source_id, result) in results {
            if matches!(workers.get(&source_id), Some(WorkerEntry::Stopping(_))) {
                workers.remove(&source_id);
            }
            if let Err(e) = result {
                tracing::error!(source_id = %source_id, error = %e, "Worker shutdown failed");
            }
        }
        drop(workers);
        tracing::info!(count = count, "All stream workers stopped");
    }

    async fn broadcast_status(&self, source_id: &str, state: WorkerState, error: Option<String>) {
        self.deps
            .hub
            .broadcast(HubMessage::StreamStatus(StreamStatusMessage {
                source_id: source_id.to_string(),
                state: state.as_str().to_string(),
                error,
                timestamp: Utc::now().to_rfc3339(),
            }))
            .await;
    }
}
