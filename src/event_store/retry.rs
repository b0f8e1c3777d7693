//! Finalize retry queue
//!
//! Closed events whose first write failed are retried in the background
//! with exponential backoff. Events that exhaust their attempts, or that
//! arrive while the queue is full, are kept in the bounded reconciliation
//! list. That list is re-driven periodically and on demand.

use super::locks::EventLocks;
use super::repository::EventRepository;
use crate::config_store::StoreRetryPolicy;
use crate::models::Event;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::time::MissedTickBehavior;

/// Event that could not be persisted
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationEntry {
    pub event: Event,
    pub attempts: u32,
    pub last_error: String,
    pub marked_at: DateTime<Utc>,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub stored: usize,
    pub remaining: usize,
}

struct RetryItem {
    event: Event,
    attempts: u32,
    last_error: String,
}

/// Bounded list; the oldest entry is evicted when full
struct ReconciliationList {
    entries: RwLock<VecDeque<ReconciliationEntry>>,
    capacity: usize,
    evicted: AtomicU64,
}

impl ReconciliationList {
    fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
            evicted: AtomicU64::new(0),
        }
    }

    async fn push(&self, entry: ReconciliationEntry) {
        let mut entries = self.entries.write().await;
        while entries.len() >= self.capacity {
            if let Some(oldest) = entries.pop_front() {
                self.evicted.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    event_id = %oldest.event.id,
                    source_id = %oldest.event.source_id,
                    capacity = self.capacity,
                    "Reconciliation list full, oldest event dropped"
                );
            }
        }
        entries.push_back(entry);
    }

    async fn mark(&self, item: RetryItem) {
        self.push(ReconciliationEntry {
            event: item.event,
            attempts: item.attempts,
            last_error: item.last_error,
            marked_at: Utc::now(),
        })
        .await;
    }

    /// One write attempt per entry; failures go back on the list
    async fn reconcile(&self, repo: &dyn EventRepository, locks: &Arc<EventLocks>) -> ReconcileReport {
        let drained: Vec<ReconciliationEntry> = self.entries.write().await.drain(..).collect();
        let mut report = ReconcileReport::default();

        for mut entry in drained {
            let result = {
                let _guard = locks.acquire(entry.event.id).await;
                repo.insert(&entry.event).await
            };
            entry.attempts += 1;
            match result {
                Ok(()) => {
                    report.stored += 1;
                    tracing::info!(
                        event_id = %entry.event.id,
                        source_id = %entry.event.source_id,
                        attempts = entry.attempts,
                        "Reconciled event persisted"
                    );
                }
                Err(e) => {
                    entry.last_error = e.to_string();
                    report.remaining += 1;
                    self.push(entry).await;
                }
            }
        }
        report
    }
}

pub struct FinalizeRetryQueue {
    tx: mpsc::Sender<RetryItem>,
    pending: Arc<AtomicUsize>,
    reconciliation: Arc<ReconciliationList>,
    repo: Arc<dyn EventRepository>,
    locks: Arc<EventLocks>,
}

impl FinalizeRetryQueue {
    /// Create the queue and spawn its worker
    pub fn spawn(
        repo: Arc<dyn EventRepository>,
        locks: Arc<EventLocks>,
        policy: StoreRetryPolicy,
    ) -> Self {
        let (tx, rx) = mpsc::channel(policy.queue_capacity.max(1));
        let pending = Arc::new(AtomicUsize::new(0));
        let reconciliation = Arc::new(ReconciliationList::new(policy.reconciliation_capacity));

        tokio::spawn(run_retry_worker(
            rx,
            repo.clone(),
            locks.clone(),
            policy,
            pending.clone(),
            reconciliation.clone(),
        ));

        Self {
            tx,
            pending,
            reconciliation,
            repo,
            locks,
        }
    }

    /// Hand over an event whose first write failed
    pub async fn enqueue(&self, event: Event, last_error: String) {
        // Counted before sending so the worker never decrements below zero
        self.pending.fetch_add(1, Ordering::SeqCst);
        let item = RetryItem {
            event,
            attempts: 1,
            last_error,
        };
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(err) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                let item = match err {
                    mpsc::error::TrySendError::Full(item) => item,
                    mpsc::error::TrySendError::Closed(item) => item,
                };
                tracing::error!(
                    event_id = %item.event.id,
                    source_id = %item.event.source_id,
                    "Finalize retry queue unavailable, event needs reconciliation"
                );
                self.reconciliation.mark(item).await;
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub async fn reconciliation_needed(&self) -> Vec<ReconciliationEntry> {
        self.reconciliation.entries.read().await.iter().cloned().collect()
    }

    /// Entries dropped because the reconciliation list was full
    pub fn reconciliation_evicted(&self) -> u64 {
        self.reconciliation.evicted.load(Ordering::Relaxed)
    }

    /// Try every reconciliation entry once now
    pub async fn reconcile(&self) -> ReconcileReport {
        self.reconciliation.reconcile(self.repo.as_ref(), &self.locks).await
    }
}

async fn retry_item(
    mut item: RetryItem,
    repo: &dyn EventRepository,
    locks: &Arc<EventLocks>,
    policy: &StoreRetryPolicy,
    reconciliation: &ReconciliationList,
) {
    let mut stored = false;

    while item.attempts < policy.max_attempts {
        tokio::time::sleep(policy.backoff(item.attempts)).await;
        item.attempts += 1;

        let _guard = locks.acquire(item.event.id).await;
        match repo.insert(&item.event).await {
            Ok(()) => {
                stored = true;
                break;
            }
            Err(e) => {
                tracing::warn!(
                    event_id = %item.event.id,
                    attempt = item.attempts,
                    error = %e,
                    "Finalize retry failed"
                );
                item.last_error = e.to_string();
            }
        }
    }

    if stored {
        tracing::info!(
            event_id = %item.event.id,
            source_id = %item.event.source_id,
            attempts = item.attempts,
            "Event persisted after retry"
        );
    } else {
        tracing::error!(
            event_id = %item.event.id,
            source_id = %item.event.source_id,
            attempts = item.attempts,
            error = %item.last_error,
            "Event store retries exhausted, event needs reconciliation"
        );
        reconciliation.mark(item).await;
    }
}

async fn run_retry_worker(
    mut rx: mpsc::Receiver<RetryItem>,
    repo: Arc<dyn EventRepository>,
    locks: Arc<EventLocks>,
    policy: StoreRetryPolicy,
    pending: Arc<AtomicUsize>,
    reconciliation: Arc<ReconciliationList>,
) {
    let periodic = policy.reconcile_interval_sec > 0;
    let mut tick = tokio::time::interval(policy.reconcile_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    tick.tick().await;

    loop {
        tokio::select! {
            item = rx.recv() => match item {
                Some(item) => {
                    retry_item(item, repo.as_ref(), &locks, &policy, &reconciliation).await;
                    pending.fetch_sub(1, Ordering::SeqCst);
                }
                None => break,
            },
            _ = tick.tick(), if periodic => {
                if reconciliation.entries.read().await.is_empty() {
                    continue;
                }
                let report = reconciliation.reconcile(repo.as_ref(), &locks).await;
                tracing::info!(
                    stored = report.stored,
                    remaining = report.remaining,
                    "Periodic reconciliation pass"
                );
            }
        }
    }
}
