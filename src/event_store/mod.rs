//! EventStore - Durable registry of closed events
//!
//! ## Responsibilities
//!
//! - Persist finalized events (retry queue on transient failure)
//! - Status transitions: closed -> resolved | false_positive (terminal)
//! - Lazy, stably ordered event listing
//! - Per-event-id write serialization
//!
//! The currently open event of a source lives in its aggregator and is
//! only written here once it closes.

mod locks;
mod memory;
mod repository;
mod retry;
mod sqlite;

pub use locks::{EventLocks, EventWriteGuard};
pub use memory::MemoryEventRepository;
pub use repository::{EventFilter, EventRepository, PageCursor};
pub use retry::{FinalizeRetryQueue, ReconcileReport, ReconciliationEntry};
pub use sqlite::SqliteEventRepository;

use crate::config_store::StoreRetryPolicy;
use crate::error::{Error, Result};
use crate::models::{Event, EventStatus};
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Records fetched per repository round trip while listing
const LIST_PAGE_SIZE: u32 = 200;

pub struct EventStore {
    repo: Arc<dyn EventRepository>,
    locks: Arc<EventLocks>,
    retry: FinalizeRetryQueue,
}

impl EventStore {
    /// Create the store and spawn its retry worker (requires a runtime)
    pub fn new(repo: Arc<dyn EventRepository>, retry_policy: StoreRetryPolicy) -> Self {
        let locks = Arc::new(EventLocks::new());
        let retry = FinalizeRetryQueue::spawn(repo.clone(), locks.clone(), retry_policy);
        Self { repo, locks, retry }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryEventRepository::new()),
            StoreRetryPolicy::default(),
        )
    }

    /// Connect by URL: `memory` or an sqlx SQLite URL
    pub async fn connect(database_url: &str, retry_policy: StoreRetryPolicy) -> Result<Self> {
        let repo: Arc<dyn EventRepository> = if database_url == "memory" {
            tracing::warn!("Using in-memory event repository, events are not durable");
            Arc::new(MemoryEventRepository::new())
        } else {
            Arc::new(SqliteEventRepository::connect(database_url).await?)
        };
        Ok(Self::new(repo, retry_policy))
    }

    /// Persist a closed event
    pub async fn finalize(&self, event: &Event) -> Result<()> {
        if event.end_time.is_none() || event.status != EventStatus::Closed {
            return Err(Error::Validation(format!(
                "event {} is not closed",
                event.id
            )));
        }

        let _guard = self.locks.acquire(event.id).await;
        self.repo
            .insert(event)
            .await
            .map_err(|e| Error::EventStoreWriteFailure(e.to_string()))?;

        tracing::info!(
            event_id = %event.id,
            source_id = %event.source_id,
            frame_count = event.frame_count,
            max_confidence = event.max_confidence,
            close_reason = ?event.close_reason,
            "Event finalized"
        );
        Ok(())
    }

    /// Persist a closed event within `write_timeout`, falling back to the
    /// retry queue on a retryable failure or a timed-out write.
    /// Returns true if the first write succeeded.
    pub async fn finalize_or_retry(&self, event: Event, write_timeout: Duration) -> bool {
        let error = match tokio::time::timeout(write_timeout, self.finalize(&event)).await {
            Ok(Ok(())) => return true,
            Ok(Err(e)) if e.is_retryable() => e.to_string(),
            Ok(Err(e)) => {
                tracing::error!(event_id = %event.id, error = %e, "Event rejected by store");
                return false;
            }
            Err(_) => format!("write timed out after {} ms", write_timeout.as_millis()),
        };

        tracing::warn!(
            event_id = %event.id,
            source_id = %event.source_id,
            error = %error,
            "Event write failed, queued for retry"
        );
        self.retry.enqueue(event, error).await;
        false
    }

    /// Move a closed event to resolved or false_positive
    pub async fn set_status(&self, id: Uuid, status: EventStatus) -> Result<Event> {
        if !status.is_terminal() {
            return Err(Error::InvalidStatusTransition(format!(
                "{} is not a permitted target status",
                status.as_str()
            )));
        }

        let _guard = self.locks.acquire(id).await;
        let mut event = self.repo.get(id).await?.ok_or_else(|| {
            Error::InvalidStatusTransition(format!("event {} does not exist", id))
        })?;

        if event.status.is_terminal() {
            return Err(Error::InvalidStatusTransition(format!(
                "event {} is already {}",
                id,
                event.status.as_str()
            )));
        }

        if !self.repo.update_status(id, status).await? {
            return Err(Error::InvalidStatusTransition(format!(
                "event {} does not exist",
                id
            )));
        }

        tracing::info!(
            event_id = %id,
            from = event.status.as_str(),
            to = status.as_str(),
            "Event status updated"
        );
        event.status = status;
        Ok(event)
    }

    pub async fn get(&self, id: Uuid) -> Result<Event> {
        self.repo
            .get(id)
            .await?
            .ok_or_else(|| Error::EventNotFound(id.to_string()))
    }

    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let _guard = self.locks.acquire(id).await;
        if !self.repo.delete(id).await? {
            return Err(Error::EventNotFound(id.to_string()));
        }
        tracing::info!(event_id = %id, "Event deleted");
        Ok(())
    }

    /// Lazy stream of matching events ordered by (start_time, id)
    pub fn list(&self, filter: EventFilter) -> BoxStream<'static, Result<Event>> {
        struct Pager {
            repo: Arc<dyn EventRepository>,
            filter: EventFilter,
            cursor: Option<PageCursor>,
            buffered: VecDeque<Event>,
            exhausted: bool,
        }

        let pager = Pager {
            repo: self.repo.clone(),
            filter,
            cursor: None,
            buffered: VecDeque::new(),
            exhausted: false,
        };

        stream::unfold(pager, |mut pager| async move {
            loop {
                if let Some(event) = pager.buffered.pop_front() {
                    return Some((Ok(event), pager));
                }
                if pager.exhausted {
                    return None;
                }
                match pager
                    .repo
                    .list_page(&pager.filter, pager.cursor, LIST_PAGE_SIZE)
                    .await
                {
                    Ok(page) => {
                        pager.exhausted = page.len() < LIST_PAGE_SIZE as usize;
                        if let Some(last) = page.last() {
                            pager.cursor = Some(PageCursor::after(last));
                        }
                        pager.buffered.extend(page);
                    }
                    Err(e) => {
                        pager.exhausted = true;
                        return Some((Err(e), pager));
                    }
                }
            }
        })
        .boxed()
    }

    /// Collect up to `limit` events from `list`
    pub async fn list_limited(&self, filter: EventFilter, limit: usize) -> Result<Vec<Event>> {
        self.list(filter).take(limit).try_collect().await
    }

    /// Source ids with at least one persisted event
    pub async fn sources_with_history(&self) -> Result<BTreeSet<String>> {
        Ok(self.repo.source_ids().await?.into_iter().collect())
    }

    pub async fn reconciliation_needed(&self) -> Vec<ReconciliationEntry> {
        self.retry.reconciliation_needed().await
    }

    /// Retry every reconciliation entry once
    pub async fn reconcile(&self) -> ReconcileReport {
        let report = self.retry.reconcile().await;
        tracing::info!(
            stored = report.stored,
            remaining = report.remaining,
            "Reconciliation pass"
        );
        report
    }

    pub fn reconciliation_evicted(&self) -> u64 {
        self.retry.reconciliation_evicted()
    }

    pub fn pending_retries(&self) -> usize {
        self.retry.pending()
    }

    pub async fn count(&self) -> Result<u64> {
        self.repo.count().await
    }

    pub async fn is_healthy(&self) -> bool {
        self.repo.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CloseReason;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
    }

    const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

    fn closed_event(source_id: &str, start_ms: i64) -> Event {
        let mut event = Event::open(source_id, ts(start_ms), 0.9, BTreeSet::from(["fight".to_string()]));
        event.close(ts(start_ms + 300), CloseReason::CooldownExpired);
        event
    }

    /// Fails the first `failures` inserts
    struct FlakyRepository {
        inner: MemoryEventRepository,
        failures: AtomicU32,
        inserts: AtomicU32,
    }

    impl FlakyRepository {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryEventRepository::new(),
                failures: AtomicU32::new(failures),
                inserts: AtomicU32::new(0),
            }
        }

        fn heal(&self) {
            self.failures.store(0, Ordering::SeqCst);
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
        async fn get(&self, id: Uuid) -> Result<Option<Event>> {
            self.inner.get(id).await
        }
        async fn update_status(&self, id: Uuid, status: EventStatus) -> Result<bool> {
            self.inner.update_status(id, status).await
        }
        async fn delete(&self, id: Uuid) -> Result<bool> {
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

    #[async_trait]
    impl EventRepository for FlakyRepository {
        async fn insert(&self, event: &Event) -> Result<()> {
            self.inserts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(Error::Database("database is locked".into()));
            }
            self.inner.insert(event).await
        }
        async fn get(&self, id: Uuid) -> Result<Option<Event>> {
            self.inner.get(id).await
        }
        async fn update_status(&self, id: Uuid, status: EventStatus) -> Result<bool> {
            self.inner.update_status(id, status).await
        }
        async fn delete(&self, id: Uuid) -> Result<bool> {
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

    async fn wait_for_retries(store: &EventStore) {
        while store.pending_retries() > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_set_status_twice_is_rejected() {
        let store = EventStore::in_memory();
        let event = closed_event("cam1", 0);
        store.finalize(&event).await.unwrap();

        let resolved = store.set_status(event.id, EventStatus::Resolved).await.unwrap();
        assert_eq!(resolved.status, EventStatus::Resolved);

        let second = store.set_status(event.id, EventStatus::FalsePositive).await;
        assert!(matches!(second, Err(Error::InvalidStatusTransition(_))));
        assert_eq!(store.get(event.id).await.unwrap().status, EventStatus::Resolved);
    }

    #[tokio::test]
    async fn test_set_status_rejects_non_terminal_target_and_missing_event() {
        let store = EventStore::in_memory();
        let event = closed_event("cam1", 0);
        store.finalize(&event).await.unwrap();

        for target in [EventStatus::Active, EventStatus::Closed] {
            let result = store.set_status(event.id, target).await;
            assert!(matches!(result, Err(Error::InvalidStatusTransition(_))));
        }

        let missing = store.set_status(Uuid::new_v4(), EventStatus::Resolved).await;
        assert!(matches!(missing, Err(Error::InvalidStatusTransition(_))));
    }

    #[tokio::test]
    async fn test_finalize_rejects_open_event() {
        let store = EventStore::in_memory();
        let open = Event::open("cam1", ts(0), 0.9, BTreeSet::new());
        assert!(matches!(store.finalize(&open).await, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = EventStore::in_memory();
        let event = closed_event("cam1", 0);
        store.finalize(&event).await.unwrap();

        store.delete(event.id).await.unwrap();
        assert!(matches!(store.get(event.id).await, Err(Error::EventNotFound(_))));
        assert!(matches!(store.delete(event.id).await, Err(Error::EventNotFound(_))));
    }

    #[tokio::test]
    async fn test_list_is_ordered_across_pages() {
        let store = EventStore::in_memory();
        // More than one page; several events share a start_time
        for i in 0..450 {
            store.finalize(&closed_event("cam1", (i / 3) * 10)).await.unwrap();
        }
        store.finalize(&closed_event("cam2", 5)).await.unwrap();

        let events = store
            .list_limited(EventFilter::for_source("cam1"), usize::MAX)
            .await
            .unwrap();
        assert_eq!(events.len(), 450);
        assert!(events
            .windows(2)
            .all(|w| (w[0].start_time, w[0].id) < (w[1].start_time, w[1].id)));

        let limited = store.list_limited(EventFilter::default(), 10).await.unwrap();
        assert_eq!(limited.len(), 10);
    }

    #[tokio::test]
    async fn test_list_filters_by_status_and_time() {
        let store = EventStore::in_memory();
        let early = closed_event("cam1", 0);
        let late = closed_event("cam1", 10_000);
        store.finalize(&early).await.unwrap();
        store.finalize(&late).await.unwrap();
        store.set_status(late.id, EventStatus::FalsePositive).await.unwrap();

        let filter = EventFilter {
            status: Some(EventStatus::FalsePositive),
            ..Default::default()
        };
        let events = store.list_limited(filter, 100).await.unwrap();
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![late.id]);

        let filter = EventFilter {
            from: Some(ts(0)),
            to: Some(ts(5_000)),
            ..Default::default()
        };
        let events = store.list_limited(filter, 100).await.unwrap();
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![early.id]);
    }

    #[tokio::test]
    async fn test_sources_with_history() {
        let store = EventStore::in_memory();
        store.finalize(&closed_event("cam2", 0)).await.unwrap();
        store.finalize(&closed_event("cam1", 0)).await.unwrap();
        store.finalize(&closed_event("cam1", 100)).await.unwrap();

        let sources: Vec<String> = store.sources_with_history().await.unwrap().into_iter().collect();
        assert_eq!(sources, vec!["cam1", "cam2"]);
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_is_retried() {
        let repo = Arc::new(FlakyRepository::new(2));
        let store = EventStore::new(repo.clone(), StoreRetryPolicy::default());
        let event = closed_event("cam1", 0);

        assert!(!store.finalize_or_retry(event.clone(), WRITE_TIMEOUT).await);
        assert_eq!(store.pending_retries(), 1);

        wait_for_retries(&store).await;
        assert_eq!(store.get(event.id).await.unwrap().id, event.id);
        assert_eq!(repo.inserts.load(Ordering::SeqCst), 3);
        assert!(store.reconciliation_needed().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_need_reconciliation() {
        let repo = Arc::new(FlakyRepository::new(u32::MAX));
        let policy = StoreRetryPolicy {
            max_attempts: 3,
            ..Default::default()
        };
        let store = EventStore::new(repo.clone(), policy);
        let event = closed_event("cam1", 0);

        store.finalize_or_retry(event.clone(), WRITE_TIMEOUT).await;
        wait_for_retries(&store).await;

        let pending = store.reconciliation_needed().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event.id, event.id);
        assert_eq!(pending[0].attempts, 3);
        assert_eq!(repo.inserts.load(Ordering::SeqCst), 3);
        assert!(matches!(store.get(event.id).await, Err(Error::EventNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_write_times_out_into_retry_queue() {
        let repo = Arc::new(SlowRepository {
            inner: MemoryEventRepository::new(),
            delay: Duration::from_secs(6),
        });
        let store = EventStore::new(repo, StoreRetryPolicy::default());
        let event = closed_event("cam1", 0);

        let started = tokio::time::Instant::now();
        assert!(!store.finalize_or_retry(event.clone(), Duration::from_millis(500)).await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(store.pending_retries(), 1);

        wait_for_retries(&store).await;
        assert_eq!(store.get(event.id).await.unwrap().id, event.id);
        assert!(store.reconciliation_needed().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_persists_entries_once_store_recovers() {
        let repo = Arc::new(FlakyRepository::new(u32::MAX));
        let policy = StoreRetryPolicy {
            max_attempts: 2,
            reconcile_interval_sec: 0,
            ..Default::default()
        };
        let store = EventStore::new(repo.clone(), policy);
        let event = closed_event("cam1", 0);

        store.finalize_or_retry(event.clone(), WRITE_TIMEOUT).await;
        wait_for_retries(&store).await;
        assert_eq!(store.reconciliation_needed().await.len(), 1);

        // Still failing: the entry stays with one more attempt counted
        let report = store.reconcile().await;
        assert_eq!(report, ReconcileReport { stored: 0, remaining: 1 });
        assert_eq!(store.reconciliation_needed().await[0].attempts, 3);

        repo.heal();
        let report = store.reconcile().await;
        assert_eq!(report, ReconcileReport { stored: 1, remaining: 0 });
        assert!(store.reconciliation_needed().await.is_empty());
        assert_eq!(store.get(event.id).await.unwrap().id, event.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_reconciliation() {
        let repo = Arc::new(FlakyRepository::new(u32::MAX));
        let policy = StoreRetryPolicy {
            max_attempts: 1,
            reconcile_interval_sec: 30,
            ..Default::default()
        };
        let store = EventStore::new(repo.clone(), policy);
        let event = closed_event("cam1", 0);

        store.finalize_or_retry(event.clone(), WRITE_TIMEOUT).await;
        wait_for_retries(&store).await;
        assert_eq!(store.reconciliation_needed().await.len(), 1);

        repo.heal();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(store.reconciliation_needed().await.is_empty());
        assert_eq!(store.get(event.id).await.unwrap().id, event.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconciliation_list_is_bounded() {
        let repo = Arc::new(FlakyRepository::new(u32::MAX));
        let policy = StoreRetryPolicy {
            max_attempts: 1,
            reconciliation_capacity: 2,
            reconcile_interval_sec: 0,
            ..Default::default()
        };
        let store = EventStore::new(repo, policy);
        let events: Vec<Event> = (0..3).map(|i| closed_event("cam1", i * 1000)).collect();

        for event in &events {
            store.finalize_or_retry(event.clone(), WRITE_TIMEOUT).await;
            wait_for_retries(&store).await;
        }

        let kept: Vec<Uuid> = store
            .reconciliation_needed()
            .await
            .iter()
            .map(|entry| entry.event.id)
            .collect();
        assert_eq!(kept, vec![events[1].id, events[2].id]);
        assert_eq!(store.reconciliation_evicted(), 1);
    }
}
