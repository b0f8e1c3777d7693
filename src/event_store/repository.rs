//! EventStore Repository
//!
//! Persistence seam for Event records. The store service layers the
//! status-transition rules, per-id serialization and retry on top.

use crate::error::Result;
use crate::models::{Event, EventStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

/// Event query filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventFilter {
    pub source_id: Option<String>,
    pub status: Option<EventStatus>,
    /// Inclusive lower bound on start_time
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on start_time
    pub to: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn for_source(source_id: impl Into<String>) -> Self {
        Self {
            source_id: Some(source_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &Event) -> bool {
        if let Some(source_id) = &self.source_id {
            if &event.source_id != source_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if event.status != status {
                return false;
            }
        }
        if let Some(from) = self.from {
            if event.start_time < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if event.start_time >= to {
                return false;
            }
        }
        true
    }
}

/// Keyset position: listing resumes strictly after (start_time, id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PageCursor {
    pub start_time: DateTime<Utc>,
    pub id: Uuid,
}

impl PageCursor {
    pub fn after(event: &Event) -> Self {
        Self {
            start_time: event.start_time,
            id: event.id,
        }
    }

    pub fn precedes(&self, event: &Event) -> bool {
        (self.start_time, self.id) < (event.start_time, event.id)
    }
}

/// Event persistence
#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Insert a record. Re-inserting an existing id is a no-op.
    async fn insert(&self, event: &Event) -> Result<()>;

    async fn get(&self, id: Uuid) -> Result<Option<Event>>;

    /// Returns false if the record does not exist
    async fn update_status(&self, id: Uuid, status: EventStatus) -> Result<bool>;

    /// Returns false if the record does not exist
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// One page ordered by (start_time, id)
    async fn list_page(
        &self,
        filter: &EventFilter,
        after: Option<PageCursor>,
        limit: u32,
    ) -> Result<Vec<Event>>;

    /// Distinct source ids with at least one record
    async fn source_ids(&self) -> Result<Vec<String>>;

    async fn count(&self) -> Result<u64>;

    async fn ping(&self) -> bool {
        self.count().await.is_ok()
    }
}
