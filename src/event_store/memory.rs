//! In-memory EventRepository (tests, `DATABASE_URL=memory`)

use super::repository::{EventFilter, EventRepository, PageCursor};
use crate::error::Result;
use crate::models::{Event, EventStatus};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
pub struct MemoryEventRepository {
    events: RwLock<HashMap<Uuid, Event>>,
}

impl MemoryEventRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventRepository for MemoryEventRepository {
    async fn insert(&self, event: &Event) -> Result<()> {
        let mut events = self.events.write().await;
        events.entry(event.id).or_insert_with(|| event.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Event>> {
        Ok(self.events.read().await.get(&id).cloned())
    }

    async fn update_status(&self, id: Uuid, status: EventStatus) -> Result<bool> {
        let mut events = self.events.write().await;
        match events.get_mut(&id) {
            Some(event) => {
                event.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.events.write().await.remove(&id).is_some())
    }

    async fn list_page(
        &self,
        filter: &EventFilter,
        after: Option<PageCursor>,
        limit: u32,
    ) -> Result<Vec<Event>> {
        let events = self.events.read().await;
        let mut page: Vec<Event> = events
            .values()
            .filter(|e| filter.matches(e))
            .filter(|e| after.map_or(true, |cursor| cursor.precedes(e)))
            .cloned()
            .collect();
        page.sort_by_key(|e| (e.start_time, e.id));
        page.truncate(limit as usize);
        Ok(page)
    }

    async fn source_ids(&self) -> Result<Vec<String>> {
        let events = self.events.read().await;
        let ids: BTreeSet<String> = events.values().map(|e| e.source_id.clone()).collect();
        Ok(ids.into_iter().collect())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.events.read().await.len() as u64)
    }
}
