//! Per-event write serialization
//!
//! Writes for the same event id queue behind one another; different ids
//! proceed in parallel. Entries are pruned when no writer holds them.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use uuid::Uuid;

#[derive(Default)]
pub struct EventLocks {
    locks: RwLock<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl EventLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive write access to one event id
    pub async fn acquire(self: &Arc<Self>, id: Uuid) -> EventWriteGuard {
        let lock = self.get_or_create(id).await;
        let guard = lock.lock_owned().await;
        EventWriteGuard {
            id,
            locks: Arc::clone(self),
            guard: Some(guard),
        }
    }

    async fn get_or_create(&self, id: Uuid) -> Arc<Mutex<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(&id) {
                return lock.clone();
            }
        }

        let mut locks = self.locks.write().await;
        locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }

    /// Drop the entry for `id` unless someone else still holds or waits on it
    fn prune(&self, id: Uuid) {
        // Best effort: skipped when the map is contended
        if let Ok(mut locks) = self.locks.try_write() {
            if let Some(lock) = locks.get(&id) {
                if Arc::strong_count(lock) == 1 {
                    locks.remove(&id);
                }
            }
        }
    }
}

/// Held for the duration of one write
pub struct EventWriteGuard {
    id: Uuid,
    locks: Arc<EventLocks>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EventWriteGuard {
    fn drop(&mut self) {
        // Release the mutex before pruning so the strong count reflects waiters only
        self.guard.take();
        self.locks.prune(self.id);
    }
}
