//! ConfigStore - Source configuration cache
//!
//! ## Responsibilities
//!
//! - Hold the registered sources (threshold, windows, adapter descriptor)
//! - Load sources from a JSON file at process start
//! - Hand out immutable snapshots to stream workers
//!
//! Administrative CRUD lives outside this crate; sources are registered by
//! whoever owns that configuration.

mod types;

pub use types::*;

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::RwLock;

/// ConfigStore instance
pub struct ConfigStore {
    sources: RwLock<HashMap<String, Source>>,
}

impl ConfigStore {
    /// Create empty ConfigStore
    pub fn new() -> Self {
        Self {
            sources: RwLock::new(HashMap::new()),
        }
    }

    /// Create ConfigStore from a JSON array of sources
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let sources: Vec<Source> = serde_json::from_str(&raw)?;

        let store = Self::new();
        for source in sources {
            store.register(source).await?;
        }

        tracing::info!(
            path = %path.display(),
            count = store.count().await,
            "ConfigStore loaded sources"
        );

        Ok(store)
    }

    /// Register (or replace) a source
    ///
    /// Replacing does not affect a worker already running; it picks up the
    /// new configuration on its next start.
    pub async fn register(&self, source: Source) -> Result<()> {
        source.validate()?;
        let mut sources = self.sources.write().await;
        if sources.insert(source.id.clone(), source.clone()).is_some() {
            tracing::info!(source_id = %source.id, "Source configuration replaced");
        } else {
            tracing::debug!(source_id = %source.id, "Source registered");
        }
        Ok(())
    }

    /// Get source by id
    pub async fn get(&self, source_id: &str) -> Option<Source> {
        self.sources.read().await.get(source_id).cloned()
    }

    /// Get source by id or SourceNotFound
    pub async fn require(&self, source_id: &str) -> Result<Source> {
        self.get(source_id)
            .await
            .ok_or_else(|| Error::SourceNotFound(source_id.to_string()))
    }

    /// All sources, ordered by id
    pub async fn list(&self) -> Vec<Source> {
        let mut sources: Vec<Source> = self.sources.read().await.values().cloned().collect();
        sources.sort_by(|a, b| a.id.cmp(&b.id));
        sources
    }

    /// Sources flagged for autostart
    pub async fn autostart_ids(&self) -> Vec<String> {
        self.list()
            .await
            .into_iter()
            .filter(|s| s.autostart)
            .map(|s| s.id)
            .collect()
    }

    pub async fn count(&self) -> usize {
        self.sources.read().await.len()
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}
