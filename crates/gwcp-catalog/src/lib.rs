//! # gwcp-catalog
//!
//! The in-memory catalog: a read-heavy ordered map of `StoredConfig`
//! keyed by id, with a secondary index on the composite
//! `(display_name, version)` key. A single `RwLock` protects both maps
//! together so the index can never drift from the primary map.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use gwcp_core::types::{ConfigId, StoredConfig};
use gwcp_core::{Error, Result};
use gwcp_store::PersistentStore;

struct Inner {
    entries: BTreeMap<ConfigId, StoredConfig>,
    by_composite: std::collections::HashMap<(String, String), ConfigId>,
}

impl Inner {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            by_composite: std::collections::HashMap::new(),
        }
    }

    fn insert(&mut self, config: StoredConfig) {
        self.by_composite.insert(config.composite_key(), config.id);
        self.entries.insert(config.id, config);
    }

    fn remove(&mut self, id: ConfigId) -> Option<StoredConfig> {
        let removed = self.entries.remove(&id)?;
        self.by_composite.remove(&removed.composite_key());
        Some(removed)
    }
}

/// Thread-safe in-process index of deployed/pending configuration
/// entities. On boot, `reload` must complete before any event listener
/// or xDS server starts accepting work (invariant 2).
#[derive(Clone)]
pub struct Catalog {
    inner: Arc<RwLock<Inner>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::new())),
        }
    }

    /// Fully repopulates the catalog from the persistent store. Any prior
    /// in-memory contents are discarded, so this must run before the
    /// catalog is exposed to readers that expect consistency.
    pub async fn reload(&self, store: &dyn PersistentStore) -> Result<()> {
        let configs = store
            .list_configs()
            .await
            .map_err(gwcp_core::Error::from)?;

        let mut inner = self.inner.write().await;
        *inner = Inner::new();
        for config in configs {
            inner.insert(config);
        }
        Ok(())
    }

    pub async fn add(&self, config: StoredConfig) {
        self.inner.write().await.insert(config);
    }

    pub async fn update(&self, config: StoredConfig) -> Result<()> {
        let mut inner = self.inner.write().await;
        if !inner.entries.contains_key(&config.id) {
            return Err(Error::NotFound(format!("config {}", config.id)));
        }
        inner.insert(config);
        Ok(())
    }

    pub async fn delete(&self, id: ConfigId) -> Result<StoredConfig> {
        self.inner
            .write()
            .await
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("config {id}")))
    }

    pub async fn get(&self, id: ConfigId) -> Option<StoredConfig> {
        self.inner.read().await.entries.get(&id).cloned()
    }

    pub async fn get_by_composite_key(
        &self,
        display_name: &str,
        version: &str,
    ) -> Option<StoredConfig> {
        let inner = self.inner.read().await;
        let key = (display_name.to_string(), version.to_string());
        let id = inner.by_composite.get(&key)?;
        inner.entries.get(id).cloned()
    }

    pub async fn list_all(&self) -> Vec<StoredConfig> {
        self.inner.read().await.entries.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}
