//! Secondary cache of templates (LLM providers, MCP proxies, …)
//! referenceable by policies at evaluation time, published to the policy
//! engine under a custom xDS type-URL separate from the API/route
//! resources in `gwcp-xds`/`gwcp-snapshot`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use gwcp_core::types::{LazyResource, LazyResourceId};
use gwcp_core::Result;
use gwcp_store::PersistentStore;
use serde_json::Value as JsonValue;
use tokio::sync::RwLock;
use tracing::debug;

pub struct LazyResourceCache {
    entries: Arc<RwLock<BTreeMap<LazyResourceId, LazyResource>>>,
}

impl LazyResourceCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Full reload from the store, discarding anything currently cached.
    /// Mirrors the catalog's boot-time reload (invariant 2 extended to
    /// this side cache).
    pub async fn reload(&self, store: &dyn PersistentStore) -> Result<()> {
        let resources = store.list_lazy_resources().await?;
        let mut guard = self.entries.write().await;
        guard.clear();
        for resource in resources {
            guard.insert(resource.id, resource);
        }
        debug!(component = "lazyres", count = guard.len(), "reloaded lazy resource cache");
        Ok(())
    }

    /// Persists and caches a resource. Returns `true` — the caller is
    /// expected to trigger a rebuild of this type-URL's snapshot only.
    pub async fn upsert(
        &self,
        store: &dyn PersistentStore,
        id: LazyResourceId,
        resource_type: String,
        payload: JsonValue,
    ) -> Result<()> {
        let now = Utc::now();
        let mut guard = self.entries.write().await;
        let created_at = guard.get(&id).map(|r| r.created_at).unwrap_or(now);

        let resource = LazyResource {
            id,
            resource_type,
            payload,
            created_at,
            updated_at: now,
        };

        store.save_lazy_resource(&resource).await?;
        guard.insert(id, resource);
        Ok(())
    }

    /// Caches a resource already persisted by the caller (e.g. the event
    /// listener re-reading canonical state after a store write). Unlike
    /// `upsert`, does not write through to the store.
    pub async fn put(&self, resource: LazyResource) {
        self.entries.write().await.insert(resource.id, resource);
    }

    pub async fn remove_by_id(&self, store: &dyn PersistentStore, id: LazyResourceId) -> Result<()> {
        store.delete_lazy_resource(id).await?;
        self.entries.write().await.remove(&id);
        Ok(())
    }

    pub async fn remove_by_type(&self, store: &dyn PersistentStore, resource_type: &str) -> Result<u64> {
        let removed = store.delete_lazy_resources_by_type(resource_type).await?;
        self.entries
            .write()
            .await
            .retain(|_, r| r.resource_type != resource_type);
        Ok(removed)
    }

    /// Drops a cached entry without touching the store — for resources
    /// (e.g. certificates) whose canonical row lives in a different table.
    pub async fn evict(&self, id: LazyResourceId) {
        self.entries.write().await.remove(&id);
    }

    pub async fn get(&self, id: LazyResourceId) -> Option<LazyResource> {
        self.entries.read().await.get(&id).cloned()
    }

    pub async fn list_all(&self) -> Vec<LazyResource> {
        self.entries.read().await.values().cloned().collect()
    }

    pub async fn list_by_type(&self, resource_type: &str) -> Vec<LazyResource> {
        self.entries
            .read()
            .await
            .values()
            .filter(|r| r.resource_type == resource_type)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Aggregates every cached resource into the single JSON-shaped
    /// protobuf Struct published under the custom `LazyResources` type
    /// URL: `{"lazyresource-<id>": {resourceType, payload}}`.
    pub async fn aggregate(&self) -> JsonValue {
        let guard = self.entries.read().await;
        let mut map = serde_json::Map::with_capacity(guard.len());
        for resource in guard.values() {
            map.insert(
                format!("lazyresource-{}", resource.id),
                serde_json::json!({
                    "resourceType": resource.resource_type,
                    "payload": resource.payload,
                }),
            );
        }
        JsonValue::Object(map)
    }
}

impl Default for LazyResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwcp_store::SqliteStore;

    #[tokio::test]
    async fn upsert_persists_and_caches() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let cache = LazyResourceCache::new();
        let id = LazyResourceId::new();

        cache
            .upsert(&store, id, "llm_provider".to_string(), serde_json::json!({"model": "x"}))
            .await
            .unwrap();

        assert_eq!(cache.len().await, 1);
        assert!(cache.get(id).await.is_some());

        let reloaded = LazyResourceCache::new();
        reloaded.reload(&store).await.unwrap();
        assert_eq!(reloaded.len().await, 1);
    }

    #[tokio::test]
    async fn remove_by_type_drops_matching_entries_only() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let cache = LazyResourceCache::new();
        let a = LazyResourceId::new();
        let b = LazyResourceId::new();

        cache
            .upsert(&store, a, "llm_provider".to_string(), serde_json::json!({}))
            .await
            .unwrap();
        cache
            .upsert(&store, b, "mcp_proxy".to_string(), serde_json::json!({}))
            .await
            .unwrap();

        let removed = cache.remove_by_type(&store, "llm_provider").await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.len().await, 1);
        assert!(cache.get(b).await.is_some());
    }

    #[tokio::test]
    async fn aggregate_shapes_json_struct_by_fixed_id() {
        let store = SqliteStore::open_in_memory().await.unwrap();
        let cache = LazyResourceCache::new();
        let id = LazyResourceId::new();

        cache
            .upsert(&store, id, "llm_provider".to_string(), serde_json::json!({"model": "x"}))
            .await
            .unwrap();

        let aggregated = cache.aggregate().await;
        assert!(aggregated.get(format!("lazyresource-{id}")).is_some());
    }
}
