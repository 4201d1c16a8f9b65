//! `UpdateSnapshot`, per §4.G: an exclusive build lock around
//! translate-then-publish, plus the `PolicyStore`/`SnapshotTrigger`
//! contracts `gwcp-listener` drives it through.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use gwcp_catalog::Catalog;
use gwcp_core::Result;
use gwcp_lazyres::LazyResourceCache;
use gwcp_listener::{PolicyStore, SnapshotTrigger};
use gwcp_policy::PolicyConfiguration;
use gwcp_xds::{XdsOptions, CLUSTER_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL};

use crate::cache::SnapshotCache;
use crate::custom::{pack_json_bundle, LAZY_RESOURCES_TYPE_URL, POLICY_STATE_TYPE_URL};

pub struct SnapshotManager {
    catalog: Arc<Catalog>,
    lazyres: Arc<LazyResourceCache>,
    cache: Arc<SnapshotCache>,
    policy_configs: RwLock<HashMap<String, PolicyConfiguration>>,
    build_lock: Mutex<()>,
    xds_options: XdsOptions,
}

impl SnapshotManager {
    pub fn new(
        catalog: Arc<Catalog>,
        lazyres: Arc<LazyResourceCache>,
        cache: Arc<SnapshotCache>,
        xds_options: XdsOptions,
    ) -> Self {
        Self {
            catalog,
            lazyres,
            cache,
            policy_configs: RwLock::new(HashMap::new()),
            build_lock: Mutex::new(()),
            xds_options,
        }
    }

    pub fn cache(&self) -> Arc<SnapshotCache> {
        Arc::clone(&self.cache)
    }

    /// Steps 1-5 of `UpdateSnapshot`: exclusive lock, invoke the
    /// translator and policy/lazy-resource bundlers, push each type-URL's
    /// bundle to the cache (which fans out to any open watch), log
    /// summary counts.
    async fn update_snapshot(&self, correlation_id: &str) -> Result<()> {
        let _guard = self.build_lock.lock().await;

        let configs = self.catalog.list_all().await;
        let translated = gwcp_xds::translate(&configs, &self.xds_options);

        let listener_count = translated.listeners.len();
        let route_count = translated.routes.len();
        let cluster_count = translated.clusters.len();

        self.cache.update(LISTENER_TYPE_URL, translated.listeners).await;
        self.cache.update(ROUTE_TYPE_URL, translated.routes).await;
        self.cache.update(CLUSTER_TYPE_URL, translated.clusters).await;

        let policy_bundle = self.build_policy_bundle().await;
        self.cache.update(POLICY_STATE_TYPE_URL, vec![policy_bundle]).await;

        let lazy_resources = self.build_lazy_resource_bundle().await;
        let lazy_count = lazy_resources.len();
        self.cache.update(LAZY_RESOURCES_TYPE_URL, lazy_resources).await;

        info!(
            component = "snapshot",
            correlation_id,
            listener_count,
            route_count,
            cluster_count,
            lazy_count,
            "snapshot rebuild complete"
        );

        Ok(())
    }

    async fn build_policy_bundle(&self) -> gwcp_xds::BuiltResource {
        let configs = self.policy_configs.read().await;
        let mut map = serde_json::Map::with_capacity(configs.len());
        for (resource_id, config) in configs.iter() {
            map.insert(resource_id.clone(), serde_json::to_value(config).unwrap_or_default());
        }
        pack_json_bundle("policy-state", POLICY_STATE_TYPE_URL, &serde_json::Value::Object(map))
    }

    async fn build_lazy_resource_bundle(&self) -> Vec<gwcp_xds::BuiltResource> {
        self.lazyres
            .list_all()
            .await
            .into_iter()
            .map(|resource| {
                let name = format!("lazyresource-{}", resource.id);
                let payload = serde_json::json!({
                    "resourceType": resource.resource_type,
                    "payload": resource.payload,
                });
                pack_json_bundle(&name, LAZY_RESOURCES_TYPE_URL, &payload)
            })
            .collect()
    }
}

#[async_trait]
impl PolicyStore for SnapshotManager {
    async fn upsert(&self, config: PolicyConfiguration) {
        self.policy_configs.write().await.insert(config.resource_id.clone(), config);
    }

    async fn remove(&self, resource_id: &str) {
        self.policy_configs.write().await.remove(resource_id);
    }
}

#[async_trait]
impl SnapshotTrigger for SnapshotManager {
    async fn rebuild(&self, correlation_id: String) -> Result<()> {
        self.update_snapshot(&correlation_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwcp_core::types::{ConfigId, ConfigKind, ConfigStatus, Operation, UpstreamHost, Vhosts};
    use gwcp_xds::LISTENER_TYPE_URL;

    fn sample_config() -> gwcp_core::types::StoredConfig {
        let now = chrono::Utc::now();
        gwcp_core::types::StoredConfig {
            id: ConfigId::new(),
            display_name: "weather".to_string(),
            version: "v1".to_string(),
            handle: "weather-v1".to_string(),
            context: "/weather".to_string(),
            kind: ConfigKind::RestApi,
            operations: vec![Operation { method: "GET".to_string(), path: "/us".to_string(), policies: vec![] }],
            upstreams: vec![UpstreamHost { url: "https://api.example.com".to_string() }],
            vhosts: Vhosts { main: "vhost1".to_string(), sandbox: None },
            api_level_policies: vec![],
            status: ConfigStatus::Deployed,
            created_at: now,
            updated_at: now,
            deployed_at: None,
            deployed_version: 1,
        }
    }

    #[tokio::test]
    async fn rebuild_publishes_every_type_url_once() {
        let catalog = Arc::new(Catalog::new());
        catalog.add(sample_config()).await;
        let lazyres = Arc::new(LazyResourceCache::new());
        let cache = Arc::new(SnapshotCache::new());
        let manager = SnapshotManager::new(catalog, lazyres, Arc::clone(&cache), XdsOptions::default());

        manager.rebuild("corr-1".to_string()).await.unwrap();

        assert!(cache.get(LISTENER_TYPE_URL, "envoy-1").await.is_some());
        assert!(cache.get(ROUTE_TYPE_URL, "envoy-1").await.is_some());
        assert!(cache.get(CLUSTER_TYPE_URL, "envoy-1").await.is_some());
        assert!(cache.get(POLICY_STATE_TYPE_URL, "policy-node").await.is_some());
        assert!(cache.get(LAZY_RESOURCES_TYPE_URL, "envoy-1").await.is_some());
    }

    #[tokio::test]
    async fn upsert_then_remove_drops_policy_bundle_entry() {
        let catalog = Arc::new(Catalog::new());
        let lazyres = Arc::new(LazyResourceCache::new());
        let cache = Arc::new(SnapshotCache::new());
        let manager = SnapshotManager::new(catalog, lazyres, Arc::clone(&cache), XdsOptions::default());

        let config = gwcp_policy::project(&sample_config());
        // sample_config carries no policies, so project() returns None;
        // exercise the trait path directly with a synthetic bundle instead.
        assert!(config.is_none());

        manager
            .upsert(PolicyConfiguration {
                resource_id: "cfg-1".to_string(),
                routes: vec![],
                metadata: gwcp_policy::PolicyMetadata {
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                    resource_version: 1,
                    api_name: "weather".to_string(),
                    version: "v1".to_string(),
                    context: "/weather".to_string(),
                },
            })
            .await;
        assert_eq!(manager.policy_configs.read().await.len(), 1);

        manager.remove("cfg-1").await;
        assert!(manager.policy_configs.read().await.is_empty());
    }
}
