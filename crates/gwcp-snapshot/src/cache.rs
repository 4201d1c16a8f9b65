//! Per-type-URL, per-node versioned resource cache, per §4.G/§3's "one
//! snapshot per node id" selection key. Envoy's three standard types
//! (`Listener`, `Route`, `Cluster`) and the gateway's custom bundle
//! types (`PolicyState`, `LazyResources`, `MetadataXDSs`) share the same
//! storage shape here. The translator itself doesn't vary its output by
//! requesting node, so `update` fans the same bundle out to every node
//! id this cache has ever seen a request for (plus a broadcast bucket
//! new node ids read from before their first request registers them) —
//! the selection key is real and load-bearing for ADS routing, even
//! though every node currently resolves to identical content. The ADS
//! layer notifies a `watch` receiver per `(type_url, node_id)` instead
//! of holding direct references to open streams, mirroring flowplane's
//! broadcast-on-update pattern from `XdsState::apply_built_resources`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tracing::info;

use gwcp_xds::BuiltResource;

/// The bucket a node id falls back to before it has registered its own
/// entry — every node id is seeded from here on first `get`/`watch`.
const BROADCAST_NODE: &str = "";

#[derive(Clone, Default)]
struct Bundle {
    version: i64,
    resources: Arc<Vec<BuiltResource>>,
}

pub struct SnapshotCache {
    bundles: RwLock<HashMap<(String, String), Bundle>>,
    watches: RwLock<HashMap<(String, String), watch::Sender<i64>>>,
    known_node_ids: RwLock<HashSet<String>>,
    version_counter: AtomicI64,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self {
            bundles: RwLock::new(HashMap::new()),
            watches: RwLock::new(HashMap::new()),
            known_node_ids: RwLock::new(HashSet::new()),
            version_counter: AtomicI64::new(0),
        }
    }

    /// Replaces the resource set for one type-URL across every node id
    /// this cache has registered (via `get`/`watch`) plus the broadcast
    /// bucket, bumps the shared monotonic version counter, and notifies
    /// any open watches.
    pub async fn update(&self, type_url: &str, resources: Vec<BuiltResource>) {
        let version = self.version_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let bundle = Bundle { version, resources: Arc::new(resources) };
        let count = bundle.resources.len();

        let node_ids: Vec<String> = {
            let known = self.known_node_ids.read().await;
            std::iter::once(BROADCAST_NODE.to_string()).chain(known.iter().cloned()).collect()
        };

        {
            let mut bundles = self.bundles.write().await;
            for node_id in &node_ids {
                bundles.insert((type_url.to_string(), node_id.clone()), bundle.clone());
            }
        }

        let watches = self.watches.read().await;
        for node_id in &node_ids {
            if let Some(sender) = watches.get(&(type_url.to_string(), node_id.clone())) {
                let _ = sender.send(version);
            }
        }

        info!(component = "snapshot", type_url, version, count, "updated resource bundle");
    }

    /// Selection key is `(type_url, node_id)` per §3; a `node_id` with
    /// no dedicated entry yet falls back to the broadcast bucket so a
    /// proxy gets the current resources even before this cache has
    /// registered it individually.
    pub async fn get(&self, type_url: &str, node_id: &str) -> Option<(i64, Arc<Vec<BuiltResource>>)> {
        self.register_node_id(node_id).await;
        let bundles = self.bundles.read().await;
        bundles
            .get(&(type_url.to_string(), node_id.to_string()))
            .or_else(|| bundles.get(&(type_url.to_string(), BROADCAST_NODE.to_string())))
            .map(|b| (b.version, Arc::clone(&b.resources)))
    }

    /// Returns a receiver that fires whenever `(type_url, node_id)`'s
    /// bundle is replaced. Creates the underlying watch channel lazily,
    /// seeded with the current version (0 if nothing has been built
    /// yet for this node, or for the broadcast bucket).
    pub async fn watch(&self, type_url: &str, node_id: &str) -> watch::Receiver<i64> {
        self.register_node_id(node_id).await;
        let key = (type_url.to_string(), node_id.to_string());
        if let Some(sender) = self.watches.read().await.get(&key) {
            return sender.subscribe();
        }

        let mut watches = self.watches.write().await;
        let current_version = self.get(type_url, node_id).await.map(|(v, _)| v).unwrap_or(0);
        let sender = watches.entry(key).or_insert_with(|| watch::channel(current_version).0);
        sender.subscribe()
    }

    /// Registers `node_id` so future `update` calls fan out to it too.
    /// A no-op once a node id has been seen; the broadcast bucket is
    /// never registered here since it's always implicitly included.
    async fn register_node_id(&self, node_id: &str) {
        if node_id.is_empty() || self.known_node_ids.read().await.contains(node_id) {
            return;
        }
        self.known_node_ids.write().await.insert(node_id.to_string());
    }
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn update_bumps_version_monotonically() {
        let cache = SnapshotCache::new();
        cache.update("type.a", vec![]).await;
        let (v1, _) = cache.get("type.a", "envoy-1").await.unwrap();
        cache.update("type.a", vec![]).await;
        let (v2, _) = cache.get("type.a", "envoy-1").await.unwrap();
        assert!(v2 > v1);
    }

    #[tokio::test]
    async fn watch_fires_on_update() {
        let cache = SnapshotCache::new();
        let mut rx = cache.watch("type.a", "envoy-1").await;
        cache.update("type.a", vec![]).await;
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }

    #[tokio::test]
    async fn distinct_type_urls_version_independently() {
        let cache = SnapshotCache::new();
        cache.update("type.a", vec![]).await;
        cache.update("type.a", vec![]).await;
        cache.update("type.b", vec![]).await;
        let (va, _) = cache.get("type.a", "envoy-1").await.unwrap();
        let (vb, _) = cache.get("type.b", "envoy-1").await.unwrap();
        assert_eq!(va, 2);
        assert_eq!(vb, 3);
    }

    /// A node id registered (via `get`) before an `update` still
    /// receives that update — fan-out isn't limited to node ids seen
    /// before the cache was first populated.
    #[tokio::test]
    async fn a_node_registered_before_first_update_still_receives_it() {
        let cache = SnapshotCache::new();
        assert!(cache.get("type.a", "policy-node").await.is_none());
        cache.update("type.a", vec![]).await;
        let (version, _) = cache.get("type.a", "policy-node").await.unwrap();
        assert_eq!(version, 1);
    }

    /// Different node ids are independent cache entries, but both start
    /// from the same broadcast-seeded content until the gateway ever
    /// differentiates by node.
    #[tokio::test]
    async fn distinct_node_ids_both_see_the_same_broadcast_update() {
        let cache = SnapshotCache::new();
        cache.update("type.a", vec![]).await;
        let (v_envoy, _) = cache.get("type.a", "envoy-1").await.unwrap();
        let (v_policy, _) = cache.get("type.a", "policy-node").await.unwrap();
        assert_eq!(v_envoy, v_policy);
    }
}
