//! Consumes event-hub batches and drives the catalog, lazy-resource
//! cache, policy projector, and snapshot rebuilds toward convergence
//! with the persistent store, per spec.md §4.D.
//!
//! Failures in any one event are logged and swallowed — the event hub
//! is at-least-once and the next poll tick re-drives the same update,
//! so there is nothing useful to propagate the error to.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use gwcp_catalog::Catalog;
use gwcp_core::types::{
    CertificateId, ConfigId, Event, EventAction, EventType, LazyResource, LazyResourceId,
};
use gwcp_core::Result;
use gwcp_eventhub::EventBackend;
use gwcp_lazyres::LazyResourceCache;
use gwcp_policy::PolicyConfiguration;
use gwcp_store::PersistentStore;

const SNAPSHOT_REBUILD_DEADLINE: Duration = Duration::from_secs(10);

/// Receives the per-route policy bundle derived from a single config, or
/// a removal for a config whose routes no longer carry any policy.
/// Implemented by `gwcp-snapshot`, which owns the published policy-state
/// bundle; defined here so the listener depends on a narrow contract
/// rather than the whole snapshot crate.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn upsert(&self, config: PolicyConfiguration);
    async fn remove(&self, resource_id: &str);
}

/// Fires an asynchronous resource-snapshot rebuild. Implemented by
/// `gwcp-snapshot`; the listener only needs to ask for one and bound how
/// long it waits.
#[async_trait]
pub trait SnapshotTrigger: Send + Sync {
    async fn rebuild(&self, correlation_id: String) -> Result<()>;
}

pub struct EventListener {
    store: Arc<dyn PersistentStore>,
    catalog: Arc<Catalog>,
    lazyres: Arc<LazyResourceCache>,
    policy_store: Arc<dyn PolicyStore>,
    snapshot: Arc<dyn SnapshotTrigger>,
    hub: Arc<dyn EventBackend>,
    org: gwcp_core::types::OrganizationId,
    shutdown: CancellationToken,
}

impl EventListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn PersistentStore>,
        catalog: Arc<Catalog>,
        lazyres: Arc<LazyResourceCache>,
        policy_store: Arc<dyn PolicyStore>,
        snapshot: Arc<dyn SnapshotTrigger>,
        hub: Arc<dyn EventBackend>,
        org: gwcp_core::types::OrganizationId,
    ) -> Self {
        Self {
            store,
            catalog,
            lazyres,
            policy_store,
            snapshot,
            hub,
            org,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Subscribes to this organization's event stream and processes
    /// batches until `shutdown` is called. Runs until cancelled; spawn
    /// this as a background task per organization.
    pub async fn run(&self) {
        let mut subscription = self.hub.subscribe(self.org, 64).await;
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.hub.unsubscribe(self.org, subscription.id).await;
                    return;
                }
                batch = subscription.receiver.recv() => {
                    match batch {
                        Some(batch) => self.handle_batch(batch).await,
                        None => return,
                    }
                }
            }
        }
    }

    async fn handle_batch(&self, batch: Vec<Event>) {
        for event in batch {
            if let Err(err) = self.handle_event(&event).await {
                warn!(
                    component = "listener",
                    entity_id = %event.entity_id,
                    event_type = ?event.event_type,
                    action = ?event.action,
                    error = %err,
                    "failed to apply event, will re-converge on next delivery"
                );
            }
        }
    }

    async fn handle_event(&self, event: &Event) -> Result<()> {
        match event.event_type {
            EventType::Api => self.handle_api_event(event).await,
            EventType::Certificate => self.handle_certificate_event(event).await,
            EventType::LlmTemplate => self.handle_llm_template_event(event).await,
        }
    }

    async fn handle_api_event(&self, event: &Event) -> Result<()> {
        let id = ConfigId::from_str(&event.entity_id)
            .map_err(|_| gwcp_core::Error::validation("entity_id", "not a config id"))?;

        match event.action {
            EventAction::Create | EventAction::Update => {
                let config = self.store.get_config(id).await?;
                if self.catalog.get(id).await.is_some() {
                    self.catalog.update(config.clone()).await?;
                } else {
                    self.catalog.add(config.clone()).await;
                }

                match gwcp_policy::project(&config) {
                    Some(policy_config) => self.policy_store.upsert(policy_config).await,
                    None => self.policy_store.remove(&id.to_string()).await,
                }
            }
            EventAction::Delete => {
                self.catalog.delete(id).await?;
                self.policy_store.remove(&id.to_string()).await;
            }
        }

        self.trigger_rebuild(&event.entity_id).await
    }

    async fn handle_certificate_event(&self, event: &Event) -> Result<()> {
        let id = CertificateId::from_str(&event.entity_id)
            .map_err(|_| gwcp_core::Error::validation("entity_id", "not a certificate id"))?;

        match event.action {
            EventAction::Create | EventAction::Update => {
                let cert = self.store.get_certificate(id).await?;
                let lazy_id = LazyResourceId::from_uuid(*id.as_uuid());
                self.lazyres
                    .put(LazyResource {
                        id: lazy_id,
                        resource_type: "certificate".to_string(),
                        payload: serde_json::json!({
                            "name": cert.name,
                            "subject": cert.subject,
                            "issuer": cert.issuer,
                            "notBefore": cert.not_before,
                            "notAfter": cert.not_after,
                            "chainLength": cert.chain_length,
                        }),
                        created_at: cert.not_before,
                        updated_at: Utc::now(),
                    })
                    .await;
            }
            EventAction::Delete => {
                self.lazyres.evict(LazyResourceId::from_uuid(*id.as_uuid())).await;
            }
        }

        self.trigger_rebuild(&event.entity_id).await
    }

    async fn handle_llm_template_event(&self, event: &Event) -> Result<()> {
        let id = LazyResourceId::from_str(&event.entity_id)
            .map_err(|_| gwcp_core::Error::validation("entity_id", "not a lazy resource id"))?;

        match event.action {
            EventAction::Create | EventAction::Update => {
                let resource = self.store.get_lazy_resource(id).await?;
                self.lazyres.put(resource).await;
            }
            EventAction::Delete => {
                self.lazyres.remove_by_id(self.store.as_ref(), id).await?;
            }
        }

        self.trigger_rebuild(&event.entity_id).await
    }

    async fn trigger_rebuild(&self, entity_id: &str) -> Result<()> {
        let correlation_id = format!("{entity_id}-{}", Utc::now().timestamp_nanos_opt().unwrap_or(0));
        let snapshot = Arc::clone(&self.snapshot);
        tokio::spawn(async move {
            match tokio::time::timeout(SNAPSHOT_REBUILD_DEADLINE, snapshot.rebuild(correlation_id.clone())).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(component = "listener", %correlation_id, error = %err, "snapshot rebuild failed");
                }
                Err(_) => {
                    error!(component = "listener", %correlation_id, "snapshot rebuild exceeded its deadline");
                }
            }
        });
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_doubles::{RecordingPolicyStore, RecordingSnapshotTrigger};
    use super::*;
    use gwcp_core::types::{ConfigKind, ConfigStatus, Operation, PolicyInstance, UpstreamHost, Vhosts};
    use gwcp_eventhub::PollingEventHub;
    use gwcp_store::SqliteStore;
    use tokio::time::sleep;

    fn sample_config(id: ConfigId, policy: bool) -> gwcp_core::types::StoredConfig {
        let now = Utc::now();
        gwcp_core::types::StoredConfig {
            id,
            display_name: "weather".to_string(),
            version: "v1".to_string(),
            handle: "weather-v1".to_string(),
            context: "/weather".to_string(),
            kind: ConfigKind::RestApi,
            operations: vec![Operation {
                method: "GET".to_string(),
                path: "/us".to_string(),
                policies: if policy {
                    vec![PolicyInstance {
                        name: "rateLimit".to_string(),
                        version: "v1".to_string(),
                        enabled: true,
                        execution_condition: None,
                        parameters: serde_json::json!({}),
                    }]
                } else {
                    vec![]
                },
            }],
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

    async fn fixture() -> (
        EventListener,
        Arc<dyn PersistentStore>,
        Arc<PollingEventHub>,
        Arc<RecordingPolicyStore>,
        Arc<RecordingSnapshotTrigger>,
        gwcp_core::types::OrganizationId,
    ) {
        let store: Arc<dyn PersistentStore> = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let catalog = Arc::new(Catalog::new());
        let lazyres = Arc::new(LazyResourceCache::new());
        let policy_store = Arc::new(RecordingPolicyStore::default());
        let snapshot = Arc::new(RecordingSnapshotTrigger::default());
        let hub = Arc::new(PollingEventHub::new(Arc::clone(&store), 3600));
        let org = gwcp_core::types::OrganizationId::new();

        let listener = EventListener::new(
            Arc::clone(&store),
            catalog,
            lazyres,
            Arc::clone(&policy_store) as Arc<dyn PolicyStore>,
            Arc::clone(&snapshot) as Arc<dyn SnapshotTrigger>,
            Arc::clone(&hub) as Arc<dyn EventBackend>,
            org,
        );

        (listener, store, hub, policy_store, snapshot, org)
    }

    #[tokio::test]
    async fn create_event_upserts_catalog_and_projects_policy() {
        let (listener, store, _hub, policy_store, snapshot, _org) = fixture().await;
        let config = sample_config(ConfigId::new(), true);
        store.save_config(&config).await.unwrap();

        let event = Event {
            organization_id: _org,
            processed_timestamp: Utc::now(),
            originated_timestamp: Utc::now(),
            event_type: EventType::Api,
            action: EventAction::Create,
            entity_id: config.id.to_string(),
            event_data: serde_json::json!({}),
            correlation_id: None,
        };

        listener.handle_event(&event).await.unwrap();
        assert!(listener.catalog.get(config.id).await.is_some());
        assert_eq!(policy_store.upserts.lock().await.len(), 1);

        sleep(Duration::from_millis(20)).await;
        assert_eq!(snapshot.rebuilds.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn create_event_with_no_policies_removes_stale_policy_entry() {
        let (listener, store, _hub, policy_store, _snapshot, _org) = fixture().await;
        let config = sample_config(ConfigId::new(), false);
        store.save_config(&config).await.unwrap();

        let event = Event {
            organization_id: _org,
            processed_timestamp: Utc::now(),
            originated_timestamp: Utc::now(),
            event_type: EventType::Api,
            action: EventAction::Create,
            entity_id: config.id.to_string(),
            event_data: serde_json::json!({}),
            correlation_id: None,
        };

        listener.handle_event(&event).await.unwrap();
        assert!(policy_store.upserts.lock().await.is_empty());
        assert_eq!(policy_store.removals.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn delete_event_removes_from_catalog() {
        let (listener, store, _hub, _policy_store, _snapshot, _org) = fixture().await;
        let config = sample_config(ConfigId::new(), false);
        store.save_config(&config).await.unwrap();
        listener.catalog.add(config.clone()).await;

        let event = Event {
            organization_id: _org,
            processed_timestamp: Utc::now(),
            originated_timestamp: Utc::now(),
            event_type: EventType::Api,
            action: EventAction::Delete,
            entity_id: config.id.to_string(),
            event_data: serde_json::json!({}),
            correlation_id: None,
        };

        listener.handle_event(&event).await.unwrap();
        assert!(listener.catalog.get(config.id).await.is_none());
    }

    #[tokio::test]
    async fn unknown_entity_id_is_swallowed_by_the_batch_handler() {
        let (listener, _store, _hub, _policy_store, _snapshot, _org) = fixture().await;

        let event = Event {
            organization_id: _org,
            processed_timestamp: Utc::now(),
            originated_timestamp: Utc::now(),
            event_type: EventType::Api,
            action: EventAction::Update,
            entity_id: ConfigId::new().to_string(),
            event_data: serde_json::json!({}),
            correlation_id: None,
        };

        listener.handle_batch(vec![event]).await;
    }
}
