use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use gwcp_core::types::OrganizationId;
use gwcp_core::Result;
use gwcp_store::{NewEvent, PersistentStore};

use crate::subscriber::{Registration, SubscriberId};
use crate::{EventBackend, EventBatch, Subscription};

struct PollState {
    last_version: HashMap<OrganizationId, Uuid>,
    last_poll_time: HashMap<OrganizationId, DateTime<Utc>>,
}

impl PollState {
    fn new() -> Self {
        Self {
            last_version: HashMap::new(),
            last_poll_time: HashMap::new(),
        }
    }
}

/// The polling implementation of [`EventBackend`]. Holds one background
/// poller task and one cleanup task, both cancelled on `shutdown`.
pub struct PollingEventHub {
    store: Arc<dyn PersistentStore>,
    subscribers: Arc<RwLock<HashMap<OrganizationId, HashMap<SubscriberId, Registration>>>>,
    poll_state: Arc<RwLock<PollState>>,
    retention: chrono::Duration,
    shutdown: CancellationToken,
}

impl PollingEventHub {
    pub fn new(store: Arc<dyn PersistentStore>, retention_secs: i64) -> Self {
        Self {
            store,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            poll_state: Arc::new(RwLock::new(PollState::new())),
            retention: chrono::Duration::seconds(retention_secs),
            shutdown: CancellationToken::new(),
        }
    }

    /// Spawns the poller and cleanup background tasks. Returns
    /// immediately; tasks run until `shutdown` is called.
    pub fn spawn(self: &Arc<Self>, poll_interval: Duration, cleanup_interval: Duration) {
        let poller = Arc::clone(self);
        tokio::spawn(async move { poller.run_poller(poll_interval).await });

        let cleaner = Arc::clone(self);
        tokio::spawn(async move { cleaner.run_cleanup(cleanup_interval).await });
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn run_poller(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        warn!(error = %err, component = "eventhub", phase = "poll", "poll tick failed");
                    }
                }
            }
        }
    }

    async fn run_cleanup(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let cutoff = Utc::now() - self.retention;
                    match self.store.cleanup_events_older_than(cutoff).await {
                        Ok(deleted) if deleted > 0 => {
                            info!(deleted, component = "eventhub", phase = "cleanup", "retired old events");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            warn!(error = %err, component = "eventhub", phase = "cleanup", "cleanup tick failed");
                        }
                    }
                }
            }
        }
    }

    /// One poll tick: a single query for all org states, then a
    /// per-changed-org fetch of events since the last watermark.
    async fn poll_once(&self) -> Result<()> {
        let states = self.store.get_all_states().await.map_err(gwcp_core::Error::from)?;

        for state in states {
            let mut poll_state = self.poll_state.write().await;
            let changed = poll_state
                .last_version
                .get(&state.organization_id)
                .map(|v| *v != state.version_id)
                .unwrap_or(true);

            let since = *poll_state
                .last_poll_time
                .get(&state.organization_id)
                .unwrap_or(&DateTime::<Utc>::MIN_UTC);

            // Watermark advances regardless of whether this org changed,
            // so a slow-changing tenant doesn't re-scan its whole history
            // every tick.
            poll_state
                .last_version
                .insert(state.organization_id, state.version_id);
            poll_state
                .last_poll_time
                .insert(state.organization_id, Utc::now());
            drop(poll_state);

            if !changed {
                continue;
            }

            let events = self
                .store
                .get_events_since(state.organization_id, since)
                .await
                .map_err(gwcp_core::Error::from)?;

            if events.is_empty() {
                continue;
            }

            self.deliver(state.organization_id, events).await;
        }

        Ok(())
    }

    async fn deliver(&self, org: OrganizationId, batch: EventBatch) {
        let subscribers = self.subscribers.read().await;
        let Some(org_subscribers) = subscribers.get(&org) else {
            return;
        };

        for (id, registration) in org_subscribers {
            if registration.sender.try_send(batch.clone()).is_err() {
                warn!(
                    organization_id = %org,
                    subscriber_id = ?id,
                    component = "eventhub",
                    phase = "deliver",
                    "subscriber channel full or closed, dropping batch for this subscriber"
                );
            }
        }
    }
}

#[async_trait]
impl EventBackend for PollingEventHub {
    async fn subscribe(&self, org: OrganizationId, capacity: usize) -> Subscription {
        let id = SubscriberId::new();
        let (internal_tx, mut internal_rx) = mpsc::channel::<EventBatch>(capacity);
        let (external_tx, external_rx) = mpsc::channel::<EventBatch>(capacity);
        let cancel = CancellationToken::new();

        self.subscribers
            .write()
            .await
            .entry(org)
            .or_default()
            .insert(
                id,
                Registration {
                    sender: internal_tx,
                    cancel: cancel.clone(),
                },
            );

        // Bridges internal deliveries to the caller's channel. Unlike the
        // leaky adapter this replaces, `unsubscribe` cancels this task
        // immediately rather than waiting for the outer process to exit.
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    batch = internal_rx.recv() => {
                        match batch {
                            Some(batch) => {
                                if external_tx.send(batch).await.is_err() {
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                }
            }
        });

        Subscription {
            id,
            receiver: external_rx,
        }
    }

    async fn unsubscribe(&self, org: OrganizationId, id: SubscriberId) {
        let mut subscribers = self.subscribers.write().await;
        if let Some(org_subscribers) = subscribers.get_mut(&org) {
            if let Some(registration) = org_subscribers.remove(&id) {
                registration.cancel.cancel();
            }
            if org_subscribers.is_empty() {
                subscribers.remove(&org);
            }
        }
    }

    async fn publish(&self, org: OrganizationId, event: NewEvent) -> Result<()> {
        self.store
            .publish_event_atomic(org, event)
            .await
            .map_err(gwcp_core::Error::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwcp_core::types::{EventAction, EventType};
    use gwcp_store::SqliteStore;

    async fn hub_with_store() -> (Arc<PollingEventHub>, Arc<dyn PersistentStore>) {
        let store: Arc<dyn PersistentStore> = Arc::new(SqliteStore::open_in_memory().await.unwrap());
        let hub = Arc::new(PollingEventHub::new(Arc::clone(&store), 3600));
        (hub, store)
    }

    fn new_event(entity_id: &str) -> NewEvent {
        NewEvent {
            originated_timestamp: Utc::now(),
            event_type: EventType::Api,
            action: EventAction::Create,
            entity_id: entity_id.to_string(),
            event_data: serde_json::json!({}),
            correlation_id: None,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event_after_poll() {
        let (hub, _store) = hub_with_store().await;
        let org = OrganizationId::new();
        let mut sub = hub.subscribe(org, 16).await;

        hub.publish(org, new_event("cfg-1")).await.unwrap();
        hub.poll_once().await.unwrap();

        let batch = sub.receiver.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].entity_id, "cfg-1");
    }

    #[tokio::test]
    async fn events_delivered_in_order_within_one_batch() {
        let (hub, _store) = hub_with_store().await;
        let org = OrganizationId::new();
        let mut sub = hub.subscribe(org, 16).await;

        hub.publish(org, new_event("cfg-1")).await.unwrap();
        hub.publish(org, new_event("cfg-2")).await.unwrap();
        hub.poll_once().await.unwrap();

        let batch = sub.receiver.recv().await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].entity_id, "cfg-1");
        assert_eq!(batch[1].entity_id, "cfg-2");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery_immediately() {
        let (hub, _store) = hub_with_store().await;
        let org = OrganizationId::new();
        let sub = hub.subscribe(org, 16).await;
        let id = sub.id;
        drop(sub);

        hub.unsubscribe(org, id).await;

        hub.publish(org, new_event("cfg-1")).await.unwrap();
        hub.poll_once().await.unwrap();

        assert!(hub.subscribers.read().await.get(&org).is_none());
    }

    #[tokio::test]
    async fn unrelated_org_does_not_see_events() {
        let (hub, _store) = hub_with_store().await;
        let org_a = OrganizationId::new();
        let org_b = OrganizationId::new();
        let mut sub_b = hub.subscribe(org_b, 16).await;

        hub.publish(org_a, new_event("cfg-1")).await.unwrap();
        hub.poll_once().await.unwrap();

        assert!(sub_b.receiver.try_recv().is_err());
    }
}
