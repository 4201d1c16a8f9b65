//! Wires the control-plane link's deploy/undeploy callbacks into the
//! store + event hub: parse → validate → persist → publish, per §4.E.
//! The event listener (spawned separately) picks up the published event
//! and drives the catalog/policy/snapshot convergence from there — this
//! handler's job ends at a durable, correctly-versioned write.

use std::sync::Arc;

use async_trait::async_trait;
use gwcp_core::metrics::MetricsRegistry;
use gwcp_core::types::{EventAction, EventType, OrganizationId};
use gwcp_eventhub::EventBackend;
use gwcp_link::{ApiDeployedPayload, LinkHandler};
use gwcp_store::{NewEvent, PersistentStore};
use tracing::{error, info, warn};

use crate::artifact::parse_artifact;

pub struct DeployHandler {
    store: Arc<dyn PersistentStore>,
    hub: Arc<dyn EventBackend>,
    org: OrganizationId,
    metrics: Arc<MetricsRegistry>,
}

impl DeployHandler {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        hub: Arc<dyn EventBackend>,
        org: OrganizationId,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self { store, hub, org, metrics }
    }
}

#[async_trait]
impl LinkHandler for DeployHandler {
    async fn on_api_deployed(
        &self,
        payload: ApiDeployedPayload,
        yaml: String,
        correlation_id: Option<String>,
    ) {
        let existing = self.store.get_config_by_handle(&payload.api_id).await.ok();
        let action = if existing.is_some() {
            EventAction::Update
        } else {
            EventAction::Create
        };

        let config = match parse_artifact(&yaml, &payload.api_id, existing.as_ref().map(|c| c.id)) {
            Ok(config) => config,
            Err(err) => {
                error!(
                    component = "daemon",
                    phase = "deploy",
                    api_id = %payload.api_id,
                    error = %err,
                    "rejected malformed deployment artifact"
                );
                return;
            }
        };

        let write_result = if existing.is_some() {
            self.store.update_config(&config).await
        } else {
            self.store.save_config(&config).await
        };

        if let Err(err) = write_result {
            error!(
                component = "daemon",
                phase = "deploy",
                api_id = %payload.api_id,
                error = %err,
                "failed to persist deployed config"
            );
            self.metrics.incr("deploy_failures", 1);
            return;
        }

        self.metrics.incr("deploys_applied", 1);
        let publish_result = self
            .hub
            .publish(
                self.org,
                NewEvent {
                    originated_timestamp: chrono::Utc::now(),
                    event_type: EventType::Api,
                    action,
                    entity_id: config.id.to_string(),
                    event_data: serde_json::json!({ "apiId": payload.api_id, "revisionId": payload.revision_id }),
                    correlation_id,
                },
            )
            .await;

        match publish_result {
            Ok(()) => info!(component = "daemon", phase = "deploy", api_id = %payload.api_id, config_id = %config.id, "deployment persisted and event published"),
            Err(err) => error!(component = "daemon", phase = "deploy", api_id = %payload.api_id, error = %err, "config persisted but event publish failed"),
        }
    }

    async fn on_api_undeployed(&self, payload: ApiDeployedPayload, correlation_id: Option<String>) {
        let Ok(config) = self.store.get_config_by_handle(&payload.api_id).await else {
            warn!(component = "daemon", phase = "undeploy", api_id = %payload.api_id, "undeploy for unknown api_id ignored");
            return;
        };

        if let Err(err) = self.store.delete_config(config.id).await {
            error!(component = "daemon", phase = "undeploy", api_id = %payload.api_id, error = %err, "failed to delete undeployed config");
            self.metrics.incr("undeploy_failures", 1);
            return;
        }

        self.metrics.incr("undeploys_applied", 1);
        let publish_result = self
            .hub
            .publish(
                self.org,
                NewEvent {
                    originated_timestamp: chrono::Utc::now(),
                    event_type: EventType::Api,
                    action: EventAction::Delete,
                    entity_id: config.id.to_string(),
                    event_data: serde_json::json!({ "apiId": payload.api_id }),
                    correlation_id,
                },
            )
            .await;

        if let Err(err) = publish_result {
            error!(component = "daemon", phase = "undeploy", api_id = %payload.api_id, error = %err, "config deleted but event publish failed");
        }
    }
}
