//! Flattens per-operation and API-level policies into a `PolicyChain` per
//! effective route, joined to the xDS translator via `route_key`.

use chrono::{DateTime, Utc};
use gwcp_core::types::{ConfigKind, Operation, PolicyChain, PolicyInstance, RouteKey, StoredConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resource_version: i64,
    pub api_name: String,
    pub version: String,
    pub context: String,
}

/// The bundle published under the custom `PolicyState` type-URL, id
/// `"<api_id>-policies"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfiguration {
    pub resource_id: String,
    pub routes: Vec<PolicyChain>,
    pub metadata: PolicyMetadata,
}

/// Projects a single API config into its `PolicyConfiguration`. Returns
/// `None` when no route in the API carries any policy (the whole API is
/// skipped, not emitted with empty chains).
pub fn project(config: &StoredConfig) -> Option<PolicyConfiguration> {
    let vhosts = std::iter::once(config.vhosts.main.as_str())
        .chain(config.vhosts.sandbox.as_deref())
        .collect::<Vec<_>>();

    let mut routes = Vec::new();

    for operation in &config.operations {
        let full_path = join_path(&config.context, &operation.path);
        let merged = merge_policies(operation, &config.api_level_policies);

        for vhost in &vhosts {
            let route_key = RouteKey::new(&operation.method, &full_path, vhost);
            routes.push(PolicyChain {
                route_key,
                policies: merged.clone(),
            });
        }
    }

    if routes.iter().all(|r| r.policies.is_empty()) {
        return None;
    }

    Some(PolicyConfiguration {
        resource_id: format!("{}-policies", config.id),
        metadata: PolicyMetadata {
            created_at: config.created_at,
            updated_at: config.updated_at,
            resource_version: config.deployed_version,
            api_name: config.display_name.clone(),
            version: config.version.clone(),
            context: config.context.clone(),
        },
        routes,
    })
}

/// Operation policies win on ordering; any API-level policy whose name
/// isn't already present is appended, stably.
fn merge_policies(operation: &Operation, api_level: &[PolicyInstance]) -> Vec<PolicyInstance> {
    let mut merged = operation.policies.clone();
    let seen: std::collections::HashSet<String> =
        merged.iter().map(|p| p.name.clone()).collect();

    for policy in api_level {
        if !seen.contains(policy.name.as_str()) {
            merged.push(policy.clone());
        }
    }

    merged
}

fn join_path(context: &str, path: &str) -> String {
    let joined = format!("{}/{}", context.trim_end_matches('/'), path.trim_start_matches('/'));
    if joined.is_empty() {
        "/".to_string()
    } else {
        joined
    }
}

/// `kind` doesn't change the projection algorithm; REST operations and
/// WebSub channels are both represented as `Operation{method, path,
/// policies}` at this layer.
pub fn applies_to(kind: ConfigKind) -> bool {
    matches!(
        kind,
        ConfigKind::RestApi | ConfigKind::WebSubApi | ConfigKind::Mcp
    )
}
