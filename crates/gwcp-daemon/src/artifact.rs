//! Turns a deployed API artifact's YAML body into a `StoredConfig`.
//!
//! Deliberately narrow: this reads the handful of fields the control
//! plane actually routes on (context, operations, upstream, vhosts,
//! policies) rather than any broader spec-authoring format. Unknown
//! YAML fields are ignored.

use chrono::Utc;
use serde::Deserialize;

use gwcp_core::types::{
    ConfigId, ConfigKind, ConfigStatus, Operation, PolicyInstance, StoredConfig, UpstreamHost,
    Vhosts,
};
use gwcp_core::{Error, Result};

#[derive(Debug, Deserialize)]
struct ArtifactOperation {
    method: String,
    path: String,
    #[serde(default)]
    policies: Vec<ArtifactPolicy>,
}

#[derive(Debug, Deserialize)]
struct ArtifactPolicy {
    name: String,
    #[serde(default = "default_policy_version")]
    version: String,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    execution_condition: Option<String>,
    #[serde(default)]
    parameters: serde_json::Value,
}

fn default_policy_version() -> String {
    "v1".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ArtifactVhosts {
    main: String,
    #[serde(default)]
    sandbox: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArtifactUpstream {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ArtifactSpec {
    #[serde(rename = "displayName")]
    display_name: String,
    version: String,
    context: String,
    kind: String,
    vhosts: ArtifactVhosts,
    upstreams: Vec<ArtifactUpstream>,
    #[serde(default)]
    operations: Vec<ArtifactOperation>,
    #[serde(default)]
    policies: Vec<ArtifactPolicy>,
}

fn parse_kind(raw: &str) -> Result<ConfigKind> {
    match raw {
        "REST_API" => Ok(ConfigKind::RestApi),
        "WEBSUB_API" => Ok(ConfigKind::WebSubApi),
        "MCP" => Ok(ConfigKind::Mcp),
        "LLM_PROVIDER" => Ok(ConfigKind::LlmProvider),
        "LLM_PROXY" => Ok(ConfigKind::LlmProxy),
        other => Err(Error::validation("kind", format!("unrecognized kind {other}"))),
    }
}

fn into_policy(p: ArtifactPolicy) -> PolicyInstance {
    PolicyInstance {
        name: p.name,
        version: p.version,
        enabled: p.enabled,
        execution_condition: p.execution_condition,
        parameters: p.parameters,
    }
}

/// Parses and validates the artifact YAML, producing a `StoredConfig`
/// whose `handle` is pinned to the management-plane `api_id` — the
/// undeploy event carries only that id, so it has to double as the
/// lookup key rather than whatever the artifact's own handle field says.
pub fn parse_artifact(yaml: &str, api_id: &str, existing_id: Option<ConfigId>) -> Result<StoredConfig> {
    let spec: ArtifactSpec =
        serde_yaml::from_str(yaml).map_err(|e| Error::validation("artifact", e.to_string()))?;

    if spec.display_name.trim().is_empty() {
        return Err(Error::validation("displayName", "must not be empty"));
    }
    if spec.context.trim().is_empty() || !spec.context.starts_with('/') {
        return Err(Error::validation("context", "must be a non-empty absolute path"));
    }
    if spec.upstreams.is_empty() {
        return Err(Error::validation("upstreams", "at least one upstream is required"));
    }
    if spec.operations.is_empty() {
        return Err(Error::validation("operations", "at least one operation is required"));
    }

    let kind = parse_kind(&spec.kind)?;
    let now = Utc::now();

    Ok(StoredConfig {
        id: existing_id.unwrap_or_else(ConfigId::new),
        display_name: spec.display_name,
        version: spec.version,
        handle: api_id.to_string(),
        context: spec.context,
        kind,
        operations: spec
            .operations
            .into_iter()
            .map(|op| Operation {
                method: op.method,
                path: op.path,
                policies: op.policies.into_iter().map(into_policy).collect(),
            })
            .collect(),
        upstreams: spec
            .upstreams
            .into_iter()
            .map(|u| UpstreamHost { url: u.url })
            .collect(),
        vhosts: Vhosts {
            main: spec.vhosts.main,
            sandbox: spec.vhosts.sandbox,
        },
        api_level_policies: spec.policies.into_iter().map(into_policy).collect(),
        status: ConfigStatus::Deployed,
        created_at: now,
        updated_at: now,
        deployed_at: Some(now),
        deployed_version: 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
displayName: weather
version: v1
context: /weather
kind: REST_API
vhosts:
  main: vhost1
upstreams:
  - url: https://api.example.com
operations:
  - method: GET
    path: /us
    policies:
      - name: rateLimit
"#;

    #[test]
    fn parses_minimal_artifact() {
        let config = parse_artifact(SAMPLE, "api-123", None).unwrap();
        assert_eq!(config.handle, "api-123");
        assert_eq!(config.operations.len(), 1);
        assert_eq!(config.operations[0].policies[0].name, "rateLimit");
        assert!(config.operations[0].policies[0].enabled);
    }

    #[test]
    fn reuses_existing_id_on_redeploy() {
        let id = ConfigId::new();
        let config = parse_artifact(SAMPLE, "api-123", Some(id)).unwrap();
        assert_eq!(config.id, id);
    }

    #[test]
    fn rejects_missing_upstreams() {
        let yaml = SAMPLE.replace("upstreams:\n  - url: https://api.example.com\n", "upstreams: []\n");
        assert!(parse_artifact(&yaml, "api-123", None).is_err());
    }

    #[test]
    fn rejects_unknown_kind() {
        let yaml = SAMPLE.replace("REST_API", "SOMETHING_ELSE");
        assert!(parse_artifact(&yaml, "api-123", None).is_err());
    }
}
