//! Shared data model: identifiers and entities from the data model section.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(OrganizationId);
uuid_id!(ConfigId);
uuid_id!(CertificateId);
uuid_id!(LazyResourceId);

/// `METHOD|CONTEXT+PATH|VHOST` — the join key between xDS routes, policy
/// chains, and analytics metadata. Invariant 3.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RouteKey(String);

impl RouteKey {
    pub fn new(method: &str, full_path: &str, vhost: &str) -> Self {
        Self(format!("{}|{}|{}", method, full_path, vhost))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.splitn(3, '|').collect();
        if parts.len() != 3 {
            return Err(Error::validation(
                "route_key",
                format!("expected METHOD|PATH|VHOST, got '{raw}'"),
            ));
        }
        Ok(Self(raw.to_string()))
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigKind {
    RestApi,
    WebSubApi,
    Mcp,
    LlmProvider,
    LlmProxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigStatus {
    Pending,
    Deployed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamHost {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vhosts {
    pub main: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub policies: Vec<PolicyInstance>,
}

/// A persisted API/Certificate-adjacent configuration entity, covering
/// REST/WebSub/MCP/LLM flavors (the `kind` discriminant).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredConfig {
    pub id: ConfigId,
    pub display_name: String,
    pub version: String,
    pub handle: String,
    pub context: String,
    pub kind: ConfigKind,
    pub operations: Vec<Operation>,
    pub upstreams: Vec<UpstreamHost>,
    pub vhosts: Vhosts,
    #[serde(default)]
    pub api_level_policies: Vec<PolicyInstance>,
    pub status: ConfigStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployed_at: Option<DateTime<Utc>>,
    pub deployed_version: i64,
}

impl StoredConfig {
    pub fn composite_key(&self) -> (String, String) {
        (self.display_name.clone(), self.version.clone())
    }
}

/// A template resource (LLM provider, MCP proxy, …) referenced by
/// policies at evaluation time, not routed directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LazyResource {
    pub id: LazyResourceId,
    pub resource_type: String,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCertificate {
    pub id: CertificateId,
    pub name: String,
    pub pem: Vec<u8>,
    pub subject: String,
    pub issuer: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub chain_length: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Api,
    Certificate,
    LlmTemplate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventAction {
    Create,
    Update,
    Delete,
}

/// A row in the per-tenant event log. Primary key is
/// `(organization_id, processed_timestamp)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub organization_id: OrganizationId,
    pub processed_timestamp: DateTime<Utc>,
    pub originated_timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub action: EventAction,
    pub entity_id: String,
    pub event_data: JsonValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// Per-organization event-log tip. `version_id` is regenerated on every
/// mutation (invariant 1: append + bump is one atomic commit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrgState {
    pub organization_id: OrganizationId,
    pub version_id: Uuid,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyInstance {
    pub name: String,
    pub version: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_condition: Option<String>,
    #[serde(default)]
    pub parameters: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyChain {
    pub route_key: RouteKey,
    pub policies: Vec<PolicyInstance>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_key_format() {
        let k = RouteKey::new("GET", "/weather/us/{city}", "vhost1");
        assert_eq!(k.as_str(), "GET|/weather/us/{city}|vhost1");
    }

    #[test]
    fn route_key_parse_rejects_missing_parts() {
        assert!(RouteKey::parse("GET|/x").is_err());
        assert!(RouteKey::parse("GET|/x|vhost").is_ok());
    }

    #[test]
    fn organization_id_round_trips_through_string() {
        let id = OrganizationId::new();
        let parsed: OrganizationId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }
}
