//! Shared resource-building types: the `Any`-wrapped protobuf output of
//! the translator, grounded on flowplane's `BuiltResource`/`CachedResource`
//! shape (`xds/state.rs`).

use envoy_types::pb::google::protobuf::Any;
use prost::Message;

pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";

/// Name shared between the ext_proc filter's `grpc_service` target
/// (`listener.rs`) and the dedicated cluster that backs it
/// (`cluster.rs`) — they must agree or Envoy rejects the snapshot.
pub const POLICY_ENGINE_CLUSTER_NAME: &str = "policy_engine";

#[derive(Clone, Debug)]
pub struct BuiltResource {
    pub name: String,
    pub resource: Any,
}

impl BuiltResource {
    pub fn pack<T: Message>(name: impl Into<String>, type_url: &str, message: &T) -> Self {
        Self {
            name: name.into(),
            resource: Any {
                type_url: type_url.to_string(),
                value: message.encode_to_vec(),
            },
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TranslatedResources {
    pub listeners: Vec<BuiltResource>,
    pub routes: Vec<BuiltResource>,
    pub clusters: Vec<BuiltResource>,
}

/// Knobs that change resource shape without changing the core mapping —
/// the ext_proc policy-engine filter and its dedicated cluster.
#[derive(Clone, Debug, Default)]
pub struct XdsOptions {
    pub policy_engine_enabled: bool,
    pub policy_engine_cluster_address: Option<String>,
    pub policy_engine_cluster_port: u16,
}
