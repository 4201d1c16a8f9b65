//! Builds one Envoy `Cluster` per distinct upstream host, STRICT_DNS,
//! 5s connect timeout, per §4.F. `https://` upstreams get a TLS
//! transport socket (SNI, TLS 1.2–1.3, default CA trust) bound via a
//! `transport_socket_match` keyed on `lb_id = "0"` metadata rather than
//! the cluster's plain `transport_socket` field. Also builds the
//! dedicated `policy_engine` cluster the ext_proc filter targets when
//! the policy engine is enabled.

use std::collections::{BTreeMap, HashMap};

use envoy_types::pb::envoy::config::cluster::v3::cluster::{
    ClusterDiscoveryType, DiscoveryType, LbPolicy, TransportSocketMatch,
};
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::address::Address as AddressKind;
use envoy_types::pb::envoy::config::core::v3::data_source::Specifier as DataSourceSpecifier;
use envoy_types::pb::envoy::config::core::v3::socket_address::PortSpecifier;
use envoy_types::pb::envoy::config::core::v3::transport_socket::ConfigType as TransportSocketConfigType;
use envoy_types::pb::envoy::config::core::v3::{
    Address, DataSource, Http2ProtocolOptions, Metadata, SocketAddress, TransportSocket,
};
use envoy_types::pb::envoy::config::endpoint::v3::lb_endpoint::HostIdentifier;
use envoy_types::pb::envoy::config::endpoint::v3::{
    ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::common_tls_context::ValidationContextType;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    CertificateValidationContext, CommonTlsContext, TlsParameters, UpstreamTlsContext,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::http_protocol_options::explicit_http_config::ProtocolConfig;
use envoy_types::pb::envoy::extensions::upstreams::http::v3::http_protocol_options::{
    ExplicitHttpConfig, UpstreamProtocolOptions,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::HttpProtocolOptions;
use envoy_types::pb::google::protobuf::value::Kind as ValueKind;
use envoy_types::pb::google::protobuf::{Any, Duration as ProstDuration, Struct as ProstStruct, Value as ProstValue};
use gwcp_core::types::StoredConfig;
use prost::Message;

use crate::types::{BuiltResource, CLUSTER_TYPE_URL, POLICY_ENGINE_CLUSTER_NAME, XdsOptions};

const TLS_TRANSPORT_SOCKET_NAME: &str = "envoy.transport_sockets.tls";
const HTTP_PROTOCOL_OPTIONS_KEY: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
/// Metadata namespace + field Envoy matches a `Cluster.TransportSocketMatch`
/// against (`envoy.transport_socket_match.lb_id`, per §4.F) — each TLS
/// upstream's `LbEndpoint.metadata` carries the same pair so the matcher
/// actually selects it.
const TRANSPORT_SOCKET_MATCH_NAMESPACE: &str = "envoy.transport_socket_match";
const TRANSPORT_SOCKET_MATCH_LB_ID_KEY: &str = "lb_id";
const TRANSPORT_SOCKET_MATCH_LB_ID_VALUE: &str = "0";
const TLS_TRANSPORT_SOCKET_MATCH_NAME: &str = "tls";
const SYSTEM_DEFAULT_CA_BUNDLE: &str = "/etc/ssl/certs/ca-certificates.crt";
const DEFAULT_CIPHER_SUITES: &[&str] = &[
    "ECDHE-ECDSA-AES128-GCM-SHA256",
    "ECDHE-RSA-AES128-GCM-SHA256",
    "ECDHE-ECDSA-AES256-GCM-SHA384",
    "ECDHE-RSA-AES256-GCM-SHA384",
];
// `TlsParameters.TlsProtocol` discriminants from
// envoy/extensions/transport_sockets/tls/v3/common.proto. Pinned by the
// proto-documented number rather than the generated enum identifier: that
// enum's mixed-case values (`TLSv1_2`, `TLSv1_3`) don't have a single
// predictable Rust spelling across codegen versions, while the wire
// discriminant is stable.
const TLS_PROTOCOL_V1_2: i32 = 3;
const TLS_PROTOCOL_V1_3: i32 = 4;

const CONNECT_TIMEOUT: ProstDuration = ProstDuration { seconds: 5, nanos: 0 };

/// `cluster_<host_with_dots_underscored>`.
pub fn cluster_name(host: &str) -> String {
    format!("cluster_{}", host.replace(['.', ':'], "_"))
}

pub(crate) struct ParsedUpstream {
    pub(crate) host: String,
    pub(crate) port: u32,
    pub(crate) tls: bool,
}

/// Shared by `build_clusters` here and `route.rs`'s cluster-name
/// lookup — both need the same host-only, port-stripped authority so a
/// route's `cluster_specifier` always matches a cluster this module
/// actually built.
pub(crate) fn parse_upstream(url: &str) -> Option<ParsedUpstream> {
    let (scheme, rest) = url.split_once("://")?;
    let authority = rest.split('/').next().unwrap_or(rest);
    let tls = scheme == "https";
    let default_port = if tls { 443 } else { 80 };

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port_str)) => (host.to_string(), port_str.parse().unwrap_or(default_port)),
        None => (authority.to_string(), default_port),
    };

    Some(ParsedUpstream { host, port, tls })
}

fn string_value(s: &str) -> ProstValue {
    ProstValue { kind: Some(ValueKind::StringValue(s.to_string())) }
}

/// The `lb_id = "0"` struct used both as the `TransportSocketMatch`'s
/// match criteria and (namespaced) as the `LbEndpoint`'s metadata — the
/// two have to carry the same key/value pair or Envoy never selects this
/// transport socket for the endpoint.
fn lb_id_fields() -> ProstStruct {
    let mut fields = BTreeMap::new();
    fields.insert(TRANSPORT_SOCKET_MATCH_LB_ID_KEY.to_string(), string_value(TRANSPORT_SOCKET_MATCH_LB_ID_VALUE));
    ProstStruct { fields }
}

fn lb_id_endpoint_metadata() -> Metadata {
    let mut filter_metadata = HashMap::new();
    filter_metadata.insert(TRANSPORT_SOCKET_MATCH_NAMESPACE.to_string(), lb_id_fields());
    Metadata { filter_metadata, ..Default::default() }
}

/// An `https://` upstream's TLS transport socket: SNI pinned to the
/// upstream host, TLS 1.2–1.3 with a conservative AEAD cipher list, and
/// a validation context trusting the host's default CA bundle. Envoy
/// checks the upstream's presented SAN against the SNI automatically
/// (`auto_host_sni_san_validation`) rather than requiring an explicit
/// per-host SAN matcher here.
fn tls_transport_socket(host: &str) -> TransportSocket {
    let validation_context = CertificateValidationContext {
        trusted_ca: Some(DataSource {
            specifier: Some(DataSourceSpecifier::Filename(SYSTEM_DEFAULT_CA_BUNDLE.to_string())),
            ..Default::default()
        }),
        ..Default::default()
    };

    let tls_context = UpstreamTlsContext {
        sni: host.to_string(),
        auto_sni_san_validation: true,
        common_tls_context: Some(CommonTlsContext {
            tls_params: Some(TlsParameters {
                tls_minimum_protocol_version: TLS_PROTOCOL_V1_2,
                tls_maximum_protocol_version: TLS_PROTOCOL_V1_3,
                cipher_suites: DEFAULT_CIPHER_SUITES.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            }),
            validation_context_type: Some(ValidationContextType::ValidationContext(validation_context)),
            ..Default::default()
        }),
        ..Default::default()
    };
    TransportSocket {
        name: TLS_TRANSPORT_SOCKET_NAME.to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(Any {
            type_url: "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext"
                .to_string(),
            value: tls_context.encode_to_vec(),
        })),
    }
}

/// Binds `tls_transport_socket` to the cluster via a metadata match
/// (`envoy.transport_socket_match.lb_id = "0"`) instead of the plain
/// `Cluster.transport_socket` field, per §4.F — every TLS endpoint
/// carries the matching `lb_id` in its own metadata (`lb_id_endpoint_metadata`).
fn tls_transport_socket_match(host: &str) -> TransportSocketMatch {
    TransportSocketMatch {
        name: TLS_TRANSPORT_SOCKET_MATCH_NAME.to_string(),
        r#match: Some(lb_id_fields()),
        transport_socket: Some(tls_transport_socket(host)),
    }
}

/// One cluster per distinct upstream host across every config (deployed
/// and pending alike — the listener §4.F concatenates both).
pub fn build_clusters(configs: &[StoredConfig]) -> Vec<BuiltResource> {
    let mut by_host: BTreeMap<String, ParsedUpstream> = BTreeMap::new();

    for config in configs {
        for upstream in &config.upstreams {
            if let Some(parsed) = parse_upstream(&upstream.url) {
                by_host.entry(parsed.host.clone()).or_insert(parsed);
            }
        }
    }

    let mut resources: Vec<BuiltResource> = by_host
        .values()
        .map(|upstream| {
            let name = cluster_name(&upstream.host);
            let cluster = build_cluster(&name, &upstream.host, upstream.port, upstream.tls);
            BuiltResource::pack(name, CLUSTER_TYPE_URL, &cluster)
        })
        .collect();

    resources.sort_by(|a, b| a.name.cmp(&b.name));
    resources
}

/// Packs `HttpProtocolOptions{explicit_http_config: http2_protocol_options}`
/// under the upstream's `typed_extension_protocol_options` map — the v3
/// way to force HTTP/2 on a cluster, now that `Cluster.http2_protocol_options`
/// is gone.
fn http2_protocol_options() -> Any {
    let options = HttpProtocolOptions {
        upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(ExplicitHttpConfig {
            protocol_config: Some(ProtocolConfig::Http2ProtocolOptions(Http2ProtocolOptions::default())),
        })),
        ..Default::default()
    };
    Any {
        type_url: format!("type.googleapis.com/{HTTP_PROTOCOL_OPTIONS_KEY}"),
        value: options.encode_to_vec(),
    }
}

/// The dedicated cluster the ext_proc filter's `grpc_service` targets
/// when the policy engine is enabled — STRICT_DNS, round-robin, HTTP/2.
/// `None` when the policy engine is disabled or has no configured
/// address; the caller (`translate`) then must not wire the ext_proc
/// filter either, or Envoy gets a filter pointing at a cluster that was
/// never pushed.
pub fn build_policy_engine_cluster(options: &XdsOptions) -> Option<BuiltResource> {
    if !options.policy_engine_enabled {
        return None;
    }
    let address = options.policy_engine_cluster_address.as_deref()?;

    let mut typed_extension_protocol_options = HashMap::new();
    typed_extension_protocol_options.insert(HTTP_PROTOCOL_OPTIONS_KEY.to_string(), http2_protocol_options());

    let cluster = Cluster {
        name: POLICY_ENGINE_CLUSTER_NAME.to_string(),
        connect_timeout: Some(CONNECT_TIMEOUT),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32)),
        lb_policy: LbPolicy::RoundRobin as i32,
        typed_extension_protocol_options,
        load_assignment: Some(ClusterLoadAssignment {
            cluster_name: POLICY_ENGINE_CLUSTER_NAME.to_string(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![LbEndpoint {
                    host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
                        address: Some(Address {
                            address: Some(AddressKind::SocketAddress(SocketAddress {
                                address: address.to_string(),
                                port_specifier: Some(PortSpecifier::PortValue(
                                    options.policy_engine_cluster_port as u32,
                                )),
                                ..Default::default()
                            })),
                        }),
                        ..Default::default()
                    })),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    };

    Some(BuiltResource::pack(POLICY_ENGINE_CLUSTER_NAME, CLUSTER_TYPE_URL, &cluster))
}

fn build_cluster(name: &str, host: &str, port: u32, tls: bool) -> Cluster {
    Cluster {
        name: name.to_string(),
        connect_timeout: Some(CONNECT_TIMEOUT),
        cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32)),
        transport_socket_matches: if tls { vec![tls_transport_socket_match(host)] } else { Vec::new() },
        load_assignment: Some(ClusterLoadAssignment {
            cluster_name: name.to_string(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![LbEndpoint {
                    host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
                        address: Some(Address {
                            address: Some(AddressKind::SocketAddress(SocketAddress {
                                address: host.to_string(),
                                port_specifier: Some(PortSpecifier::PortValue(port)),
                                ..Default::default()
                            })),
                        }),
                        ..Default::default()
                    })),
                    metadata: if tls { Some(lb_id_endpoint_metadata()) } else { None },
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwcp_core::types::{ConfigId, ConfigKind, ConfigStatus, UpstreamHost, Vhosts};

    fn config_with_upstream(url: &str) -> StoredConfig {
        let now = chrono::Utc::now();
        StoredConfig {
            id: ConfigId::new(),
            display_name: "weather".to_string(),
            version: "v1".to_string(),
            handle: "weather-v1".to_string(),
            context: "/weather".to_string(),
            kind: ConfigKind::RestApi,
            operations: vec![],
            upstreams: vec![UpstreamHost { url: url.to_string() }],
            vhosts: Vhosts { main: "vhost1".to_string(), sandbox: None },
            api_level_policies: vec![],
            status: ConfigStatus::Deployed,
            created_at: now,
            updated_at: now,
            deployed_at: None,
            deployed_version: 1,
        }
    }

    #[test]
    fn cluster_name_replaces_dots_with_underscores() {
        assert_eq!(cluster_name("api.example.com"), "cluster_api_example_com");
    }

    #[test]
    fn parses_default_port_for_https() {
        let configs = vec![config_with_upstream("https://api.example.com/v2")];
        let resources = build_clusters(&configs);
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].name, "cluster_api_example_com");
    }

    #[test]
    fn dedupes_clusters_sharing_a_host() {
        let configs = vec![
            config_with_upstream("https://api.example.com/v2"),
            config_with_upstream("https://api.example.com/v3"),
        ];
        assert_eq!(build_clusters(&configs).len(), 1);
    }

    #[test]
    fn https_upstream_gets_tls_transport_socket_match() {
        let cluster = build_cluster("cluster_api_example_com", "api.example.com", 443, true);
        assert_eq!(cluster.transport_socket_matches.len(), 1);
        let tsm = &cluster.transport_socket_matches[0];
        assert_eq!(tsm.name, TLS_TRANSPORT_SOCKET_MATCH_NAME);
        assert_eq!(
            tsm.r#match.as_ref().unwrap().fields.get(TRANSPORT_SOCKET_MATCH_LB_ID_KEY),
            Some(&string_value(TRANSPORT_SOCKET_MATCH_LB_ID_VALUE))
        );
        let transport_socket = tsm.transport_socket.as_ref().unwrap();
        assert_eq!(transport_socket.name, TLS_TRANSPORT_SOCKET_NAME);

        let endpoint_metadata = cluster.load_assignment.unwrap().endpoints[0].lb_endpoints[0]
            .metadata
            .clone()
            .unwrap();
        let namespace = endpoint_metadata.filter_metadata.get(TRANSPORT_SOCKET_MATCH_NAMESPACE).unwrap();
        assert_eq!(
            namespace.fields.get(TRANSPORT_SOCKET_MATCH_LB_ID_KEY),
            Some(&string_value(TRANSPORT_SOCKET_MATCH_LB_ID_VALUE))
        );
    }

    #[test]
    fn http_upstream_has_no_transport_socket_match() {
        let cluster = build_cluster("cluster_api_example_com", "api.example.com", 80, false);
        assert!(cluster.transport_socket_matches.is_empty());
        assert!(cluster.load_assignment.unwrap().endpoints[0].lb_endpoints[0].metadata.is_none());
    }

    #[test]
    fn tls_transport_socket_decodes_to_upstream_tls_context_with_expected_protocol_range() {
        let tsm = tls_transport_socket_match("api.example.com");
        let any = match tsm.transport_socket.unwrap().config_type.unwrap() {
            TransportSocketConfigType::TypedConfig(any) => any,
        };
        let decoded = <UpstreamTlsContext as prost::Message>::decode(&any.value[..]).unwrap();
        assert_eq!(decoded.sni, "api.example.com");
        assert!(decoded.auto_sni_san_validation);
        let tls_params = decoded.common_tls_context.unwrap().tls_params.unwrap();
        assert_eq!(tls_params.tls_minimum_protocol_version, TLS_PROTOCOL_V1_2);
        assert_eq!(tls_params.tls_maximum_protocol_version, TLS_PROTOCOL_V1_3);
        assert!(!tls_params.cipher_suites.is_empty());
    }

    #[test]
    fn policy_engine_cluster_is_skipped_when_disabled() {
        let options = XdsOptions { policy_engine_enabled: false, ..Default::default() };
        assert!(build_policy_engine_cluster(&options).is_none());
    }

    #[test]
    fn policy_engine_cluster_is_skipped_without_an_address() {
        let options = XdsOptions { policy_engine_enabled: true, ..Default::default() };
        assert!(build_policy_engine_cluster(&options).is_none());
    }

    #[test]
    fn policy_engine_cluster_is_built_with_http2_when_enabled() {
        let options = XdsOptions {
            policy_engine_enabled: true,
            policy_engine_cluster_address: Some("127.0.0.1".to_string()),
            policy_engine_cluster_port: 9000,
        };
        let resource = build_policy_engine_cluster(&options).unwrap();
        assert_eq!(resource.name, POLICY_ENGINE_CLUSTER_NAME);

        let decoded = <Cluster as prost::Message>::decode(&resource.resource.value[..]).unwrap();
        assert!(decoded
            .typed_extension_protocol_options
            .contains_key(HTTP_PROTOCOL_OPTIONS_KEY));
        assert_eq!(decoded.lb_policy, LbPolicy::RoundRobin as i32);
    }
}
