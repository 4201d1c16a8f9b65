//! Builds the single HTTP listener on port 8080 with an ordered filter
//! chain (optional ext_proc policy engine, then the router), per §4.F.

use envoy_types::pb::envoy::config::accesslog::v3::access_log::ConfigType as AccessLogConfigType;
use envoy_types::pb::envoy::config::accesslog::v3::AccessLog;
use envoy_types::pb::envoy::config::core::v3::address::Address as AddressKind;
use envoy_types::pb::envoy::config::core::v3::grpc_service::{EnvoyGrpc, TargetSpecifier};
use envoy_types::pb::envoy::config::core::v3::socket_address::PortSpecifier;
use envoy_types::pb::envoy::config::core::v3::{Address, GrpcService, SocketAddress};
use envoy_types::pb::envoy::config::listener::v3::filter::ConfigType as FilterConfigType;
use envoy_types::pb::envoy::config::listener::v3::{Filter, FilterChain, Listener};
use envoy_types::pb::envoy::extensions::access_loggers::stream::v3::StdoutAccessLog;
use envoy_types::pb::envoy::extensions::filters::http::ext_proc::v3::processing_mode::HeaderSendMode;
use envoy_types::pb::envoy::extensions::filters::http::ext_proc::v3::{ExternalProcessor, ProcessingMode};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::http_connection_manager::{
    CodecType, RouteSpecifier,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    HttpConnectionManager, HttpFilter,
};
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::http_filter::ConfigType as HttpFilterConfigType;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;

use crate::types::{BuiltResource, LISTENER_TYPE_URL, POLICY_ENGINE_CLUSTER_NAME, XdsOptions};
use crate::route::route_config_name;

const LISTENER_NAME: &str = "listener_0";
const LISTENER_PORT: u32 = 8080;
const ROUTER_FILTER: &str = "envoy.filters.http.router";
const EXT_PROC_FILTER: &str = "envoy.filters.http.ext_proc";
const HCM_FILTER: &str = "envoy.filters.network.http_connection_manager";
/// Only header-bound inspection is needed for policy evaluation;
/// bodies stay unbuffered (`ProcessingMode`'s default `Skip` for the
/// body/trailer modes is left as-is).
const EXT_PROC_ATTRIBUTE_ROUTE_NAME: &str = "xds.route_name";

fn stdout_access_log() -> AccessLog {
    let config = StdoutAccessLog::default();
    AccessLog {
        name: "envoy.access_loggers.stdout".to_string(),
        config_type: Some(AccessLogConfigType::TypedConfig(Any {
            type_url: "type.googleapis.com/envoy.extensions.access_loggers.stream.v3.StdoutAccessLog"
                .to_string(),
            value: config.encode_to_vec(),
        })),
        ..Default::default()
    }
}

fn router_filter() -> HttpFilter {
    HttpFilter {
        name: ROUTER_FILTER.to_string(),
        config_type: Some(HttpFilterConfigType::TypedConfig(Any {
            type_url: "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router".to_string(),
            value: Vec::new(),
        })),
        ..Default::default()
    }
}

/// Targets the dedicated `policy_engine` cluster `cluster.rs` builds
/// whenever this filter is wired in — the two must always travel
/// together (see `lib.rs::translate`).
fn ext_proc_filter() -> HttpFilter {
    let external_processor = ExternalProcessor {
        grpc_service: Some(GrpcService {
            target_specifier: Some(TargetSpecifier::EnvoyGrpc(EnvoyGrpc {
                cluster_name: POLICY_ENGINE_CLUSTER_NAME.to_string(),
                ..Default::default()
            })),
            ..Default::default()
        }),
        failure_mode_allow: false,
        processing_mode: Some(ProcessingMode {
            request_header_mode: HeaderSendMode::Send as i32,
            response_header_mode: HeaderSendMode::Send as i32,
            ..Default::default()
        }),
        request_attributes: vec![EXT_PROC_ATTRIBUTE_ROUTE_NAME.to_string()],
        ..Default::default()
    };
    HttpFilter {
        name: EXT_PROC_FILTER.to_string(),
        config_type: Some(HttpFilterConfigType::TypedConfig(Any {
            type_url: "type.googleapis.com/envoy.extensions.filters.http.ext_proc.v3.ExternalProcessor"
                .to_string(),
            value: external_processor.encode_to_vec(),
        })),
        ..Default::default()
    }
}

fn http_filters(options: &XdsOptions) -> Vec<HttpFilter> {
    let mut filters = Vec::new();
    if options.policy_engine_enabled && options.policy_engine_cluster_address.is_some() {
        filters.push(ext_proc_filter());
    }
    filters.push(router_filter());
    filters
}

fn http_connection_manager(options: &XdsOptions) -> HttpConnectionManager {
    HttpConnectionManager {
        stat_prefix: "ingress_http".to_string(),
        codec_type: CodecType::Auto as i32,
        route_specifier: Some(RouteSpecifier::Rds(
            envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::Rds {
                route_config_name: route_config_name().to_string(),
                config_source: None,
            },
        )),
        http_filters: http_filters(options),
        access_log: vec![stdout_access_log()],
        ..Default::default()
    }
}

/// A single listener on port 8080 binding `0.0.0.0`, AUTO protocol,
/// RDS-sourced routes.
pub fn build_listener(options: &XdsOptions) -> BuiltResource {
    let hcm = http_connection_manager(options);

    let filter = Filter {
        name: HCM_FILTER.to_string(),
        config_type: Some(FilterConfigType::TypedConfig(Any {
            type_url:
                "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager"
                    .to_string(),
            value: hcm.encode_to_vec(),
        })),
    };

    let listener = Listener {
        name: LISTENER_NAME.to_string(),
        address: Some(Address {
            address: Some(AddressKind::SocketAddress(SocketAddress {
                address: "0.0.0.0".to_string(),
                port_specifier: Some(PortSpecifier::PortValue(LISTENER_PORT)),
                ..Default::default()
            })),
        }),
        filter_chains: vec![FilterChain {
            filters: vec![filter],
            ..Default::default()
        }],
        ..Default::default()
    };

    BuiltResource::pack(LISTENER_NAME, LISTENER_TYPE_URL, &listener)
}
