//! Builds the single `RouteConfiguration` with one virtual host
//! (`"all_apis"`, domain `"*"`) per §4.F. Route matching, naming, and
//! dynamic metadata all derive from the same `RouteKey` join key used by
//! the policy projector (P5).

use envoy_types::pb::envoy::config::core::v3::Metadata;
use envoy_types::pb::envoy::config::route::v3::header_matcher::HeaderMatchSpecifier;
use envoy_types::pb::envoy::config::route::v3::route::Action;
use envoy_types::pb::envoy::config::route::v3::route_action::ClusterSpecifier;
use envoy_types::pb::envoy::config::route::v3::route_match::PathSpecifier;
use envoy_types::pb::envoy::config::route::v3::{
    DirectResponseAction, HeaderMatcher, Route, RouteAction, RouteConfiguration,
    RouteMatch, VirtualHost,
};
use envoy_types::pb::envoy::r#type::matcher::v3::regex_matcher::{EngineType, GoogleRe2};
use envoy_types::pb::envoy::r#type::matcher::v3::RegexMatcher;
use envoy_types::pb::google::protobuf::value::Kind as ValueKind;
use envoy_types::pb::google::protobuf::{Struct as ProstStruct, Value as ProstValue};
use gwcp_core::types::{ConfigKind, RouteKey, StoredConfig};

use crate::cluster::{cluster_name, parse_upstream};
use crate::types::{BuiltResource, ROUTE_TYPE_URL};

const ROUTE_CONFIG_NAME: &str = "local_route";
const VIRTUAL_HOST_NAME: &str = "all_apis";

fn has_param_placeholder(path: &str) -> bool {
    path.contains('{') && path.contains('}')
}

fn join_path(context: &str, path: &str) -> String {
    let joined = format!("{}/{}", context.trim_end_matches('/'), path.trim_start_matches('/'));
    if joined.is_empty() {
        "/".to_string()
    } else {
        joined
    }
}

/// `{name}` placeholders become `[^/]+`, anchored `^...$`.
fn path_to_regex(full_path: &str) -> String {
    let mut out = String::from("^");
    let mut chars = full_path.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' => {
                while let Some(&next) = chars.peek() {
                    chars.next();
                    if next == '}' {
                        break;
                    }
                }
                out.push_str("[^/]+");
            }
            other => {
                if "\\.+*?()|[]^$".contains(other) {
                    out.push('\\');
                }
                out.push(other);
            }
        }
    }
    out.push('$');
    out
}

fn string_value(s: &str) -> ProstValue {
    ProstValue {
        kind: Some(ValueKind::StringValue(s.to_string())),
    }
}

fn route_metadata(route_name: &str, config: &StoredConfig, method: &str, full_path: &str) -> Metadata {
    let mut fields = std::collections::BTreeMap::new();
    fields.insert("route_name".to_string(), string_value(route_name));
    fields.insert("api_name".to_string(), string_value(&config.display_name));
    fields.insert("api_version".to_string(), string_value(&config.version));
    fields.insert("api_context".to_string(), string_value(&config.context));
    fields.insert("path".to_string(), string_value(full_path));
    fields.insert("method".to_string(), string_value(method));

    let mut filter_metadata = std::collections::HashMap::new();
    filter_metadata.insert("wso2.route".to_string(), ProstStruct { fields });

    Metadata { filter_metadata, ..Default::default() }
}

fn upstream_rewrite(upstream_url: &str, context: &str) -> Option<RegexMatcher> {
    let (_, rest) = upstream_url.split_once("://")?;
    let path_start = rest.find('/')?;
    let upstream_path = &rest[path_start..];
    if upstream_path.is_empty() || upstream_path == "/" {
        return None;
    }
    Some(RegexMatcher {
        regex: format!("^{}(.*)$", context),
        engine_type: Some(EngineType::GoogleRe2(GoogleRe2::default())),
    })
}

fn build_route(config: &StoredConfig, method: &str, full_path: &str, vhost: &str) -> Route {
    let route_key = RouteKey::new(method, full_path, vhost);
    let cluster = config
        .upstreams
        .first()
        .and_then(|u| parse_upstream(&u.url))
        .map(|parsed| cluster_name(&parsed.host))
        .unwrap_or_default();

    let path_specifier = if has_param_placeholder(full_path) {
        PathSpecifier::SafeRegex(RegexMatcher {
            regex: path_to_regex(full_path),
            engine_type: Some(EngineType::GoogleRe2(GoogleRe2::default())),
        })
    } else {
        PathSpecifier::Path(full_path.to_string())
    };

    let regex_rewrite = config
        .upstreams
        .first()
        .and_then(|u| upstream_rewrite(&u.url, &config.context))
        .map(|pattern| envoy_types::pb::envoy::r#type::matcher::v3::RegexMatchAndSubstitute {
            pattern: Some(pattern),
            substitution: "{upstream_path}\\1".replace(
                "{upstream_path}",
                config
                    .upstreams
                    .first()
                    .and_then(|u| u.url.split_once("://"))
                    .and_then(|(_, rest)| rest.find('/').map(|i| &rest[i..]))
                    .unwrap_or(""),
            ),
        });

    Route {
        name: route_key.to_string(),
        r#match: Some(RouteMatch {
            path_specifier: Some(path_specifier),
            headers: vec![HeaderMatcher {
                name: ":method".to_string(),
                header_match_specifier: Some(HeaderMatchSpecifier::ExactMatch(method.to_string())),
                ..Default::default()
            }],
            ..Default::default()
        }),
        action: Some(Action::Route(RouteAction {
            cluster_specifier: Some(ClusterSpecifier::Cluster(cluster)),
            regex_rewrite,
            ..Default::default()
        })),
        metadata: Some(route_metadata(route_key.as_str(), config, method, full_path)),
        ..Default::default()
    }
}

fn catch_all_route() -> Route {
    Route {
        name: "catch_all_404".to_string(),
        r#match: Some(RouteMatch {
            path_specifier: Some(PathSpecifier::Prefix("/".to_string())),
            ..Default::default()
        }),
        action: Some(Action::DirectResponse(DirectResponseAction {
            status: 404,
            ..Default::default()
        })),
        ..Default::default()
    }
}

/// Concatenates routes from every deployed-and-pending config, appends
/// the 404 catch-all, sorts by name for determinism (P4).
pub fn build_route_configuration(configs: &[StoredConfig]) -> BuiltResource {
    let mut routes = Vec::new();

    for config in configs {
        if !matches!(
            config.kind,
            ConfigKind::RestApi | ConfigKind::WebSubApi | ConfigKind::Mcp
        ) {
            continue;
        }

        let vhosts: Vec<&str> = std::iter::once(config.vhosts.main.as_str())
            .chain(config.vhosts.sandbox.as_deref())
            .collect();

        for operation in &config.operations {
            let full_path = join_path(&config.context, &operation.path);
            for vhost in &vhosts {
                routes.push(build_route(config, &operation.method, &full_path, vhost));
            }
        }
    }

    routes.sort_by(|a, b| a.name.cmp(&b.name));
    routes.push(catch_all_route());

    let route_config = RouteConfiguration {
        name: ROUTE_CONFIG_NAME.to_string(),
        virtual_hosts: vec![VirtualHost {
            name: VIRTUAL_HOST_NAME.to_string(),
            domains: vec!["*".to_string()],
            routes,
            ..Default::default()
        }],
        ..Default::default()
    };

    BuiltResource::pack(ROUTE_CONFIG_NAME, ROUTE_TYPE_URL, &route_config)
}

pub fn route_config_name() -> &'static str {
    ROUTE_CONFIG_NAME
}
