//! Deterministic Listener/Route/Cluster translation from the gateway's
//! catalog into Envoy xDS resources, grounded on flowplane's
//! `Any`-wrapped `BuiltResource` shape.

pub mod cluster;
pub mod listener;
pub mod route;
pub mod types;

use gwcp_core::types::StoredConfig;

pub use types::{BuiltResource, TranslatedResources, XdsOptions, CLUSTER_TYPE_URL, LISTENER_TYPE_URL, ROUTE_TYPE_URL};

/// Translates every deployed-and-pending config into the three Envoy
/// resource families in one pass. The caller (`gwcp-snapshot`) is
/// responsible for bumping the version and pushing to node streams.
///
/// When the policy engine is enabled (and has a configured address),
/// the listener's ext_proc filter and the dedicated `policy_engine`
/// cluster it targets are added together — never one without the
/// other, or Envoy ends up with a filter referencing a cluster that
/// was never pushed.
pub fn translate(configs: &[StoredConfig], options: &XdsOptions) -> TranslatedResources {
    let mut clusters = cluster::build_clusters(configs);
    clusters.extend(cluster::build_policy_engine_cluster(options));

    TranslatedResources {
        listeners: vec![listener::build_listener(options)],
        routes: vec![route::build_route_configuration(configs)],
        clusters,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gwcp_core::types::{ConfigId, ConfigKind, ConfigStatus, Operation, UpstreamHost, Vhosts};

    fn sample_config() -> StoredConfig {
        let now = chrono::Utc::now();
        StoredConfig {
            id: ConfigId::new(),
            display_name: "weather".to_string(),
            version: "v1".to_string(),
            handle: "weather-v1".to_string(),
            context: "/weather".to_string(),
            kind: ConfigKind::RestApi,
            operations: vec![Operation {
                method: "GET".to_string(),
                path: "/us".to_string(),
                policies: vec![],
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

    #[test]
    fn translate_emits_one_resource_of_each_kind() {
        let resources = translate(&[sample_config()], &XdsOptions::default());
        assert_eq!(resources.listeners.len(), 1);
        assert_eq!(resources.routes.len(), 1);
        assert_eq!(resources.clusters.len(), 1);
    }

    #[test]
    fn translate_adds_policy_engine_cluster_alongside_ext_proc_filter() {
        let options = XdsOptions {
            policy_engine_enabled: true,
            policy_engine_cluster_address: Some("127.0.0.1".to_string()),
            policy_engine_cluster_port: 9000,
        };
        let resources = translate(&[sample_config()], &options);
        // One cluster for the upstream host, one for the policy engine.
        assert_eq!(resources.clusters.len(), 2);
        assert!(resources
            .clusters
            .iter()
            .any(|c| c.name == types::POLICY_ENGINE_CLUSTER_NAME));
    }

}

#[cfg(test)]
mod proptests {
    use super::*;
    use gwcp_core::types::{ConfigId, ConfigKind, ConfigStatus, Operation, UpstreamHost, Vhosts};
    use proptest::prelude::*;

    fn config_with_host(host: &str) -> StoredConfig {
        let now = chrono::Utc::now();
        StoredConfig {
            id: ConfigId::new(),
            display_name: host.to_string(),
            version: "v1".to_string(),
            handle: format!("{host}-v1"),
            context: format!("/{}", host.replace('.', "-")),
            kind: ConfigKind::RestApi,
            operations: vec![Operation {
                method: "GET".to_string(),
                path: "/ping".to_string(),
                policies: vec![],
            }],
            upstreams: vec![UpstreamHost { url: format!("https://{host}") }],
            vhosts: Vhosts { main: "vhost1".to_string(), sandbox: None },
            api_level_policies: vec![],
            status: ConfigStatus::Deployed,
            created_at: now,
            updated_at: now,
            deployed_at: None,
            deployed_version: 1,
        }
    }

    proptest! {
        /// P4: the translator's output bytes don't depend on the order
        /// configs arrive in — only on their content. `keys` permutes
        /// the fixed three-config set via a sort, since shuffling
        /// without an extra RNG dependency is otherwise awkward.
        #[test]
        fn translate_output_is_order_independent(keys in proptest::collection::vec(any::<u8>(), 3)) {
            let configs = vec![
                config_with_host("a.example.com"),
                config_with_host("b.example.com"),
                config_with_host("c.example.com"),
            ];

            let mut keyed: Vec<_> = configs.iter().cloned().zip(keys.iter().copied()).collect();
            keyed.sort_by_key(|(_, k)| *k);
            let shuffled: Vec<_> = keyed.into_iter().map(|(c, _)| c).collect();

            let baseline = translate(&configs, &XdsOptions::default());
            let reordered = translate(&shuffled, &XdsOptions::default());

            let cluster_bytes = |r: &TranslatedResources| {
                r.clusters.iter().map(|c| c.resource.value.clone()).collect::<Vec<_>>()
            };
            prop_assert_eq!(cluster_bytes(&baseline), cluster_bytes(&reordered));
            prop_assert_eq!(baseline.routes[0].resource.value.clone(), reordered.routes[0].resource.value.clone());
            prop_assert_eq!(baseline.listeners[0].resource.value.clone(), reordered.listeners[0].resource.value.clone());
        }
    }
}
