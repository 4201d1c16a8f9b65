//! Entry point for the gateway control-plane daemon: one process per
//! gateway instance, subscribed to exactly one organization's event
//! stream, serving xDS to Envoy and the policy engine.

mod artifact;
mod handler;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use opentelemetry::trace::TracerProvider as _;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gwcp_catalog::Catalog;
use gwcp_config::Config;
use gwcp_core::metrics::MetricsRegistry;
use gwcp_core::types::OrganizationId;
use gwcp_eventhub::{EventBackend, PollingEventHub};
use gwcp_lazyres::LazyResourceCache;
use gwcp_link::{BackoffPolicy, ControlPlaneLink, LinkConfig as PlLinkConfig};
use gwcp_listener::EventListener;
use gwcp_snapshot::{AdsServer, SnapshotCache, SnapshotManager};
use gwcp_store::{PersistentStore, SqliteStore};
use gwcp_xds::XdsOptions;

use handler::DeployHandler;

#[derive(Parser, Debug)]
#[command(name = "gwcpd", version, about = "Gateway control-plane daemon")]
struct Cli {
    /// Path to a TOML config file; falls back to the default search path.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };

    init_telemetry(&config)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        git_commit = std::env::var("GIT_COMMIT").unwrap_or_else(|_| "unknown".to_string()),
        "starting gateway control-plane daemon"
    );

    let organization_id = OrganizationId::from_str(&config.tenant.organization_id)
        .unwrap_or_else(|_| panic!("tenant.organization_id is not a valid UUID: {}", config.tenant.organization_id));

    let store: Arc<dyn PersistentStore> = Arc::new(SqliteStore::open(&config.store.path).await?);

    let catalog = Arc::new(Catalog::new());
    catalog.reload(store.as_ref()).await?;
    tracing::info!(count = catalog.len().await, "catalog loaded from store");

    let lazyres = Arc::new(LazyResourceCache::new());
    lazyres.reload(store.as_ref()).await?;
    tracing::info!(count = lazyres.len().await, "lazy resource cache loaded from store");

    let hub = Arc::new(PollingEventHub::new(
        Arc::clone(&store),
        config.eventhub.retention_secs,
    ));
    hub.spawn(
        Duration::from_secs(config.eventhub.poll_interval_secs),
        Duration::from_secs(config.eventhub.cleanup_interval_secs),
    );

    let xds_options = XdsOptions {
        policy_engine_enabled: config.xds.policy_engine_enabled,
        policy_engine_cluster_address: if config.xds.policy_engine_enabled {
            Some("127.0.0.1".to_string())
        } else {
            None
        },
        policy_engine_cluster_port: 9000,
    };

    let snapshot_manager = Arc::new(SnapshotManager::new(
        Arc::clone(&catalog),
        Arc::clone(&lazyres),
        Arc::new(SnapshotCache::new()),
        xds_options,
    ));

    let listener = Arc::new(EventListener::new(
        Arc::clone(&store),
        Arc::clone(&catalog),
        Arc::clone(&lazyres),
        Arc::clone(&snapshot_manager) as Arc<dyn gwcp_listener::PolicyStore>,
        Arc::clone(&snapshot_manager) as Arc<dyn gwcp_listener::SnapshotTrigger>,
        Arc::clone(&hub) as Arc<dyn EventBackend>,
        organization_id,
    ));
    let listener_task = tokio::spawn({
        let listener = Arc::clone(&listener);
        async move { listener.run().await }
    });

    let metrics = Arc::new(MetricsRegistry::new());

    let deploy_handler = Arc::new(DeployHandler::new(
        Arc::clone(&store),
        Arc::clone(&hub) as Arc<dyn EventBackend>,
        organization_id,
        Arc::clone(&metrics),
    ));

    let link = Arc::new(ControlPlaneLink::new(
        PlLinkConfig {
            ws_url: config.link.ws_url.clone(),
            api_key: config.link.api_key.clone(),
            artifact_base_url: config.link.artifact_base_url.clone(),
            handshake_timeout: Duration::from_secs(config.link.handshake_timeout_secs),
            ack_timeout: Duration::from_secs(config.link.ack_timeout_secs),
            heartbeat_grace: Duration::from_secs(config.link.heartbeat_grace_secs),
            backoff: BackoffPolicy::new(
                Duration::from_secs_f64(config.link.backoff_initial_secs),
                Duration::from_secs_f64(config.link.backoff_max_secs),
            ),
            tls_verify: config.link.tls_verify,
        },
        deploy_handler,
    ));
    let link_task = tokio::spawn({
        let link = Arc::clone(&link);
        async move { link.run().await }
    });

    let ads_server = AdsServer::new(snapshot_manager.cache());
    let xds_addr: std::net::SocketAddr = config.xds.listen_address.parse()?;
    let ads_task = tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(
                envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer::new(
                    ads_server,
                ),
            )
            .serve(xds_addr)
            .await
    });

    let metrics_task = tokio::spawn({
        let metrics = Arc::clone(&metrics);
        async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                tracing::info!(component = "daemon", metrics = ?metrics.snapshot(), "metrics snapshot");
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received, stopping daemon");

    listener.shutdown();
    link.stop();
    hub.shutdown();
    ads_task.abort();
    metrics_task.abort();

    let _ = listener_task.await;
    let _ = link_task.await;

    Ok(())
}

fn init_telemetry(config: &Config) -> anyhow::Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.logging.level.clone()));

    if config.telemetry.enabled {
        let tracer_provider = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(
                opentelemetry_otlp::new_exporter()
                    .tonic()
                    .with_endpoint(&config.telemetry.otlp_endpoint),
            )
            .with_trace_config(opentelemetry_sdk::trace::Config::default().with_resource(
                opentelemetry_sdk::Resource::new(vec![opentelemetry::KeyValue::new(
                    "service.name",
                    config.telemetry.service_name.clone(),
                )]),
            ))
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;

        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .with(tracing_opentelemetry::layer().with_tracer(tracer_provider.tracer(config.telemetry.service_name.clone())))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    Ok(())
}
