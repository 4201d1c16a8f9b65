//! The ADS (Aggregated Discovery Service) gRPC endpoint: one
//! bidirectional stream multiplexing every type-URL a client subscribes
//! to, per §4.G/§6. Node id `"policy-node"` is the fixed identity the
//! policy engine dials in with; Envoy proxies use their own configured
//! node id. Each `(type_url, node_id)` pair is its own selection key in
//! `SnapshotCache` — they all resolve to the same content today since
//! the translator doesn't vary its output by node, but the cache keys
//! and routes by node id regardless, per §3's snapshot-selection model.

use std::pin::Pin;

use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryService;
use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use crate::cache::SnapshotCache;
use std::sync::Arc;

const STREAM_BUFFER: usize = 16;

pub struct AdsServer {
    cache: Arc<SnapshotCache>,
}

impl AdsServer {
    pub fn new(cache: Arc<SnapshotCache>) -> Self {
        Self { cache }
    }

    async fn serve_type_url(
        cache: Arc<SnapshotCache>,
        type_url: String,
        node_id: String,
        tx: mpsc::Sender<Result<DiscoveryResponse, Status>>,
    ) {
        let mut watch = cache.watch(&type_url, &node_id).await;
        loop {
            let Some((version, resources)) = cache.get(&type_url, &node_id).await else {
                if watch.changed().await.is_err() {
                    return;
                }
                continue;
            };

            let response = DiscoveryResponse {
                version_info: version.to_string(),
                resources: resources.iter().map(|r| r.resource.clone()).collect(),
                type_url: type_url.clone(),
                nonce: version.to_string(),
                ..Default::default()
            };

            if tx.send(Ok(response)).await.is_err() {
                return;
            }

            if watch.changed().await.is_err() {
                return;
            }
        }
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for AdsServer {
    type StreamAggregatedResourcesStream =
        Pin<Box<dyn Stream<Item = Result<DiscoveryResponse, Status>> + Send + 'static>>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        let mut incoming = request.into_inner();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let cache = Arc::clone(&self.cache);

        tokio::spawn(async move {
            let mut active_type_urls = std::collections::HashSet::new();

            loop {
                match incoming.message().await {
                    Ok(Some(req)) => {
                        let node_id = req.node.as_ref().map(|n| n.id.clone()).unwrap_or_default();
                        if req.error_detail.is_some() {
                            warn!(component = "ads", node_id, type_url = %req.type_url, "client nack'd a discovery response");
                        }

                        if active_type_urls.insert(req.type_url.clone()) {
                            info!(component = "ads", node_id, type_url = %req.type_url, "new watch on type-url");
                            let cache = Arc::clone(&cache);
                            let tx = tx.clone();
                            let type_url = req.type_url.clone();
                            tokio::spawn(AdsServer::serve_type_url(cache, type_url, node_id.clone(), tx));
                        }
                    }
                    Ok(None) => return,
                    Err(err) => {
                        warn!(component = "ads", error = %err, "discovery request stream error");
                        return;
                    }
                }
            }
        });

        let stream = ReceiverStream::new(rx);
        Ok(Response::new(Box::pin(stream)))
    }

    type DeltaAggregatedResourcesStream =
        Pin<Box<dyn Stream<Item = Result<envoy_types::pb::envoy::service::discovery::v3::DeltaDiscoveryResponse, Status>> + Send + 'static>>;

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<envoy_types::pb::envoy::service::discovery::v3::DeltaDiscoveryRequest>>,
    ) -> Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(Status::unimplemented("incremental xDS is not offered; use state-of-the-world ADS"))
    }
}
