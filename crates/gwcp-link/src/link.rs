use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::artifact::ArtifactClient;
use crate::backoff::BackoffPolicy;
use crate::frame::{ApiDeployedPayload, Frame};
use crate::state_machine::{LinkState, LinkStateMachine, TransitionEvent};

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub ws_url: String,
    pub api_key: String,
    pub artifact_base_url: String,
    pub handshake_timeout: Duration,
    pub ack_timeout: Duration,
    pub heartbeat_grace: Duration,
    pub backoff: BackoffPolicy,
    pub tls_verify: bool,
}

/// The config-pipeline entry point invoked for deploy/undeploy events.
/// `gwcp-listener`/`gwcp-daemon` implement this to wire the link into
/// parse → validate → store → xDS rebuild.
#[async_trait]
pub trait LinkHandler: Send + Sync {
    async fn on_api_deployed(
        &self,
        payload: ApiDeployedPayload,
        yaml: String,
        correlation_id: Option<String>,
    );
    async fn on_api_undeployed(&self, payload: ApiDeployedPayload, correlation_id: Option<String>);
}

/// A single long-lived websocket connection to the management plane.
/// `Stop` is guarded by an atomic once-token so calling it twice (or
/// concurrently with the run loop's own shutdown) never double-closes
/// anything.
pub struct ControlPlaneLink {
    config: LinkConfig,
    state: Arc<RwLock<LinkStateMachine>>,
    last_heartbeat_unix_ms: Arc<AtomicI64>,
    stopped: Arc<AtomicBool>,
    artifact_client: ArtifactClient,
    handler: Arc<dyn LinkHandler>,
}

impl ControlPlaneLink {
    pub fn new(config: LinkConfig, handler: Arc<dyn LinkHandler>) -> Self {
        let artifact_client = ArtifactClient::new(
            config.artifact_base_url.clone(),
            config.api_key.clone(),
            config.tls_verify,
        );

        Self {
            config,
            state: Arc::new(RwLock::new(LinkStateMachine::new())),
            last_heartbeat_unix_ms: Arc::new(AtomicI64::new(Utc::now().timestamp_millis())),
            stopped: Arc::new(AtomicBool::new(false)),
            artifact_client,
            handler,
        }
    }

    pub async fn state(&self) -> LinkState {
        self.state.read().await.state()
    }

    /// Runs the connect/heartbeat/reconnect loop until `stop()` is
    /// called. Intended to be spawned as its own task.
    pub async fn run(&self) {
        self.state
            .write()
            .await
            .transition(TransitionEvent::Start)
            .expect("Disconnected -> Connecting is always valid");

        let mut retries: u32 = 0;

        while !self.stopped.load(Ordering::SeqCst) {
            match self.connect_and_serve().await {
                Ok(()) => {
                    // Clean shutdown requested mid-session.
                    break;
                }
                Err(reason) => {
                    warn!(
                        component = "link",
                        phase = "reconnect",
                        reason = %reason,
                        retries,
                        "connection ended, backing off before retry"
                    );
                    let event = if self.state().await == LinkState::Connecting {
                        TransitionEvent::DialFail
                    } else {
                        TransitionEvent::ReadError
                    };
                    let _ = self.state.write().await.transition(event);

                    if self.stopped.load(Ordering::SeqCst) {
                        break;
                    }

                    let delay = self.config.backoff.delay(retries);
                    tokio::time::sleep(delay).await;
                    retries = retries.saturating_add(1);

                    let _ = self.state.write().await.transition(TransitionEvent::Start);
                }
            }
        }

        let _ = self.state.write().await.transition(TransitionEvent::Stop);
    }

    /// Idempotent: a second call observes `stopped` already set and
    /// returns immediately rather than double-closing anything.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    async fn connect_and_serve(&self) -> Result<(), String> {
        let request = Request::builder()
            .uri(&self.config.ws_url)
            .header("api-key", &self.config.api_key)
            .body(())
            .map_err(|e| format!("request build failed: {e}"))?;

        let dial = tokio::time::timeout(
            self.config.handshake_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| "handshake timed out".to_string())?
        .map_err(|e| format!("dial failed: {e}"))?;

        let (mut write, mut read) = dial.0.split();

        let ack_frame = tokio::time::timeout(self.config.ack_timeout, read.next())
            .await
            .map_err(|_| "ack wait timed out".to_string())?
            .ok_or_else(|| "connection closed before ack".to_string())?
            .map_err(|e| format!("read error waiting for ack: {e}"))?;

        let Message::Text(ack_text) = ack_frame else {
            return Err("first frame was not text".to_string());
        };

        match Frame::parse(&ack_text) {
            Ok(Frame::ConnectionAck(ack)) => {
                info!(
                    component = "link",
                    phase = "handshake",
                    gateway_id = %ack.gateway_id,
                    connection_id = %ack.connection_id,
                    "connection acknowledged"
                );
            }
            _ => return Err("missing or malformed connection.ack".to_string()),
        }

        self.state
            .write()
            .await
            .transition(TransitionEvent::DialOk)
            .map_err(|e| e.to_string())?;
        self.last_heartbeat_unix_ms
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);

        let monitor_heartbeat = Arc::clone(&self.last_heartbeat_unix_ms);
        let monitor_stopped = Arc::clone(&self.stopped);
        let grace = self.config.heartbeat_grace;
        let heartbeat_expired = Arc::new(AtomicBool::new(false));
        let monitor_expired = Arc::clone(&heartbeat_expired);

        let monitor = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                if monitor_stopped.load(Ordering::SeqCst) {
                    return;
                }
                let last = monitor_heartbeat.load(Ordering::SeqCst);
                let age_ms = Utc::now().timestamp_millis() - last;
                if age_ms > grace.as_millis() as i64 {
                    monitor_expired.store(true, Ordering::SeqCst);
                    return;
                }
            }
        });

        let result = loop {
            if self.stopped.load(Ordering::SeqCst) {
                break Ok(());
            }
            if heartbeat_expired.load(Ordering::SeqCst) {
                break Err("heartbeat timeout".to_string());
            }

            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(Message::Ping(payload))) => {
                            self.last_heartbeat_unix_ms
                                .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
                            if write.send(Message::Pong(payload)).await.is_err() {
                                break Err("failed to send pong".to_string());
                            }
                        }
                        Some(Ok(Message::Text(text))) => {
                            self.dispatch(&text).await;
                        }
                        Some(Ok(Message::Close(_))) => break Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Err(format!("read error: {e}")),
                        None => break Err("connection closed".to_string()),
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        };

        monitor.abort();

        if result.is_ok() {
            let _ = write
                .send(Message::Close(Some(
                    tokio_tungstenite::tungstenite::protocol::CloseFrame {
                        code: tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal,
                        reason: "Gateway shutting down".into(),
                    },
                )))
                .await;
        }

        result
    }

    async fn dispatch(&self, text: &str) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(component = "link", phase = "dispatch", error = %e, "malformed frame ignored");
                return;
            }
        };

        match frame {
            Frame::ConnectionAck(_) => {
                // Only expected as the first frame; a later one is odd but harmless.
            }
            Frame::ApiDeployed(event) => {
                let correlation_id = event.correlation_id.clone();
                match self.artifact_client.fetch_yaml(&event.payload.api_id).await {
                    Ok(yaml) => {
                        self.handler
                            .on_api_deployed(event.payload, yaml, correlation_id)
                            .await;
                    }
                    Err(e) => {
                        error!(
                            component = "link",
                            phase = "artifact_fetch",
                            api_id = %event.payload.api_id,
                            error = %e,
                            "failed to fetch deployed API artifact"
                        );
                    }
                }
            }
            Frame::ApiUndeployed(event) => {
                self.handler
                    .on_api_undeployed(event.payload, event.correlation_id)
                    .await;
            }
            Frame::Unknown { raw_type, .. } => {
                info!(component = "link", phase = "dispatch", frame_type = %raw_type, "ignoring unknown frame type");
            }
        }
    }
}
