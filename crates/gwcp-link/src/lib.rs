//! # gwcp-link
//!
//! The control-plane link: a long-lived, authenticated websocket to the
//! management plane with reconnect/backoff, heartbeat liveness, and
//! artifact-fetch-triggered config ingestion.

pub mod artifact;
pub mod backoff;
pub mod frame;
pub mod link;
pub mod state_machine;

pub use artifact::{ArtifactClient, ArtifactError};
pub use backoff::BackoffPolicy;
pub use frame::{ApiDeployed, ApiDeployedPayload, ConnectionAck, Frame};
pub use link::{ControlPlaneLink, LinkConfig, LinkHandler};
pub use state_machine::{LinkState, LinkStateMachine, TransitionEvent};
