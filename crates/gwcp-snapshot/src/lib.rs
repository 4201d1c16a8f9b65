//! Versioned per-type-URL resource cache and the ADS gRPC server that
//! streams it to Envoy and the policy engine, per §4.G.

pub mod ads;
pub mod cache;
pub mod custom;
pub mod manager;

pub use ads::AdsServer;
pub use cache::SnapshotCache;
pub use custom::{LAZY_RESOURCES_TYPE_URL, POLICY_STATE_TYPE_URL};
pub use manager::SnapshotManager;
