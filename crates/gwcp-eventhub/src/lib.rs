//! # gwcp-eventhub
//!
//! Tenant-scoped, durable, at-least-once pub/sub. A background poller
//! ticks on an interval, diffs each organization's `version_id` against
//! what it last observed, and fans out the newly-appended events to that
//! organization's in-process subscribers.
//!
//! The poller/registry pair here is one implementation of [`EventBackend`];
//! a message-broker backend could replace it without changing callers.

mod hub;
mod subscriber;

pub use hub::PollingEventHub;
pub use subscriber::{SubscriberId, Subscription};

use async_trait::async_trait;
use gwcp_core::types::{Event, OrganizationId};
use gwcp_core::Result;

/// The fan-out contract. `Subscribe` registers a new subscription and
/// returns a channel the caller reads batches from; `Unsubscribe` is
/// idempotent and must stop delivery immediately, not merely mark the
/// subscriber for later cleanup.
#[async_trait]
pub trait EventBackend: Send + Sync {
    async fn subscribe(&self, org: OrganizationId, capacity: usize) -> Subscription;
    async fn unsubscribe(&self, org: OrganizationId, id: SubscriberId);
    async fn publish(&self, org: OrganizationId, event: gwcp_store::NewEvent) -> Result<()>;
}

pub(crate) type EventBatch = Vec<Event>;
