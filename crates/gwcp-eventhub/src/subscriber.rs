use tokio::sync::mpsc;
use uuid::Uuid;

use crate::EventBatch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub(crate) fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

/// A live subscription handed back from `subscribe`. Dropping it does not
/// by itself deregister the subscriber from the hub — callers must still
/// call `unsubscribe` so the hub's registry (and its bridging task) is
/// torn down immediately rather than waiting for a future failed send.
pub struct Subscription {
    pub id: SubscriberId,
    pub receiver: mpsc::Receiver<EventBatch>,
}

/// Internal per-subscriber registration: the hub delivers into `sender`;
/// `cancel` terminates the bridging task started in `subscribe` so that
/// `unsubscribe` stops delivery immediately instead of leaking a task
/// that only exits when the whole hub shuts down.
pub(crate) struct Registration {
    pub sender: mpsc::Sender<EventBatch>,
    pub cancel: tokio_util::sync::CancellationToken,
}
