use async_trait::async_trait;

use crate::events::Event;

/// Consumes lifecycle events from the manager's broadcast stream.
///
/// Handlers run outside the wait loop; they may perform I/O but should not
/// assume any ordering guarantee stronger than per-publisher FIFO.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn handle(&self, event: &Event);
}
