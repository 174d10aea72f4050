use async_trait::async_trait;

use tandem_types::events::{GatewayEvent, Topic};

/// Delivers events to every process holding a subscriber for the topic.
///
/// Emission is fire-and-forget from the caller's point of view: delivery
/// failures are logged by the implementation and never fail the operation
/// that produced the event.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn emit(&self, topic: Topic, event: GatewayEvent);
}
