use serde_json::Value;
use tokio::sync::mpsc;

use saga_types::events::ChangeEvent;
use saga_types::subscription::SubscriptionDescriptor;

/// Connection status transitions reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError(String),
    TimedOut,
    Closed,
}

/// Everything a transport channel can deliver, in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Status(ChannelStatus),
    Change(ChangeEvent),
    Broadcast { event: String, payload: Value },
}

/// Live subscription on the transport side.
pub trait TransportHandle: Send + Sync {
    /// Fire-and-forget; delivered to every other subscriber of the channel.
    fn broadcast(&self, event: &str, payload: Value);

    /// Must tolerate being called more than once.
    fn unsubscribe(&self);
}

pub struct TransportChannel {
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
    pub handle: Box<dyn TransportHandle>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// The hosted pub/sub service. Delivery is at-least-once and may be reordered.
pub trait Transport: Send + Sync + 'static {
    fn open(&self, name: &str, descriptor: &SubscriptionDescriptor) -> Result<TransportChannel, TransportError>;
}
