// =============================================================================
// Message Bus — producer/consumer seam between the two services
// =============================================================================
//
// The trade producer and the OHLC aggregator never talk directly; they only
// share topics.  Any bus that gives ordered, at-least-once delivery per key
// can sit behind these traits.  `MemoryBus` is the in-process implementation.
// =============================================================================

pub mod memory;

use async_trait::async_trait;

use crate::error::PublishError;

pub use memory::{MemoryBus, MemoryConsumer};

/// One record read from a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    /// Position within the topic, starting at 0.
    pub offset: u64,
}

#[async_trait]
pub trait BusProducer: Send + Sync {
    /// Hand one keyed message to the bus.  Messages published with the same
    /// key are delivered in publish order.
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

#[async_trait]
pub trait BusConsumer: Send {
    /// Wait for the next message.  `None` means the topic is closed.
    async fn recv(&mut self) -> Option<BusMessage>;

    /// Next message only if one is already queued.
    fn try_recv(&mut self) -> Option<BusMessage>;
}
