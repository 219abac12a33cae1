// =============================================================================
// In-process bus — bounded tokio channels, one per topic
// =============================================================================
//
// Each topic is a single bounded mpsc channel, so delivery is totally ordered
// per topic (and therefore per key).  A full channel suspends the publisher,
// which is the backpressure between the two services.  A topic has at most
// one consumer; once that consumer is dropped, publishing to the topic fails.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{BusConsumer, BusMessage, BusProducer};
use crate::error::PublishError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BusError {
    #[error("topic '{0}' already has a consumer")]
    AlreadySubscribed(String),
}

struct Topic {
    tx: mpsc::Sender<BusMessage>,
    rx: Option<mpsc::Receiver<BusMessage>>,
    /// Held while an offset is assigned and its message enqueued.
    next_offset: Arc<Mutex<u64>>,
}

/// Cheap to clone; all clones share the same topics.
#[derive(Clone)]
pub struct MemoryBus {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
    capacity: usize,
}

impl MemoryBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    /// Attach the single consumer of `topic`, creating the topic if needed.
    pub fn subscribe(&self, topic: &str) -> Result<MemoryConsumer, BusError> {
        let mut topics = self.topics.lock();
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| Self::new_topic(self.capacity));

        let rx = entry
            .rx
            .take()
            .ok_or_else(|| BusError::AlreadySubscribed(topic.to_string()))?;

        info!(topic = %topic, "consumer attached");
        Ok(MemoryConsumer {
            topic: topic.to_string(),
            rx,
        })
    }

    fn sender(&self, topic: &str) -> (mpsc::Sender<BusMessage>, Arc<Mutex<u64>>) {
        let mut topics = self.topics.lock();
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| Self::new_topic(self.capacity));
        (entry.tx.clone(), entry.next_offset.clone())
    }

    fn new_topic(capacity: usize) -> Topic {
        let (tx, rx) = mpsc::channel(capacity);
        Topic {
            tx,
            rx: Some(rx),
            next_offset: Arc::new(Mutex::new(0)),
        }
    }
}

#[async_trait]
impl BusProducer for MemoryBus {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        // Lock is released before awaiting on the channel.
        let (tx, next_offset) = self.sender(topic);

        // Capacity first; an offset is only taken once the send cannot fail.
        let permit = tx.reserve().await.map_err(|_| PublishError {
            topic: topic.to_string(),
            key: key.to_string(),
            reason: "topic consumer is gone".into(),
        })?;

        let offset = {
            let mut next = next_offset.lock();
            let offset = *next;
            *next += 1;
            permit.send(BusMessage {
                topic: topic.to_string(),
                key: key.to_string(),
                payload,
                offset,
            });
            offset
        };

        debug!(topic = %topic, key = %key, offset, "message published");
        Ok(())
    }
}

/// The receiving end of one topic.
pub struct MemoryConsumer {
    topic: String,
    rx: mpsc::Receiver<BusMessage>,
}

impl MemoryConsumer {
    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl BusConsumer for MemoryConsumer {
    async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    fn try_recv(&mut self) -> Option<BusMessage> {
        self.rx.try_recv().ok()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
