// =============================================================================
// Pipeline error taxonomy
// =============================================================================
//
//   FeedError::Connection   transport failure; retried with backoff.
//   FeedError::Protocol     malformed or unexpected frame; frame skipped.
//   PublishError            bus refused a message; one retry, then fatal
//                           for the trade producer.
//
// Configuration errors live in `config.rs` and are fatal at startup.
// =============================================================================

/// Errors surfaced by a [`crate::feed::TradeSource`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl FeedError {
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// A message could not be handed to the bus.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("publish to topic '{topic}' (key '{key}') failed: {reason}")]
pub struct PublishError {
    pub topic: String,
    pub key: String,
    pub reason: String,
}
