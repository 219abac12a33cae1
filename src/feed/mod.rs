pub mod backoff;
pub mod frame;
pub mod kraken;

use async_trait::async_trait;

use crate::error::FeedError;
use crate::types::Trade;

pub use backoff::ReconnectBackoff;
pub use kraken::KrakenTradeSource;

/// Connection lifecycle of a trade source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connecting,
    Subscribing,
    Streaming,
}

impl std::fmt::Display for FeedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Streaming => write!(f, "Streaming"),
        }
    }
}

/// A streaming source of normalized trades.
///
/// Any `FeedError::Connection` leaves the source `Disconnected`; the caller
/// must run `connect` and `subscribe` again before reading.
#[async_trait]
pub trait TradeSource: Send {
    fn state(&self) -> FeedState;

    async fn connect(&mut self) -> Result<(), FeedError>;

    async fn subscribe(&mut self, pair: &str) -> Result<(), FeedError>;

    /// Wait for one frame.  Heartbeats and frames without trade data yield
    /// an empty batch.
    async fn next_trades(&mut self) -> Result<Vec<Trade>, FeedError>;
}
