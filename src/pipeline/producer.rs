// =============================================================================
// Trade Producer — feed → trade topic
// =============================================================================
//
// Synchronous pull-publish: one batch is read from the source and every
// trade in it is published (keyed by pair) before the next read.  A trade
// that was read is therefore never lost or replayed across a reconnect.
//
// A failed publish is retried once; a second failure stops the producer
// rather than skipping past an unpublished trade.
// =============================================================================

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bus::BusProducer;
use crate::error::{FeedError, PublishError};
use crate::feed::{ReconnectBackoff, TradeSource};
use crate::types::{Trade, TradeMessage};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(250);

pub struct TradeProducer<S, P> {
    source: S,
    bus: P,
    topic: String,
    pair: String,
    backoff: ReconnectBackoff,
    retry_delay: Duration,
    published: u64,
}

impl<S: TradeSource, P: BusProducer> TradeProducer<S, P> {
    pub fn new(source: S, bus: P, topic: impl Into<String>, pair: impl Into<String>) -> Self {
        Self {
            source,
            bus,
            topic: topic.into(),
            pair: pair.into(),
            backoff: ReconnectBackoff::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
            published: 0,
        }
    }

    #[cfg(test)]
    pub fn with_backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    #[cfg(test)]
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Trades successfully handed to the bus.
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Run until cancelled.  Only a publish failure that survives its retry
    /// is returned as an error.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), PublishError> {
        info!(topic = %self.topic, pair = %self.pair, "trade producer starting");

        if self.establish(&cancel).await {
            loop {
                let batch = tokio::select! {
                    _ = cancel.cancelled() => break,
                    batch = self.source.next_trades() => batch,
                };

                match batch {
                    Ok(trades) => {
                        for trade in &trades {
                            self.publish(trade).await?;
                        }
                    }
                    Err(e) if e.is_connection() => {
                        warn!(error = %e, state = %self.source.state(), "trade feed lost — reconnecting");
                        if !self.establish(&cancel).await {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "skipping malformed frame");
                    }
                }
            }
        }

        info!(published = self.published, "trade producer stopped");
        Ok(())
    }

    /// Connect and subscribe, backing off between failures.  Returns `false`
    /// if cancelled first.
    async fn establish(&mut self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }

            match self.connect_and_subscribe().await {
                Ok(()) => {
                    if self.backoff.attempts() > 0 {
                        info!(attempts = self.backoff.attempts(), "trade feed recovered");
                    }
                    self.backoff.reset();
                    return true;
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!(
                        error = %e,
                        attempt = self.backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "trade feed connect failed — retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return false,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn connect_and_subscribe(&mut self) -> Result<(), FeedError> {
        self.source.connect().await?;
        self.source.subscribe(&self.pair).await
    }

    async fn publish(&mut self, trade: &Trade) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(&TradeMessage::from(trade)).map_err(|e| PublishError {
            topic: self.topic.clone(),
            key: trade.pair.clone(),
            reason: format!("failed to encode trade: {e}"),
        })?;

        if let Err(first) = self.bus.publish(&self.topic, &trade.pair, payload.clone()).await {
            warn!(error = %first, "publish failed — retrying once");
            tokio::time::sleep(self.retry_delay).await;
            if let Err(second) = self.bus.publish(&self.topic, &trade.pair, payload).await {
                error!(error = %second, published = self.published, "publish retry failed — halting producer");
                return Err(second);
            }
        }

        self.published += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
