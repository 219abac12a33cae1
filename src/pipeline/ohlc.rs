// =============================================================================
// OHLC Service — trade topic → window aggregator → candle sink
// =============================================================================
//
// Single task, one message at a time.  Besides the bus read, the loop wakes
// on a ticker to force-flush windows that have been quiet past their end.
// On cancellation every open window is drained through the sink.
// =============================================================================

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::sink::{CandleSink, SinkStats};
use crate::aggregator::{AggregatorStats, WindowAggregator};
use crate::bus::{BusConsumer, BusMessage, BusProducer};
use crate::types::{Trade, TradeMessage};

const DEFAULT_TICK: Duration = Duration::from_secs(1);

pub struct OhlcService<C, P> {
    consumer: C,
    aggregator: WindowAggregator,
    sink: CandleSink<P>,
    tick: Duration,
    clock: fn() -> DateTime<Utc>,
    malformed: u64,
}

impl<C: BusConsumer, P: BusProducer> OhlcService<C, P> {
    pub fn new(consumer: C, aggregator: WindowAggregator, sink: CandleSink<P>) -> Self {
        Self {
            consumer,
            aggregator,
            sink,
            tick: DEFAULT_TICK,
            clock: Utc::now,
            malformed: 0,
        }
    }

    /// How often idle windows are checked.
    #[cfg(test)]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Wall clock used for idle flushing.
    #[cfg(test)]
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    /// Run until cancelled or the input topic closes, then drain.
    pub async fn run(mut self, cancel: CancellationToken) -> (AggregatorStats, SinkStats) {
        info!(window_ms = self.aggregator.window_ms(), "ohlc service starting");

        let mut ticker = tokio::time::interval(self.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let expired = self.aggregator.flush_expired((self.clock)());
                    self.sink.emit_all(expired).await;
                }
                message = self.consumer.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => {
                        warn!("trade topic closed");
                        break;
                    }
                },
            }
        }

        // Trades already on the topic still count.
        let mut backlog = 0u64;
        while let Some(message) = self.consumer.try_recv() {
            backlog += 1;
            self.handle(message).await;
        }
        if backlog > 0 {
            info!(messages = backlog, "trade backlog consumed before drain");
        }

        info!(open_windows = self.aggregator.open_windows(), "draining open windows");
        let remaining = self.aggregator.drain();
        self.sink.emit_all(remaining).await;

        let stats = (self.aggregator.stats(), self.sink.stats());
        info!(
            trades_applied = stats.0.trades_applied,
            late_dropped = stats.0.late_dropped,
            candles_emitted = stats.0.candles_emitted,
            candles_published = stats.1.published,
            candles_dropped = stats.1.dropped,
            malformed = self.malformed,
            "ohlc service stopped"
        );
        stats
    }

    async fn handle(&mut self, message: BusMessage) {
        let trade: Trade = match serde_json::from_slice::<TradeMessage>(&message.payload) {
            Ok(value) => value.into(),
            Err(e) => {
                self.malformed += 1;
                warn!(
                    topic = %message.topic,
                    offset = message.offset,
                    error = %e,
                    "skipping malformed trade message"
                );
                return;
            }
        };

        if trade.pair != message.key {
            warn!(
                key = %message.key,
                product_id = %trade.pair,
                offset = message.offset,
                "message key does not match product_id"
            );
        }

        let closed = self.aggregator.on_trade(&trade);
        self.sink.emit_all(closed).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
