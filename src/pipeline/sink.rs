// =============================================================================
// Candle Sink — completed candles → candle topic (at-most-once)
// =============================================================================
//
// A candle that cannot be published within `publish_timeout` is logged and
// dropped; the aggregator is never held up by the output topic.
// =============================================================================

use std::time::Duration;

use tracing::{info, warn};

use crate::bus::BusProducer;
use crate::types::{Candle, CandleMessage};

const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub published: u64,
    pub dropped: u64,
}

pub struct CandleSink<P> {
    bus: P,
    topic: String,
    publish_timeout: Duration,
    stats: SinkStats,
}

impl<P: BusProducer> CandleSink<P> {
    pub fn new(bus: P, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
            stats: SinkStats::default(),
        }
    }

    #[cfg(test)]
    pub fn with_publish_timeout(mut self, publish_timeout: Duration) -> Self {
        self.publish_timeout = publish_timeout;
        self
    }

    pub fn stats(&self) -> SinkStats {
        self.stats
    }

    pub async fn emit(&mut self, candle: &Candle) {
        info!(
            pair = %candle.pair,
            window_start = candle.window_start,
            window_end = candle.window_end,
            open = %candle.open,
            high = %candle.high,
            low = %candle.low,
            close = %candle.close,
            volume = %candle.volume,
            trades = candle.trade_count,
            "candle closed"
        );

        let payload = match serde_json::to_vec(&CandleMessage::from(candle)) {
            Ok(payload) => payload,
            Err(e) => {
                self.drop_candle(candle, &format!("failed to encode candle: {e}"));
                return;
            }
        };

        let publish = self.bus.publish(&self.topic, &candle.pair, payload);
        let outcome = tokio::time::timeout(self.publish_timeout, publish).await;
        match outcome {
            Ok(Ok(())) => self.stats.published += 1,
            Ok(Err(e)) => self.drop_candle(candle, &e.to_string()),
            Err(_) => self.drop_candle(candle, "publish timed out"),
        }
    }

    pub async fn emit_all(&mut self, candles: Vec<Candle>) {
        for candle in &candles {
            self.emit(candle).await;
        }
    }

    fn drop_candle(&mut self, candle: &Candle, reason: &str) {
        self.stats.dropped += 1;
        warn!(
            topic = %self.topic,
            candle = %candle,
            reason = %reason,
            dropped = self.stats.dropped,
            "candle dropped"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BusConsumer, MemoryBus};
    use rust_decimal::Decimal;

    fn candle(pair: &str, start: i64) -> Candle {
        Candle {
            pair: pair.into(),
            window_start: start,
            window_end: start + 60_000,
            open: Decimal::from(10),
            high: Decimal::from(12),
            low: Decimal::from(9),
            close: Decimal::from(11),
            volume: Decimal::from(3),
            trade_count: 3,
        }
    }

    #[tokio::test]
    async fn publishes_keyed_candle_message() {
        let bus = MemoryBus::new(8);
        let mut consumer = bus.subscribe("ohlc").unwrap();
        let mut sink = CandleSink::new(bus.clone(), "ohlc");

        sink.emit(&candle("BTC/USD", 60_000)).await;

        let msg = consumer.recv().await.unwrap();
        assert_eq!(msg.key, "BTC/USD");
        let value: CandleMessage = serde_json::from_slice(&msg.payload).unwrap();
        assert_eq!(value.product_id, "BTC/USD");
        assert_eq!(value.timestamp, 120_000);
        assert_eq!(value.close, Decimal::from(11));
        assert_eq!(sink.stats(), SinkStats { published: 1, dropped: 0 });
    }

    #[tokio::test]
    async fn unavailable_topic_drops_instead_of_failing() {
        let bus = MemoryBus::new(8);
        drop(bus.subscribe("ohlc").unwrap());
        let mut sink = CandleSink::new(bus.clone(), "ohlc");

        sink.emit_all(vec![candle("BTC/USD", 0), candle("BTC/USD", 60_000)]).await;
        assert_eq!(sink.stats(), SinkStats { published: 0, dropped: 2 });
    }

    #[tokio::test]
    async fn full_topic_times_out_and_drops() {
        let bus = MemoryBus::new(1);
        let _consumer = bus.subscribe("ohlc").unwrap();
        let mut sink = CandleSink::new(bus.clone(), "ohlc").with_publish_timeout(Duration::from_millis(20));

        sink.emit(&candle("BTC/USD", 0)).await;
        sink.emit(&candle("BTC/USD", 60_000)).await;
        assert_eq!(sink.stats(), SinkStats { published: 1, dropped: 1 });
    }
}
