pub mod ohlc;
pub mod producer;
pub mod sink;

pub use ohlc::OhlcService;
pub use producer::TradeProducer;
pub use sink::CandleSink;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::aggregator::WindowAggregator;
use crate::bus::{BusConsumer, BusProducer};
use crate::config::Config;
use crate::feed::KrakenTradeSource;

/// Kraken feed → trade topic, until cancelled or a publish fails for good.
pub async fn run_producer_service<P: BusProducer>(
    config: &Config,
    bus: P,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let source = KrakenTradeSource::new(config.feed_url.clone(), config.stale_timeout);
    let mut producer = TradeProducer::new(
        source,
        bus,
        config.input_topic.clone(),
        config.product_id.clone(),
    );
    let outcome = producer.run(cancel).await;
    info!(published = producer.published(), "trade producer service exited");
    outcome.context("trade producer halted")
}

/// Trade topic → candles on the output topic, draining on cancellation.
pub async fn run_ohlc_service<C: BusConsumer, P: BusProducer>(
    config: &Config,
    consumer: C,
    bus: P,
    cancel: CancellationToken,
) {
    let aggregator = WindowAggregator::new(config.window, config.idle_flush);
    let sink = CandleSink::new(bus, config.output_topic.clone());
    OhlcService::new(consumer, aggregator, sink).run(cancel).await;
}
