// =============================================================================
// Trade OHLC — Main Entry Point
// =============================================================================
//
// Two services share one bus: the trade producer streams Kraken trades onto
// the input topic, and the OHLC service folds them into tumbling-window
// candles published on the output topic.  Ctrl+C drains open windows before
// exit.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod aggregator;
mod bus;
mod config;
mod error;
mod feed;
mod pipeline;
mod types;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::bus::{BusConsumer, MemoryBus, MemoryConsumer};
use crate::config::Config;
use crate::types::CandleMessage;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Trade OHLC — Starting Up                         ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = Config::from_env().context("invalid configuration")?;

    // ── 2. Bus & topics ──────────────────────────────────────────────────
    let bus = MemoryBus::new(config.channel_capacity);
    info!(
        broker = %config.broker_address,
        capacity = config.channel_capacity,
        "bus ready (in-process)"
    );

    let trades = bus
        .subscribe(&config.input_topic)
        .context("failed to subscribe to the trade topic")?;
    let candles = bus
        .subscribe(&config.output_topic)
        .context("failed to subscribe to the candle topic")?;

    // The producer stops first so everything it published is aggregated.
    let producer_cancel = CancellationToken::new();
    let ohlc_cancel = CancellationToken::new();

    // ── 3. Candle topic reader ───────────────────────────────────────────
    let reader = tokio::spawn(log_candles(candles));

    // ── 4. OHLC service ──────────────────────────────────────────────────
    let ohlc_config = config.clone();
    let ohlc_bus = bus.clone();
    let ohlc_token = ohlc_cancel.clone();
    let ohlc = tokio::spawn(async move {
        pipeline::run_ohlc_service(&ohlc_config, trades, ohlc_bus, ohlc_token).await;
    });

    // ── 5. Trade producer ────────────────────────────────────────────────
    let producer_config = config.clone();
    let producer_bus = bus.clone();
    let producer_token = producer_cancel.clone();
    let mut producer = tokio::spawn(async move {
        pipeline::run_producer_service(&producer_config, producer_bus, producer_token).await
    });

    info!(
        pair = %config.product_id,
        window_secs = config.window.as_secs(),
        "All subsystems running. Press Ctrl+C to stop."
    );

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    let finished_early = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "failed to listen for Ctrl+C");
            }
            warn!("Shutdown signal received — stopping gracefully");
            None
        }
        outcome = &mut producer => Some(outcome),
    };
    producer_cancel.cancel();

    let producer_outcome = match finished_early {
        Some(outcome) => outcome,
        None => producer.await,
    };

    ohlc_cancel.cancel();
    if let Err(e) = ohlc.await {
        error!(error = %e, "ohlc service task failed");
    }

    // The candle reader ends once every bus handle is gone.
    drop(bus);
    if let Err(e) = reader.await {
        error!(error = %e, "candle reader task failed");
    }

    let result = producer_outcome
        .context("trade producer task failed")
        .and_then(|outcome| outcome);
    match &result {
        Ok(()) => info!("Trade OHLC shut down complete."),
        Err(e) => error!(error = %format!("{e:#}"), "Trade OHLC stopped on error"),
    }
    result
}

/// Downstream stand-in: log every candle that reaches the output topic.
async fn log_candles(mut consumer: MemoryConsumer) {
    while let Some(message) = consumer.recv().await {
        match serde_json::from_slice::<CandleMessage>(&message.payload) {
            Ok(candle) => info!(
                topic = %consumer.topic(),
                offset = message.offset,
                product_id = %candle.product_id,
                open = %candle.open,
                high = %candle.high,
                low = %candle.low,
                close = %candle.close,
                timestamp = candle.timestamp,
                "candle received"
            ),
            Err(e) => warn!(offset = message.offset, error = %e, "unreadable candle message"),
        }
    }
}
