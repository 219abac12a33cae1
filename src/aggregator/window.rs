// =============================================================================
// Window Aggregator — tumbling-window OHLC with explicit flush
// =============================================================================
//
// Holds one `CandleState` per (pair, window_start).  A window is flushed when
// a trade for the same pair lands in a strictly later window, when the idle
// timer finds it `idle_flush` past its end, or on shutdown drain.  Flushed
// keys are never reopened: every pair keeps a watermark of its newest flushed
// window, and anything at or below it is a late trade and is dropped.
//
// Flushing always yields candles in time order.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::candle::{window_start, CandleState, WindowKey};
use crate::types::{Candle, Trade};

/// Running counters, logged on shutdown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub trades_applied: u64,
    pub late_dropped: u64,
    pub candles_emitted: u64,
}

pub struct WindowAggregator {
    window_ms: i64,
    idle_flush_ms: i64,
    windows: BTreeMap<WindowKey, CandleState>,
    /// Newest flushed window_start per pair.
    watermarks: HashMap<String, i64>,
    stats: AggregatorStats,
}

impl WindowAggregator {
    /// `window` is clamped to at least one millisecond.
    pub fn new(window: Duration, idle_flush: Duration) -> Self {
        Self {
            window_ms: duration_ms(window).max(1),
            idle_flush_ms: duration_ms(idle_flush),
            windows: BTreeMap::new(),
            watermarks: HashMap::new(),
            stats: AggregatorStats::default(),
        }
    }

    pub fn window_ms(&self) -> i64 {
        self.window_ms
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats
    }

    pub fn open_windows(&self) -> usize {
        self.windows.len()
    }

    #[cfg(test)]
    pub fn get(&self, key: &WindowKey) -> Option<&CandleState> {
        self.windows.get(key)
    }

    /// Reduce one trade.  Returns the candles this trade closed, oldest first.
    pub fn on_trade(&mut self, trade: &Trade) -> Vec<Candle> {
        let start = window_start(trade.timestamp, self.window_ms);

        if self.is_late(&trade.pair, start) {
            self.stats.late_dropped += 1;
            warn!(
                pair = %trade.pair,
                window_start = start,
                timestamp = %trade.timestamp,
                watermark = ?self.watermarks.get(&trade.pair),
                "late trade for a closed window — dropped"
            );
            return Vec::new();
        }

        let flushed = self.flush_pair_before(&trade.pair, start);

        let key = WindowKey::new(trade.pair.as_str(), start);
        match self.windows.get_mut(&key) {
            Some(state) => state.apply(trade),
            None => {
                debug!(key = %key, price = %trade.price, "window opened");
                self.windows
                    .insert(key, CandleState::open(trade, start, self.window_ms));
            }
        }
        self.stats.trades_applied += 1;

        flushed
    }

    /// Flush every window that ended at least `idle_flush` before `now`.
    pub fn flush_expired(&mut self, now: DateTime<Utc>) -> Vec<Candle> {
        let now_ms = now.timestamp_millis();
        let expired: Vec<WindowKey> = self
            .windows
            .iter()
            .filter(|(_, state)| state.window_end.saturating_add(self.idle_flush_ms) <= now_ms)
            .map(|(key, _)| key.clone())
            .collect();

        if !expired.is_empty() {
            debug!(count = expired.len(), now_ms, "idle flush");
        }
        self.finish_all(expired)
    }

    /// Flush everything still open (graceful shutdown).
    pub fn drain(&mut self) -> Vec<Candle> {
        let keys: Vec<WindowKey> = self.windows.keys().cloned().collect();
        self.finish_all(keys)
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// A trade is late if its window is at or below the pair's watermark, or
    /// if the pair already has an open window further ahead in time.
    fn is_late(&self, pair: &str, start: i64) -> bool {
        if let Some(&watermark) = self.watermarks.get(pair) {
            if start <= watermark {
                return true;
            }
        }
        let ahead = WindowKey::new(pair, start.saturating_add(1))..=WindowKey::new(pair, i64::MAX);
        self.windows.range(ahead).next().is_some()
    }

    fn flush_pair_before(&mut self, pair: &str, start: i64) -> Vec<Candle> {
        let behind = WindowKey::new(pair, i64::MIN)..WindowKey::new(pair, start);
        let keys: Vec<WindowKey> = self.windows.range(behind).map(|(k, _)| k.clone()).collect();
        keys.into_iter().filter_map(|key| self.finish(&key)).collect()
    }

    /// Flush a set of keys across pairs in (window_start, pair) order.
    fn finish_all(&mut self, mut keys: Vec<WindowKey>) -> Vec<Candle> {
        keys.sort_by(|a, b| {
            a.window_start
                .cmp(&b.window_start)
                .then_with(|| a.pair.cmp(&b.pair))
        });
        keys.iter().filter_map(|key| self.finish(key)).collect()
    }

    fn finish(&mut self, key: &WindowKey) -> Option<Candle> {
        let state = self.windows.remove(key)?;
        debug_assert!(state.is_valid(), "inconsistent candle state for {key}");
        let watermark = self.watermarks.entry(key.pair.clone()).or_insert(i64::MIN);
        *watermark = (*watermark).max(key.window_start);
        self.stats.candles_emitted += 1;

        debug!(
            key = %key,
            trades = state.trade_count,
            open = %state.open,
            close = %state.close,
            "window flushed"
        );
        Some(state.into_candle())
    }
}

fn duration_ms(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use std::collections::HashSet;

    const MINUTE: Duration = Duration::from_secs(60);

    fn trade(pair: &str, secs: i64, price: i64) -> Trade {
        Trade {
            pair: pair.into(),
            price: Decimal::from(price),
            volume: Decimal::ONE,
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn btc_example_emits_once_next_window_starts() {
        let mut agg = WindowAggregator::new(MINUTE, MINUTE);
        assert!(agg.on_trade(&trade("BTC/USD", 100, 60_000)).is_empty());
        assert!(agg.on_trade(&trade("BTC/USD", 110, 61_000)).is_empty());
        assert!(agg.on_trade(&trade("BTC/USD", 115, 59_500)).is_empty());
        assert_eq!(agg.open_windows(), 1);

        let emitted = agg.on_trade(&trade("BTC/USD", 121, 59_800));
        assert_eq!(emitted.len(), 1);
        let c = &emitted[0];
        assert_eq!(c.pair, "BTC/USD");
        assert_eq!(c.open, Decimal::from(60_000));
        assert_eq!(c.high, Decimal::from(61_000));
        assert_eq!(c.low, Decimal::from(59_500));
        assert_eq!(c.close, Decimal::from(59_500));
        assert_eq!(c.window_start, 60_000);
        assert_eq!(c.window_end, 120_000);
        assert_eq!(c.trade_count, 3);

        // The new window is open, the old one is gone.
        assert_eq!(agg.open_windows(), 1);
        assert!(agg.get(&WindowKey::new("BTC/USD", 60_000)).is_none());
        assert!(agg.get(&WindowKey::new("BTC/USD", 120_000)).is_some());
    }

    #[test]
    fn btc_example_emits_on_idle_flush() {
        let mut agg = WindowAggregator::new(MINUTE, Duration::from_secs(5));
        agg.on_trade(&trade("BTC/USD", 100, 60_000));
        agg.on_trade(&trade("BTC/USD", 110, 61_000));
        agg.on_trade(&trade("BTC/USD", 115, 59_500));

        // Window ends at 120s; 5s of idle grace.
        assert!(agg.flush_expired(at(124)).is_empty());
        let emitted = agg.flush_expired(at(125));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].close, Decimal::from(59_500));
        assert!(agg.flush_expired(at(500)).is_empty());
        assert_eq!(agg.stats().candles_emitted, 1);
    }

    #[test]
    fn pairs_are_independent() {
        let mut agg = WindowAggregator::new(MINUTE, MINUTE);
        agg.on_trade(&trade("BTC/USD", 10, 100));
        agg.on_trade(&trade("ETH/USD", 10, 5));
        // ETH moving on must not flush BTC.
        let emitted = agg.on_trade(&trade("ETH/USD", 70, 6));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].pair, "ETH/USD");
        assert!(agg.get(&WindowKey::new("BTC/USD", 0)).is_some());
    }

    #[test]
    fn skipped_windows_emit_nothing() {
        let mut agg = WindowAggregator::new(MINUTE, MINUTE);
        agg.on_trade(&trade("BTC/USD", 10, 100));
        let emitted = agg.on_trade(&trade("BTC/USD", 600, 101));
        assert_eq!(emitted.len(), 1);
        assert_eq!(emitted[0].window_start, 0);
        let rest = agg.drain();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].window_start, 600_000);
    }

    #[test]
    fn late_trade_after_flush_is_dropped() {
        let mut agg = WindowAggregator::new(MINUTE, MINUTE);
        agg.on_trade(&trade("BTC/USD", 10, 100));
        agg.on_trade(&trade("BTC/USD", 70, 101));

        // Belongs to the flushed [0, 60s) window.
        assert!(agg.on_trade(&trade("BTC/USD", 59, 1)).is_empty());
        assert_eq!(agg.stats().late_dropped, 1);
        assert!(agg.get(&WindowKey::new("BTC/USD", 0)).is_none());

        let open = agg.get(&WindowKey::new("BTC/USD", 60_000)).unwrap();
        assert_eq!(open.low, Decimal::from(101));
        assert_eq!(open.trade_count, 1);
    }

    #[test]
    fn idle_flushed_window_is_never_reopened() {
        let mut agg = WindowAggregator::new(MINUTE, Duration::ZERO);
        agg.on_trade(&trade("BTC/USD", 10, 100));
        assert_eq!(agg.flush_expired(at(60)).len(), 1);

        agg.on_trade(&trade("BTC/USD", 30, 99));
        assert_eq!(agg.open_windows(), 0);
        assert_eq!(agg.stats().late_dropped, 1);
    }

    #[test]
    fn out_of_order_within_open_window_is_applied() {
        let mut agg = WindowAggregator::new(MINUTE, MINUTE);
        agg.on_trade(&trade("BTC/USD", 50, 100));
        agg.on_trade(&trade("BTC/USD", 20, 90));
        let state = agg.get(&WindowKey::new("BTC/USD", 0)).unwrap();
        assert_eq!(state.open, Decimal::from(100));
        assert_eq!(state.close, Decimal::from(90));
        assert_eq!(agg.stats().late_dropped, 0);
    }

    #[test]
    fn duplicate_trade_does_not_change_ohlc() {
        let mut agg = WindowAggregator::new(MINUTE, MINUTE);
        let t = trade("BTC/USD", 5, 100);
        agg.on_trade(&trade("BTC/USD", 1, 120));
        agg.on_trade(&t);
        let key = WindowKey::new("BTC/USD", 0);
        let before = agg.get(&key).cloned().unwrap();
        agg.on_trade(&t);
        let after = agg.get(&key).unwrap();
        assert_eq!(
            (after.open, after.high, after.low, after.close),
            (before.open, before.high, before.low, before.close)
        );
    }

    #[test]
    fn drain_is_time_ordered_across_pairs() {
        let mut agg = WindowAggregator::new(MINUTE, MINUTE);
        agg.on_trade(&trade("ETH/USD", 70, 1));
        agg.on_trade(&trade("BTC/USD", 130, 2));
        agg.on_trade(&trade("ADA/USD", 10, 3));
        let order: Vec<(String, i64)> = agg
            .drain()
            .into_iter()
            .map(|c| (c.pair, c.window_start))
            .collect();
        assert_eq!(
            order,
            vec![
                ("ADA/USD".to_string(), 0),
                ("ETH/USD".to_string(), 60_000),
                ("BTC/USD".to_string(), 120_000),
            ]
        );
        assert_eq!(agg.open_windows(), 0);
    }

    fn arb_trades() -> impl Strategy<Value = Vec<(u8, i64, i64)>> {
        proptest::collection::vec((0u8..3, 0i64..3_600, 1i64..10_000), 1..200)
    }

    proptest! {
        #[test]
        fn prop_one_candle_per_touched_window(mut raw in arb_trades()) {
            raw.sort_by_key(|(_, secs, _)| *secs);
            let pairs = ["BTC/USD", "ETH/USD", "SOL/USD"];
            let mut agg = WindowAggregator::new(MINUTE, MINUTE);

            let mut touched = HashSet::new();
            let mut emitted = Vec::new();
            for (p, secs, price) in &raw {
                let t = trade(pairs[*p as usize], *secs, *price);
                touched.insert((t.pair.clone(), window_start(t.timestamp, 60_000)));
                emitted.extend(agg.on_trade(&t));
            }
            emitted.extend(agg.drain());

            let keys: Vec<(String, i64)> =
                emitted.iter().map(|c| (c.pair.clone(), c.window_start)).collect();
            let unique: HashSet<(String, i64)> = keys.iter().cloned().collect();
            prop_assert_eq!(unique.len(), keys.len());
            prop_assert_eq!(unique, touched);
            prop_assert_eq!(agg.stats().late_dropped, 0);
            prop_assert!(emitted.iter().all(|c| c.low <= c.open && c.open <= c.high));
        }

        #[test]
        fn prop_shuffled_input_never_duplicates(raw in arb_trades()) {
            let pairs = ["BTC/USD", "ETH/USD", "SOL/USD"];
            let mut agg = WindowAggregator::new(MINUTE, MINUTE);

            let mut emitted = Vec::new();
            for (p, secs, price) in &raw {
                emitted.extend(agg.on_trade(&trade(pairs[*p as usize], *secs, *price)));
            }
            emitted.extend(agg.drain());

            let unique: HashSet<(String, i64)> =
                emitted.iter().map(|c| (c.pair.clone(), c.window_start)).collect();
            prop_assert_eq!(unique.len(), emitted.len());

            let stats = agg.stats();
            prop_assert_eq!(stats.trades_applied + stats.late_dropped, raw.len() as u64);
            let counted: u64 = emitted.iter().map(|c| c.trade_count).sum();
            prop_assert_eq!(counted, stats.trades_applied);
        }
    }
}
