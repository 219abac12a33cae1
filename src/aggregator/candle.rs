// =============================================================================
// Candle State — the per-window reducer
// =============================================================================
//
// A `CandleState` lives from the first trade that lands in its window until
// the aggregator flushes it.  `open` is fixed at creation; `close` follows
// arrival order, not timestamp order.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::types::{Candle, Trade};

/// Start of the tumbling window containing `timestamp`, in epoch ms.
///
/// Floored division, so `window_start(t) <= t < window_start(t) + window_ms`
/// also holds for instants before the epoch.
pub fn window_start(timestamp: DateTime<Utc>, window_ms: i64) -> i64 {
    timestamp.timestamp_millis().div_euclid(window_ms) * window_ms
}

/// Identifies exactly one candle in progress.
///
/// Ordering is `(pair, window_start)`, so all windows of one pair are
/// contiguous and time-ordered inside a `BTreeMap`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct WindowKey {
    pub pair: String,
    pub window_start: i64,
}

impl WindowKey {
    pub fn new(pair: impl Into<String>, window_start: i64) -> Self {
        Self {
            pair: pair.into(),
            window_start,
        }
    }
}

impl std::fmt::Display for WindowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pair, self.window_start)
    }
}

/// Running OHLC for a single open window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandleState {
    pub pair: String,
    pub window_start: i64,
    pub window_end: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub trade_count: u64,
}

impl CandleState {
    /// Seed a window from its first trade.
    pub fn open(trade: &Trade, window_start: i64, window_ms: i64) -> Self {
        Self {
            pair: trade.pair.clone(),
            window_start,
            window_end: window_start + window_ms,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.volume,
            trade_count: 1,
        }
    }

    /// Fold one more trade into the window.
    pub fn apply(&mut self, trade: &Trade) {
        if trade.price > self.high {
            self.high = trade.price;
        }
        if trade.price < self.low {
            self.low = trade.price;
        }
        self.close = trade.price;
        self.volume += trade.volume;
        self.trade_count += 1;
    }

    /// Validate OHLC invariants.
    pub fn is_valid(&self) -> bool {
        self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.trade_count > 0
            && self.window_end > self.window_start
    }

    pub fn into_candle(self) -> Candle {
        Candle {
            pair: self.pair,
            window_start: self.window_start,
            window_end: self.window_end,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            trade_count: self.trade_count,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn trade_at(secs: i64, price: i64) -> Trade {
        Trade {
            pair: "BTC/USD".into(),
            price: Decimal::from(price),
            volume: Decimal::new(1, 2),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn window_start_on_sixty_second_grid() {
        let ws = |secs| window_start(Utc.timestamp_opt(secs, 0).unwrap(), 60_000);
        assert_eq!(ws(60), 60_000);
        assert_eq!(ws(100), 60_000);
        assert_eq!(ws(119), 60_000);
        assert_eq!(ws(120), 120_000);
        assert_eq!(ws(130), 120_000);
        assert_eq!(ws(0), 0);
        assert_eq!(ws(-1), -60_000);
    }

    #[test]
    fn open_seeds_every_price_field() {
        let state = CandleState::open(&trade_at(100, 60_000), 60_000, 60_000);
        assert_eq!(state.open, Decimal::from(60_000));
        assert_eq!(state.high, state.open);
        assert_eq!(state.low, state.open);
        assert_eq!(state.close, state.open);
        assert_eq!(state.window_end, 120_000);
        assert_eq!(state.trade_count, 1);
        assert!(state.is_valid());
    }

    #[test]
    fn apply_tracks_extremes_and_arrival_close() {
        let mut state = CandleState::open(&trade_at(100, 60_000), 60_000, 60_000);
        state.apply(&trade_at(110, 61_000));
        state.apply(&trade_at(115, 59_500));

        assert_eq!(state.open, Decimal::from(60_000));
        assert_eq!(state.high, Decimal::from(61_000));
        assert_eq!(state.low, Decimal::from(59_500));
        assert_eq!(state.close, Decimal::from(59_500));
        assert_eq!(state.volume, Decimal::new(3, 2));
        assert_eq!(state.trade_count, 3);
        assert!(state.is_valid());
    }

    #[test]
    fn close_follows_arrival_not_timestamp() {
        let mut state = CandleState::open(&trade_at(110, 100), 60_000, 60_000);
        // Earlier timestamp, later arrival.
        state.apply(&trade_at(61, 105));
        assert_eq!(state.close, Decimal::from(105));
        assert_eq!(state.open, Decimal::from(100));
    }

    #[test]
    fn reapplying_same_trade_keeps_ohlc() {
        let first = trade_at(100, 60_000);
        let mut state = CandleState::open(&first, 60_000, 60_000);
        state.apply(&trade_at(110, 61_000));
        let last = trade_at(115, 60_500);
        state.apply(&last);
        let before = state.clone().into_candle();

        state.apply(&last);
        let after = state.into_candle();
        assert_eq!(
            (after.open, after.high, after.low, after.close),
            (before.open, before.high, before.low, before.close)
        );
        assert_eq!(after.trade_count, before.trade_count + 1);
    }

    proptest! {
        #[test]
        fn prop_window_contains_timestamp(
            millis in -10_000_000_000_000i64..10_000_000_000_000i64,
            window_ms in 1i64..86_400_000,
        ) {
            let ts = Utc.timestamp_millis_opt(millis).unwrap();
            let start = window_start(ts, window_ms);
            prop_assert_eq!(start.rem_euclid(window_ms), 0);
            prop_assert!(start <= millis);
            prop_assert!(millis < start + window_ms);
        }

        #[test]
        fn prop_ohlc_matches_prices(prices in proptest::collection::vec(1i64..1_000_000, 1..64)) {
            let mut state = CandleState::open(&trade_at(0, prices[0]), 0, 3_600_000);
            for (i, p) in prices.iter().enumerate().skip(1) {
                state.apply(&trade_at(i as i64, *p));
            }
            let candle = state.into_candle();
            prop_assert_eq!(candle.open, Decimal::from(prices[0]));
            prop_assert_eq!(candle.close, Decimal::from(*prices.last().unwrap()));
            prop_assert_eq!(candle.high, Decimal::from(*prices.iter().max().unwrap()));
            prop_assert_eq!(candle.low, Decimal::from(*prices.iter().min().unwrap()));
            prop_assert_eq!(candle.trade_count, prices.len() as u64);
        }
    }
}
