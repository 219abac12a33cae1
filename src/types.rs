// =============================================================================
// Shared types used across the trade → OHLC pipeline
// =============================================================================
//
// `Trade` and `Candle` are the in-process records.  `TradeMessage` and
// `CandleMessage` are their JSON shapes on the bus; the field names
// (`product_id`, `timestamp`) are what downstream consumers already read.
// =============================================================================

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single normalized trade.  Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trade {
    pub pair: String,
    pub price: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// A completed OHLC candle.  Window bounds are epoch milliseconds,
/// `window_end` exclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candle {
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

impl std::fmt::Display for Candle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{}..{}) O={} H={} L={} C={} V={} N={}",
            self.pair,
            self.window_start,
            self.window_end,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            self.trade_count
        )
    }
}

// ---------------------------------------------------------------------------
// Bus payloads
// ---------------------------------------------------------------------------

/// JSON value of a message on the trade topic.  Keyed by `product_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeMessage {
    pub product_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub volume: Decimal,
    #[serde(serialize_with = "serialize_rfc3339", deserialize_with = "deserialize_flexible")]
    pub timestamp: DateTime<Utc>,
}

impl From<&Trade> for TradeMessage {
    fn from(trade: &Trade) -> Self {
        Self {
            product_id: trade.pair.clone(),
            price: trade.price,
            volume: trade.volume,
            timestamp: trade.timestamp,
        }
    }
}

impl From<TradeMessage> for Trade {
    fn from(msg: TradeMessage) -> Self {
        Self {
            pair: msg.product_id,
            price: msg.price,
            volume: msg.volume,
            timestamp: msg.timestamp,
        }
    }
}

/// JSON value of a message on the candle topic.  `timestamp` is the window
/// end in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandleMessage {
    pub product_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub open: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub high: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub low: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub close: Decimal,
    pub timestamp: i64,
}

impl From<&Candle> for CandleMessage {
    fn from(candle: &Candle) -> Self {
        Self {
            product_id: candle.pair.clone(),
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            timestamp: candle.window_end,
        }
    }
}

// ---------------------------------------------------------------------------
// Timestamp encoding
// ---------------------------------------------------------------------------

fn serialize_rfc3339<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Micros, true))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTimestamp {
    Text(String),
    Millis(i64),
    Fractional(f64),
}

/// Accepts an RFC 3339 string or epoch milliseconds.
fn deserialize_flexible<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    use serde::de::Error;

    match RawTimestamp::deserialize(d)? {
        RawTimestamp::Text(s) => DateTime::parse_from_rfc3339(&s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| D::Error::custom(format!("invalid RFC 3339 timestamp {s:?}: {e}"))),
        RawTimestamp::Millis(ms) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .ok_or_else(|| D::Error::custom(format!("timestamp {ms} out of range"))),
        RawTimestamp::Fractional(ms) => Utc
            .timestamp_millis_opt(ms as i64)
            .single()
            .ok_or_else(|| D::Error::custom(format!("timestamp {ms} out of range"))),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
