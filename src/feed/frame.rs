// =============================================================================
// Kraken v2 frame parsing
// =============================================================================
//
// Frames of interest on wss://ws.kraken.com/v2:
//
//   {"channel":"heartbeat"}
//   {"channel":"status","type":"update","data":[{"system":"online",...}]}
//   {"method":"subscribe","result":{...},"success":true,"time_in":...}
//   {"channel":"trade","type":"update","data":[
//       {"symbol":"BTC/USD","side":"buy","price":60000.1,"qty":0.01,
//        "ord_type":"market","trade_id":1,"timestamp":"2023-09-25T07:49:37.708706Z"}]}
// =============================================================================

use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};

use crate::error::FeedError;
use crate::types::Trade;

/// What a single text frame turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Keepalive, no trade data.
    Heartbeat,
    /// A frame without a `data` payload (acks, errors, pongs).
    NoData,
    /// A data frame on some other channel, e.g. `status`.
    Control { channel: String },
    /// One or more trades.
    Trades(Vec<Trade>),
}

/// Subscription request for the trade channel of a single pair.
pub fn subscribe_request(pair: &str) -> String {
    json!({
        "method": "subscribe",
        "params": {
            "channel": "trade",
            "symbol": [pair],
            "snapshot": false
        }
    })
    .to_string()
}

/// If `text` is a subscribe acknowledgement that reports failure, return
/// the exchange's error message.
pub fn subscription_rejection(text: &str) -> Option<String> {
    let root: Value = serde_json::from_str(text).ok()?;
    if root["method"].as_str() != Some("subscribe") || root["success"].as_bool() != Some(false) {
        return None;
    }
    Some(
        root["error"]
            .as_str()
            .unwrap_or("no error message")
            .to_string(),
    )
}

/// Classify one text frame.  Trades are attributed to `pair`, the pair that
/// was subscribed.
pub fn parse_frame(text: &str, pair: &str) -> Result<Frame, FeedError> {
    let root: Value = serde_json::from_str(text)
        .map_err(|e| FeedError::Protocol(format!("frame is not JSON: {e}")))?;

    let channel = root["channel"].as_str().unwrap_or_default();
    if channel == "heartbeat" {
        return Ok(Frame::Heartbeat);
    }

    let data = match root.get("data") {
        Some(data) => data,
        None => return Ok(Frame::NoData),
    };

    if channel != "trade" {
        return Ok(Frame::Control {
            channel: channel.to_string(),
        });
    }

    let entries = data
        .as_array()
        .ok_or_else(|| FeedError::Protocol("trade data is not an array".into()))?;

    entries
        .iter()
        .map(|entry| parse_trade(entry, pair))
        .collect::<Result<Vec<_>, _>>()
        .map(Frame::Trades)
}

fn parse_trade(entry: &Value, pair: &str) -> Result<Trade, FeedError> {
    Ok(Trade {
        pair: pair.to_string(),
        price: parse_decimal(&entry["price"], "price")?,
        volume: parse_decimal(&entry["qty"], "qty")?,
        timestamp: parse_timestamp(&entry["timestamp"])?,
    })
}

/// Kraken sends JSON numbers; strings are accepted too.
fn parse_decimal(val: &Value, name: &str) -> Result<Decimal, FeedError> {
    let text = match val {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        Value::Null => return Err(FeedError::Protocol(format!("missing field {name}"))),
        _ => return Err(FeedError::Protocol(format!("field {name} has unexpected JSON type"))),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|e| FeedError::Protocol(format!("failed to parse {name} {text:?}: {e}")))
}

fn parse_timestamp(val: &Value) -> Result<DateTime<Utc>, FeedError> {
    match val {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| FeedError::Protocol(format!("invalid timestamp {s:?}: {e}"))),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| FeedError::Protocol(format!("invalid timestamp {n}"))),
        Value::Null => Err(FeedError::Protocol("missing field timestamp".into())),
        _ => Err(FeedError::Protocol("field timestamp has unexpected JSON type".into())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
