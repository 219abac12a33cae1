// =============================================================================
// Service Configuration — environment-sourced, validated once at startup
// =============================================================================
//
// Every setting is read from the process environment (a `.env` file is
// honoured via `dotenv` in main.rs).  Required settings that are missing or
// unparsable are a startup-time fatal error; nothing is re-read at runtime.
//
// =============================================================================

use std::time::Duration;

use tracing::info;

// =============================================================================
// Variable names and defaults
// =============================================================================

pub const ENV_BROKER_ADDRESS: &str = "KAFKA_BROKER_ADDRESS";
pub const ENV_INPUT_TOPIC: &str = "KAFKA_INPUT_TOPIC";
pub const ENV_OUTPUT_TOPIC: &str = "KAFKA_OUTPUT_TOPIC";
pub const ENV_WINDOW_SECONDS: &str = "OHLC_WINDOW_SECONDS";
pub const ENV_PRODUCT_ID: &str = "PRODUCT_ID";
pub const ENV_FEED_URL: &str = "KRAKEN_WS_URL";
pub const ENV_IDLE_FLUSH_SECONDS: &str = "OHLC_IDLE_FLUSH_SECONDS";
pub const ENV_STALE_TIMEOUT_SECONDS: &str = "FEED_STALE_TIMEOUT_SECONDS";
pub const ENV_CHANNEL_CAPACITY: &str = "BUS_CHANNEL_CAPACITY";

const DEFAULT_FEED_URL: &str = "wss://ws.kraken.com/v2";
const DEFAULT_STALE_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Configuration could not be assembled.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Fully validated service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Bus broker address.
    pub broker_address: String,
    /// Topic the producer writes trades to and the aggregator reads from.
    pub input_topic: String,
    /// Topic completed candles are published to.
    pub output_topic: String,
    /// Tumbling window length.
    pub window: Duration,
    /// Trading pair to subscribe to, e.g. `BTC/USD`.
    pub product_id: String,
    /// Exchange websocket endpoint.
    pub feed_url: String,
    /// How long after its end a quiet window is force-flushed.
    pub idle_flush: Duration,
    /// No frame for this long means the feed connection is dead.
    pub stale_timeout: Duration,
    /// Per-topic bus buffer.
    pub channel_capacity: usize,
}

impl Config {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;

        info!(
            broker = %config.broker_address,
            input_topic = %config.input_topic,
            output_topic = %config.output_topic,
            window_secs = config.window.as_secs(),
            product_id = %config.product_id,
            "configuration loaded"
        );

        Ok(config)
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &'static str| -> Result<String, ConfigError> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::Missing(key))
        };
        let optional = |key: &'static str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let broker_address = required(ENV_BROKER_ADDRESS)?;
        let input_topic = required(ENV_INPUT_TOPIC)?;
        let output_topic = required(ENV_OUTPUT_TOPIC)?;
        let window_secs = parse_positive(ENV_WINDOW_SECONDS, &required(ENV_WINDOW_SECONDS)?)?;
        let product_id = required(ENV_PRODUCT_ID)?;

        let feed_url = optional(ENV_FEED_URL).unwrap_or_else(|| DEFAULT_FEED_URL.to_string());
        if !(feed_url.starts_with("ws://") || feed_url.starts_with("wss://")) {
            return Err(ConfigError::Invalid {
                key: ENV_FEED_URL,
                value: feed_url,
                reason: "expected a ws:// or wss:// URL".into(),
            });
        }

        let idle_flush_secs = match optional(ENV_IDLE_FLUSH_SECONDS) {
            Some(v) => parse_number(ENV_IDLE_FLUSH_SECONDS, &v)?,
            None => window_secs,
        };
        let stale_secs = match optional(ENV_STALE_TIMEOUT_SECONDS) {
            Some(v) => parse_positive(ENV_STALE_TIMEOUT_SECONDS, &v)?,
            None => DEFAULT_STALE_TIMEOUT_SECONDS,
        };
        let channel_capacity = match optional(ENV_CHANNEL_CAPACITY) {
            Some(v) => parse_positive(ENV_CHANNEL_CAPACITY, &v)? as usize,
            None => DEFAULT_CHANNEL_CAPACITY,
        };

        Ok(Self {
            broker_address,
            input_topic,
            output_topic,
            window: Duration::from_secs(window_secs),
            product_id,
            feed_url,
            idle_flush: Duration::from_secs(idle_flush_secs),
            stale_timeout: Duration::from_secs(stale_secs),
            channel_capacity,
        })
    }
}

fn parse_number(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|e| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_positive(key: &'static str, value: &str) -> Result<u64, ConfigError> {
    match parse_number(key, value)? {
        0 => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "must be greater than zero".into(),
        }),
        n => Ok(n),
    }
}
