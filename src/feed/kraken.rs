// =============================================================================
// Kraken Trade Source — websocket v2 trade channel for a single pair
// =============================================================================
//
// Disconnected → Connecting → Subscribing → Streaming, and back to
// Disconnected on any transport failure.  Nothing survives a disconnect:
// the socket is dropped and the caller must connect and subscribe again,
// which always requests a fresh (snapshot-free) subscription.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::frame::{parse_frame, subscribe_request, subscription_rejection, Frame};
use super::{FeedState, TradeSource};
use crate::error::FeedError;
use crate::types::Trade;

/// Frames the exchange sends right after a subscribe request (system status
/// and the subscribe acknowledgement).  Neither carries trades.
const CONFIRMATION_FRAMES: usize = 2;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct KrakenTradeSource {
    url: String,
    stale_timeout: Duration,
    ws: Option<WsStream>,
    pair: Option<String>,
    state: FeedState,
}

impl KrakenTradeSource {
    /// `stale_timeout` bounds the wait for any single frame; Kraken sends a
    /// heartbeat roughly every second, so silence means a dead connection.
    pub fn new(url: impl Into<String>, stale_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            stale_timeout,
            ws: None,
            pair: None,
            state: FeedState::Disconnected,
        }
    }

    fn disconnect(&mut self, reason: &str) -> FeedError {
        if self.state != FeedState::Disconnected {
            warn!(url = %self.url, state = %self.state, reason = %reason, "trade feed disconnected");
        }
        self.ws = None;
        self.state = FeedState::Disconnected;
        FeedError::Connection(reason.to_string())
    }

    /// Next text frame.  Control frames are skipped, binary frames are a
    /// protocol error, anything that ends the stream is a connection error.
    async fn read_text(&mut self) -> Result<String, FeedError> {
        loop {
            let ws = match self.ws.as_mut() {
                Some(ws) => ws,
                None => return Err(self.disconnect("not connected")),
            };

            let next = match tokio::time::timeout(self.stale_timeout, ws.next()).await {
                Ok(next) => next,
                Err(_) => {
                    let reason = format!("no frame within {:?}", self.stale_timeout);
                    return Err(self.disconnect(&reason));
                }
            };

            match next {
                Some(Ok(Message::Text(text))) => return Ok(text),
                Some(Ok(Message::Binary(bytes))) => {
                    return Err(FeedError::Protocol(format!(
                        "unexpected binary frame ({} bytes)",
                        bytes.len()
                    )));
                }
                Some(Ok(Message::Close(frame))) => {
                    let reason = format!("server closed the connection: {frame:?}");
                    return Err(self.disconnect(&reason));
                }
                // Ping / Pong / raw frames -- tungstenite answers pings itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    let reason = format!("websocket read error: {e}");
                    return Err(self.disconnect(&reason));
                }
                None => return Err(self.disconnect("websocket stream ended")),
            }
        }
    }
}

#[async_trait]
impl TradeSource for KrakenTradeSource {
    fn state(&self) -> FeedState {
        self.state
    }

    async fn connect(&mut self) -> Result<(), FeedError> {
        self.ws = None;
        self.pair = None;
        self.state = FeedState::Connecting;
        info!(url = %self.url, "connecting to trade feed");

        let connected = tokio::time::timeout(self.stale_timeout, connect_async(self.url.as_str())).await;
        match connected {
            Ok(Ok((ws, _response))) => {
                self.ws = Some(ws);
                info!(url = %self.url, "trade feed connected");
                Ok(())
            }
            Ok(Err(e)) => Err(self.disconnect(&format!("failed to connect: {e}"))),
            Err(_) => Err(self.disconnect("connect timed out")),
        }
    }

    async fn subscribe(&mut self, pair: &str) -> Result<(), FeedError> {
        let request = subscribe_request(pair);
        let ws = match self.ws.as_mut() {
            Some(ws) => ws,
            None => return Err(self.disconnect("subscribe without a connection")),
        };

        self.state = FeedState::Subscribing;
        info!(pair = %pair, "subscribing to trades");
        if let Err(e) = ws.send(Message::Text(request)).await {
            return Err(self.disconnect(&format!("failed to send subscribe request: {e}")));
        }

        for n in 1..=CONFIRMATION_FRAMES {
            match self.read_text().await {
                Ok(text) => {
                    if let Some(error) = subscription_rejection(&text) {
                        return Err(self.disconnect(&format!("subscription rejected: {error}")));
                    }
                    debug!(frame = n, text = %text, "discarding subscription confirmation");
                }
                Err(FeedError::Protocol(reason)) => {
                    debug!(frame = n, reason = %reason, "discarding non-text confirmation");
                }
                Err(e) => return Err(e),
            }
        }

        self.pair = Some(pair.to_string());
        self.state = FeedState::Streaming;
        info!(pair = %pair, "subscription confirmed — streaming");
        Ok(())
    }

    async fn next_trades(&mut self) -> Result<Vec<Trade>, FeedError> {
        let pair = match (&self.pair, self.state) {
            (Some(pair), FeedState::Streaming) => pair.clone(),
            _ => return Err(self.disconnect("read before subscribing")),
        };

        let text = self.read_text().await?;
        match parse_frame(&text, &pair)? {
            Frame::Heartbeat => {
                debug!("heartbeat");
                Ok(Vec::new())
            }
            Frame::NoData => {
                info!(text = %text, "received frame without data");
                Ok(Vec::new())
            }
            Frame::Control { channel } => {
                debug!(channel = %channel, "ignoring control frame");
                Ok(Vec::new())
            }
            Frame::Trades(trades) => {
                debug!(pair = %pair, count = trades.len(), "trades received");
                Ok(trades)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
