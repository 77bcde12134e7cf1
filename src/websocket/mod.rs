//! WebSocket transport layer: per-group connection state machines for the
//! market and user channels, plus the frame decoding they share.
//!
//! Each successful connect installs a fresh *epoch* on its group; every
//! task spawned for that transport carries its epoch and compares it with
//! the group's current one before touching group state. A mismatch means
//! the transport was replaced behind the task's back, and the callback
//! exits silently instead of corrupting its successor's state.

mod market;
mod user;

pub(crate) use market::connect_market_group;
pub(crate) use user::connect_user_group;

use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::MarketEvent;

/// Public market-channel endpoint (no authentication).
pub const MARKET_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/market";

/// Authenticated user-channel endpoint.
pub const USER_WS_URL: &str = "wss://ws-subscriptions-clob.polymarket.com/ws/user";

/// Keepalive period bounds; each connection draws its own period so pings
/// across a fleet of sockets do not align.
pub(crate) const KEEPALIVE_MIN_MS: u64 = 15_000;
pub(crate) const KEEPALIVE_MAX_MS: u64 = 25_000;

/// Handle to a live transport, owned by its group record.
///
/// Closing is idempotent: the cancellation token wakes the socket's run
/// loop, which sends a close frame and exits; later closes are no-ops.
#[derive(Debug)]
pub(crate) struct SocketHandle {
    epoch: u64,
    token: CancellationToken,
}

impl SocketHandle {
    pub fn new(epoch: u64, token: CancellationToken) -> Self {
        Self { epoch, token }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Fresh keepalive period in `[15_000, 25_000)` ms.
pub(crate) fn keepalive_period<R: Rng>(rng: &mut R) -> Duration {
    Duration::from_millis(rng.gen_range(KEEPALIVE_MIN_MS..KEEPALIVE_MAX_MS))
}

/// The upstream answers protocol pings with a literal `PONG` text frame
/// during handler reattachment windows. Only that exact frame is
/// swallowed; any other text falls through to JSON decoding so malformed
/// frames still reach `on_error` with their raw payload.
pub(crate) fn is_keepalive_text(text: &str) -> bool {
    text.trim() == "PONG"
}

/// The server sends either a single object or an array of objects.
fn normalize_frame(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// Decode a market-channel text frame into typed events.
///
/// A frame that is not JSON at all is an error carrying the raw payload;
/// an element with an unknown `event_type` is ignored.
pub(crate) fn decode_market_frame(text: &str) -> Result<Vec<MarketEvent>> {
    let value: Value = serde_json::from_str(text).map_err(|source| Error::Decode {
        raw: text.to_string(),
        source,
    })?;
    let mut events = Vec::new();
    for item in normalize_frame(value) {
        let Some(kind) = item
            .get("event_type")
            .and_then(Value::as_str)
            .map(str::to_owned)
        else {
            debug!("market frame element without event_type");
            continue;
        };
        let decoded = match kind.as_str() {
            "book" => serde_json::from_value(item).map(MarketEvent::Book),
            "price_change" => serde_json::from_value(item).map(MarketEvent::PriceChange),
            "tick_size_change" => serde_json::from_value(item).map(MarketEvent::TickSizeChange),
            "last_trade_price" => serde_json::from_value(item).map(MarketEvent::LastTradePrice),
            other => {
                debug!(event_type = other, "ignoring unknown market event");
                continue;
            }
        };
        match decoded {
            Ok(event) => events.push(event),
            Err(source) => {
                warn!(event_type = %kind, %source, "failed to decode market event");
            }
        }
    }
    Ok(events)
}

/// Decode a user-channel text frame into trade and order batches. Events
/// of any other type are dropped.
pub(crate) fn decode_user_frame(text: &str) -> Result<(Vec<Value>, Vec<Value>)> {
    let value: Value = serde_json::from_str(text).map_err(|source| Error::Decode {
        raw: text.to_string(),
        source,
    })?;
    let mut trades = Vec::new();
    let mut orders = Vec::new();
    for item in normalize_frame(value) {
        let kind = item
            .get("event_type")
            .and_then(Value::as_str)
            .map(str::to_owned);
        match kind.as_deref() {
            Some("trade") => trades.push(item),
            Some("order") => orders.push(item),
            _ => {}
        }
    }
    Ok((trades, orders))
}

/// Code and reason of a close frame; 1000 with an empty reason when the
/// peer closed without one.
pub(crate) fn close_parts(frame: Option<CloseFrame<'_>>) -> (u16, String) {
    frame
        .map(|f| (u16::from(f.code), f.reason.to_string()))
        .unwrap_or((1000, String::new()))
}
