//! # polymarket-ws
//!
//! A Rust client library that maintains many long-lived WebSocket
//! subscriptions to the Polymarket CLOB on behalf of a user program.
//!
//! Two upstream channels are covered:
//! - the public **market channel**: order-book snapshots, incremental
//!   price changes, tick-size changes, and last-trade ticks, keyed by
//!   per-outcome asset id;
//! - the authenticated **user channel**: one user's trade and order
//!   events across all of that user's markets.
//!
//! The core is [`SubscriptionManager`], a group-based multiplexer: asset
//! ids are packed onto connections under a per-connection capacity limit,
//! connection health is maintained by a periodic reconnect/cleanup pass,
//! and raw frames become typed event batches. On top of the raw events the
//! manager derives a synthetic displayed price per asset, fusing the order
//! book with the last trade: the bid/ask midpoint while the spread stays
//! within 0.10, the last trade price otherwise.
//!
//! ## Features
//!
//! - **Dynamic subscriptions**: add and remove asset ids at any time; the
//!   manager reshuffles connections without dropping in-flight events.
//! - **Self-healing**: dead connections are detected and replaced by an
//!   idempotent periodic pass; connect bursts are paced by a token bucket.
//! - **Decimal precision**: prices and sizes stay exact decimals that
//!   round-trip the wire's string representation unchanged.
//! - **No panics**: transport and decode failures surface through the
//!   `on_error` handlers.

// Public modules
pub mod book;
pub mod config;
pub mod error;
pub mod handlers;
pub mod limiter;
pub mod manager;
pub mod registry;
pub mod types;
pub mod websocket;

// Re-export commonly used types
pub use book::{BookCache, BookEntry};
pub use config::Options;
pub use error::{Error, Result};
pub use handlers::{MarketHandlers, UserHandlers};
pub use limiter::BurstLimiter;
pub use manager::SubscriptionManager;
pub use registry::{GroupId, GroupStatus};
pub use types::{
    Auth, BookEvent, LastTradePriceEvent, MarketEvent, MarketSubscription, PriceChange,
    PriceChangeEvent, PriceLevel, PriceUpdateEvent, Side, TickSizeChangeEvent,
    UserAuthentication, UserSubscription, PRICE_UPDATE_EVENT_TYPE,
};
pub use websocket::{MARKET_WS_URL, USER_WS_URL};
