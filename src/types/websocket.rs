use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::primitives::{PriceLevel, Side};

/// `event_type` of the synthetic displayed-price event.
pub const PRICE_UPDATE_EVENT_TYPE: &str = "polymarket_price_update";

/// Subscription frame for the market channel.
///
/// Polymarket does not support changing the asset list on a live
/// connection; a new list always means a new socket.
#[derive(Debug, Clone, Serialize)]
pub struct MarketSubscription {
    pub assets_ids: Vec<String>,
    #[serde(rename = "type")]
    pub channel: &'static str,
}

impl MarketSubscription {
    pub fn new(assets_ids: Vec<String>) -> Self {
        Self {
            assets_ids,
            channel: "market",
        }
    }
}

/// Subscription frame for the user channel.
///
/// `markets` is deliberately empty: the upstream then streams every event
/// for the authenticated user across all of that user's markets.
#[derive(Debug, Clone, Serialize)]
pub struct UserSubscription {
    pub markets: Vec<String>,
    #[serde(rename = "type")]
    pub channel: &'static str,
    pub auth: super::auth::UserAuthentication,
}

impl UserSubscription {
    pub fn new(auth: &super::auth::Auth) -> Self {
        Self {
            markets: Vec::new(),
            channel: "user",
            auth: auth.into(),
        }
    }
}

/// Full order-book snapshot for one asset. Authoritative: replaces both
/// sides of any previously known book.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookEvent {
    pub asset_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market: Option<String>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// One level change inside a [`PriceChangeEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceChange {
    pub asset_id: String,
    pub price: Decimal,
    pub side: Side,
    pub size: Decimal,
}

/// Incremental order-book update; may touch several assets at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceChangeEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market: Option<String>,
    pub price_changes: Vec<PriceChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Tick-size change for one asset. Carries no book data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickSizeChangeEvent {
    pub asset_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_tick_size: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_tick_size: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Last-trade-price tick for one asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastTradePriceEvent {
    pub asset_id: String,
    pub price: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub market: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub side: Option<Side>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Decoded market-channel event, dispatched on `event_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum MarketEvent {
    Book(BookEvent),
    PriceChange(PriceChangeEvent),
    TickSizeChange(TickSizeChangeEvent),
    LastTradePrice(LastTradePriceEvent),
}

/// Synthetic displayed-price event derived from the order-book cache.
///
/// The price is the bid/ask midpoint when the spread is at most 0.10,
/// otherwise the last trade price. The full book snapshot rides along.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceUpdateEvent {
    pub event_type: &'static str,
    pub asset_id: String,
    pub price: Decimal,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    #[serde(rename = "lastTradePrice", skip_serializing_if = "Option::is_none")]
    pub last_trade_price: Option<Decimal>,
}
