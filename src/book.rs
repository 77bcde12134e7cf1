//! Per-asset order-book cache and the displayed-price rule.
//!
//! The cache is the only point where order-book and last-trade state fuse.
//! It never emits events on its own; the sockets ask for a derived event
//! after each update that could change the displayed price.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::types::{PriceChange, PriceLevel, PriceUpdateEvent, Side, PRICE_UPDATE_EVENT_TYPE};

/// Cached book state for one asset.
///
/// Bids are kept descending by price, asks ascending, so the best level of
/// each side is always the first element.
#[derive(Debug, Clone, Default)]
pub struct BookEntry {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    pub last_trade_price: Option<Decimal>,
    /// Monotonic update counter shared across all assets.
    pub last_update: u64,
}

impl BookEntry {
    pub fn best_bid(&self) -> Option<&PriceLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&PriceLevel> {
        self.asks.first()
    }

    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask.price - bid.price),
            _ => None,
        }
    }

    pub fn midpoint(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid.price + ask.price) / Decimal::TWO),
            _ => None,
        }
    }
}

/// Best-bid / best-ask / last-trade store for all subscribed assets.
pub struct BookCache {
    books: Mutex<HashMap<String, BookEntry>>,
    updates: AtomicU64,
}

impl BookCache {
    pub fn new() -> Self {
        Self {
            books: Mutex::new(HashMap::new()),
            updates: AtomicU64::new(0),
        }
    }

    fn next_update(&self) -> u64 {
        self.updates.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Replace both sides from a `book` snapshot. The snapshot is
    /// authoritative for the levels but preserves the last trade price.
    pub fn apply_book(&self, asset_id: &str, bids: &[PriceLevel], asks: &[PriceLevel]) {
        let update = self.next_update();
        let mut books = self.books.lock();
        let entry = books.entry(asset_id.to_string()).or_default();
        entry.bids = bids.to_vec();
        entry.asks = asks.to_vec();
        sort_sides(entry);
        entry.last_update = update;
    }

    /// Apply incremental level changes for one asset. A zero size deletes
    /// the level at that price; anything else upserts it.
    pub fn apply_price_change(&self, asset_id: &str, changes: &[PriceChange]) {
        let update = self.next_update();
        let mut books = self.books.lock();
        let entry = books.entry(asset_id.to_string()).or_default();
        for change in changes {
            let levels = match change.side {
                Side::Buy => &mut entry.bids,
                Side::Sell => &mut entry.asks,
            };
            if change.size.is_zero() {
                levels.retain(|level| level.price != change.price);
            } else if let Some(level) = levels.iter_mut().find(|l| l.price == change.price) {
                level.size = change.size;
            } else {
                levels.push(PriceLevel::new(change.price, change.size));
            }
        }
        sort_sides(entry);
        entry.last_update = update;
    }

    pub fn apply_last_trade_price(&self, asset_id: &str, price: Decimal) {
        let update = self.next_update();
        let mut books = self.books.lock();
        let entry = books.entry(asset_id.to_string()).or_default();
        entry.last_trade_price = Some(price);
        entry.last_update = update;
    }

    /// Derive the displayed-price event for an asset, if one is defined.
    ///
    /// Midpoint of best bid and best ask when both exist and the spread is
    /// at most 0.10; otherwise the last trade price when known; otherwise
    /// nothing.
    pub fn derive_price(&self, asset_id: &str) -> Option<PriceUpdateEvent> {
        let books = self.books.lock();
        let entry = books.get(asset_id)?;
        let max_spread = Decimal::new(10, 2);
        let price = match (entry.best_bid(), entry.best_ask()) {
            (Some(bid), Some(ask)) if ask.price - bid.price <= max_spread => {
                (bid.price + ask.price) / Decimal::TWO
            }
            _ => entry.last_trade_price?,
        };
        Some(PriceUpdateEvent {
            event_type: PRICE_UPDATE_EVENT_TYPE,
            asset_id: asset_id.to_string(),
            price,
            bids: entry.bids.clone(),
            asks: entry.asks.clone(),
            last_trade_price: entry.last_trade_price,
        })
    }

    /// Snapshot of one asset's cached entry.
    pub fn snapshot(&self, asset_id: &str) -> Option<BookEntry> {
        self.books.lock().get(asset_id).cloned()
    }

    pub fn drop_assets(&self, asset_ids: &[String]) {
        let mut books = self.books.lock();
        for id in asset_ids {
            books.remove(id);
        }
    }

    pub fn clear(&self) {
        self.books.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.books.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.lock().is_empty()
    }
}

impl Default for BookCache {
    fn default() -> Self {
        Self::new()
    }
}

fn sort_sides(entry: &mut BookEntry) {
    entry.bids.sort_by(|a, b| b.price.cmp(&a.price));
    entry.asks.sort_by(|a, b| a.price.cmp(&b.price));
}
