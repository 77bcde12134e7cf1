//! User-supplied event handlers.
//!
//! Every handler is optional and receives a whole decoded batch; batches
//! from one socket are awaited in arrival order, so a slow handler applies
//! backpressure to its own connection only.

use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::error::Error;
use crate::registry::GroupId;
use crate::types::{
    BookEvent, LastTradePriceEvent, PriceChangeEvent, PriceUpdateEvent, TickSizeChangeEvent,
};

pub(crate) type BookCallback = Arc<dyn Fn(Vec<BookEvent>) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type PriceChangeCallback =
    Arc<dyn Fn(Vec<PriceChangeEvent>) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type TickSizeChangeCallback =
    Arc<dyn Fn(Vec<TickSizeChangeEvent>) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type LastTradePriceCallback =
    Arc<dyn Fn(Vec<LastTradePriceEvent>) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type PriceUpdateCallback =
    Arc<dyn Fn(Vec<PriceUpdateEvent>) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type OpenCallback =
    Arc<dyn Fn(GroupId, Vec<String>) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type CloseCallback =
    Arc<dyn Fn(GroupId, u16, String) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type ErrorCallback = Arc<dyn Fn(Error) -> BoxFuture<'static, ()> + Send + Sync>;

pub(crate) type UserBatchCallback =
    Arc<dyn Fn(String, Vec<Value>) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type UserOpenCallback = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type UserCloseCallback =
    Arc<dyn Fn(String, u16, String) -> BoxFuture<'static, ()> + Send + Sync>;
pub(crate) type UserErrorCallback =
    Arc<dyn Fn(String, Error) -> BoxFuture<'static, ()> + Send + Sync>;

/// Market-channel handlers, built fluently:
///
/// ```no_run
/// use polymarket_ws::MarketHandlers;
///
/// let handlers = MarketHandlers::new()
///     .on_book(|books| async move {
///         for book in books {
///             println!("book for {}", book.asset_id);
///         }
///     })
///     .on_error(|err| async move { eprintln!("{err}") });
/// ```
#[derive(Clone, Default)]
pub struct MarketHandlers {
    pub(crate) book: Option<BookCallback>,
    pub(crate) price_change: Option<PriceChangeCallback>,
    pub(crate) tick_size_change: Option<TickSizeChangeCallback>,
    pub(crate) last_trade_price: Option<LastTradePriceCallback>,
    pub(crate) price_update: Option<PriceUpdateCallback>,
    pub(crate) ws_open: Option<OpenCallback>,
    pub(crate) ws_close: Option<CloseCallback>,
    pub(crate) error: Option<ErrorCallback>,
}

impl MarketHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_book<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<BookEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.book = Some(Arc::new(move |events| Box::pin(f(events))));
        self
    }

    pub fn on_price_change<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<PriceChangeEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.price_change = Some(Arc::new(move |events| Box::pin(f(events))));
        self
    }

    pub fn on_tick_size_change<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<TickSizeChangeEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.tick_size_change = Some(Arc::new(move |events| Box::pin(f(events))));
        self
    }

    pub fn on_last_trade_price<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<LastTradePriceEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.last_trade_price = Some(Arc::new(move |events| Box::pin(f(events))));
        self
    }

    /// Handler for the synthetic displayed-price events.
    pub fn on_price_update<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<PriceUpdateEvent>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.price_update = Some(Arc::new(move |events| Box::pin(f(events))));
        self
    }

    pub fn on_ws_open<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(GroupId, Vec<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ws_open = Some(Arc::new(move |group, assets| Box::pin(f(group, assets))));
        self
    }

    pub fn on_ws_close<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(GroupId, u16, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ws_close = Some(Arc::new(move |group, code, reason| {
            Box::pin(f(group, code, reason))
        }));
        self
    }

    pub fn on_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.error = Some(Arc::new(move |err| Box::pin(f(err))));
        self
    }
}

/// User-channel handlers. Every callback gets the API key first; there are
/// no group ids on the user-channel surface.
///
/// Trade and order payloads are passed through as raw JSON values, exactly
/// as the upstream sent them.
#[derive(Clone, Default)]
pub struct UserHandlers {
    pub(crate) trade: Option<UserBatchCallback>,
    pub(crate) order: Option<UserBatchCallback>,
    pub(crate) ws_open: Option<UserOpenCallback>,
    pub(crate) ws_close: Option<UserCloseCallback>,
    pub(crate) error: Option<UserErrorCallback>,
}

impl UserHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_trade<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.trade = Some(Arc::new(move |key, events| Box::pin(f(key, events))));
        self
    }

    pub fn on_order<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.order = Some(Arc::new(move |key, events| Box::pin(f(key, events))));
        self
    }

    pub fn on_ws_open<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ws_open = Some(Arc::new(move |key| Box::pin(f(key))));
        self
    }

    pub fn on_ws_close<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String, u16, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.ws_close = Some(Arc::new(move |key, code, reason| {
            Box::pin(f(key, code, reason))
        }));
        self
    }

    pub fn on_error<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(String, Error) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.error = Some(Arc::new(move |key, err| Box::pin(f(key, err))));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_market_handler_invocation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let handlers = MarketHandlers::new().on_book(move |events| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(events.len(), Ordering::SeqCst);
            }
        });

        let cb = handlers.book.as_ref().unwrap();
        cb(vec![]).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(handlers.error.is_none());
    }
}
