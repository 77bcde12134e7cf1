//! The public subscription manager.
//!
//! Wires the registries, the order-book cache, the connect limiter, and
//! the per-group sockets together behind a small async surface. All retry
//! behavior flows through a single periodic reconnect/cleanup pass; there
//! are no per-operation retry counters.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::book::BookCache;
use crate::config::Options;
use crate::error::Error;
use crate::handlers::{MarketHandlers, UserHandlers};
use crate::limiter::BurstLimiter;
use crate::registry::{GroupId, MarketRegistry, UserRegistry};
use crate::types::{Auth, MarketEvent};
use crate::websocket::{self, connect_market_group, connect_user_group};

/// Group-based multiplexer over the Polymarket WebSocket channels.
///
/// Asset ids are allocated onto market connections under a per-connection
/// capacity limit; authenticated users each get a connection of their own.
/// Connection health is maintained by a periodic reconnect/cleanup pass,
/// and every decoded event is filtered to the currently-subscribed set
/// before reaching a handler, so callers never observe events for assets
/// they removed.
///
/// Market handlers are fixed at construction; user handlers are opt-in via
/// [`set_user_handlers`](Self::set_user_handlers). Must be created inside
/// a Tokio runtime.
///
/// ```no_run
/// use polymarket_ws::{MarketHandlers, Options, SubscriptionManager};
///
/// # async fn run() {
/// let handlers = MarketHandlers::new().on_price_update(|updates| async move {
///     for update in updates {
///         println!("{} -> {}", update.asset_id, update.price);
///     }
/// });
/// let manager = SubscriptionManager::new(handlers, Options::default());
/// manager.add_subscriptions(vec!["clob-token-id".to_string()]).await;
/// # }
/// ```
pub struct SubscriptionManager {
    inner: Arc<ManagerInner>,
    tick: JoinHandle<()>,
}

pub(crate) struct ManagerInner {
    pub(crate) options: Options,
    pub(crate) limiter: Arc<BurstLimiter>,
    pub(crate) markets: MarketRegistry,
    pub(crate) users: UserRegistry,
    pub(crate) cache: BookCache,
    pub(crate) market_handlers: MarketHandlers,
    pub(crate) user_handlers: RwLock<Option<UserHandlers>>,
}

impl SubscriptionManager {
    /// Create a manager and start its reconnect/cleanup tick.
    pub fn new(market_handlers: MarketHandlers, options: Options) -> Self {
        let limiter = options
            .burst_limiter
            .clone()
            .unwrap_or_else(|| Arc::new(BurstLimiter::default()));
        let period = options.reconnect_and_cleanup_interval;
        let inner = Arc::new(ManagerInner {
            options,
            limiter,
            markets: MarketRegistry::new(),
            users: UserRegistry::new(),
            cache: BookCache::new(),
            market_handlers,
            user_handlers: RwLock::new(None),
        });
        let tick = tokio::spawn(reconnect_and_cleanup_loop(Arc::downgrade(&inner), period));
        Self { inner, tick }
    }

    /// Subscribe to market data for the given asset ids. Ids already
    /// subscribed are ignored; new ids are placed onto existing or fresh
    /// connections under the capacity limit, and any needed connects are
    /// attempted before this returns. Connect failures go to `on_error`
    /// and are retried by the periodic pass.
    pub async fn add_subscriptions(&self, asset_ids: Vec<String>) {
        let to_connect = self
            .inner
            .markets
            .add_assets(&asset_ids, self.inner.options.max_markets_per_ws)
            .await;
        for group_id in to_connect {
            if let Err(err) = connect_market_group(&self.inner, group_id).await {
                self.inner.emit_market_error(err).await;
            }
        }
    }

    /// Unsubscribe the given asset ids and drop their cached books. The
    /// serving sockets stay open for their remaining ids; an emptied group
    /// is collected on the next cleanup pass.
    pub async fn remove_subscriptions(&self, asset_ids: Vec<String>) {
        let removed = self.inner.markets.remove_assets(&asset_ids).await;
        self.inner.cache.drop_assets(&removed);
    }

    /// Install the user-channel handlers. Required before
    /// [`connect_user_socket`](Self::connect_user_socket).
    pub async fn set_user_handlers(&self, handlers: UserHandlers) {
        *self.inner.user_handlers.write() = Some(handlers);
    }

    /// Open the user channel for one set of credentials. A no-op when the
    /// user is already connected. Calling this before
    /// [`set_user_handlers`](Self::set_user_handlers) is reported through
    /// the market `on_error` handler.
    pub async fn connect_user_socket(&self, auth: Auth) {
        if self.inner.user_handlers.read().is_none() {
            self.inner
                .emit_market_error(Error::Config(
                    "connect_user_socket called before set_user_handlers".to_string(),
                ))
                .await;
            return;
        }
        let Some(group_id) = self.inner.users.add_user(auth).await else {
            debug!("user socket already connected");
            return;
        };
        if let Err(err) = connect_user_group(&self.inner, group_id).await {
            let api_key = self
                .inner
                .users
                .api_key_of(group_id)
                .await
                .unwrap_or_default();
            self.inner.emit_user_error(&api_key, err).await;
        }
    }

    /// Close and remove one user's connection. Other users are untouched.
    pub async fn disconnect_user_socket(&self, api_key: &str) {
        if let Some(socket) = self.inner.users.remove_user(api_key).await {
            socket.close();
        }
    }

    /// Remove every group, close every socket, and clear the book cache.
    pub async fn clear_state(&self) {
        for socket in self.inner.markets.clear().await {
            socket.close();
        }
        for socket in self.inner.users.clear().await {
            socket.close();
        }
        self.inner.cache.clear();
        info!("subscription state cleared");
    }

    /// Asset ids currently held by any active group.
    pub async fn subscribed_assets(&self) -> Vec<String> {
        self.inner.markets.subscribed_assets().await
    }

    /// API keys with a user-channel group.
    pub async fn connected_users(&self) -> Vec<String> {
        self.inner.users.connected_users().await
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.tick.abort();
    }
}

async fn reconnect_and_cleanup_loop(inner: Weak<ManagerInner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(inner) = inner.upgrade() else { break };
        run_reconnect_pass(&inner).await;
    }
    debug!("reconnect/cleanup loop stopped");
}

/// One idempotent pass: collect drained groups, then reconnect every group
/// both registries report as needing a socket.
async fn run_reconnect_pass(inner: &Arc<ManagerInner>) {
    let market_groups = inner.markets.groups_to_reconnect_and_cleanup().await;
    if !market_groups.is_empty() {
        debug!(count = market_groups.len(), "reconnecting market groups");
    }
    for group_id in market_groups {
        if let Err(err) = connect_market_group(inner, group_id).await {
            inner.emit_market_error(err).await;
        }
    }
    let user_groups = inner.users.groups_to_reconnect_and_cleanup().await;
    for group_id in user_groups {
        if let Err(err) = connect_user_group(inner, group_id).await {
            let api_key = inner.users.api_key_of(group_id).await.unwrap_or_default();
            inner.emit_user_error(&api_key, err).await;
        }
    }
}

impl ManagerInner {
    /// Decode and dispatch one market-channel text frame.
    ///
    /// Events are filtered to assets currently held by an active group, the
    /// cache is updated, and one batch per event type goes to the handlers
    /// in arrival order, followed by at most one derived displayed-price
    /// event per touched asset.
    pub(crate) async fn handle_market_text(&self, group_id: GroupId, epoch: u64, text: &str) {
        if websocket::is_keepalive_text(text) {
            return;
        }
        let events = match websocket::decode_market_frame(text) {
            Ok(events) => events,
            Err(err) => {
                self.emit_market_error(err).await;
                return;
            }
        };
        if self.markets.current_epoch(group_id).await != Some(epoch) {
            debug!(group = group_id, "dropping frame from replaced market socket");
            return;
        }

        let mut books = Vec::new();
        let mut price_changes = Vec::new();
        let mut tick_size_changes = Vec::new();
        let mut last_trade_prices = Vec::new();
        let mut touched: Vec<String> = Vec::new();

        for event in events {
            match event {
                MarketEvent::Book(book) => {
                    if !self.markets.is_subscribed(&book.asset_id).await {
                        continue;
                    }
                    self.cache.apply_book(&book.asset_id, &book.bids, &book.asks);
                    touch(&mut touched, &book.asset_id);
                    books.push(book);
                }
                MarketEvent::PriceChange(mut event) => {
                    let changes = std::mem::take(&mut event.price_changes);
                    let mut kept = Vec::with_capacity(changes.len());
                    for change in changes {
                        if !self.markets.is_subscribed(&change.asset_id).await {
                            continue;
                        }
                        self.cache
                            .apply_price_change(&change.asset_id, std::slice::from_ref(&change));
                        touch(&mut touched, &change.asset_id);
                        kept.push(change);
                    }
                    if kept.is_empty() {
                        continue;
                    }
                    event.price_changes = kept;
                    price_changes.push(event);
                }
                MarketEvent::TickSizeChange(event) => {
                    if !self.markets.is_subscribed(&event.asset_id).await {
                        continue;
                    }
                    tick_size_changes.push(event);
                }
                MarketEvent::LastTradePrice(event) => {
                    if !self.markets.is_subscribed(&event.asset_id).await {
                        continue;
                    }
                    self.cache.apply_last_trade_price(&event.asset_id, event.price);
                    touch(&mut touched, &event.asset_id);
                    last_trade_prices.push(event);
                }
            }
        }

        // Derived events are coalesced: one per touched asset, computed
        // after the whole frame has been applied to the cache.
        let mut price_updates = Vec::new();
        for asset_id in &touched {
            if let Some(update) = self.cache.derive_price(asset_id) {
                price_updates.push(update);
            }
        }

        let handlers = &self.market_handlers;
        if !books.is_empty() {
            if let Some(callback) = &handlers.book {
                callback(books).await;
            }
        }
        if !price_changes.is_empty() {
            if let Some(callback) = &handlers.price_change {
                callback(price_changes).await;
            }
        }
        if !tick_size_changes.is_empty() {
            if let Some(callback) = &handlers.tick_size_change {
                callback(tick_size_changes).await;
            }
        }
        if !last_trade_prices.is_empty() {
            if let Some(callback) = &handlers.last_trade_price {
                callback(last_trade_prices).await;
            }
        }
        if !price_updates.is_empty() {
            if let Some(callback) = &handlers.price_update {
                callback(price_updates).await;
            }
        }
    }

    /// Decode and dispatch one user-channel text frame into trade and
    /// order batches.
    pub(crate) async fn handle_user_text(
        &self,
        group_id: GroupId,
        epoch: u64,
        api_key: &str,
        text: &str,
    ) {
        if websocket::is_keepalive_text(text) {
            return;
        }
        let (trades, orders) = match websocket::decode_user_frame(text) {
            Ok(batches) => batches,
            Err(err) => {
                self.emit_user_error(api_key, err).await;
                return;
            }
        };
        if self.users.current_epoch(group_id).await != Some(epoch) {
            debug!(api_key, "dropping frame from replaced user socket");
            return;
        }
        let handlers = self.user_handlers.read().clone();
        let Some(handlers) = handlers else { return };
        if !trades.is_empty() {
            if let Some(callback) = &handlers.trade {
                callback(api_key.to_string(), trades).await;
            }
        }
        if !orders.is_empty() {
            if let Some(callback) = &handlers.order {
                callback(api_key.to_string(), orders).await;
            }
        }
    }

    pub(crate) async fn emit_market_error(&self, err: Error) {
        match &self.market_handlers.error {
            Some(callback) => callback(err).await,
            None => warn!(error = %err, "market channel error with no handler installed"),
        }
    }

    pub(crate) async fn emit_market_ws_open(&self, group_id: GroupId, assets: Vec<String>) {
        if let Some(callback) = &self.market_handlers.ws_open {
            callback(group_id, assets).await;
        }
    }

    pub(crate) async fn emit_market_ws_close(&self, group_id: GroupId, code: u16, reason: String) {
        if let Some(callback) = &self.market_handlers.ws_close {
            callback(group_id, code, reason).await;
        }
    }

    pub(crate) async fn emit_user_ws_open(&self, api_key: &str) {
        let callback = self.user_handlers.read().clone().and_then(|h| h.ws_open);
        if let Some(callback) = callback {
            callback(api_key.to_string()).await;
        }
    }

    pub(crate) async fn emit_user_ws_close(&self, api_key: &str, code: u16, reason: String) {
        info!(api_key, code, reason = %reason, "user socket closed");
        let callback = self.user_handlers.read().clone().and_then(|h| h.ws_close);
        if let Some(callback) = callback {
            callback(api_key.to_string(), code, reason).await;
        }
    }

    pub(crate) async fn emit_user_error(&self, api_key: &str, err: Error) {
        let callback = self.user_handlers.read().clone().and_then(|h| h.error);
        match callback {
            Some(callback) => callback(api_key.to_string(), err).await,
            None => warn!(api_key, error = %err, "user channel error with no handler installed"),
        }
    }
}

fn touch(touched: &mut Vec<String>, asset_id: &str) {
    if !touched.iter().any(|existing| existing == asset_id) {
        touched.push(asset_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::GroupStatus;
    use crate::websocket::SocketHandle;
    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    // Nothing listens on the discard port, so connect attempts fail fast
    // without leaving the machine.
    fn test_options() -> Options {
        Options {
            market_url: "ws://127.0.0.1:9".to_string(),
            user_url: "ws://127.0.0.1:9".to_string(),
            reconnect_and_cleanup_interval: Duration::from_secs(3600),
            ..Options::default()
        }
    }

    #[derive(Clone, Default)]
    struct Captured {
        books: Arc<Mutex<Vec<String>>>,
        price_updates: Arc<Mutex<Vec<(String, String)>>>,
        errors: Arc<Mutex<Vec<String>>>,
    }

    fn capturing_handlers(captured: &Captured) -> MarketHandlers {
        let books = Arc::clone(&captured.books);
        let price_updates = Arc::clone(&captured.price_updates);
        let errors = Arc::clone(&captured.errors);
        MarketHandlers::new()
            .on_book(move |events| {
                let books = Arc::clone(&books);
                async move {
                    books.lock().extend(events.into_iter().map(|e| e.asset_id));
                }
            })
            .on_price_update(move |events| {
                let price_updates = Arc::clone(&price_updates);
                async move {
                    price_updates
                        .lock()
                        .extend(events.into_iter().map(|e| (e.asset_id, e.price.to_string())));
                }
            })
            .on_error(move |err| {
                let errors = Arc::clone(&errors);
                async move {
                    errors.lock().push(err.to_string());
                }
            })
    }

    async fn alive_group(manager: &SubscriptionManager, assets: &[&str]) -> (GroupId, u64) {
        manager
            .add_subscriptions(assets.iter().map(|s| s.to_string()).collect())
            .await;
        let group_id = manager.inner.markets.snapshot().await.last().unwrap().0;
        let epoch = manager.inner.markets.next_epoch();
        manager
            .inner
            .markets
            .install_socket(group_id, SocketHandle::new(epoch, CancellationToken::new()))
            .await
            .unwrap();
        (group_id, epoch)
    }

    #[tokio::test]
    async fn test_add_subscriptions_creates_group_and_attempts_one_connect() {
        let captured = Captured::default();
        let manager = SubscriptionManager::new(capturing_handlers(&captured), test_options());

        manager
            .add_subscriptions(vec!["a".to_string(), "b".to_string()])
            .await;

        assert_eq!(
            manager.subscribed_assets().await,
            vec!["a".to_string(), "b".to_string()]
        );
        // One group, one (failed) connect attempt, surfaced via on_error.
        assert_eq!(manager.inner.markets.snapshot().await.len(), 1);
        assert_eq!(captured.errors.lock().len(), 1);
        let groups = manager.inner.markets.snapshot().await;
        assert_eq!(groups[0].2, GroupStatus::Dead);
    }

    #[tokio::test]
    async fn test_dispatch_updates_cache_and_filters_unsubscribed() {
        let captured = Captured::default();
        let manager = SubscriptionManager::new(capturing_handlers(&captured), test_options());
        let (group_id, epoch) = alive_group(&manager, &["a", "b"]).await;

        let frame = r#"[
            {"event_type":"book","asset_id":"a","bids":[{"price":"0.50","size":"10"}],"asks":[{"price":"0.55","size":"10"}]},
            {"event_type":"book","asset_id":"z","bids":[{"price":"0.10","size":"1"}],"asks":[{"price":"0.90","size":"1"}]}
        ]"#;
        manager.inner.handle_market_text(group_id, epoch, frame).await;

        assert_eq!(*captured.books.lock(), vec!["a".to_string()]);
        assert_eq!(
            *captured.price_updates.lock(),
            vec![("a".to_string(), "0.525".to_string())]
        );
        assert!(manager.inner.cache.snapshot("a").is_some());
        assert!(manager.inner.cache.snapshot("z").is_none());
    }

    #[tokio::test]
    async fn test_derived_events_coalesce_per_asset() {
        let captured = Captured::default();
        let manager = SubscriptionManager::new(capturing_handlers(&captured), test_options());
        let (group_id, epoch) = alive_group(&manager, &["a"]).await;

        let frame = r#"[
            {"event_type":"book","asset_id":"a","bids":[{"price":"0.50","size":"10"}],"asks":[{"price":"0.55","size":"10"}]},
            {"event_type":"price_change","price_changes":[{"asset_id":"a","price":"0.52","side":"BUY","size":"5"}]},
            {"event_type":"last_trade_price","asset_id":"a","price":"0.53"}
        ]"#;
        manager.inner.handle_market_text(group_id, epoch, frame).await;

        // Three cache updates, exactly one derived event for the final state.
        let updates = captured.price_updates.lock();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0], ("a".to_string(), "0.535".to_string()));
    }

    #[tokio::test]
    async fn test_stale_epoch_frames_are_dropped() {
        let captured = Captured::default();
        let manager = SubscriptionManager::new(capturing_handlers(&captured), test_options());
        let (group_id, old_epoch) = alive_group(&manager, &["a"]).await;
        let errors_after_setup = captured.errors.lock().len();

        // Replace the socket; the old epoch is now stale.
        let new_epoch = manager.inner.markets.next_epoch();
        manager
            .inner
            .markets
            .install_socket(group_id, SocketHandle::new(new_epoch, CancellationToken::new()))
            .await
            .unwrap();

        let frame =
            r#"{"event_type":"book","asset_id":"a","bids":[{"price":"0.50","size":"1"}],"asks":[]}"#;
        manager
            .inner
            .handle_market_text(group_id, old_epoch, frame)
            .await;
        assert!(captured.books.lock().is_empty());
        assert!(manager.inner.cache.snapshot("a").is_none());

        // A stale transport failure must not flip the live group to DEAD.
        manager
            .inner
            .market_socket_failed(group_id, old_epoch, Error::WebSocket("late".to_string()))
            .await;
        assert_eq!(captured.errors.lock().len(), errors_after_setup);
        let groups = manager.inner.markets.snapshot().await;
        assert_eq!(groups[0].2, GroupStatus::Alive);
    }

    #[tokio::test]
    async fn test_regroup_window_still_delivers_old_socket_events() {
        let captured = Captured::default();
        let options = Options {
            max_markets_per_ws: 3,
            ..test_options()
        };
        let manager = SubscriptionManager::new(capturing_handlers(&captured), options);
        let (old_group, old_epoch) = alive_group(&manager, &["a", "b"]).await;

        // Growing past the original allocation retires the old group and
        // creates a replacement holding the union.
        manager.add_subscriptions(vec!["c".to_string()]).await;
        let groups = manager.inner.markets.snapshot().await;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, old_group);
        assert_eq!(groups[0].2, GroupStatus::Cleanup);
        assert_eq!(groups[1].1, vec!["a", "b", "c"]);

        // Events still arriving on the old socket pass the filter because
        // the replacement group owns the assets.
        let frame =
            r#"{"event_type":"book","asset_id":"a","bids":[{"price":"0.40","size":"1"}],"asks":[{"price":"0.45","size":"1"}]}"#;
        manager
            .inner
            .handle_market_text(old_group, old_epoch, frame)
            .await;
        assert_eq!(*captured.books.lock(), vec!["a".to_string()]);

        // The next pass removes the retired group and closes its socket.
        run_reconnect_pass(&manager.inner).await;
        let groups = manager.inner.markets.snapshot().await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_remove_subscriptions_drops_cache_entries() {
        let captured = Captured::default();
        let manager = SubscriptionManager::new(capturing_handlers(&captured), test_options());
        let (group_id, epoch) = alive_group(&manager, &["a"]).await;

        let frame =
            r#"{"event_type":"last_trade_price","asset_id":"a","price":"0.6"}"#;
        manager.inner.handle_market_text(group_id, epoch, frame).await;
        assert!(manager.inner.cache.snapshot("a").is_some());

        manager.remove_subscriptions(vec!["a".to_string()]).await;
        assert!(manager.inner.cache.snapshot("a").is_none());
        assert!(manager.subscribed_assets().await.is_empty());

        // Post-removal frames are filtered out.
        manager.inner.handle_market_text(group_id, epoch, frame).await;
        assert!(manager.inner.cache.snapshot("a").is_none());
    }

    #[tokio::test]
    async fn test_connect_user_socket_requires_handlers() {
        let captured = Captured::default();
        let manager = SubscriptionManager::new(capturing_handlers(&captured), test_options());

        manager
            .connect_user_socket(Auth::new("user1", "s", "p"))
            .await;

        assert!(manager.connected_users().await.is_empty());
        let errors = captured.errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("set_user_handlers"));
    }

    #[tokio::test]
    async fn test_user_lifecycle_with_handlers() {
        let captured = Captured::default();
        let manager = SubscriptionManager::new(capturing_handlers(&captured), test_options());

        let user_errors: Arc<Mutex<Vec<String>>> = Arc::default();
        let sink = Arc::clone(&user_errors);
        manager
            .set_user_handlers(UserHandlers::new().on_error(move |key, err| {
                let sink = Arc::clone(&sink);
                async move {
                    sink.lock().push(format!("{key}: {err}"));
                }
            }))
            .await;

        manager
            .connect_user_socket(Auth::new("user1", "s", "p"))
            .await;
        assert_eq!(manager.connected_users().await, vec!["user1".to_string()]);
        // The connect attempt failed and went to the user error handler,
        // not the market one.
        assert_eq!(user_errors.lock().len(), 1);
        assert!(captured.errors.lock().is_empty());

        // Second connect for the same key is a no-op.
        manager
            .connect_user_socket(Auth::new("user1", "s", "p"))
            .await;
        assert_eq!(manager.connected_users().await.len(), 1);

        manager.disconnect_user_socket("user1").await;
        assert!(manager.connected_users().await.is_empty());
    }

    #[tokio::test]
    async fn test_clear_state_closes_everything() {
        let captured = Captured::default();
        let manager = SubscriptionManager::new(capturing_handlers(&captured), test_options());
        let (group_id, epoch) = alive_group(&manager, &["a"]).await;
        let frame = r#"{"event_type":"last_trade_price","asset_id":"a","price":"0.6"}"#;
        manager.inner.handle_market_text(group_id, epoch, frame).await;
        let has_socket = manager
            .inner
            .markets
            .snapshot()
            .await
            .first()
            .map(|entry| entry.3)
            .unwrap();
        assert!(has_socket);

        manager.clear_state().await;
        assert!(manager.subscribed_assets().await.is_empty());
        assert!(manager.inner.cache.is_empty());
        assert!(manager.inner.markets.snapshot().await.is_empty());
    }
}
