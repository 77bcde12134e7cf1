use std::sync::Arc;
use std::time::Duration;

use crate::limiter::BurstLimiter;
use crate::websocket::{MARKET_WS_URL, USER_WS_URL};

/// Configuration for [`SubscriptionManager`](crate::SubscriptionManager).
///
/// Every field has a production default; construct with struct-update
/// syntax to override a subset:
///
/// ```
/// use polymarket_ws::Options;
///
/// let options = Options {
///     max_markets_per_ws: 50,
///     ..Options::default()
/// };
/// assert_eq!(options.reconnect_and_cleanup_interval.as_secs(), 10);
/// ```
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum asset ids multiplexed onto one market connection.
    pub max_markets_per_ws: usize,
    /// Period of the reconnect/cleanup pass.
    pub reconnect_and_cleanup_interval: Duration,
    /// Connect-burst limiter override; defaults to 5 connects per second.
    pub burst_limiter: Option<Arc<BurstLimiter>>,
    /// Market-channel endpoint.
    pub market_url: String,
    /// User-channel endpoint.
    pub user_url: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_markets_per_ws: 100,
            reconnect_and_cleanup_interval: Duration::from_secs(10),
            burst_limiter: None,
            market_url: MARKET_WS_URL.to_string(),
            user_url: USER_WS_URL.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert_eq!(options.max_markets_per_ws, 100);
        assert_eq!(options.reconnect_and_cleanup_interval, Duration::from_secs(10));
        assert!(options.burst_limiter.is_none());
        assert!(options.market_url.ends_with("/ws/market"));
        assert!(options.user_url.ends_with("/ws/user"));
    }
}
