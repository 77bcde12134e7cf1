//! Group registries: the shared state behind the subscription manager.
//!
//! A group is one socket plus the set of subscriptions it multiplexes.
//! Each registry keeps its group list behind a single async mutex; all
//! mutation goes through a `mutate` helper so callers never hold the lock
//! across I/O.

mod market;
mod user;

pub(crate) use market::MarketRegistry;
pub(crate) use user::UserRegistry;

/// Unique identifier of a connection group.
pub type GroupId = u64;

/// Lifecycle state of a connection group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// Created but not yet connected, or waiting for the next connect pass.
    Pending,
    /// Socket open and subscribed.
    Alive,
    /// Socket lost; the next reconnect pass will retry.
    Dead,
    /// Superseded or drained; the next cleanup pass removes it.
    Cleanup,
}

/// Outcome of a keepalive tick, decided under the registry lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepaliveState {
    /// Socket is current and live: send a protocol ping.
    Ping,
    /// Stop the keepalive timer; the socket is stale, drained, or gone.
    Stop,
}
