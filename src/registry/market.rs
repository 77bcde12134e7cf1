//! Market-channel group registry.
//!
//! Allocates asset ids onto connection groups under a per-group capacity
//! limit. Growing a group never mutates its live socket: a replacement
//! group with the expanded id set is created instead, and the old group is
//! marked [`GroupStatus::Cleanup`] with its socket deliberately left open
//! until the next cleanup pass, so no in-flight events are lost while the
//! replacement connects.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{GroupId, GroupStatus, KeepaliveState};
use crate::websocket::SocketHandle;

#[derive(Debug)]
pub(crate) struct MarketGroup {
    pub id: GroupId,
    pub asset_ids: Vec<String>,
    pub socket: Option<SocketHandle>,
    pub status: GroupStatus,
}

pub(crate) struct MarketRegistry {
    groups: Mutex<Vec<MarketGroup>>,
    next_group_id: AtomicU64,
    next_epoch: AtomicU64,
}

impl MarketRegistry {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(Vec::new()),
            next_group_id: AtomicU64::new(0),
            next_epoch: AtomicU64::new(0),
        }
    }

    /// Run `f` with exclusive access to the group list. `f` must not block;
    /// callers do I/O outside the lock using the ids it returns.
    async fn mutate<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Vec<MarketGroup>) -> R,
    {
        let mut groups = self.groups.lock().await;
        f(&mut groups)
    }

    fn next_group_id(&self) -> GroupId {
        self.next_group_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Add asset ids, returning the ids of groups that need a connect.
    ///
    /// Ids already present anywhere are dropped. If no existing group can
    /// absorb the whole residual it is chunked into fresh groups of at most
    /// `max`. Otherwise the first group with capacity is replaced by a new
    /// group holding the union, and the old one becomes CLEANUP with its
    /// asset set emptied so the dispatcher stops routing to it immediately.
    pub async fn add_assets(&self, ids: &[String], max: usize) -> Vec<GroupId> {
        self.mutate(|groups| {
            let mut residual: Vec<String> = Vec::new();
            for id in ids {
                if residual.contains(id) {
                    continue;
                }
                let present = groups
                    .iter()
                    .any(|g| g.asset_ids.iter().any(|a| a == id));
                if !present {
                    residual.push(id.clone());
                }
            }
            if residual.is_empty() {
                return Vec::new();
            }

            match find_group_with_capacity(groups, residual.len(), max) {
                None => residual
                    .chunks(max)
                    .map(|chunk| {
                        let id = self.next_group_id();
                        groups.push(MarketGroup {
                            id,
                            asset_ids: chunk.to_vec(),
                            socket: None,
                            status: GroupStatus::Pending,
                        });
                        id
                    })
                    .collect(),
                Some(slot) => {
                    let mut merged = std::mem::take(&mut groups[slot].asset_ids);
                    merged.extend(residual);
                    groups[slot].status = GroupStatus::Cleanup;
                    let id = self.next_group_id();
                    debug!(
                        old_group = groups[slot].id,
                        new_group = id,
                        assets = merged.len(),
                        "regrouping onto replacement socket"
                    );
                    groups.push(MarketGroup {
                        id,
                        asset_ids: merged,
                        socket: None,
                        status: GroupStatus::Pending,
                    });
                    vec![id]
                }
            }
        })
        .await
    }

    /// Delete asset ids from every group, returning the ids actually
    /// removed. Shrunken groups keep their sockets; an emptied group is
    /// garbage-collected on the next cleanup pass.
    pub async fn remove_assets(&self, ids: &[String]) -> Vec<String> {
        self.mutate(|groups| {
            let mut removed: Vec<String> = Vec::new();
            for group in groups.iter_mut() {
                group.asset_ids.retain(|asset| {
                    if ids.contains(asset) {
                        if !removed.contains(asset) {
                            removed.push(asset.clone());
                        }
                        false
                    } else {
                        true
                    }
                });
            }
            removed
        })
        .await
    }

    /// One cleanup pass over the group list: drop empty and CLEANUP groups
    /// (closing their sockets), detach DEAD sockets, and return the ids of
    /// groups that should be (re)connected.
    pub async fn groups_to_reconnect_and_cleanup(&self) -> Vec<GroupId> {
        self.mutate(|groups| {
            let mut reconnect = Vec::new();
            let mut remove = Vec::new();
            for (index, group) in groups.iter_mut().enumerate() {
                // A group that shrank to zero assets is collected here;
                // retired CLEANUP groups go through their own arm below.
                if group.asset_ids.is_empty() && group.status != GroupStatus::Cleanup {
                    remove.push(index);
                    continue;
                }
                match group.status {
                    GroupStatus::Alive => {}
                    GroupStatus::Dead => {
                        if let Some(socket) = group.socket.take() {
                            socket.close();
                        }
                        reconnect.push(group.id);
                    }
                    GroupStatus::Cleanup => remove.push(index),
                    GroupStatus::Pending => reconnect.push(group.id),
                }
            }
            for index in remove.into_iter().rev() {
                let group = groups.remove(index);
                debug!(group = group.id, "removing drained group");
                if let Some(socket) = group.socket {
                    socket.close();
                }
            }
            reconnect
        })
        .await
    }

    /// Whether an asset belongs to any non-CLEANUP group. More than one
    /// owning group is a transient regrouping window; it is logged and the
    /// asset still counts as subscribed.
    pub async fn is_subscribed(&self, asset_id: &str) -> bool {
        self.mutate(|groups| {
            let owners = groups
                .iter()
                .filter(|g| {
                    g.status != GroupStatus::Cleanup && g.asset_ids.iter().any(|a| a == asset_id)
                })
                .count();
            if owners > 1 {
                warn!(asset_id, owners, "asset held by multiple active groups");
            }
            owners > 0
        })
        .await
    }

    /// Asset ids of the group, or `None` if the group is gone or drained.
    /// A drained group is marked CLEANUP on the spot.
    pub async fn prepare_connect(&self, id: GroupId) -> Option<Vec<String>> {
        self.mutate(|groups| {
            let group = groups.iter_mut().find(|g| g.id == id)?;
            if group.asset_ids.is_empty() {
                group.status = GroupStatus::Cleanup;
                return None;
            }
            Some(group.asset_ids.clone())
        })
        .await
    }

    /// Install a freshly opened socket, marking the group ALIVE. Returns
    /// the previous handle for the caller to close, or gives the handle
    /// back if the group no longer exists.
    pub async fn install_socket(
        &self,
        id: GroupId,
        handle: SocketHandle,
    ) -> std::result::Result<Option<SocketHandle>, SocketHandle> {
        self.mutate(move |groups| match groups.iter_mut().find(|g| g.id == id) {
            Some(group) => {
                group.status = GroupStatus::Alive;
                Ok(std::mem::replace(&mut group.socket, Some(handle)))
            }
            None => Err(handle),
        })
        .await
    }

    /// Epoch of the group's current socket, if any.
    pub async fn current_epoch(&self, id: GroupId) -> Option<u64> {
        self.mutate(|groups| {
            groups
                .iter()
                .find(|g| g.id == id)
                .and_then(|g| g.socket.as_ref())
                .map(|s| s.epoch())
        })
        .await
    }

    /// Set the group's status only if `epoch` still names its current
    /// socket. Returns whether the write happened; a stale epoch is the
    /// signature of a callback from a replaced transport.
    pub async fn set_status_if_current(
        &self,
        id: GroupId,
        epoch: u64,
        status: GroupStatus,
    ) -> bool {
        self.mutate(|groups| {
            let Some(group) = groups.iter_mut().find(|g| g.id == id) else {
                return false;
            };
            if group.socket.as_ref().map(|s| s.epoch()) != Some(epoch) {
                return false;
            }
            group.status = status;
            true
        })
        .await
    }

    /// Mark a group DEAD after a failed connect (no socket installed).
    pub async fn mark_dead(&self, id: GroupId) {
        self.mutate(|groups| {
            if let Some(group) = groups.iter_mut().find(|g| g.id == id) {
                group.status = GroupStatus::Dead;
            }
        })
        .await
    }

    /// Decide what this keepalive tick should do for the given socket.
    pub async fn keepalive_state(&self, id: GroupId, epoch: u64) -> KeepaliveState {
        self.mutate(|groups| {
            let Some(group) = groups.iter_mut().find(|g| g.id == id) else {
                return KeepaliveState::Stop;
            };
            if group.socket.as_ref().map(|s| s.epoch()) != Some(epoch) {
                return KeepaliveState::Stop;
            }
            if group.asset_ids.is_empty() {
                group.status = GroupStatus::Cleanup;
                return KeepaliveState::Stop;
            }
            KeepaliveState::Ping
        })
        .await
    }

    /// Remove every group, returning the sockets for the caller to close.
    pub async fn clear(&self) -> Vec<SocketHandle> {
        self.mutate(|groups| groups.drain(..).filter_map(|g| g.socket).collect())
            .await
    }

    /// Union of asset ids across all non-CLEANUP groups.
    pub async fn subscribed_assets(&self) -> Vec<String> {
        self.mutate(|groups| {
            let mut assets: Vec<String> = Vec::new();
            for group in groups.iter().filter(|g| g.status != GroupStatus::Cleanup) {
                for asset in &group.asset_ids {
                    if !assets.contains(asset) {
                        assets.push(asset.clone());
                    }
                }
            }
            assets
        })
        .await
    }

    #[cfg(test)]
    pub async fn snapshot(&self) -> Vec<(GroupId, Vec<String>, GroupStatus, bool)> {
        self.mutate(|groups| {
            groups
                .iter()
                .map(|g| (g.id, g.asset_ids.clone(), g.status, g.socket.is_some()))
                .collect()
        })
        .await
    }
}

/// First non-empty group able to absorb `count` more assets.
fn find_group_with_capacity(groups: &[MarketGroup], count: usize, max: usize) -> Option<usize> {
    groups
        .iter()
        .position(|g| !g.asset_ids.is_empty() && g.asset_ids.len() + count <= max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn handle(registry: &MarketRegistry) -> SocketHandle {
        SocketHandle::new(registry.next_epoch(), CancellationToken::new())
    }

    #[test]
    fn test_find_group_with_capacity_skips_empty_and_full() {
        let groups = vec![
            MarketGroup {
                id: 1,
                asset_ids: vec![],
                socket: None,
                status: GroupStatus::Cleanup,
            },
            MarketGroup {
                id: 2,
                asset_ids: ids(&["a", "b"]),
                socket: None,
                status: GroupStatus::Alive,
            },
        ];
        assert_eq!(find_group_with_capacity(&groups, 1, 3), Some(1));
        assert_eq!(find_group_with_capacity(&groups, 2, 3), None);
    }

    #[tokio::test]
    async fn test_add_creates_single_pending_group() {
        let registry = MarketRegistry::new();
        let to_connect = registry.add_assets(&ids(&["a", "b"]), 100).await;
        assert_eq!(to_connect.len(), 1);

        let groups = registry.snapshot().await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1, ids(&["a", "b"]));
        assert_eq!(groups[0].2, GroupStatus::Pending);
    }

    #[tokio::test]
    async fn test_add_ignores_already_subscribed_assets() {
        let registry = MarketRegistry::new();
        registry.add_assets(&ids(&["a", "b"]), 100).await;
        let to_connect = registry.add_assets(&ids(&["a", "b"]), 100).await;
        assert!(to_connect.is_empty());
        assert_eq!(registry.snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn test_add_without_capacity_creates_new_group() {
        let registry = MarketRegistry::new();
        registry.add_assets(&ids(&["a", "b"]), 2).await;
        let to_connect = registry.add_assets(&ids(&["c"]), 2).await;
        assert_eq!(to_connect.len(), 1);

        let groups = registry.snapshot().await;
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].1, ids(&["a", "b"]));
        assert_eq!(groups[0].2, GroupStatus::Pending);
        assert_eq!(groups[1].1, ids(&["c"]));
    }

    #[tokio::test]
    async fn test_add_with_capacity_regroups() {
        let registry = MarketRegistry::new();
        let first = registry.add_assets(&ids(&["a", "b"]), 3).await;
        let second = registry.add_assets(&ids(&["c"]), 3).await;
        assert_eq!(second.len(), 1);
        assert_ne!(first[0], second[0]);

        let groups = registry.snapshot().await;
        assert_eq!(groups.len(), 2);
        // The old group is retired in place: CLEANUP with no assets.
        assert_eq!(groups[0].2, GroupStatus::Cleanup);
        assert!(groups[0].1.is_empty());
        assert_eq!(groups[1].1, ids(&["a", "b", "c"]));
        assert_eq!(groups[1].2, GroupStatus::Pending);
    }

    #[tokio::test]
    async fn test_regrouped_group_is_removed_on_cleanup_pass() {
        let registry = MarketRegistry::new();
        let original = registry.add_assets(&ids(&["a", "b"]), 3).await[0];
        let socket = handle(&registry);
        let token = socket.token();
        registry.install_socket(original, socket).await.unwrap();
        let replacement = registry.add_assets(&ids(&["c"]), 3).await[0];

        // The retired group kept its socket open through the regroup
        // window; the pass removes it via the CLEANUP rule and closes it.
        assert!(!token.is_cancelled());
        let reconnect = registry.groups_to_reconnect_and_cleanup().await;
        assert_eq!(reconnect, vec![replacement]);
        assert!(token.is_cancelled());

        let groups = registry.snapshot().await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].0, replacement);
    }

    #[tokio::test]
    async fn test_oversized_add_is_chunked() {
        let registry = MarketRegistry::new();
        let to_connect = registry
            .add_assets(&ids(&["a", "b", "c", "d", "e"]), 2)
            .await;
        assert_eq!(to_connect.len(), 3);

        let groups = registry.snapshot().await;
        let sizes: Vec<usize> = groups.iter().map(|g| g.1.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert!(groups.iter().all(|g| g.1.len() <= 2));
    }

    #[tokio::test]
    async fn test_remove_assets_keeps_shrunken_group() {
        let registry = MarketRegistry::new();
        registry.add_assets(&ids(&["a", "b"]), 100).await;
        let removed = registry.remove_assets(&ids(&["a", "z"])).await;
        assert_eq!(removed, ids(&["a"]));

        let groups = registry.snapshot().await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].1, ids(&["b"]));
    }

    #[tokio::test]
    async fn test_emptied_group_is_collected_on_next_pass() {
        let registry = MarketRegistry::new();
        registry.add_assets(&ids(&["a"]), 100).await;
        registry.remove_assets(&ids(&["a"])).await;
        registry.groups_to_reconnect_and_cleanup().await;
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_dead_group_socket_is_detached_and_reconnected() {
        let registry = MarketRegistry::new();
        let group = registry.add_assets(&ids(&["a"]), 100).await[0];
        let socket = handle(&registry);
        let token = socket.token();
        registry.install_socket(group, socket).await.unwrap();
        let epoch = registry.current_epoch(group).await.unwrap();
        assert!(registry
            .set_status_if_current(group, epoch, GroupStatus::Dead)
            .await);

        let reconnect = registry.groups_to_reconnect_and_cleanup().await;
        assert_eq!(reconnect, vec![group]);
        assert!(token.is_cancelled());
        assert!(registry.current_epoch(group).await.is_none());
    }

    #[tokio::test]
    async fn test_alive_group_is_skipped() {
        let registry = MarketRegistry::new();
        let group = registry.add_assets(&ids(&["a"]), 100).await[0];
        registry.install_socket(group, handle(&registry)).await.unwrap();
        assert!(registry.groups_to_reconnect_and_cleanup().await.is_empty());
    }

    #[tokio::test]
    async fn test_stale_epoch_cannot_change_status() {
        let registry = MarketRegistry::new();
        let group = registry.add_assets(&ids(&["a"]), 100).await[0];
        registry.install_socket(group, handle(&registry)).await.unwrap();
        let old_epoch = registry.current_epoch(group).await.unwrap();
        registry.install_socket(group, handle(&registry)).await.unwrap();

        assert!(!registry
            .set_status_if_current(group, old_epoch, GroupStatus::Dead)
            .await);
        let groups = registry.snapshot().await;
        assert_eq!(groups[0].2, GroupStatus::Alive);
    }

    #[tokio::test]
    async fn test_keepalive_state_transitions() {
        let registry = MarketRegistry::new();
        let group = registry.add_assets(&ids(&["a"]), 100).await[0];
        registry.install_socket(group, handle(&registry)).await.unwrap();
        let epoch = registry.current_epoch(group).await.unwrap();

        assert_eq!(
            registry.keepalive_state(group, epoch).await,
            KeepaliveState::Ping
        );
        assert_eq!(
            registry.keepalive_state(group, epoch + 1).await,
            KeepaliveState::Stop
        );

        registry.remove_assets(&ids(&["a"])).await;
        assert_eq!(
            registry.keepalive_state(group, epoch).await,
            KeepaliveState::Stop
        );
        let groups = registry.snapshot().await;
        assert_eq!(groups[0].2, GroupStatus::Cleanup);
    }

    #[tokio::test]
    async fn test_subscription_lookup_ignores_cleanup_groups() {
        let registry = MarketRegistry::new();
        registry.add_assets(&ids(&["a", "b"]), 3).await;
        registry.add_assets(&ids(&["c"]), 3).await;

        // The CLEANUP group was emptied; only the replacement owns assets.
        assert!(registry.is_subscribed("a").await);
        assert!(registry.is_subscribed("c").await);
        assert!(!registry.is_subscribed("z").await);
        assert_eq!(registry.subscribed_assets().await, ids(&["a", "b", "c"]));
    }

    #[tokio::test]
    async fn test_clear_returns_all_sockets() {
        let registry = MarketRegistry::new();
        let g1 = registry.add_assets(&ids(&["a"]), 1).await[0];
        let g2 = registry.add_assets(&ids(&["b"]), 1).await[0];
        registry.install_socket(g1, handle(&registry)).await.unwrap();
        registry.install_socket(g2, handle(&registry)).await.unwrap();

        let sockets = registry.clear().await;
        assert_eq!(sockets.len(), 2);
        assert!(registry.snapshot().await.is_empty());
    }
}
