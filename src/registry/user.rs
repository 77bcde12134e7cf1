//! User-channel group registry.
//!
//! Simpler than the market side: one group per API key, no capacity or
//! regrouping. A user group is never merged with another.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;

use super::{GroupId, GroupStatus, KeepaliveState};
use crate::types::Auth;
use crate::websocket::SocketHandle;

#[derive(Debug)]
pub(crate) struct UserGroup {
    pub id: GroupId,
    pub api_key: String,
    pub auth: Auth,
    pub socket: Option<SocketHandle>,
    pub status: GroupStatus,
}

pub(crate) struct UserRegistry {
    groups: Mutex<Vec<UserGroup>>,
    next_group_id: AtomicU64,
    next_epoch: AtomicU64,
}

impl UserRegistry {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(Vec::new()),
            next_group_id: AtomicU64::new(0),
            next_epoch: AtomicU64::new(0),
        }
    }

    async fn mutate<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&mut Vec<UserGroup>) -> R,
    {
        let mut groups = self.groups.lock().await;
        f(&mut groups)
    }

    pub fn next_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Create a group for this user unless one already exists. Returns the
    /// new group's id only when a group was actually created.
    pub async fn add_user(&self, auth: Auth) -> Option<GroupId> {
        self.mutate(|groups| {
            if groups.iter().any(|g| g.api_key == auth.key) {
                return None;
            }
            let id = self.next_group_id.fetch_add(1, Ordering::Relaxed) + 1;
            groups.push(UserGroup {
                id,
                api_key: auth.key.clone(),
                auth,
                socket: None,
                status: GroupStatus::Pending,
            });
            Some(id)
        })
        .await
    }

    /// Remove the user's group, returning its socket for the caller to
    /// close.
    pub async fn remove_user(&self, api_key: &str) -> Option<SocketHandle> {
        self.mutate(|groups| {
            let index = groups.iter().position(|g| g.api_key == api_key)?;
            groups.remove(index).socket
        })
        .await
    }

    /// Same state machine as the market registry minus the emptiness check.
    pub async fn groups_to_reconnect_and_cleanup(&self) -> Vec<GroupId> {
        self.mutate(|groups| {
            let mut reconnect = Vec::new();
            let mut remove = Vec::new();
            for (index, group) in groups.iter_mut().enumerate() {
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
                if let Some(socket) = group.socket {
                    socket.close();
                }
            }
            reconnect
        })
        .await
    }

    pub async fn prepare_connect(&self, id: GroupId) -> Option<Auth> {
        self.mutate(|groups| groups.iter().find(|g| g.id == id).map(|g| g.auth.clone()))
            .await
    }

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

    pub async fn mark_dead(&self, id: GroupId) {
        self.mutate(|groups| {
            if let Some(group) = groups.iter_mut().find(|g| g.id == id) {
                group.status = GroupStatus::Dead;
            }
        })
        .await
    }

    pub async fn keepalive_state(&self, id: GroupId, epoch: u64) -> KeepaliveState {
        self.mutate(|groups| {
            let Some(group) = groups.iter().find(|g| g.id == id) else {
                return KeepaliveState::Stop;
            };
            if group.socket.as_ref().map(|s| s.epoch()) != Some(epoch) {
                return KeepaliveState::Stop;
            }
            KeepaliveState::Ping
        })
        .await
    }

    pub async fn api_key_of(&self, id: GroupId) -> Option<String> {
        self.mutate(|groups| groups.iter().find(|g| g.id == id).map(|g| g.api_key.clone()))
            .await
    }

    pub async fn clear(&self) -> Vec<SocketHandle> {
        self.mutate(|groups| groups.drain(..).filter_map(|g| g.socket).collect())
            .await
    }

    /// API keys with a registered group, in insertion order.
    pub async fn connected_users(&self) -> Vec<String> {
        self.mutate(|groups| groups.iter().map(|g| g.api_key.clone()).collect())
            .await
    }
}
