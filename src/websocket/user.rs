//! User-channel group socket.
//!
//! Mirrors the market socket with two differences: the subscription frame
//! authenticates instead of listing assets, and handler callbacks carry
//! the API key rather than a group id.

use std::sync::{Arc, Weak};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{close_parts, keepalive_period, SocketHandle};
use crate::error::{Error, Result};
use crate::manager::ManagerInner;
use crate::registry::{GroupId, GroupStatus, KeepaliveState};
use crate::types::UserSubscription;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Open a connection for one user group and hand it to a background run
/// loop. Credentials are sent verbatim inside the first text frame.
pub(crate) async fn connect_user_group(
    inner: &Arc<ManagerInner>,
    group_id: GroupId,
) -> Result<()> {
    if inner.users.prepare_connect(group_id).await.is_none() {
        return Ok(());
    }
    let url = inner.options.user_url.clone();
    let connected = inner
        .limiter
        .schedule(async move { connect_async(&url).await })
        .await;
    let (stream, _) = match connected {
        Ok(ok) => ok,
        Err(err) => {
            inner.users.mark_dead(group_id).await;
            return Err(err.into());
        }
    };

    // Re-read in case the user was disconnected while the connect was in
    // flight.
    let Some(auth) = inner.users.prepare_connect(group_id).await else {
        return Ok(());
    };
    let api_key = auth.key.clone();

    let (mut write, read) = stream.split();
    let frame = serde_json::to_string(&UserSubscription::new(&auth))?;
    if let Err(err) = write.send(Message::Text(frame)).await {
        inner.users.mark_dead(group_id).await;
        return Err(err.into());
    }

    let token = CancellationToken::new();
    let epoch = inner.users.next_epoch();
    match inner
        .users
        .install_socket(group_id, SocketHandle::new(epoch, token.clone()))
        .await
    {
        Ok(previous) => {
            if let Some(previous) = previous {
                previous.close();
            }
        }
        Err(handle) => {
            handle.close();
            let _ = write.close().await;
            return Ok(());
        }
    }

    info!(api_key = %api_key, "user socket open");
    inner.emit_user_ws_open(&api_key).await;
    tokio::spawn(run_user_socket(
        Arc::downgrade(inner),
        group_id,
        epoch,
        api_key,
        write,
        read,
        token,
    ));
    Ok(())
}

async fn run_user_socket(
    inner: Weak<ManagerInner>,
    group_id: GroupId,
    epoch: u64,
    api_key: String,
    mut write: WsSink,
    mut read: WsSource,
    token: CancellationToken,
) {
    let period = keepalive_period(&mut rand::thread_rng());
    let mut keepalive = tokio::time::interval(period);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await;
    let mut keepalive_on = true;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(api_key = %api_key, "user socket closed by handle");
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            _ = keepalive.tick(), if keepalive_on => {
                let Some(inner) = inner.upgrade() else { break };
                match inner.users.keepalive_state(group_id, epoch).await {
                    KeepaliveState::Stop => {
                        debug!(api_key = %api_key, "user keepalive stopped");
                        keepalive_on = false;
                    }
                    KeepaliveState::Ping => {
                        if let Err(err) = write.send(Message::Ping(Vec::new())).await {
                            inner
                                .user_socket_failed(group_id, epoch, &api_key, Error::from(err))
                                .await;
                            break;
                        }
                    }
                }
            }
            message = read.next() => {
                let Some(inner) = inner.upgrade() else { break };
                match message {
                    Some(Ok(Message::Text(text))) => {
                        inner.handle_user_text(group_id, epoch, &api_key, &text).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = close_parts(frame);
                        inner
                            .user_socket_closed(group_id, epoch, &api_key, code, reason)
                            .await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        inner
                            .user_socket_failed(group_id, epoch, &api_key, Error::from(err))
                            .await;
                        break;
                    }
                    None => {
                        inner
                            .user_socket_closed(
                                group_id,
                                epoch,
                                &api_key,
                                1006,
                                "stream ended".to_string(),
                            )
                            .await;
                        break;
                    }
                }
            }
        }
    }
}

impl ManagerInner {
    pub(crate) async fn user_socket_failed(
        &self,
        group_id: GroupId,
        epoch: u64,
        api_key: &str,
        err: Error,
    ) {
        if self
            .users
            .set_status_if_current(group_id, epoch, GroupStatus::Dead)
            .await
        {
            self.emit_user_error(api_key, err).await;
        }
    }

    pub(crate) async fn user_socket_closed(
        &self,
        group_id: GroupId,
        epoch: u64,
        api_key: &str,
        code: u16,
        reason: String,
    ) {
        if self
            .users
            .set_status_if_current(group_id, epoch, GroupStatus::Dead)
            .await
        {
            self.emit_user_ws_close(api_key, code, reason).await;
        }
    }
}
