//! Market-channel group socket.

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
use crate::types::MarketSubscription;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Open a connection for one market group and hand it to a background run
/// loop. A group that has been drained in the meantime is marked CLEANUP
/// instead of connecting; a failed open marks the group DEAD and the error
/// propagates for the manager to surface.
pub(crate) async fn connect_market_group(
    inner: &Arc<ManagerInner>,
    group_id: GroupId,
) -> Result<()> {
    if inner.markets.prepare_connect(group_id).await.is_none() {
        return Ok(());
    }
    let url = inner.options.market_url.clone();
    let connected = inner
        .limiter
        .schedule(async move { connect_async(&url).await })
        .await;
    let (stream, _) = match connected {
        Ok(ok) => ok,
        Err(err) => {
            inner.markets.mark_dead(group_id).await;
            return Err(err.into());
        }
    };

    // The group may have been drained or removed while the connect was in
    // flight; re-read the asset set before subscribing.
    let Some(assets) = inner.markets.prepare_connect(group_id).await else {
        return Ok(());
    };

    let (mut write, read) = stream.split();
    let frame = serde_json::to_string(&MarketSubscription::new(assets.clone()))?;
    if let Err(err) = write.send(Message::Text(frame)).await {
        inner.markets.mark_dead(group_id).await;
        return Err(err.into());
    }

    let token = CancellationToken::new();
    let epoch = inner.markets.next_epoch();
    match inner
        .markets
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

    info!(group = group_id, assets = assets.len(), "market socket open");
    inner.emit_market_ws_open(group_id, assets).await;
    tokio::spawn(run_market_socket(
        Arc::downgrade(inner),
        group_id,
        epoch,
        write,
        read,
        token,
    ));
    Ok(())
}

/// Per-connection run loop: inbound frames, keepalive pings, and the close
/// signal. Exits when the transport dies, the handle is closed, or the
/// manager is dropped.
async fn run_market_socket(
    inner: Weak<ManagerInner>,
    group_id: GroupId,
    epoch: u64,
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
                debug!(group = group_id, "market socket closed by handle");
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            _ = keepalive.tick(), if keepalive_on => {
                let Some(inner) = inner.upgrade() else { break };
                match inner.markets.keepalive_state(group_id, epoch).await {
                    KeepaliveState::Stop => {
                        debug!(group = group_id, "market keepalive stopped");
                        keepalive_on = false;
                    }
                    KeepaliveState::Ping => {
                        if let Err(err) = write.send(Message::Ping(Vec::new())).await {
                            inner
                                .market_socket_failed(group_id, epoch, Error::from(err))
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
                        inner.handle_market_text(group_id, epoch, &text).await;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = close_parts(frame);
                        inner
                            .market_socket_closed(group_id, epoch, code, reason)
                            .await;
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        inner
                            .market_socket_failed(group_id, epoch, Error::from(err))
                            .await;
                        break;
                    }
                    None => {
                        inner
                            .market_socket_closed(group_id, epoch, 1006, "stream ended".to_string())
                            .await;
                        break;
                    }
                }
            }
        }
    }
}

impl ManagerInner {
    /// Transport error: DEAD if this socket is still current, then surface
    /// the error. A stale socket exits silently.
    pub(crate) async fn market_socket_failed(&self, group_id: GroupId, epoch: u64, err: Error) {
        if self
            .markets
            .set_status_if_current(group_id, epoch, GroupStatus::Dead)
            .await
        {
            self.emit_market_error(err).await;
        }
    }

    /// Transport closed by the peer: DEAD if current, then `on_ws_close`.
    pub(crate) async fn market_socket_closed(
        &self,
        group_id: GroupId,
        epoch: u64,
        code: u16,
        reason: String,
    ) {
        if self
            .markets
            .set_status_if_current(group_id, epoch, GroupStatus::Dead)
            .await
        {
            self.emit_market_ws_close(group_id, code, reason).await;
        }
    }
}
