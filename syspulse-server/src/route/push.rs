use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use futures_util::{
    FutureExt, SinkExt, StreamExt,
    future::BoxFuture,
    stream::{SplitSink, SplitStream},
};
use tracing::{debug, trace};

use crate::{
    AppState,
    session::{CloseReason, DeliveryError, SnapshotSink},
};

pub async fn handle_socket(socket: WebSocket, state: AppState) {
    let _tracker_token = state.ws_graceful_shutdown.tracker.token();
    let (write, read) = socket.split();

    let sessions = state.sessions.clone();
    let id = sessions.attach(WsSink(write)).await;
    let attached = sessions.len().await;
    debug!(session_id = %id, sessions = attached, "observer attached");

    let mut controller = PushController { ws: read };
    tokio::select! {
        res = controller.run() => {
            if let Err(e) = res {
                debug!("push channel error: {e}");
            }
            sessions.detach(id).await;
        }
        // the manager closed the session itself (delivery failure or shutdown)
        _ = sessions.closed(id) => {}
    }

    let final_state = sessions.state(id).await;
    trace!(session_id = %id, state = ?final_state, "push channel finished");
}

/// Inbound half of the push channel. Observers have nothing to say, so this
/// only watches for the channel going away.
struct PushController {
    ws: SplitStream<WebSocket>,
}

impl PushController {
    async fn run(&mut self) -> Result<(), TransportError> {
        while let Some(msg) = self.ws.next().await {
            match msg.map_err(|e| TransportError(e.to_string()))? {
                Message::Close(Some(CloseFrame { code, reason })) => {
                    trace!(code, %reason, "websocket closed with frame");
                    return Ok(());
                }
                Message::Close(None) => return Ok(()),
                _ => {} // ignore anything else
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("push channel error: {0}")]
pub struct TransportError(String);

struct WsSink(SplitSink<WebSocket, Message>);

impl SnapshotSink for WsSink {
    fn send(&mut self, payload: String) -> BoxFuture<'_, Result<(), DeliveryError>> {
        async move {
            self.0
                .send(Message::Text(payload.into()))
                .await
                .map_err(|e| DeliveryError::Unreachable(e.to_string()))
        }
        .boxed()
    }

    fn close(&mut self, reason: CloseReason) -> BoxFuture<'_, ()> {
        async move {
            self.0.send(Message::Close(close_frame(reason))).await.ok();
            self.0.close().await.ok();
        }
        .boxed()
    }
}

fn close_frame(reason: CloseReason) -> Option<CloseFrame> {
    Some(match reason {
        CloseReason::PeerGone => CloseFrame {
            code: close_code::NORMAL,
            reason: "session closed".into(),
        },
        CloseReason::DeliveryFailed => CloseFrame {
            code: close_code::ERROR,
            reason: "snapshot delivery failed".into(),
        },
        CloseReason::Shutdown => CloseFrame {
            code: close_code::AWAY,
            reason: "server shutting down".into(),
        },
    })
}
