//! Connection endpoint: the two pumps behind one attached controller.
//!
//! The read pump turns frames into envelopes and forwards them to the
//! session's command channel; the write pump drains the bounded outbound
//! queue. The queue's fixed capacity is the backpressure knob: the hub never
//! waits on an endpoint, it evicts whoever cannot keep up.

use crate::ws::hub::HubHandle;
use crate::ws::proto::Envelope;
use axum::extract::ws::{Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Outbound queue capacity per endpoint, in already-serialized frames.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub type EndpointId = u64;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_endpoint_id() -> EndpointId {
    NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed)
}

/// The hub-owned half of an endpoint: its identity and outbound queue.
pub struct Endpoint {
    pub id: EndpointId,
    pub outbound: mpsc::Sender<String>,
}

/// Drive an attached controller's socket until either side is done, then
/// deregister. Detach is idempotent: the hub ignores ids it no longer owns.
pub async fn run(
    socket: WebSocket,
    hub: HubHandle,
    id: EndpointId,
    outbound: mpsc::Receiver<String>,
) {
    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(write_pump(ws_tx, outbound, id));
    read_pump(ws_rx, &hub, id).await;
    hub.detach(id).await;
    let _ = writer.await;
    debug!(target: "ws", "endpoint {id} closed");
}

async fn read_pump(mut ws_rx: SplitStream<WebSocket>, hub: &HubHandle, id: EndpointId) {
    while let Some(frame) = ws_rx.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(e) => {
                debug!(target: "ws", "endpoint {id} read error: {e}");
                return;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(target: "ws", "endpoint {id} sent a non-UTF-8 frame");
                    return;
                }
            },
            Message::Close(_) => return,
            // ping/pong are answered by the transport layer
            _ => continue,
        };
        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(target: "ws", "endpoint {id} sent a malformed envelope: {e}");
                return;
            }
        };
        if hub.forward_command(envelope).await.is_err() {
            // session shut down underneath us
            return;
        }
    }
}

async fn write_pump(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    id: EndpointId,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(e) = ws_tx.send(Message::Text(frame)).await {
            debug!(target: "ws", "endpoint {id} write error: {e}");
            return;
        }
    }
    // Queue closed by the session: graceful close handshake, best effort --
    // the peer may already be gone.
    let _ = ws_tx.send(Message::Close(None)).await;
}
