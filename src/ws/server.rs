//! Session registry and the HTTP/WebSocket surface.
//!
//! `GET /ws` upgrades a controller connection and binds it to a session:
//! no `session` query parameter mints a fresh identifier, a known identifier
//! joins the existing session, an unknown one is declined. `GET /sessions`
//! lists the live identifiers.

use crate::config::WebSocketConfig;
use crate::ws::endpoint::{self, Endpoint, OUTBOUND_QUEUE_CAPACITY};
use crate::ws::hub::{Hub, HubHandle, ShutdownCallback};
use crate::ws::proto;
use crate::ws::SessionError;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use log::{info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
}

impl From<&WebSocketConfig> for RegistryOptions {
    fn from(cfg: &WebSocketConfig) -> Self {
        RegistryOptions {
            max_sessions: cfg.max_sessions,
            idle_timeout: cfg.idle_timeout(),
        }
    }
}

/// Bounded set of live sessions keyed by identifier. Readers (lookups, the
/// listing) dominate, so a read-biased lock guards the map; writers are the
/// create path and remove-on-shutdown.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, HubHandle>>,
    options: RegistryOptions,
}

impl SessionRegistry {
    pub fn new(options: RegistryOptions) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry {
            sessions: RwLock::new(HashMap::new()),
            options,
        })
    }

    /// Create a session with its engine and hub, register the remove
    /// callback as its shutdown hook, and start its event loop.
    pub fn create(self: &Arc<Self>, session_id: &str) -> Result<HubHandle, SessionError> {
        let mut sessions = self.sessions.write().expect("registry lock poisoned");
        if sessions.len() >= self.options.max_sessions {
            return Err(SessionError::CapacityExceeded(self.options.max_sessions));
        }
        if sessions.contains_key(session_id) {
            return Err(SessionError::Duplicate(session_id.to_string()));
        }

        let registry = Arc::downgrade(self);
        let on_shutdown: ShutdownCallback = Box::new(move |id: &str| {
            if let Some(registry) = Weak::upgrade(&registry) {
                registry.remove(id);
            }
        });
        let (hub, handle) = Hub::new(
            session_id.to_string(),
            self.options.idle_timeout,
            on_shutdown,
        );
        sessions.insert(session_id.to_string(), handle.clone());
        tokio::spawn(hub.run());
        info!(target: "ws", "created session {session_id}");
        Ok(handle)
    }

    pub fn lookup(&self, session_id: &str) -> Result<HubHandle, SessionError> {
        self.sessions
            .read()
            .expect("registry lock poisoned")
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Drop a session identifier. Once removed it is never reused.
    pub fn remove(&self, session_id: &str) {
        self.sessions
            .write()
            .expect("registry lock poisoned")
            .remove(session_id);
        info!(target: "ws", "removed session {session_id}");
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ask every live session to shut down (closing endpoint queues and
    /// streams on the way) and clear the map.
    pub async fn shutdown(&self) {
        let handles: Vec<HubHandle> = {
            let sessions = self.sessions.read().expect("registry lock poisoned");
            sessions.values().cloned().collect()
        };
        info!(target: "ws", "shutting down {} session(s)", handles.len());
        for handle in handles {
            handle.shutdown().await;
        }
    }
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    session: Option<String>,
}

pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/sessions", get(list_sessions))
        .with_state(registry)
}

/// Serve the upgrade surface until the listener fails or the task is
/// dropped by graceful shutdown.
pub async fn serve(
    listener: tokio::net::TcpListener,
    registry: Arc<SessionRegistry>,
) -> std::io::Result<()> {
    let shutdown_registry = registry.clone();
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!(target: "ws", "interrupt received, shutting down");
            shutdown_registry.shutdown().await;
        })
        .await
}

async fn list_sessions(State(registry): State<Arc<SessionRegistry>>) -> Json<Vec<String>> {
    Json(registry.session_ids())
}

async fn ws_upgrade(
    State(registry): State<Arc<SessionRegistry>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| attach_controller(registry, query.session, socket))
}

/// Resolve the requested session, attach the controller as an endpoint, and
/// run its pumps. The `sessionStarted` acknowledgement is queued before the
/// hub can broadcast anything, so it is always the first frame.
async fn attach_controller(
    registry: Arc<SessionRegistry>,
    requested: Option<String>,
    mut socket: WebSocket,
) {
    let handle = match requested {
        None => {
            let session_id = Uuid::new_v4().to_string();
            match registry.create(&session_id) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(target: "ws", "refusing connection: {e}");
                    let _ = socket.send(Message::Close(None)).await;
                    return;
                }
            }
        }
        Some(session_id) => match registry.lookup(&session_id) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(target: "ws", "refusing connection: {e}");
                let _ = socket.send(Message::Close(None)).await;
                return;
            }
        },
    };

    let id = endpoint::next_endpoint_id();
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

    let ack = proto::Event::SessionStarted {
        session_id: handle.session_id().to_string(),
        pid: 0,
    };
    match serde_json::to_string(&ack) {
        Ok(frame) => {
            let _ = outbound_tx.try_send(frame);
        }
        Err(e) => warn!(target: "ws", "failed to serialize sessionStarted: {e}"),
    }

    if !handle
        .attach(Endpoint {
            id,
            outbound: outbound_tx,
        })
        .await
    {
        // session shut down between resolution and attach
        let _ = socket.send(Message::Close(None)).await;
        return;
    }

    endpoint::run(socket, handle, id, outbound_rx).await;
}
