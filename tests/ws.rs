//! Session server behaviors over real sockets plus hub-level policies
//! (broadcast, slow-peer eviction, idle shutdown) driven through the hub's
//! public handle.

use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use trapline::ws::endpoint::{Endpoint, OUTBOUND_QUEUE_CAPACITY};
use trapline::ws::hub::Hub;
use trapline::ws::proto::{
    self, ContinueCmd, Envelope, Event, SessionState, StartDebugCmd,
};
use trapline::ws::server::{self, RegistryOptions, SessionRegistry};

type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

fn options(max_sessions: usize, idle_timeout: Duration) -> RegistryOptions {
    RegistryOptions {
        max_sessions,
        idle_timeout,
    }
}

async fn start_server(options: RegistryOptions) -> (SocketAddr, Arc<SessionRegistry>) {
    let registry = SessionRegistry::new(options);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = server::router(registry.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, registry)
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    client
}

async fn connect_to_session(addr: SocketAddr, session_id: &str) -> WsClient {
    let (client, _) = connect_async(format!("ws://{addr}/ws?session={session_id}"))
        .await
        .unwrap();
    client
}

/// Next event frame from the server, failing the test on close or silence.
async fn next_event(client: &mut WsClient) -> Event {
    loop {
        let frame = timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("no frame within the timeout")
            .expect("stream ended")
            .expect("transport error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).expect("valid event"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Drain frames until the server closes, asserting none of them carried data.
async fn expect_declined(client: &mut WsClient) {
    loop {
        match timeout(RECV_TIMEOUT, client.next()).await.expect("no close") {
            None => return,
            Some(Ok(Message::Close(_))) => return,
            Some(Ok(Message::Text(text))) => panic!("expected decline, got frame {text}"),
            Some(Ok(_)) => continue,
            Some(Err(_)) => return,
        }
    }
}

#[tokio::test]
async fn test_session_bring_up() {
    let (addr, registry) = start_server(options(100, Duration::from_secs(3600))).await;
    assert!(registry.is_empty());

    let mut client = connect(addr).await;
    let event = next_event(&mut client).await;
    let Event::SessionStarted { session_id, pid } = event else {
        panic!("first frame must be sessionStarted, got {event:?}");
    };
    assert_eq!(session_id.len(), 36);
    assert_eq!(pid, 0);
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.session_ids(), vec![session_id]);
}

#[tokio::test]
async fn test_join_existing_session() {
    let (addr, registry) = start_server(options(100, Duration::from_secs(3600))).await;

    let mut first = connect(addr).await;
    let Event::SessionStarted { session_id, .. } = next_event(&mut first).await else {
        panic!("expected sessionStarted");
    };

    let mut second = connect_to_session(addr, &session_id).await;
    let Event::SessionStarted {
        session_id: joined, ..
    } = next_event(&mut second).await
    else {
        panic!("expected sessionStarted");
    };
    assert_eq!(joined, session_id);
    assert_eq!(registry.len(), 1);

    // both controllers observe the same broadcast
    let envelope = Envelope::command(
        proto::CMD_CONTINUE,
        &ContinueCmd {
            session_id: session_id.clone(),
        },
    )
    .unwrap();
    second
        .send(Message::Text(serde_json::to_string(&envelope).unwrap()))
        .await
        .unwrap();

    for client in [&mut first, &mut second] {
        let event = next_event(client).await;
        assert_eq!(
            event,
            Event::StateUpdate {
                session_id: session_id.clone(),
                new_state: SessionState::Executing,
            }
        );
    }
}

#[tokio::test]
async fn test_unknown_session_is_declined() {
    let (addr, registry) = start_server(options(100, Duration::from_secs(3600))).await;
    let mut client = connect_to_session(addr, "not-a-live-session").await;
    expect_declined(&mut client).await;
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_session_capacity() {
    let (addr, registry) = start_server(options(1, Duration::from_secs(3600))).await;

    let mut first = connect(addr).await;
    let Event::SessionStarted { .. } = next_event(&mut first).await else {
        panic!("expected sessionStarted");
    };

    // at capacity: a fresh session is declined, the map is unchanged
    let mut second = connect(addr).await;
    expect_declined(&mut second).await;
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_registry_duplicate_and_lookup() {
    let registry = SessionRegistry::new(options(2, Duration::from_secs(3600)));

    registry.create("alpha").unwrap();
    let err = registry.create("alpha").unwrap_err();
    assert_eq!(
        err,
        trapline::ws::SessionError::Duplicate("alpha".to_string())
    );

    assert!(registry.lookup("alpha").is_ok());
    let err = registry.lookup("beta").unwrap_err();
    assert_eq!(err, trapline::ws::SessionError::NotFound("beta".to_string()));

    registry.create("beta").unwrap();
    let err = registry.create("gamma").unwrap_err();
    assert_eq!(err, trapline::ws::SessionError::CapacityExceeded(2));
    assert_eq!(registry.len(), 2);
}

#[tokio::test]
async fn test_sessions_listing_endpoint() {
    let (addr, _registry) = start_server(options(100, Duration::from_secs(3600))).await;

    let mut client = connect(addr).await;
    let Event::SessionStarted { session_id, .. } = next_event(&mut client).await else {
        panic!("expected sessionStarted");
    };

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /sessions HTTP/1.1\r\nHost: trapline\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let body = response
        .split("\r\n\r\n")
        .nth(1)
        .expect("response has a body");
    let ids: Vec<String> = serde_json::from_str(body.trim()).expect("JSON array of ids");
    assert_eq!(ids, vec![session_id]);
}

/// Scenario: two endpoints, one stops draining its queue. The broadcaster
/// never waits: the stalled endpoint is evicted at queue capacity while the
/// healthy one receives every event, in order.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_endpoint_is_evicted() {
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let counter = shutdowns.clone();
    let (hub, handle) = Hub::new(
        "sess".to_string(),
        Duration::from_secs(3600),
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    tokio::spawn(hub.run());

    let (healthy_tx, mut healthy_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let (stalled_tx, mut stalled_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    assert!(
        handle
            .attach(Endpoint {
                id: 1,
                outbound: healthy_tx
            })
            .await
    );
    assert!(
        handle
            .attach(Endpoint {
                id: 2,
                outbound: stalled_tx
            })
            .await
    );

    // endpoint 1 keeps draining; endpoint 2 never does
    let drained = tokio::spawn(async move {
        let mut frames = vec![];
        while let Some(frame) = healthy_rx.recv().await {
            frames.push(frame);
        }
        frames
    });

    const EVENTS: usize = 300;
    for _ in 0..EVENTS {
        let envelope = Envelope::command(
            proto::CMD_CONTINUE,
            &ContinueCmd {
                session_id: "sess".to_string(),
            },
        )
        .unwrap();
        handle.forward_command(envelope).await.unwrap();
    }

    // the stalled endpoint got exactly its queue capacity, then was cut off
    let mut stalled_frames = 0;
    loop {
        match timeout(RECV_TIMEOUT, stalled_rx.recv()).await.unwrap() {
            Some(_) => stalled_frames += 1,
            None => break,
        }
    }
    assert_eq!(stalled_frames, OUTBOUND_QUEUE_CAPACITY);

    // the healthy endpoint sees everything in order
    handle.detach(1).await;
    let frames = drained.await.unwrap();
    assert_eq!(frames.len(), EVENTS);
    for frame in &frames {
        let event: Event = serde_json::from_str(frame).unwrap();
        assert_eq!(
            event,
            Event::StateUpdate {
                session_id: "sess".to_string(),
                new_state: SessionState::Executing,
            }
        );
    }

    // detaching the last endpoint shut the session down, exactly once
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
}

/// Scenario: an endpoint attaches and leaves; the empty session shuts down
/// exactly once and later idle ticks cannot fire it again.
#[tokio::test]
async fn test_empty_session_shuts_down_once() {
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let counter = shutdowns.clone();
    let (hub, handle) = Hub::new(
        "sess".to_string(),
        Duration::from_millis(100),
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    tokio::spawn(hub.run());

    let (outbound_tx, _outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    assert!(
        handle
            .attach(Endpoint {
                id: 1,
                outbound: outbound_tx
            })
            .await
    );
    handle.detach(1).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

    // the session is gone: further control messages are ignored
    handle.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
}

/// A session nobody ever attached to falls to the idle timer.
#[tokio::test]
async fn test_idle_session_shuts_down() {
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let counter = shutdowns.clone();
    let (hub, _handle) = Hub::new(
        "sess".to_string(),
        Duration::from_millis(100),
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    tokio::spawn(hub.run());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_idle_shutdown_removes_session_from_registry() {
    let (addr, registry) = start_server(options(100, Duration::from_millis(100))).await;

    let mut client = connect(addr).await;
    let Event::SessionStarted { session_id, .. } = next_event(&mut client).await else {
        panic!("expected sessionStarted");
    };
    assert_eq!(registry.len(), 1);
    drop(client);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(registry.is_empty());

    // the identifier is never reused: rejoining it is declined
    let mut rejoin = connect_to_session(addr, &session_id).await;
    expect_declined(&mut rejoin).await;
}

/// A rejected start-debug request must not emit events or end the session.
#[tokio::test]
async fn test_rejected_target_leaves_session_alive() {
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let counter = shutdowns.clone();
    let (hub, handle) = Hub::new(
        "sess".to_string(),
        Duration::from_secs(3600),
        Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }),
    );
    tokio::spawn(hub.run());

    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    assert!(
        handle
            .attach(Endpoint {
                id: 1,
                outbound: outbound_tx
            })
            .await
    );

    let envelope = Envelope::command(
        proto::CMD_START_DEBUG,
        &StartDebugCmd {
            session_id: "sess".to_string(),
            target_path: "/etc/passwd".to_string(),
        },
    )
    .unwrap();
    handle.forward_command(envelope).await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(outbound_rx.try_recv().is_err(), "no event may follow a rejected target");
    assert_eq!(shutdowns.load(Ordering::SeqCst), 0);

    // a malformed and an unknown command are dropped without detaching us
    handle
        .forward_command(Envelope {
            kind: "setBreakpoint".to_string(),
            data: None,
        })
        .await
        .unwrap();
    handle
        .forward_command(Envelope {
            kind: "teleport".to_string(),
            data: None,
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
}
