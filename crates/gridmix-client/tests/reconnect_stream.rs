//! Integration tests for push stream supervision: indefinite reconnection
//! with a fixed delay, independent stream lifecycles, and the stale-handle
//! guard that keeps superseded connections inert.
//!
//! Run with: cargo test --test reconnect_stream

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use gridmix_client::app::consume_inbound;
use gridmix_client::conn::{ConnOptions, ConnectionManager, Inbound, LinkStatus, StreamKind};
use gridmix_client::router::EventRouter;
use gridmix_proto::state::ChannelStore;

/// WebSocket server that greets each connection with `greeting`, holds it
/// open for `hold`, then drops it.  Counts accepted connections.
async fn flaky_ws_server(greeting: &'static str, hold: Duration) -> (SocketAddr, Arc<AtomicU64>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepts = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&accepts);
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut ws) = tokio_tungstenite::accept_async(socket).await {
                let _ = ws.send(Message::Text(greeting.into())).await;
                tokio::time::sleep(hold).await;
                // Dropping the socket here forces the client to reconnect.
            }
        }
    });
    (addr, accepts)
}

/// A port with nothing listening on it.
async fn dead_port() -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn options(thread_addr: SocketAddr, volume_addr: SocketAddr) -> ConnOptions {
    ConnOptions {
        thread_url: format!("ws://{thread_addr}/ws/thread"),
        volume_url: format!("ws://{volume_addr}/ws/volume"),
        reconnect_delay: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn test_reconnects_indefinitely_with_fixed_delay() {
    let (thread_addr, accepts) =
        flaky_ws_server(r#"{"type":"connection","activeThreads":[]}"#, Duration::ZERO).await;
    let volume_addr = dead_port().await;

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(64);
    let manager = ConnectionManager::start(options(thread_addr, volume_addr), inbound_tx);

    // Drain inbound so the supervisor never blocks on a full channel.
    tokio::spawn(async move { while inbound_rx.recv().await.is_some() {} });

    // Each accepted connection is dropped by the server, so reaching three
    // accepts proves the client keeps retrying after repeated failures.
    tokio::time::timeout(Duration::from_secs(5), async {
        while accepts.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("thread stream stopped reconnecting");

    assert!(manager.generation(StreamKind::Thread) >= 3);
}

#[tokio::test]
async fn test_streams_fail_independently() {
    let (thread_addr, _accepts) =
        flaky_ws_server(r#"{"type":"connection","activeThreads":[]}"#, Duration::from_millis(500)).await;
    let volume_addr = dead_port().await;

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(64);
    let manager = ConnectionManager::start(options(thread_addr, volume_addr), inbound_tx);

    // The thread stream must reach Open even though the volume stream
    // cannot connect at all.
    let mut thread_status = manager.subscribe_status(StreamKind::Thread);
    tokio::time::timeout(Duration::from_secs(5), async {
        while *thread_status.borrow_and_update() != LinkStatus::Open {
            thread_status.changed().await.unwrap();
        }
    })
    .await
    .expect("thread stream never opened");

    assert_ne!(manager.status(StreamKind::Volume), LinkStatus::Open);

    // The greeting actually made it through.
    let msg = tokio::time::timeout(Duration::from_secs(5), inbound_rx.recv())
        .await
        .expect("no inbound message")
        .unwrap();
    assert_eq!(msg.kind, StreamKind::Thread);
    assert!(msg.payload.contains("connection"));
}

#[tokio::test]
async fn test_superseded_generation_is_not_current() {
    let (thread_addr, accepts) =
        flaky_ws_server(r#"{"type":"thread_started","channelId":1}"#, Duration::ZERO).await;
    let volume_addr = dead_port().await;

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(64);
    let manager = ConnectionManager::start(options(thread_addr, volume_addr), inbound_tx);

    // Wait until at least two connections have come and gone.
    tokio::time::timeout(Duration::from_secs(5), async {
        while accepts.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("thread stream stopped reconnecting");

    // The first connection's messages now fail the guard.
    let first = tokio::time::timeout(Duration::from_secs(5), inbound_rx.recv())
        .await
        .expect("no inbound message")
        .unwrap();
    assert_eq!(first.generation, 1);
    assert!(!manager.is_current(&first));

    // A message tagged with the live generation passes.
    let live = Inbound {
        kind: StreamKind::Thread,
        generation: manager.generation(StreamKind::Thread),
        payload: String::new(),
    };
    assert!(manager.is_current(&live));
}

#[tokio::test]
async fn test_stopped_stream_does_not_reconnect() {
    let (thread_addr, accepts) =
        flaky_ws_server(r#"{"type":"connection","activeThreads":[]}"#, Duration::ZERO).await;
    let volume_addr = dead_port().await;

    let (inbound_tx, mut inbound_rx) = mpsc::channel::<Inbound>(64);
    let manager = ConnectionManager::start(options(thread_addr, volume_addr), inbound_tx);
    tokio::spawn(async move { while inbound_rx.recv().await.is_some() {} });

    tokio::time::timeout(Duration::from_secs(5), async {
        while accepts.load(Ordering::SeqCst) < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("thread stream never connected");

    manager.stop(StreamKind::Thread);

    // Let an attempt that was already in flight settle, then verify no
    // further reconnects happen across several reconnect windows.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let settled = accepts.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(accepts.load(Ordering::SeqCst), settled);
    assert_eq!(manager.status(StreamKind::Thread), LinkStatus::Closed);

    // The volume stream is unaffected by the thread stream's stop.
    assert_ne!(manager.status(StreamKind::Volume), LinkStatus::Open);
    manager.stop(StreamKind::Volume);
}

#[tokio::test]
async fn test_superseded_message_never_mutates_store() {
    // Nothing listening on either port; a long delay keeps the generation
    // stable at 1 after the first failed attempt.
    let thread_addr = dead_port().await;
    let volume_addr = dead_port().await;
    let mut options = options(thread_addr, volume_addr);
    options.reconnect_delay = Duration::from_secs(60);

    let (inbound_tx, _inbound_rx) = mpsc::channel::<Inbound>(8);
    let manager = ConnectionManager::start(options, inbound_tx);

    tokio::time::timeout(Duration::from_secs(5), async {
        while manager.generation(StreamKind::Thread) < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("thread supervisor never attempted a connection");

    let store = Arc::new(ChannelStore::new());
    let (actions_tx, _actions_rx) = mpsc::channel(8);
    let router = EventRouter::new(Arc::clone(&store), actions_tx, Duration::from_millis(5000));

    let payload = r#"{"type":"thread_started","channelId":3}"#;

    // A message from a connection that no longer exists is dropped whole.
    let stale = Inbound {
        kind: StreamKind::Thread,
        generation: 0,
        payload: payload.to_string(),
    };
    consume_inbound(&manager, &router, stale).await;
    assert!(store.snapshot().await.is_empty());

    // The same payload from the live generation goes through.
    let live = Inbound {
        kind: StreamKind::Thread,
        generation: manager.generation(StreamKind::Thread),
        payload: payload.to_string(),
    };
    consume_inbound(&manager, &router, live).await;
    assert!(store.get(3).await.unwrap().is_running);
}

#[tokio::test]
async fn test_volume_push_fails_while_link_down() {
    let (thread_addr, _accepts) =
        flaky_ws_server(r#"{"type":"connection","activeThreads":[]}"#, Duration::ZERO).await;
    let volume_addr = dead_port().await;

    let (inbound_tx, _inbound_rx) = mpsc::channel::<Inbound>(64);
    let manager = ConnectionManager::start(options(thread_addr, volume_addr), inbound_tx);

    let push = manager.volume_push();
    let cmd = gridmix_proto::protocol::VolumeCommand {
        channel_id: 1,
        volume: 30,
    };
    // Never connects, so the fire-and-forget path must report failure
    // instead of queueing silently.
    assert!(push.send(&cmd).is_err());
}
