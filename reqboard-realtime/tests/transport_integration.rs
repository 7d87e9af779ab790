//! WebSocket relay tests: a real `RelayServer` on a local port with real
//! `WsRelay` clients.

use std::sync::Arc;

use reqboard_realtime::transport::ConnectionState;
use reqboard_realtime::{
    BroadcastRelay, LocalIdentity, LockKind, MemoryChangeFeed, RealtimeConfig, RealtimeContext, RealtimeError,
    RelayServer, RelayServerConfig, UserProfile, WsRelay,
};
use tokio::time::{sleep, timeout, Duration};
use uuid::Uuid;

macro_rules! eventually {
    ($cond:expr) => {
        timeout(Duration::from_secs(3), async {
            loop {
                if $cond {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect(concat!("condition never held: ", stringify!($cond)))
    };
}

/// Start a relay on an ephemeral port. Returns its URL and the server.
async fn start_relay() -> (String, Arc<RelayServer>) {
    let server = Arc::new(RelayServer::new(RelayServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..RelayServerConfig::default()
    }));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (format!("ws://{addr}"), server)
}

#[tokio::test]
async fn test_client_connects() {
    let (url, server) = start_relay().await;
    let relay = WsRelay::connect(&url).await.unwrap();
    assert_eq!(relay.connection_state().await, ConnectionState::Connected);
    eventually!(server.stats().await.active_connections == 1);
}

#[tokio::test]
async fn test_connect_to_nothing_fails() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let err = WsRelay::connect(format!("ws://127.0.0.1:{port}")).await;
    assert!(matches!(err, Err(RealtimeError::Transport(_))));
}

#[tokio::test]
async fn test_broadcast_fans_out_with_sequence() {
    let (url, _server) = start_relay().await;
    let alice = WsRelay::connect(&url).await.unwrap();
    let bob = WsRelay::connect(&url).await.unwrap();

    let mut alice_rx = alice.open_channel("doc:1:presence").await.unwrap();
    let mut bob_rx = bob.open_channel("doc:1:presence").await.unwrap();
    // let both subscriptions land before broadcasting
    sleep(Duration::from_millis(100)).await;

    alice.send("doc:1:presence", "presence", vec![1, 2, 3]).await.unwrap();
    alice.send("doc:1:presence", "lock", vec![4]).await.unwrap();

    let first = timeout(Duration::from_secs(2), bob_rx.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(2), bob_rx.recv()).await.unwrap().unwrap();
    assert_eq!(first.payload, vec![1, 2, 3]);
    assert_eq!((first.seq, second.seq), (1, 2));
    assert_eq!(second.event, "lock");

    // the sender hears its own broadcast too
    let echo = timeout(Duration::from_secs(2), alice_rx.recv()).await.unwrap().unwrap();
    assert_eq!(echo.seq, 1);
}

#[tokio::test]
async fn test_channels_are_isolated() {
    let (url, _server) = start_relay().await;
    let alice = WsRelay::connect(&url).await.unwrap();
    let bob = WsRelay::connect(&url).await.unwrap();

    alice.open_channel("doc:a:presence").await.unwrap();
    let mut bob_rx = bob.open_channel("doc:b:presence").await.unwrap();
    sleep(Duration::from_millis(100)).await;

    alice.send("doc:a:presence", "presence", vec![9]).await.unwrap();
    let res = timeout(Duration::from_millis(200), bob_rx.recv()).await;
    assert!(res.is_err(), "bob must not see another document's traffic");
}

#[tokio::test]
async fn test_send_on_unopened_channel() {
    let (url, _server) = start_relay().await;
    let relay = WsRelay::connect(&url).await.unwrap();
    let err = relay.send("doc:x:presence", "presence", vec![]).await.unwrap_err();
    assert!(matches!(err, RealtimeError::ChannelClosed(_)));
    assert!(relay.close_channel("doc:x:presence").await.is_err());
}

#[tokio::test]
async fn test_ping_pong() {
    let (url, _server) = start_relay().await;
    let relay = WsRelay::connect(&url).await.unwrap();
    relay.ping().await.unwrap();
    eventually!(relay.pongs_received() == 1);
}

#[tokio::test]
async fn test_disconnect_updates_server_stats() {
    let (url, server) = start_relay().await;
    let relay = WsRelay::connect(&url).await.unwrap();
    relay.open_channel("doc:1:presence").await.unwrap();
    eventually!(server.stats().await.active_channels == 1);

    drop(relay);
    eventually!(server.stats().await.active_connections == 0);
    eventually!(server.stats().await.active_channels == 0);
    assert_eq!(server.stats().await.total_connections, 1);
}

#[tokio::test]
async fn test_locks_over_websocket() {
    let (url, _server) = start_relay().await;
    let feed = Arc::new(MemoryChangeFeed::default());
    let doc = Uuid::new_v4();

    let connect = |name: &'static str| {
        let url = url.clone();
        let feed = feed.clone();
        async move {
            let relay = WsRelay::connect(url).await.unwrap();
            RealtimeContext::new(
                RealtimeConfig::default(),
                LocalIdentity::new(UserProfile::new(Uuid::new_v4(), name)),
                Arc::new(relay),
                feed,
            )
        }
    };
    let alice = connect("Alice").await;
    let bob = connect("Bob").await;

    let a = alice.subscribe_to_document(doc).await.unwrap();
    sleep(Duration::from_millis(100)).await;
    let b = bob.subscribe_to_document(doc).await.unwrap();
    eventually!(b.collaborators().await.len() == 1);
    eventually!(a.collaborators().await.len() == 1);

    assert!(a.acquire_entity_lock("req-1", LockKind::Requirement).await);
    eventually!(b.lock_holder("req-1").await.is_some());
    assert_eq!(b.lock_holder("req-1").await.unwrap().holder_name, "Alice");
    assert!(!b.acquire_entity_lock("req-1", LockKind::Requirement).await);

    a.unsubscribe().await.unwrap();
    eventually!(b.lock_holder("req-1").await.is_none());
    eventually!(b.collaborators().await.is_empty());
}

#[tokio::test]
async fn test_unsubscribe_prunes_server_channels() {
    let (url, server) = start_relay().await;
    let relay = WsRelay::connect(&url).await.unwrap();
    for i in 0..20 {
        let name = format!("doc:{i}:presence");
        relay.open_channel(&name).await.unwrap();
        relay.close_channel(&name).await.unwrap();
    }
    // frames are handled in order, so once this one lands the rest have too
    relay.open_channel("doc:keep:presence").await.unwrap();
    eventually!(server.hub().active_channels().await == vec!["doc:keep:presence".to_string()]);
    assert_eq!(relay.connection_state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_subscription_limit_rejects_and_closes_channel() {
    let server = Arc::new(RelayServer::new(RelayServerConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        max_channels_per_connection: 1,
        ..RelayServerConfig::default()
    }));
    let listener = server.bind().await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });

    let relay = WsRelay::connect(&url).await.unwrap();
    let _first = relay.open_channel("doc:1:presence").await.unwrap();
    let mut second = relay.open_channel("doc:2:presence").await.unwrap();

    let closed = timeout(Duration::from_secs(2), second.recv()).await.unwrap();
    assert!(closed.is_err());
    let err = relay.send("doc:2:presence", "presence", vec![]).await.unwrap_err();
    assert!(matches!(err, RealtimeError::ChannelClosed(_)));
    assert!(relay.send("doc:1:presence", "presence", vec![]).await.is_ok());
}
