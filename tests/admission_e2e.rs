//! End-to-end tests for admission control: the `--once` lifecycle,
//! `--max-clients`, and origin checking, exercised through real WebSocket
//! handshakes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use wterm::config::ServerConfig;
use wterm::registry::SessionRegistry;
use wterm::server::{self, AppState};

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

fn test_config(command: &[&str]) -> ServerConfig {
    ServerConfig::new(command.iter().map(|s| s.to_string()).collect())
        .expect("test command must not be empty")
}

async fn start_server(config: ServerConfig) -> (SocketAddr, SessionRegistry) {
    let registry = SessionRegistry::new(config.once, config.max_clients);
    let state = AppState {
        config: Arc::new(config),
        registry: registry.clone(),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        // In --once mode serve() returns once the session is done, so an
        // error here would hide real failures; unwrap is what we want.
        server::serve(listener, state).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, registry)
}

async fn connect(addr: SocketAddr) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("WebSocket connect failed");
    ws
}

/// Wait until the server has sent its three handshake frames, proving the
/// session is fully established.
async fn read_handshake(ws: &mut WsStream) {
    let mut seen = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while seen < 3 {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("timed out waiting for handshake")
            .expect("socket closed during handshake")
            .expect("handshake frame error");
        if matches!(msg, Message::Binary(_)) {
            seen += 1;
        }
    }
}

/// Status code of a refused handshake; panics if the refusal was not an
/// HTTP rejection.
fn refusal_status(err: WsError) -> u16 {
    match err {
        WsError::Http(response) => response.status().as_u16(),
        other => panic!("expected an HTTP rejection, got: {other:?}"),
    }
}

async fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

#[tokio::test(flavor = "multi_thread")]
async fn once_admits_one_session_and_requests_exit() {
    let mut config = test_config(&["cat"]);
    config.once = true;
    let (addr, registry) = start_server(config).await;

    let mut first = connect(addr).await;
    read_handshake(&mut first).await;

    // A concurrent second connection is refused during the HTTP
    // handshake.
    assert!(
        connect_async(format!("ws://{addr}/ws")).await.is_err(),
        "second client must be refused while the once session lives"
    );

    // Closing the only permitted session must trigger the process exit
    // signal.
    first.close(None).await.unwrap();
    let exit = registry.exit_signal();
    tokio::time::timeout(Duration::from_secs(5), exit.cancelled())
        .await
        .expect("server should request exit after the once session closes");

    // Nothing is admitted afterwards either; depending on timing the
    // listener may already be gone, which also counts as refusal.
    assert!(connect_async(format!("ws://{addr}/ws")).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn max_clients_is_enforced_and_slots_are_reusable() {
    let mut config = test_config(&["cat"]);
    config.max_clients = 1;
    let (addr, registry) = start_server(config).await;

    let mut first = connect(addr).await;
    read_handshake(&mut first).await;

    assert!(
        connect_async(format!("ws://{addr}/ws")).await.is_err(),
        "second client must be refused at the cap"
    );

    // Freeing the slot lets the next client in.
    first.close(None).await.unwrap();
    assert!(
        wait_until(|| registry.count() == 0, Duration::from_secs(5)).await,
        "slot should be released after close"
    );

    let mut third = connect(addr).await;
    read_handshake(&mut third).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn origin_check_accepts_same_host_and_rejects_others() {
    let mut config = test_config(&["cat"]);
    config.check_origin = true;
    let (addr, _registry) = start_server(config).await;

    // Same host:port as the Host header tungstenite will send.
    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut()
        .insert("origin", format!("http://{addr}").parse().unwrap());
    let (mut ws, _) = connect_async(req)
        .await
        .expect("same-origin client should be accepted");
    read_handshake(&mut ws).await;

    // Different host: refused before the upgrade, with the origin 403.
    let mut evil = format!("ws://{addr}/ws").into_client_request().unwrap();
    evil.headers_mut()
        .insert("origin", "http://evil.example.net".parse().unwrap());
    let err = connect_async(evil).await.expect_err("cross-origin client must be refused");
    assert_eq!(refusal_status(err), 403);

    // No Origin header at all: refused as well.
    let bare = format!("ws://{addr}/ws").into_client_request().unwrap();
    let err = connect_async(bare).await.expect_err("origin-less client must be refused");
    assert_eq!(refusal_status(err), 403);
}

/// Admission comes before the origin rule: when both would refuse a
/// client, the once verdict (503) wins over the origin 403.
#[tokio::test(flavor = "multi_thread")]
async fn once_refusal_wins_over_origin_mismatch() {
    let mut config = test_config(&["cat"]);
    config.once = true;
    config.check_origin = true;
    let (addr, _registry) = start_server(config).await;

    // Occupy the single slot with a well-behaved client.
    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut()
        .insert("origin", format!("http://{addr}").parse().unwrap());
    let (mut first, _) = connect_async(req)
        .await
        .expect("first client should be accepted");
    read_handshake(&mut first).await;

    let mut evil = format!("ws://{addr}/ws").into_client_request().unwrap();
    evil.headers_mut()
        .insert("origin", "http://evil.example.net".parse().unwrap());
    let err = connect_async(evil).await.expect_err("second client must be refused");
    assert_eq!(
        refusal_status(err),
        503,
        "the once refusal must not be masked by the origin check"
    );
}

/// Same priority for the client cap: a full server answers 503 even when
/// the client's origin is also wrong.
#[tokio::test(flavor = "multi_thread")]
async fn max_clients_refusal_wins_over_origin_mismatch() {
    let mut config = test_config(&["cat"]);
    config.max_clients = 1;
    config.check_origin = true;
    let (addr, _registry) = start_server(config).await;

    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut()
        .insert("origin", format!("http://{addr}").parse().unwrap());
    let (mut first, _) = connect_async(req)
        .await
        .expect("first client should be accepted");
    read_handshake(&mut first).await;

    let mut evil = format!("ws://{addr}/ws").into_client_request().unwrap();
    evil.headers_mut()
        .insert("origin", "http://evil.example.net".parse().unwrap());
    let err = connect_async(evil).await.expect_err("second client must be refused");
    assert_eq!(
        refusal_status(err),
        503,
        "the client-cap refusal must not be masked by the origin check"
    );
}

/// A client turned away by the origin check must not use up the single
/// permitted `--once` session.
#[tokio::test(flavor = "multi_thread")]
async fn origin_rejection_does_not_consume_the_once_slot() {
    let mut config = test_config(&["cat"]);
    config.once = true;
    config.check_origin = true;
    let (addr, registry) = start_server(config).await;

    let mut evil = format!("ws://{addr}/ws").into_client_request().unwrap();
    evil.headers_mut()
        .insert("origin", "http://evil.example.net".parse().unwrap());
    let err = connect_async(evil).await.expect_err("cross-origin client must be refused");
    assert_eq!(refusal_status(err), 403);
    assert!(
        !registry.exit_signal().is_cancelled(),
        "a refused client must not end a --once run"
    );

    // The slot is still there for a legitimate client.
    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut()
        .insert("origin", format!("http://{addr}").parse().unwrap());
    let (mut ws, _) = connect_async(req)
        .await
        .expect("the once slot should have been refunded");
    read_handshake(&mut ws).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn origin_check_disabled_accepts_any_origin() {
    let (addr, _registry) = start_server(test_config(&["cat"])).await;

    let mut req = format!("ws://{addr}/ws").into_client_request().unwrap();
    req.headers_mut()
        .insert("origin", "http://elsewhere.example.com".parse().unwrap());
    let (mut ws, _) = connect_async(req)
        .await
        .expect("origins are not checked by default");
    read_handshake(&mut ws).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sessions_outlive_each_other_independently() {
    let (addr, registry) = start_server(test_config(&["cat"])).await;

    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    read_handshake(&mut a).await;
    read_handshake(&mut b).await;
    assert_eq!(registry.count(), 2);

    a.close(None).await.unwrap();
    assert!(
        wait_until(|| registry.count() == 1, Duration::from_secs(5)).await,
        "closing one session must not touch the other"
    );

    b.close(None).await.unwrap();
    assert!(wait_until(|| registry.count() == 0, Duration::from_secs(5)).await);
}
