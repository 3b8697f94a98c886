//! End-to-end scenarios driven through a real TCP listener and a real
//! WebSocket client, the same way the teacher's `status_server.rs` tests
//! spin up `axum::serve` on an ephemeral port and hit it with `reqwest`.

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use webtty::config::{AuthMode, Config, Endpoints};
use webtty::server::Server;

fn base_config(argv: Vec<&str>) -> Config {
    Config {
        listen_addr: "127.0.0.1".to_string(),
        port: 0,
        unix_socket: None,
        socket_owner: None,
        ipv6: false,
        tls: None,
        argv: argv.into_iter().map(String::from).collect(),
        cwd: None,
        terminal_type: "xterm-256color".to_string(),
        close_signal: libc::SIGHUP,
        auth: AuthMode::None,
        url_arg: false,
        writable: true,
        check_origin: false,
        max_clients: 0,
        once: false,
        exit_no_conn: false,
        ping_interval: Duration::from_secs(300),
        base_path: String::new(),
        index_override: None,
        client_preferences: serde_json::json!({}),
        endpoints: Endpoints {
            ws: "/ws".to_string(),
            index: "/".to_string(),
            token: "/token".to_string(),
            parent: String::new(),
        },
        uid: None,
        gid: None,
    }
}

/// Binds the server's router to a loopback ephemeral port and spawns it in
/// the background, returning the address to connect test clients to.
async fn start(config: Config) -> (SocketAddr, Server) {
    let server = Server::new(config);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = server
        .router()
        .into_make_service_with_connect_info::<SocketAddr>();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, server)
}

async fn connect_ws(
    addr: SocketAddr,
    path: &str,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let url = format!("ws://{addr}{path}");
    let (ws, _response) = tokio_tungstenite::connect_async(url).await.unwrap();
    ws
}

fn handshake_frame(columns: u16, rows: u16) -> Vec<u8> {
    let payload = serde_json::json!({ "columns": columns, "rows": rows });
    let mut frame = vec![b'{'];
    frame.extend_from_slice(payload.to_string().as_bytes());
    frame
}

#[tokio::test]
async fn no_auth_echo_round_trip() {
    let (addr, _server) = start(base_config(vec!["cat"])).await;
    let mut ws = connect_ws(addr, "/ws").await;

    // InitialSending: window title then preferences, both tagged frames.
    let title = ws.next().await.unwrap().unwrap();
    assert!(matches!(title, WsMessage::Binary(b) if b.first() == Some(&b'1')));
    let prefs = ws.next().await.unwrap().unwrap();
    assert!(matches!(prefs, WsMessage::Binary(b) if b.first() == Some(&b'2')));

    ws.send(WsMessage::Binary(handshake_frame(80, 24).into())).await.unwrap();

    let mut input = vec![b'0'];
    input.extend_from_slice(b"hello\n");
    ws.send(WsMessage::Binary(input.into())).await.unwrap();

    let echoed = loop {
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Binary(b) if b.first() == Some(&b'0') => break b,
            _ => continue,
        }
    };
    assert!(echoed.windows(5).any(|w| w == b"hello"));

    ws.close(None).await.ok();
}

#[tokio::test]
async fn auth_gate_rejects_missing_credential() {
    let mut config = base_config(vec!["cat"]);
    config.auth = AuthMode::Basic {
        credential_b64: "dXNlcjpwdw==".to_string(),
    };
    let (addr, _server) = start(config).await;

    let client = reqwest::Client::new();
    let resp = client.get(format!("http://{addr}/")).send().await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    let resp = client
        .get(format!("http://{addr}/"))
        .header("Authorization", "Basic dXNlcjpwdw==")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn websocket_handshake_with_wrong_basic_credential_is_policy_violation() {
    let mut config = base_config(vec!["cat"]);
    config.auth = AuthMode::Basic {
        credential_b64: "dXNlcjpwdw==".to_string(),
    };
    let (addr, _server) = start(config).await;

    let mut ws = connect_ws(addr, "/ws").await;
    ws.next().await.unwrap().unwrap(); // window title
    ws.next().await.unwrap().unwrap(); // preferences

    let payload = serde_json::json!({ "AuthToken": "wrong", "columns": 80, "rows": 24 });
    let mut frame = vec![b'{'];
    frame.extend_from_slice(payload.to_string().as_bytes());
    ws.send(WsMessage::Binary(frame.into())).await.unwrap();

    let close = ws.next().await.unwrap().unwrap();
    match close {
        WsMessage::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected policy-violation close, got {other:?}"),
    }
}

#[tokio::test]
async fn non_handshake_frame_before_handshake_is_policy_violation_under_credential() {
    let mut config = base_config(vec!["cat"]);
    config.auth = AuthMode::Basic {
        credential_b64: "dXNlcjpwdw==".to_string(),
    };
    let (addr, _server) = start(config).await;

    let mut ws = connect_ws(addr, "/ws").await;
    ws.next().await.unwrap().unwrap(); // window title
    ws.next().await.unwrap().unwrap(); // preferences

    // An INPUT frame arriving before the JSON_DATA handshake, with a
    // credential configured, must be rejected rather than silently dropped.
    let mut frame = vec![b'0'];
    frame.extend_from_slice(b"too early");
    ws.send(WsMessage::Binary(frame.into())).await.unwrap();

    let close = ws.next().await.unwrap().unwrap();
    match close {
        WsMessage::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected policy-violation close, got {other:?}"),
    }
}

#[tokio::test]
async fn once_refuses_a_second_client_and_exits_after_the_first_closes() {
    let mut config = base_config(vec!["cat"]);
    config.once = true;
    let (addr, server) = start(config).await;
    let state = server.state();

    let mut first = connect_ws(addr, "/ws").await;
    first.next().await.unwrap().unwrap();
    first.next().await.unwrap().unwrap();
    first.send(WsMessage::Binary(handshake_frame(80, 24).into())).await.unwrap();

    // give the session task a moment to register and bump client_count
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(state.client_count.load(std::sync::atomic::Ordering::Acquire), 1);

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{addr}/ws"))
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);

    first.close(None).await.ok();
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.force_exit.load(std::sync::atomic::Ordering::Acquire));
}

#[tokio::test]
async fn child_exit_closes_the_socket_with_normal_status() {
    let (addr, _server) = start(base_config(vec!["true"])).await;
    let mut ws = connect_ws(addr, "/ws").await;
    ws.next().await.unwrap().unwrap();
    ws.next().await.unwrap().unwrap();
    ws.send(WsMessage::Binary(handshake_frame(80, 24).into())).await.unwrap();

    let close = loop {
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Close(frame) => break frame,
            _ => continue,
        }
    };
    assert_eq!(close.map(|f| u16::from(f.code)), Some(1000));
}

#[tokio::test]
async fn resize_reaches_the_child_via_stty_size() {
    let (addr, _server) = start(base_config(vec!["sh", "-c", "stty size"])).await;
    let mut ws = connect_ws(addr, "/ws").await;
    ws.next().await.unwrap().unwrap();
    ws.next().await.unwrap().unwrap();
    ws.send(WsMessage::Binary(handshake_frame(120, 40).into())).await.unwrap();

    let mut output = Vec::new();
    loop {
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Binary(b) if b.first() == Some(&b'0') => {
                output.extend_from_slice(&b[1..]);
            }
            WsMessage::Close(_) => break,
            _ => continue,
        }
        if output.windows(3).any(|w| w == b"40 ") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("40 120") || text.contains("40\r\n120"), "unexpected stty output: {text:?}");
}
