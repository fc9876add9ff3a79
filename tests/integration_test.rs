//! Integration tests for Pulse Relay
//!
//! Drives the full proxy path over real TCP: public caller → router →
//! tunnel stream → client agent → local HTTP server and back, covering
//! identity assignment, response correlation under concurrency, transport
//! loss, and reconnection.

use pulse_relay::client::TunnelClient;
use pulse_relay::config::RelayConfig;
use pulse_relay::http;
use pulse_relay::protocol::{self, ClientHello, HandshakeReply, PROTOCOL_VERSION};
use pulse_relay::registry::{ClientRegistry, MemoryStore};
use pulse_relay::relay::RelayServer;
use pulse_relay::tunnel::{Frame, FrameType};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

/// Bind a relay on ephemeral ports and run it in the background
async fn start_relay(auth_tokens: Vec<String>) -> (SocketAddr, SocketAddr, Arc<ClientRegistry>) {
    let config = RelayConfig {
        tunnel_listen: "127.0.0.1:0".to_string(),
        public_listen: "127.0.0.1:0".to_string(),
        auth_tokens,
        max_clients: 64,
        ..Default::default()
    };
    let registry = Arc::new(ClientRegistry::new(
        Arc::new(MemoryStore::new()),
        "test-relay".to_string(),
    ));

    let server = RelayServer::bind(&config, Arc::clone(&registry))
        .await
        .unwrap();
    let tunnel_addr = server.tunnel_addr().unwrap();
    let public_addr = server.public_addr().unwrap();
    tokio::spawn(server.run());

    (tunnel_addr, public_addr, registry)
}

fn big_body() -> Vec<u8> {
    (0..1024 * 1024).map(|i| (i % 251) as u8).collect()
}

/// A small local HTTP server with the routes the tests exercise
async fn start_local_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(handle_local_connection(stream));
        }
    });

    addr
}

async fn handle_local_connection(stream: TcpStream) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let Ok(Some(head)) = http::read_request_head(&mut reader).await else {
        return;
    };
    let kind = http::request_body_kind(&head).unwrap();
    let mut body = Vec::new();
    {
        let mut body_reader = http::BodyReader::new(&mut reader, kind);
        while let Ok(Some(chunk)) = body_reader.next_chunk().await {
            body.extend_from_slice(&chunk);
        }
    }

    let path = head.path.split('?').next().unwrap_or("");
    match path {
        "/hello" => {
            let payload = br#"{"ok":true}"#;
            let head = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n",
                payload.len()
            );
            let _ = write_half.write_all(head.as_bytes()).await;
            let _ = write_half.write_all(payload).await;
        }
        "/empty" => {
            let _ = write_half
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                .await;
        }
        "/big" => {
            let payload = big_body();
            let head = format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n", payload.len());
            let _ = write_half.write_all(head.as_bytes()).await;
            let _ = write_half.write_all(&payload).await;
        }
        "/stream" => {
            let _ = write_half
                .write_all(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n")
                .await;
            for part in [&b"first "[..], &b"second "[..], &b"third"[..]] {
                let _ = http::write_chunk(&mut write_half, part).await;
            }
            let _ = http::finish_chunked(&mut write_half).await;
        }
        "/echo" => {
            let head = format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n", body.len());
            let _ = write_half.write_all(head.as_bytes()).await;
            let _ = write_half.write_all(&body).await;
        }
        p if p.starts_with("/echo-path") => {
            let payload = head.path.as_bytes();
            let reply = format!("HTTP/1.1 200 OK\r\ncontent-length: {}\r\n\r\n", payload.len());
            let _ = write_half.write_all(reply.as_bytes()).await;
            let _ = write_half.write_all(payload).await;
        }
        _ => {
            let _ = write_half
                .write_all(b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\n\r\n")
                .await;
        }
    }
    let _ = write_half.flush().await;
}

/// Send a raw request to the public listener and collect the response
async fn send_request(
    addr: SocketAddr,
    method: &str,
    raw: Vec<u8>,
) -> (u16, Vec<(String, String)>, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&raw).await.unwrap();

    let mut reader = BufReader::new(stream);
    let head = http::read_response_head(&mut reader).await.unwrap();
    let kind = http::response_body_kind(method, head.status, &head.headers).unwrap();

    let mut body = Vec::new();
    let mut body_reader = http::BodyReader::new(&mut reader, kind);
    while let Some(chunk) = body_reader.next_chunk().await.unwrap() {
        body.extend_from_slice(&chunk);
    }
    (head.status, head.headers, body)
}

fn get(client_id: &str, path: &str) -> Vec<u8> {
    format!(
        "GET /{}{} HTTP/1.1\r\nhost: relay.test\r\nconnection: close\r\n\r\n",
        client_id, path
    )
    .into_bytes()
}

async fn wait_for_session(registry: &ClientRegistry, client_id: &str) {
    for _ in 0..200 {
        if let Some(session) = registry.resolve(client_id).await {
            if session.is_active() {
                return;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session for {} never became active", client_id);
}

/// Connect a tunnel client, serve it in the background, return its ID
async fn attach_client(
    tunnel_addr: SocketAddr,
    local_addr: SocketAddr,
    registry: &ClientRegistry,
) -> String {
    let mut client = TunnelClient::new(tunnel_addr.to_string(), "", local_addr.to_string());
    let tunnel = client.connect().await.unwrap();
    let client_id = tunnel.client_id().to_string();
    tokio::spawn(tunnel.serve());
    wait_for_session(registry, &client_id).await;
    client_id
}

/// Scenario A: registered client, public GET forwarded, JSON round-trip
#[tokio::test]
async fn test_basic_roundtrip() {
    let (tunnel_addr, public_addr, registry) = start_relay(Vec::new()).await;
    let local_addr = start_local_server().await;
    let client_id = attach_client(tunnel_addr, local_addr, &registry).await;

    let (status, headers, body) =
        send_request(public_addr, "GET", get(&client_id, "/hello")).await;

    assert_eq!(status, 200);
    assert_eq!(&body, br#"{"ok":true}"#);
    assert_eq!(
        http::header(&headers, "content-type"),
        Some("application/json")
    );
}

/// Scenario B: unknown client ID resolves to 404, no stream opened
#[tokio::test]
async fn test_unknown_client_is_404() {
    let (_tunnel_addr, public_addr, _registry) = start_relay(Vec::new()).await;

    let (status, _, _) = send_request(public_addr, "GET", get("doesnotexist", "/hello")).await;
    assert_eq!(status, 404);
}

/// An empty-body response relays byte-identically
#[tokio::test]
async fn test_empty_body_roundtrip() {
    let (tunnel_addr, public_addr, registry) = start_relay(Vec::new()).await;
    let local_addr = start_local_server().await;
    let client_id = attach_client(tunnel_addr, local_addr, &registry).await;

    let (status, headers, body) =
        send_request(public_addr, "GET", get(&client_id, "/empty")).await;

    assert_eq!(status, 200);
    assert!(body.is_empty());
    assert_eq!(http::header(&headers, "content-length"), Some("0"));
}

/// A large body streams through without truncation or corruption
#[tokio::test]
async fn test_large_body_roundtrip() {
    let (tunnel_addr, public_addr, registry) = start_relay(Vec::new()).await;
    let local_addr = start_local_server().await;
    let client_id = attach_client(tunnel_addr, local_addr, &registry).await;

    let (status, _, body) = send_request(public_addr, "GET", get(&client_id, "/big")).await;

    assert_eq!(status, 200);
    let expected = big_body();
    assert_eq!(body.len(), expected.len());
    assert_eq!(body, expected);
}

/// A chunked response with no content-length relays as a delimited body
#[tokio::test]
async fn test_chunked_response_roundtrip() {
    let (tunnel_addr, public_addr, registry) = start_relay(Vec::new()).await;
    let local_addr = start_local_server().await;
    let client_id = attach_client(tunnel_addr, local_addr, &registry).await;

    let (status, headers, body) =
        send_request(public_addr, "GET", get(&client_id, "/stream")).await;

    assert_eq!(status, 200);
    assert_eq!(&body, b"first second third");
    assert!(http::header(&headers, "content-length").is_none());
}

/// Request bodies forward through the tunnel unmodified
#[tokio::test]
async fn test_post_body_echo() {
    let (tunnel_addr, public_addr, registry) = start_relay(Vec::new()).await;
    let local_addr = start_local_server().await;
    let client_id = attach_client(tunnel_addr, local_addr, &registry).await;

    let payload = b"some opaque request payload";
    let raw = format!(
        "POST /{}/echo HTTP/1.1\r\nhost: relay.test\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        client_id,
        payload.len()
    );
    let mut request = raw.into_bytes();
    request.extend_from_slice(payload);

    let (status, _, body) = send_request(public_addr, "POST", request).await;

    assert_eq!(status, 200);
    assert_eq!(&body, payload);
}

/// Scenario D: concurrent requests to one client correlate strictly 1:1
#[tokio::test]
async fn test_concurrent_request_correlation() {
    let (tunnel_addr, public_addr, registry) = start_relay(Vec::new()).await;
    let local_addr = start_local_server().await;
    let client_id = attach_client(tunnel_addr, local_addr, &registry).await;

    let mut tasks = Vec::new();
    for i in 0..100 {
        let path = format!("/echo-path/{}", i);
        let request = get(&client_id, &path);
        tasks.push(tokio::spawn(async move {
            let (status, _, body) = send_request(public_addr, "GET", request).await;
            (status, path, body)
        }));
    }

    for task in tasks {
        let (status, path, body) = task.await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(String::from_utf8(body).unwrap(), path);
    }
}

/// Scenario C: severing the tunnel mid-exchange fails the in-flight
/// request promptly instead of hanging it
#[tokio::test]
async fn test_severed_tunnel_fails_inflight_request() {
    let (tunnel_addr, public_addr, registry) = start_relay(Vec::new()).await;

    // A bare protocol peer instead of the real client, so the transport
    // can be severed at an exact point
    let mut tunnel = TcpStream::connect(tunnel_addr).await.unwrap();
    let hello = ClientHello {
        version: PROTOCOL_VERSION,
        token: String::new(),
        client_id: None,
        resume_key: None,
    };
    protocol::write_message(&mut tunnel, &hello).await.unwrap();
    let reply: HandshakeReply = protocol::read_message(&mut tunnel).await.unwrap();
    let client_id = match reply {
        HandshakeReply::Welcome { client_id, .. } => client_id,
        HandshakeReply::Reject { reason } => panic!("rejected: {}", reason),
    };
    wait_for_session(&registry, &client_id).await;

    let request = get(&client_id, "/hello");
    let public = tokio::spawn(async move { send_request(public_addr, "GET", request).await });

    // Absorb frames until the full request has arrived, then sever
    loop {
        let frame = Frame::read_from(&mut tunnel).await.unwrap();
        if frame.frame_type == FrameType::RequestEnd {
            break;
        }
    }
    drop(tunnel);

    let started = Instant::now();
    let (status, _, _) = public.await.unwrap();
    assert_eq!(status, 502);
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "failure must surface within the grace period"
    );
}

/// A reconnecting client keeps its issued identity and evicts the stale
/// session; at most one active session exists per ID
#[tokio::test]
async fn test_reconnect_keeps_identity_and_evicts_stale_session() {
    let (tunnel_addr, public_addr, registry) = start_relay(Vec::new()).await;
    let local_addr = start_local_server().await;

    let mut client = TunnelClient::new(tunnel_addr.to_string(), "", local_addr.to_string());
    let first = client.connect().await.unwrap();
    let client_id = first.client_id().to_string();
    let serving = tokio::spawn(first.serve());
    wait_for_session(&registry, &client_id).await;

    // Simulate transport loss without telling the relay
    serving.abort();

    let second = client.connect().await.unwrap();
    assert_eq!(second.client_id(), client_id, "identity must be stable");
    tokio::spawn(second.serve());
    wait_for_session(&registry, &client_id).await;

    assert_eq!(registry.session_count().await, 1);

    let (status, _, body) = send_request(public_addr, "GET", get(&client_id, "/hello")).await;
    assert_eq!(status, 200);
    assert_eq!(&body, br#"{"ok":true}"#);
}

/// A wrong resume key gets a fresh identity instead of hijacking the ID
#[tokio::test]
async fn test_bogus_resume_key_gets_fresh_identity() {
    let (tunnel_addr, _public_addr, registry) = start_relay(Vec::new()).await;
    let local_addr = start_local_server().await;
    let victim_id = attach_client(tunnel_addr, local_addr, &registry).await;

    let mut tunnel = TcpStream::connect(tunnel_addr).await.unwrap();
    let hello = ClientHello {
        version: PROTOCOL_VERSION,
        token: String::new(),
        client_id: Some(victim_id.clone()),
        resume_key: Some("forged".to_string()),
    };
    protocol::write_message(&mut tunnel, &hello).await.unwrap();
    let reply: HandshakeReply = protocol::read_message(&mut tunnel).await.unwrap();

    match reply {
        HandshakeReply::Welcome { client_id, .. } => {
            assert_ne!(client_id, victim_id, "forged resume must not take over an ID");
        }
        HandshakeReply::Reject { reason } => panic!("rejected: {}", reason),
    }

    // The victim's session is untouched
    assert!(registry.resolve(&victim_id).await.unwrap().is_active());
}

/// Authentication is checked before any resources are allocated
#[tokio::test]
async fn test_auth_token_enforced() {
    let (tunnel_addr, _public_addr, registry) =
        start_relay(vec!["sekret".to_string()]).await;
    let local_addr = start_local_server().await;

    let mut bad = TunnelClient::new(tunnel_addr.to_string(), "wrong", local_addr.to_string());
    match bad.connect().await {
        Err(pulse_relay::Error::AuthenticationFailed) => {}
        other => panic!("expected auth failure, got {:?}", other.map(|t| t.client_id().to_string())),
    }
    assert_eq!(registry.session_count().await, 0);

    let mut good = TunnelClient::new(tunnel_addr.to_string(), "sekret", local_addr.to_string());
    let tunnel = good.connect().await.unwrap();
    let client_id = tunnel.client_id().to_string();
    tokio::spawn(tunnel.serve());
    wait_for_session(&registry, &client_id).await;
}

/// After a client disconnects and its session closes, its URL is 404
#[tokio::test]
async fn test_disconnected_client_resolves_not_found() {
    let (tunnel_addr, public_addr, registry) = start_relay(Vec::new()).await;
    let local_addr = start_local_server().await;

    let mut client = TunnelClient::new(tunnel_addr.to_string(), "", local_addr.to_string());
    let tunnel = client.connect().await.unwrap();
    let client_id = tunnel.client_id().to_string();
    let serving = tokio::spawn(tunnel.serve());
    wait_for_session(&registry, &client_id).await;

    serving.abort();

    // Wait for the relay to notice the loss and close the session
    for _ in 0..200 {
        if registry.resolve(&client_id).await.is_none() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let (status, _, _) = send_request(public_addr, "GET", get(&client_id, "/hello")).await;
    assert_eq!(status, 404);
}

/// The local server being down surfaces as a gateway error, not a hang
#[tokio::test]
async fn test_unreachable_local_server_is_502() {
    let (tunnel_addr, public_addr, registry) = start_relay(Vec::new()).await;

    // Point the client at a port nothing listens on
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let client_id = attach_client(tunnel_addr, dead_addr, &registry).await;

    let (status, _, _) = send_request(public_addr, "GET", get(&client_id, "/hello")).await;
    assert_eq!(status, 502);
}
