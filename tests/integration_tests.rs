// End-to-end tests for the ferry relay: HTTP rendezvous, socket pairing,
// READY/ACK gating, and byte forwarding, each against a fresh server on
// ephemeral ports.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use ferry::api::{self, ApiState};
use ferry::registry::SessionRegistry;
use ferry::rendezvous::Rendezvous;
use ferry::session::{Session, SessionStatus};
use ferry::socket;
use ferry::{ACK_SIGNAL, READY_SIGNAL};

struct TestRelay {
    http_base: String,
    socket_addr: std::net::SocketAddr,
    registry: Arc<SessionRegistry>,
}

async fn start_relay(blocking_timeout: Duration) -> TestRelay {
    let registry = Arc::new(SessionRegistry::new());
    let rendezvous = Arc::new(Rendezvous::new(
        registry.clone(),
        blocking_timeout,
        Duration::from_millis(120_000),
    ));

    let socket_listener =
        socket::bind("127.0.0.1:0".parse().unwrap(), 128).expect("bind socket listener");
    let socket_addr = socket_listener.local_addr().unwrap();
    tokio::spawn(socket::serve(registry.clone(), socket_listener));

    let app = api::router(ApiState {
        rendezvous,
        registry: registry.clone(),
        socket_port: socket_addr.port(),
    });
    let http_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_base = format!("http://{}", http_listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(http_listener, app).await.unwrap();
    });

    TestRelay {
        http_base,
        socket_addr,
        registry,
    }
}

fn serve_body(sender_fp: &str, receiver_fp: &str) -> Value {
    json!({
        "senderFp": sender_fp,
        "receiverFp": receiver_fp,
        "filename": "report.pdf",
        "fileSize": 1024,
        "signature": "ed25519-sig",
        "fileHash": "sha256-hash",
    })
}

async fn post(url: String, body: Value) -> (u16, Value) {
    let response = reqwest::Client::new()
        .post(url)
        .json(&body)
        .send()
        .await
        .expect("http request");
    let status = response.status().as_u16();
    let body: Value = response.json().await.expect("json body");
    (status, body)
}

/// Connect a socket client, handshake, consume READY, and answer ACK.
async fn connect_and_ack(
    addr: std::net::SocketAddr,
    session_id: &str,
    role: &str,
) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.expect("connect socket");
    stream
        .write_all(format!("{}:{}\n", session_id, role).as_bytes())
        .await
        .unwrap();
    let mut ready = [0u8; 6];
    stream.read_exact(&mut ready).await.expect("READY signal");
    assert_eq!(&ready, READY_SIGNAL);
    stream.write_all(ACK_SIGNAL).await.unwrap();
    stream
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// Run serve + listen concurrently and return the matched session id.
async fn match_session(relay: &TestRelay) -> String {
    let serve_url = format!("{}/api/relay/serve", relay.http_base);
    let serve_task = tokio::spawn(post(serve_url, serve_body("alice-fp-0001", "bob-fp-0002")));
    tokio::time::sleep(Duration::from_millis(100)).await;
    let (_, listen_json) = post(
        format!("{}/api/relay/listen", relay.http_base),
        json!({ "receiverFp": "bob-fp-0002" }),
    )
    .await;
    let (serve_status, serve_json) = serve_task.await.unwrap();
    assert_eq!(serve_status, 200);
    assert_eq!(serve_json["sessionId"], listen_json["sessionId"]);
    serve_json["sessionId"].as_str().unwrap().to_string()
}

// ============================================================================
// Rendezvous over HTTP
// ============================================================================

#[tokio::test]
async fn test_sender_first_match() {
    let relay = start_relay(Duration::from_secs(5)).await;

    let serve_url = format!("{}/api/relay/serve", relay.http_base);
    let serve_task = tokio::spawn(post(serve_url, serve_body("alice-fp-0001", "bob-fp-0002")));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let (listen_status, listen_json) = post(
        format!("{}/api/relay/listen", relay.http_base),
        json!({ "receiverFp": "bob-fp-0002" }),
    )
    .await;
    let (serve_status, serve_json) = serve_task.await.unwrap();

    assert_eq!(serve_status, 200);
    assert_eq!(listen_status, 200);
    assert_eq!(serve_json["status"], "matched");
    assert_eq!(listen_json["status"], "matched");
    assert_eq!(serve_json["sessionId"], listen_json["sessionId"]);
    assert!(serve_json["expiresIn"].as_u64().unwrap() <= 120_000);

    // the receiver gets the transfer metadata verbatim
    assert_eq!(listen_json["senderFp"], "alice-fp-0001");
    assert_eq!(listen_json["filename"], "report.pdf");
    assert_eq!(listen_json["fileSize"], 1024);
    assert_eq!(listen_json["signature"], "ed25519-sig");
    assert_eq!(listen_json["fileHash"], "sha256-hash");
    assert_eq!(
        listen_json["socketPort"].as_u64().unwrap(),
        relay.socket_addr.port() as u64
    );

    let session_id = serve_json["sessionId"].as_str().unwrap();
    let session = relay.registry.get_session(session_id).unwrap();
    assert_eq!(session.status, SessionStatus::Matched);
}

#[tokio::test]
async fn test_receiver_first_match() {
    let relay = start_relay(Duration::from_secs(5)).await;

    let listen_url = format!("{}/api/relay/listen", relay.http_base);
    let listen_task = tokio::spawn(post(listen_url, json!({ "receiverFp": "bob-fp-0002" })));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let (serve_status, serve_json) = post(
        format!("{}/api/relay/serve", relay.http_base),
        serve_body("alice-fp-0001", "bob-fp-0002"),
    )
    .await;
    let (listen_status, listen_json) = listen_task.await.unwrap();

    assert_eq!(serve_status, 200);
    assert_eq!(listen_status, 200);
    assert_eq!(serve_json["status"], "matched");
    assert_eq!(listen_json["status"], "matched");
    assert_eq!(serve_json["sessionId"], listen_json["sessionId"]);
}

#[tokio::test]
async fn test_sender_timeout_removes_session() {
    let relay = start_relay(Duration::from_millis(300)).await;

    let (status, body) = post(
        format!("{}/api/relay/serve", relay.http_base),
        serve_body("alice-fp-0001", "nobody-fp"),
    )
    .await;

    assert_eq!(status, 408);
    assert_eq!(body["status"], "timeout");
    assert!(relay.registry.find_waiting_session_for("nobody-fp").is_none());
}

#[tokio::test]
async fn test_listen_timeout() {
    let relay = start_relay(Duration::from_millis(300)).await;

    let (status, body) = post(
        format!("{}/api/relay/listen", relay.http_base),
        json!({ "receiverFp": "bob-fp-0002" }),
    )
    .await;

    assert_eq!(status, 408);
    assert_eq!(body["status"], "timeout");
}

#[tokio::test]
async fn test_serve_missing_sender_fp_is_bad_request() {
    let relay = start_relay(Duration::from_secs(5)).await;

    let mut body = serve_body("", "bob-fp-0002");
    body.as_object_mut().unwrap().remove("senderFp");
    let (status, json) = post(format!("{}/api/relay/serve", relay.http_base), body).await;

    assert_eq!(status, 400);
    assert!(json["message"]
        .as_str()
        .unwrap()
        .contains("sender fingerprint"));
    // nothing was created
    assert!(relay
        .registry
        .find_waiting_session_for("bob-fp-0002")
        .is_none());
}

#[tokio::test]
async fn test_serve_rejects_negative_file_size() {
    let relay = start_relay(Duration::from_secs(5)).await;

    let mut body = serve_body("alice-fp-0001", "bob-fp-0002");
    body["fileSize"] = json!(-1);
    let (status, json) = post(format!("{}/api/relay/serve", relay.http_base), body).await;

    assert_eq!(status, 400);
    assert!(json["message"].as_str().unwrap().contains("file size"));
}

#[tokio::test]
async fn test_listen_missing_fingerprint_is_bad_request() {
    let relay = start_relay(Duration::from_secs(5)).await;

    let (status, json) = post(
        format!("{}/api/relay/listen", relay.http_base),
        json!({}),
    )
    .await;

    assert_eq!(status, 400);
    assert!(json["message"]
        .as_str()
        .unwrap()
        .contains("receiver fingerprint"));
}

#[tokio::test]
async fn test_second_listen_conflicts() {
    let relay = start_relay(Duration::from_secs(2)).await;

    let listen_url = format!("{}/api/relay/listen", relay.http_base);
    let first = tokio::spawn(post(listen_url.clone(), json!({ "receiverFp": "bob-fp" })));
    tokio::time::sleep(Duration::from_millis(200)).await;

    let (status, _body) = post(listen_url, json!({ "receiverFp": "bob-fp" })).await;
    assert_eq!(status, 409);

    // the parked listener is untouched and times out normally
    let (first_status, _) = first.await.unwrap();
    assert_eq!(first_status, 408);
}

#[tokio::test]
async fn test_complete_session_endpoint() {
    let relay = start_relay(Duration::from_secs(5)).await;
    let session_id = match_session(&relay).await;

    let response = reqwest::Client::new()
        .delete(format!(
            "{}/api/relay/session/{}",
            relay.http_base, session_id
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "Session completed");

    let session = relay.registry.get_session(&session_id).unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
}

#[tokio::test]
async fn test_health_endpoint() {
    let relay = start_relay(Duration::from_secs(5)).await;
    let response = reqwest::get(format!("{}/health", relay.http_base))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    assert_eq!(response.text().await.unwrap(), "OK");
}

// ============================================================================
// Socket relay
// ============================================================================

#[tokio::test]
async fn test_full_transfer_one_mebibyte() {
    let relay = start_relay(Duration::from_secs(5)).await;
    let session_id = match_session(&relay).await;

    // both sides must be in flight at once: READY is only sent to a pair
    let (mut sender, mut receiver) = tokio::join!(
        connect_and_ack(relay.socket_addr, &session_id, "sender"),
        connect_and_ack(relay.socket_addr, &session_id, "receiver"),
    );

    let data = payload(1024 * 1024);
    let to_send = data.clone();
    let send_task = tokio::spawn(async move {
        sender.write_all(&to_send).await.unwrap();
        sender.shutdown().await.unwrap();
    });

    let mut received = vec![0u8; data.len()];
    receiver.read_exact(&mut received).await.unwrap();
    send_task.await.unwrap();

    assert_eq!(received, data);
    // relay saw exactly the payload, not the handshake lines
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(relay.registry.total_bytes_transferred(), data.len() as u64);
}

#[tokio::test]
async fn test_payload_sent_with_ack_is_buffered() {
    let relay = start_relay(Duration::from_secs(5)).await;
    let session_id = match_session(&relay).await;

    // sender connects and handshakes but does not ACK yet
    let mut sender = TcpStream::connect(relay.socket_addr).await.unwrap();
    sender
        .write_all(format!("{}:sender\n", session_id).as_bytes())
        .await
        .unwrap();

    let mut receiver = TcpStream::connect(relay.socket_addr).await.unwrap();
    receiver
        .write_all(format!("{}:receiver\n", session_id).as_bytes())
        .await
        .unwrap();

    let mut ready = [0u8; 6];
    sender.read_exact(&mut ready).await.unwrap();
    assert_eq!(&ready, b"READY\n");
    receiver.read_exact(&mut ready).await.unwrap();
    assert_eq!(&ready, b"READY\n");

    // ACK and 64 KiB of payload in a single write, before the receiver ACKs
    let data = payload(64 * 1024);
    let mut burst = b"ACK\n".to_vec();
    burst.extend_from_slice(&data);
    sender.write_all(&burst).await.unwrap();

    // nothing may reach the receiver until it has ACKed
    let mut probe = [0u8; 1];
    let early = tokio::time::timeout(Duration::from_millis(200), receiver.read(&mut probe)).await;
    assert!(early.is_err(), "payload leaked before both ACKs");

    receiver.write_all(b"ACK\n").await.unwrap();
    let mut received = vec![0u8; data.len()];
    receiver.read_exact(&mut received).await.unwrap();
    assert_eq!(received, data);
}

#[tokio::test]
async fn test_relay_is_bidirectional() {
    let relay = start_relay(Duration::from_secs(5)).await;
    let session_id = match_session(&relay).await;

    let (mut sender, mut receiver) = tokio::join!(
        connect_and_ack(relay.socket_addr, &session_id, "sender"),
        connect_and_ack(relay.socket_addr, &session_id, "receiver"),
    );

    sender.write_all(b"from-sender").await.unwrap();
    let mut buf = [0u8; 11];
    receiver.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"from-sender");

    receiver.write_all(b"from-receiver").await.unwrap();
    let mut buf = [0u8; 13];
    sender.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"from-receiver");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(relay.registry.total_bytes_transferred(), 24);
}

#[tokio::test]
async fn test_peer_drop_mid_transfer_closes_partner() {
    let relay = start_relay(Duration::from_secs(5)).await;
    let session_id = match_session(&relay).await;

    let (mut sender, mut receiver) = tokio::join!(
        connect_and_ack(relay.socket_addr, &session_id, "sender"),
        connect_and_ack(relay.socket_addr, &session_id, "receiver"),
    );

    let data = payload(500 * 1024);
    sender.write_all(&data).await.unwrap();
    drop(sender);

    // everything sent still arrives, then the relay hangs up on us
    let mut received = vec![0u8; data.len()];
    receiver.read_exact(&mut received).await.unwrap();
    assert_eq!(received, data);
    let n = receiver.read(&mut [0u8; 256]).await.unwrap();
    assert_eq!(n, 0, "receiver should see EOF after the sender drops");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(relay.registry.get_active(&session_id).is_none());
    assert_eq!(relay.registry.total_bytes_transferred(), data.len() as u64);
}

#[tokio::test]
async fn test_handshake_with_unknown_session_is_closed() {
    let relay = start_relay(Duration::from_secs(5)).await;

    let mut stream = TcpStream::connect(relay.socket_addr).await.unwrap();
    stream
        .write_all(b"00000000-dead-beef-0000-000000000000:sender\n")
        .await
        .unwrap();

    let n = stream.read(&mut [0u8; 16]).await.unwrap();
    assert_eq!(n, 0, "unknown session should be disconnected");
}

#[tokio::test]
async fn test_handshake_with_expired_session_is_closed() {
    let relay = start_relay(Duration::from_secs(5)).await;

    let session = Session::new(
        "alice-fp-0001",
        "bob-fp-0002",
        "report.pdf",
        1024,
        "sig",
        "hash",
        Duration::ZERO,
    );
    let session_id = session.session_id.clone();
    relay.registry.put_session(session).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert!(relay.registry.get_session(&session_id).is_none());

    let mut stream = TcpStream::connect(relay.socket_addr).await.unwrap();
    stream
        .write_all(format!("{}:sender\n", session_id).as_bytes())
        .await
        .unwrap();
    let n = stream.read(&mut [0u8; 16]).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn test_malformed_handshake_is_closed() {
    let relay = start_relay(Duration::from_secs(5)).await;

    for line in ["no-colon\n", "some-id:pilot\n"] {
        let mut stream = TcpStream::connect(relay.socket_addr).await.unwrap();
        stream.write_all(line.as_bytes()).await.unwrap();
        let n = stream.read(&mut [0u8; 16]).await.unwrap();
        assert_eq!(n, 0, "handshake {:?} should be rejected", line);
    }
}

#[tokio::test]
async fn test_duplicate_role_does_not_disturb_pending_partner() {
    let relay = start_relay(Duration::from_secs(5)).await;
    let session_id = match_session(&relay).await;

    let mut first = TcpStream::connect(relay.socket_addr).await.unwrap();
    first
        .write_all(format!("{}:sender\n", session_id).as_bytes())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // same role again: the new connection is closed, the first stays parked
    let mut dup = TcpStream::connect(relay.socket_addr).await.unwrap();
    dup.write_all(format!("{}:sender\n", session_id).as_bytes())
        .await
        .unwrap();
    let n = dup.read(&mut [0u8; 16]).await.unwrap();
    assert_eq!(n, 0);

    // the original sender still pairs with a receiver
    let mut receiver = TcpStream::connect(relay.socket_addr).await.unwrap();
    receiver
        .write_all(format!("{}:receiver\n", session_id).as_bytes())
        .await
        .unwrap();
    let mut ready = [0u8; 6];
    first.read_exact(&mut ready).await.unwrap();
    assert_eq!(&ready, b"READY\n");
    receiver.read_exact(&mut ready).await.unwrap();
    assert_eq!(&ready, b"READY\n");
}
