//! Integration tests for the vote listener.
//!
//! These tests start a real listener on an ephemeral port and drive it with
//! raw client sockets speaking both wire protocol versions.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Notify;

use ballotd::config::Settings;
use ballotd::crypto::{derive_key, KeyPair, TokenStore};
use ballotd::error::BallotError;
use ballotd::protocol::{encode_v1_block, sign_envelope, ProtocolVersion, VoteHandler, V2_MAGIC};
use ballotd::server::VoteListener;
use ballotd::vote::Vote;

/// Records every handler callback for later assertions.
#[derive(Default)]
struct RecordingHandler {
    votes: Mutex<Vec<(Vote, ProtocolVersion)>>,
    errors: Mutex<Vec<(String, bool)>>,
}

impl VoteHandler for RecordingHandler {
    fn on_vote_received(&self, vote: Vote, version: ProtocolVersion, _remote: Option<SocketAddr>) {
        self.votes.lock().unwrap().push((vote, version));
    }

    fn on_error(&self, error: &BallotError, vote_delivered: bool, _remote: SocketAddr) {
        self.errors
            .lock()
            .unwrap()
            .push((error.to_string(), vote_delivered));
    }
}

/// Test server instance.
struct TestServer {
    addr: SocketAddr,
    keys: Arc<KeyPair>,
    handler: Arc<RecordingHandler>,
    shutdown: Arc<Notify>,
}

impl TestServer {
    async fn start() -> Self {
        let mut settings = Settings::default();
        settings.listener.host = "127.0.0.1".to_string();
        settings.listener.port = 0; // ephemeral
        settings.listener.read_timeout_seconds = 1;

        // 512-bit keys keep the tests fast; block size is 64 bytes.
        let keys = Arc::new(KeyPair::generate(512).unwrap());

        let mut tokens = TokenStore::empty();
        tokens.insert("alpha", derive_key("tok123").unwrap());

        let handler = Arc::new(RecordingHandler::default());

        let listener = VoteListener::bind(
            Arc::new(settings),
            Arc::clone(&keys),
            Arc::new(tokens),
            Arc::clone(&handler) as Arc<dyn VoteHandler>,
        )
        .await
        .expect("bind failed")
        .expect("listener should be enabled");

        let addr = listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let shutdown_for_run = Arc::clone(&shutdown);

        tokio::spawn(async move {
            let _ = listener.run(shutdown_for_run).await;
        });

        Self {
            addr,
            keys,
            handler,
            shutdown,
        }
    }

    async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.expect("connect failed")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}

/// Read the greeting line and extract the session challenge.
async fn read_greeting(stream: &mut TcpStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.expect("greeting read failed");
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }

    let line = String::from_utf8(line).unwrap();
    let mut fields = line.split(' ');
    assert_eq!(fields.next(), Some("VOTIFIER"));
    assert_eq!(fields.next(), Some("2"));
    fields.next().expect("greeting carries no challenge").to_string()
}

async fn write_v2_frame(stream: &mut TcpStream, body: &[u8]) {
    stream.write_all(&V2_MAGIC.to_be_bytes()).await.unwrap();
    stream.write_all(&(body.len() as u16).to_be_bytes()).await.unwrap();
    stream.write_all(body).await.unwrap();
}

async fn read_v2_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.expect("frame read failed");
    assert_eq!(u16::from_be_bytes([header[0], header[1]]), V2_MAGIC);

    let len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.unwrap();
    body
}

/// Read until the server closes the connection, returning leftover bytes.
async fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
    let mut rest = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest))
        .await
        .expect("server did not close the connection")
        .unwrap();
    rest
}

#[tokio::test]
async fn test_v1_submission() {
    let server = TestServer::start().await;
    let mut stream = server.connect().await;

    let _challenge = read_greeting(&mut stream).await;

    let vote = Vote::new("alpha", "Steve", "1.2.3.4", "1700000000");
    let block = encode_v1_block(server.keys.public(), &vote).unwrap();
    stream.write_all(&block).await.unwrap();

    // The legacy protocol sends no reply payload; the server just closes.
    let rest = read_to_eof(&mut stream).await;
    assert!(rest.is_empty());

    let votes = server.handler.votes.lock().unwrap();
    assert_eq!(votes.as_slice(), &[(vote, ProtocolVersion::V1)]);
}

#[tokio::test]
async fn test_v2_submission() {
    let server = TestServer::start().await;
    let mut stream = server.connect().await;

    let challenge = read_greeting(&mut stream).await;

    let vote = Vote::new("alpha", "Steve", "1.2.3.4", "1700000000");
    let payload = serde_json::to_string(&vote).unwrap();
    let envelope = sign_envelope("alpha", payload, &challenge, &derive_key("tok123").unwrap());
    write_v2_frame(&mut stream, &serde_json::to_vec(&envelope).unwrap()).await;

    let ack = read_v2_frame(&mut stream).await;
    assert_eq!(ack, br#"{"status":"ok"}"#);

    let rest = read_to_eof(&mut stream).await;
    assert!(rest.is_empty());

    let votes = server.handler.votes.lock().unwrap();
    assert_eq!(votes.as_slice(), &[(vote, ProtocolVersion::V2)]);
}

#[tokio::test]
async fn test_v2_unknown_service_gets_uniform_error() {
    let server = TestServer::start().await;

    // Unknown site.
    let mut stream = server.connect().await;
    let challenge = read_greeting(&mut stream).await;
    let vote = Vote::new("zeta", "Steve", "1.2.3.4", "1700000000");
    let payload = serde_json::to_string(&vote).unwrap();
    let envelope = sign_envelope("zeta", payload, &challenge, &derive_key("tok123").unwrap());
    write_v2_frame(&mut stream, &serde_json::to_vec(&envelope).unwrap()).await;
    let unknown_site_ack = read_v2_frame(&mut stream).await;

    // Known site, broken signature.
    let mut stream = server.connect().await;
    let challenge = read_greeting(&mut stream).await;
    let vote = Vote::new("alpha", "Steve", "1.2.3.4", "1700000000");
    let payload = serde_json::to_string(&vote).unwrap();
    let mut envelope = sign_envelope("alpha", payload, &challenge, &derive_key("tok123").unwrap());
    envelope.signature = envelope.signature.chars().rev().collect();
    write_v2_frame(&mut stream, &serde_json::to_vec(&envelope).unwrap()).await;
    let bad_signature_ack = read_v2_frame(&mut stream).await;

    // The two failures must be indistinguishable to the peer.
    assert_eq!(unknown_site_ack, bad_signature_ack);
    assert_eq!(unknown_site_ack, br#"{"status":"error"}"#);

    assert!(server.handler.votes.lock().unwrap().is_empty());
    let errors = server.handler.errors.lock().unwrap();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|(_, delivered)| !delivered));
}

#[tokio::test]
async fn test_v2_replayed_envelope_rejected() {
    let server = TestServer::start().await;

    // Capture a valid envelope from one session.
    let mut stream = server.connect().await;
    let challenge = read_greeting(&mut stream).await;
    let vote = Vote::new("alpha", "Steve", "1.2.3.4", "1700000000");
    let payload = serde_json::to_string(&vote).unwrap();
    let envelope = sign_envelope("alpha", payload, &challenge, &derive_key("tok123").unwrap());
    let captured = serde_json::to_vec(&envelope).unwrap();
    write_v2_frame(&mut stream, &captured).await;
    assert_eq!(read_v2_frame(&mut stream).await, br#"{"status":"ok"}"#);

    // Replay it against a fresh session with a different challenge.
    let mut stream = server.connect().await;
    let _fresh_challenge = read_greeting(&mut stream).await;
    write_v2_frame(&mut stream, &captured).await;
    assert_eq!(read_v2_frame(&mut stream).await, br#"{"status":"error"}"#);

    let votes = server.handler.votes.lock().unwrap();
    assert_eq!(votes.len(), 1);
}

#[tokio::test]
async fn test_v1_truncated_block() {
    let server = TestServer::start().await;
    let mut stream = server.connect().await;

    let _challenge = read_greeting(&mut stream).await;

    // Send less than one RSA block, then half-close.
    let partial = vec![0x41u8; server.keys.block_size() / 2];
    stream.write_all(&partial).await.unwrap();
    stream.shutdown().await.unwrap();

    let rest = read_to_eof(&mut stream).await;
    assert!(rest.is_empty());

    assert!(server.handler.votes.lock().unwrap().is_empty());
    let errors = server.handler.errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].0.contains("Truncated input"));
    assert!(!errors[0].1);
}

#[tokio::test]
async fn test_silent_client_times_out() {
    let server = TestServer::start().await;
    let mut stream = server.connect().await;

    let _challenge = read_greeting(&mut stream).await;
    // Say nothing; the server must cut us off after its read timeout.

    let rest = read_to_eof(&mut stream).await;
    assert!(rest.is_empty());

    let errors = server.handler.errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].0.contains("timed out"));
}

#[tokio::test]
async fn test_listener_survives_bad_connections() {
    let server = TestServer::start().await;

    // A peer that disconnects immediately after the greeting.
    let mut stream = server.connect().await;
    let _challenge = read_greeting(&mut stream).await;
    drop(stream);

    // The listener must still serve the next client.
    let mut stream = server.connect().await;
    let _challenge = read_greeting(&mut stream).await;
    let vote = Vote::new("alpha", "Steve", "1.2.3.4", "1700000000");
    let block = encode_v1_block(server.keys.public(), &vote).unwrap();
    stream.write_all(&block).await.unwrap();
    read_to_eof(&mut stream).await;

    let votes = server.handler.votes.lock().unwrap();
    assert_eq!(votes.len(), 1);
}

#[tokio::test]
async fn test_negative_port_disables_listener() {
    let mut settings = Settings::default();
    settings.listener.port = -1;

    let listener = VoteListener::bind(
        Arc::new(settings),
        Arc::new(KeyPair::generate(512).unwrap()),
        Arc::new(TokenStore::empty()),
        Arc::new(RecordingHandler::default()) as Arc<dyn VoteHandler>,
    )
    .await
    .unwrap();

    assert!(listener.is_none());
}
