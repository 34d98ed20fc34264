//! Integration Tests for multiwire Carriers
//!
//! Real sockets on loopback:
//! - TCP request/response through one handler
//! - Server-side addressing (`send_to`, `broadcast`)
//! - Reconnecting client buffering across a server restart
//! - Session cleanup when a connection ends
//! - Per-type throttling on the wire
//! - UDP request/response
//!
//! # Running
//!
//! ```bash
//! cargo test -p multiwire-core --test integration_tests
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use multiwire_core::pipeline::{ChannelContext, HandlerResult, ProtocolHandler};
use multiwire_core::protocol::ProtocolCodec;
use multiwire_core::transport::frame::{encode_frame, MAX_FRAME_SIZE};
use multiwire_core::{
    Client, Connection, Protocol, ProtocolError, ProtocolReader, ProtocolRegistry, ProtocolType,
    ProtocolWriter, ReconnectClient, RequestStatus, Server, SessionCleanupHandler,
    SessionRegistry, TcpClient, TcpServer, TransportConfig, TransportError, UdpClient,
    UdpEnvelope, UdpServer,
};

// =============================================================================
// Test Protocols
// =============================================================================

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Chat {
    text: String,
}

impl Chat {
    fn boxed(text: &str) -> Box<dyn Protocol> {
        Box::new(Self {
            text: text.to_string(),
        })
    }
}

impl Protocol for Chat {
    fn protocol_id(&self) -> u32 {
        Self::ID
    }

    fn read(&mut self, reader: &mut ProtocolReader) -> Result<(), ProtocolError> {
        self.text = reader.read_string()?;
        Ok(())
    }

    fn write(&self, writer: &mut ProtocolWriter) {
        writer.write_string(&self.text);
    }
}

impl ProtocolType for Chat {
    const ID: u32 = 10;
}

/// Throttled to one per minute
#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct Heavy;

impl Protocol for Heavy {
    fn protocol_id(&self) -> u32 {
        Self::ID
    }
}

impl ProtocolType for Heavy {
    const ID: u32 = 11;
    const MIN_INTERVAL: Duration = Duration::from_secs(60);
}

fn registry() -> Arc<ProtocolRegistry> {
    ProtocolRegistry::new()
        .with_type::<Chat>()
        .unwrap()
        .with_type::<Heavy>()
        .unwrap()
        .into_shared()
}

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn text_of(message: &dyn Protocol) -> Option<String> {
    message.downcast_ref::<Chat>().map(|chat| chat.text.clone())
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

async fn recv_n<T>(rx: &mut mpsc::UnboundedReceiver<T>, n: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(n);
    while out.len() < n {
        match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await {
            Ok(Some(item)) => out.push(item),
            _ => break,
        }
    }
    out
}

// =============================================================================
// Test Handlers
// =============================================================================

/// Replies `echo:<text>` to every chat
struct Echo;

impl ProtocolHandler<Box<dyn Protocol>> for Echo {
    fn handle(
        &self,
        ctx: &ChannelContext<Box<dyn Protocol>>,
        message: Box<dyn Protocol>,
    ) -> HandlerResult {
        if let Some(text) = text_of(&*message) {
            let _ = ctx.send(Chat::boxed(&format!("echo:{text}")));
        }
        Ok(())
    }
}

/// Forwards chat texts, rejections and errors to the test body
struct Sink {
    texts: mpsc::UnboundedSender<String>,
    rejected: AtomicUsize,
    errors: Mutex<Vec<String>>,
}

impl Sink {
    fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (texts, rx) = mpsc::unbounded_channel();
        let sink = Arc::new(Self {
            texts,
            rejected: AtomicUsize::new(0),
            errors: Mutex::new(Vec::new()),
        });
        (sink, rx)
    }
}

impl ProtocolHandler<Box<dyn Protocol>> for Sink {
    fn handle(
        &self,
        _ctx: &ChannelContext<Box<dyn Protocol>>,
        message: Box<dyn Protocol>,
    ) -> HandlerResult {
        let text = text_of(&*message).unwrap_or_else(|| format!("{message:?}"));
        let _ = self.texts.send(text);
        Ok(())
    }

    fn rate_limit_reject(
        &self,
        _ctx: &ChannelContext<Box<dyn Protocol>>,
        _message: Box<dyn Protocol>,
    ) {
        self.rejected.fetch_add(1, Ordering::SeqCst);
    }

    fn handle_exception(&self, _ctx: &ChannelContext<Box<dyn Protocol>>, cause: &TransportError) {
        self.errors.lock().push(cause.to_string());
    }
}

// =============================================================================
// TCP
// =============================================================================

#[tokio::test]
async fn test_tcp_request_response() {
    let registry = registry();
    let config = TransportConfig::for_testing();
    let server = TcpServer::socket(config.clone(), Arc::clone(&registry), Arc::new(Echo));
    let addr = server.bind(any_port()).await.unwrap();

    let (sink, mut rx) = Sink::new();
    let client = TcpClient::socket(config, registry, sink);
    client.connect(addr).await.unwrap();
    assert!(client.is_active());
    assert_eq!(client.remote_addr(), Some(addr));

    for text in ["a", "b", "c"] {
        assert_eq!(client.request(Chat::boxed(text)).unwrap(), RequestStatus::Queued);
    }
    assert_eq!(recv_n(&mut rx, 3).await, vec!["echo:a", "echo:b", "echo:c"]);

    client.close().await;
    client.close().await;
    assert!(!client.is_active());
    server.close().await;
}

#[tokio::test]
async fn test_tcp_server_send_to_and_broadcast() {
    let registry = registry();
    let config = TransportConfig::for_testing();
    let server = TcpServer::socket(config.clone(), Arc::clone(&registry), Arc::new(Echo));
    let addr = server.bind(any_port()).await.unwrap();

    let (sink_a, mut rx_a) = Sink::new();
    let (sink_b, mut rx_b) = Sink::new();
    let a = TcpClient::socket(config.clone(), Arc::clone(&registry), sink_a);
    let b = TcpClient::socket(config, registry, sink_b);
    a.connect(addr).await.unwrap();
    b.connect(addr).await.unwrap();
    wait_for(|| server.connections().len() == 2).await;

    assert_eq!(server.broadcast(|| Chat::boxed("all")), 2);
    assert_eq!(recv_n(&mut rx_a, 1).await, vec!["all"]);
    assert_eq!(recv_n(&mut rx_b, 1).await, vec!["all"]);

    let first = server.connections()[0].clone();
    server.send_to(&first, Chat::boxed("one")).unwrap();
    let got = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::select! {
            Some(text) = rx_a.recv() => text,
            Some(text) = rx_b.recv() => text,
        }
    })
    .await
    .unwrap();
    assert_eq!(got, "one");

    a.close().await;
    wait_for(|| server.connections().len() == 1).await;
    b.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_tcp_corrupted_frame_is_skipped() {
    let registry = registry();
    let (sink, mut rx) = Sink::new();
    let server = TcpServer::socket(
        TransportConfig::for_testing(),
        Arc::clone(&registry),
        Arc::clone(&sink) as Arc<dyn ProtocolHandler<Box<dyn Protocol>>>,
    );
    let addr = server.bind(any_port()).await.unwrap();

    let codec = ProtocolCodec::new(registry);
    let mut bad =
        encode_frame(&codec.encode(&*Chat::boxed("bad")), MAX_FRAME_SIZE).unwrap();
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;
    let good =
        encode_frame(&codec.encode(&*Chat::boxed("good")), MAX_FRAME_SIZE).unwrap();

    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(&bad).await.unwrap();
    stream.write_all(&good).await.unwrap();

    assert_eq!(recv_n(&mut rx, 1).await, vec!["good"]);
    assert_eq!(sink.errors.lock().len(), 1);

    drop(stream);
    server.close().await;
}

#[tokio::test]
async fn test_tcp_min_interval_throttles_type() {
    let registry = registry();
    let (sink, mut rx) = Sink::new();
    let server = TcpServer::socket(
        TransportConfig::for_testing(),
        Arc::clone(&registry),
        Arc::clone(&sink) as Arc<dyn ProtocolHandler<Box<dyn Protocol>>>,
    );
    let addr = server.bind(any_port()).await.unwrap();

    let (client_sink, _client_rx) = Sink::new();
    let client = TcpClient::socket(TransportConfig::for_testing(), registry, client_sink);
    client.connect(addr).await.unwrap();
    client.request(Box::new(Heavy)).unwrap();
    client.request(Box::new(Heavy)).unwrap();
    client.request(Chat::boxed("after")).unwrap();

    assert_eq!(recv_n(&mut rx, 2).await, vec!["Heavy", "after"]);
    assert_eq!(sink.rejected.load(Ordering::SeqCst), 1);

    client.close().await;
    server.close().await;
}

// =============================================================================
// Reconnecting Client
// =============================================================================

#[tokio::test]
async fn test_reconnect_replays_buffer_after_server_restart() {
    let registry = registry();
    let config = TransportConfig::for_testing();

    let (first_sink, mut first_rx) = Sink::new();
    let first = TcpServer::socket(config.clone(), Arc::clone(&registry), first_sink);
    let addr = first.bind(any_port()).await.unwrap();

    let (client_sink, _client_rx) = Sink::new();
    let client = ReconnectClient::tcp(config.clone(), Arc::clone(&registry), client_sink);
    client.connect(addr).await.unwrap();
    client.request(Chat::boxed("before")).unwrap();
    assert_eq!(recv_n(&mut first_rx, 1).await, vec!["before"]);

    first.close().await;
    wait_for(|| !client.is_active()).await;

    for text in ["m1", "m2", "m3"] {
        assert_eq!(client.request(Chat::boxed(text)).unwrap(), RequestStatus::Buffered);
    }
    assert_eq!(client.buffered(), 3);

    let (second_sink, mut second_rx) = Sink::new();
    let second = TcpServer::socket(config, registry, second_sink);
    second.bind(addr).await.unwrap();

    assert_eq!(recv_n(&mut second_rx, 3).await, vec!["m1", "m2", "m3"]);
    wait_for(|| client.is_active()).await;
    assert_eq!(client.buffered(), 0);

    client.request(Chat::boxed("m4")).unwrap();
    assert_eq!(recv_n(&mut second_rx, 1).await, vec!["m4"]);

    client.close().await;
    second.close().await;
}

// =============================================================================
// Sessions
// =============================================================================

#[derive(Debug, Default)]
struct Tally {
    seen: AtomicUsize,
}

struct Counting {
    sessions: Arc<SessionRegistry<Tally>>,
    totals: mpsc::UnboundedSender<usize>,
}

impl ProtocolHandler<Box<dyn Protocol>> for Counting {
    fn handle(
        &self,
        ctx: &ChannelContext<Box<dyn Protocol>>,
        _message: Box<dyn Protocol>,
    ) -> HandlerResult {
        let tally = self.sessions.get(ctx.info());
        let seen = tally.seen.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.totals.send(seen);
        Ok(())
    }
}

#[tokio::test]
async fn test_sessions_are_per_connection_and_cleaned_up() {
    let registry = registry();
    let config = TransportConfig::for_testing();
    let sessions = Arc::new(SessionRegistry::new(|_| Tally::default()));
    let (totals, mut totals_rx) = mpsc::unbounded_channel();
    let handler = SessionCleanupHandler::<Box<dyn Protocol>, Tally>::new(
        Arc::clone(&sessions),
        Arc::new(Counting {
            sessions: Arc::clone(&sessions),
            totals,
        }),
    );
    let server = TcpServer::socket(config.clone(), Arc::clone(&registry), Arc::new(handler));
    let addr = server.bind(any_port()).await.unwrap();

    let (sink, _rx) = Sink::new();
    let a = TcpClient::socket(
        config.clone(),
        Arc::clone(&registry),
        Arc::clone(&sink) as Arc<dyn ProtocolHandler<Box<dyn Protocol>>>,
    );
    a.connect(addr).await.unwrap();
    a.request(Chat::boxed("1")).unwrap();
    a.request(Chat::boxed("2")).unwrap();
    assert_eq!(recv_n(&mut totals_rx, 2).await, vec![1, 2]);

    let b = TcpClient::socket(config, registry, sink);
    b.connect(addr).await.unwrap();
    b.request(Chat::boxed("1")).unwrap();
    assert_eq!(recv_n(&mut totals_rx, 1).await, vec![1]);
    assert_eq!(sessions.len(), 2);

    a.close().await;
    wait_for(|| sessions.len() == 1).await;
    b.close().await;
    wait_for(|| sessions.is_empty()).await;
    server.close().await;
}

// =============================================================================
// UDP
// =============================================================================

struct UdpEcho;

impl ProtocolHandler<UdpEnvelope> for UdpEcho {
    fn handle(&self, ctx: &ChannelContext<UdpEnvelope>, envelope: UdpEnvelope) -> HandlerResult {
        if let Some(text) = text_of(&*envelope.protocol) {
            let _ = ctx.send(envelope.reply(Chat::boxed(&format!("echo:{text}"))));
        }
        Ok(())
    }
}

struct UdpSink(mpsc::UnboundedSender<(String, SocketAddr)>);

impl ProtocolHandler<UdpEnvelope> for UdpSink {
    fn handle(&self, _ctx: &ChannelContext<UdpEnvelope>, envelope: UdpEnvelope) -> HandlerResult {
        if let Some(text) = text_of(&*envelope.protocol) {
            let _ = self.0.send((text, envelope.peer));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_udp_request_response() {
    let registry = registry();
    let config = TransportConfig::for_testing();
    let server = UdpServer::socket(config.clone(), Arc::clone(&registry), Arc::new(UdpEcho));
    let addr = server.bind(any_port()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = UdpClient::socket(config, registry, Arc::new(UdpSink(tx)));
    client.connect(addr).await.unwrap();
    client.send(Chat::boxed("ping")).unwrap();

    let replies = recv_n(&mut rx, 1).await;
    assert_eq!(replies, vec![("echo:ping".to_string(), addr)]);

    client.close().await;
    server.close().await;
    assert!(server.is_stopped());
}
