//! Fixtures shared by the socket-level tests: a scripted upstream, a
//! recording director, and a client connected through either discipline.

#![allow(dead_code, reason = "each test binary uses a different subset")]

pub mod scenarios;

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use micro_relay::blocking::{BlockingEngine, ExchangeHandle, TlsTransport};
use micro_relay::config::{BlockingConfig, SelectorConfig};
use micro_relay::director::{ConnectionTarget, Director};
use micro_relay::protocol::{HttpMessage, MessageContext};
use micro_relay::selector::EventLoopPool;
use parking_lot::{Condvar, Mutex};
use rustls::pki_types::{CertificateDer, PrivatePkcs8KeyDer, ServerName};
use rustls::{ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection, StreamOwned};

pub const HELLO: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";
pub const TIMEOUT: Duration = Duration::from_secs(5);
pub const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
pub const LARGE_BODY: usize = 4 * 1024 * 1024;

/// What the scripted upstream does with each request head it reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Answer every request with [`HELLO`]
    Hello,
    /// Promise ten body bytes, send three, hang up
    Truncated,
    /// Read and never answer
    Silent,
    /// Answer with [`chunked_response`]
    Chunked,
    /// Answer one request with [`HELLO`], then hang up
    Once,
    /// Send `100 Continue` ahead of [`HELLO`]
    Interim,
    /// Answer with an unparsable `Content-Length`
    BadLength,
    /// Answer with a [`LARGE_BODY`]-byte body
    Large,
}

pub struct Upstream {
    pub addr: SocketAddr,
    /// Every request head the upstream read, in order
    pub heads: Receiver<String>,
}

pub fn upstream(script: Script) -> Upstream {
    upstream_with(script, None)
}

pub fn upstream_with(script: Script, tls: Option<Arc<ServerConfig>>) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let (heads_tx, heads) = unbounded();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { return };
            let heads_tx = heads_tx.clone();
            let tls = tls.clone();
            thread::spawn(move || match tls {
                Some(config) => {
                    let session = ServerConnection::new(config).unwrap();
                    serve_upstream(StreamOwned::new(session, stream), script, &heads_tx);
                }
                None => serve_upstream(stream, script, &heads_tx),
            });
        }
    });

    Upstream { addr, heads }
}

fn serve_upstream<S: Read + Write>(mut stream: S, script: Script, heads: &Sender<String>) {
    while let Some(head) = read_head(&mut stream) {
        let _ = heads.send(head);
        match script {
            Script::Hello => {
                if stream.write_all(HELLO).and_then(|()| stream.flush()).is_err() {
                    return;
                }
            }
            Script::Truncated => {
                let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc");
                let _ = stream.flush();
                return;
            }
            Script::Chunked => {
                if stream.write_all(&chunked_response()).and_then(|()| stream.flush()).is_err() {
                    return;
                }
            }
            Script::Once => {
                let _ = stream.write_all(HELLO).and_then(|()| stream.flush());
                return;
            }
            Script::Interim => {
                let answered = stream.write_all(CONTINUE).and_then(|()| stream.write_all(HELLO));
                if answered.and_then(|()| stream.flush()).is_err() {
                    return;
                }
            }
            Script::BadLength => {
                let _ = stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: zz\r\n\r\nhello");
                let _ = stream.flush();
                return;
            }
            Script::Large => {
                let head = format!("HTTP/1.1 200 OK\r\nContent-Length: {LARGE_BODY}\r\n\r\n");
                let answered = stream.write_all(head.as_bytes()).and_then(|()| stream.write_all(&large_body()));
                if answered.and_then(|()| stream.flush()).is_err() {
                    return;
                }
            }
            Script::Silent => {
                let mut sink = [0u8; 1024];
                while matches!(stream.read(&mut sink), Ok(n) if n > 0) {}
                return;
            }
        }
    }
}

/// Reads up to and including the empty line; `None` on end-of-stream.
fn read_head<S: Read>(stream: &mut S) -> Option<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        match stream.read(&mut byte) {
            Ok(1) => head.push(byte[0]),
            _ => return None,
        }
    }
    Some(String::from_utf8_lossy(&head).into_owned())
}

/// Sixty-four 1 KiB chunks cycling through the alphabet.
pub fn chunked_response() -> Vec<u8> {
    let mut response = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    for i in 0..64u8 {
        response.extend_from_slice(b"400\r\n");
        response.extend_from_slice(&[b'a' + i % 26; 1024]);
        response.extend_from_slice(b"\r\n");
    }
    response.extend_from_slice(b"0\r\n\r\n");
    response
}

/// [`LARGE_BODY`] bytes cycling through the alphabet.
pub fn large_body() -> Vec<u8> {
    (0..LARGE_BODY).map(|i| b'a' + u8::try_from(i % 26).unwrap()).collect()
}

/// A port nothing listens on.
pub fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Complete { path: String, status: i32 },
    PrematureRequest { path: String },
    PrematureResponse { status: i32 },
    RequestProtocolError,
    ResponseProtocolError,
}

#[derive(Default)]
pub struct Log {
    events: Mutex<Vec<Event>>,
    changed: Condvar,
}

impl Log {
    fn push(&self, event: Event) {
        self.events.lock().push(event);
        self.changed.notify_all();
    }

    /// Waits until `done` holds (or the timeout passes) and returns what was recorded.
    pub fn wait_for(&self, done: impl Fn(&[Event]) -> bool) -> Vec<Event> {
        let deadline = Instant::now() + TIMEOUT;
        let mut events = self.events.lock();
        while !done(&events) {
            if self.changed.wait_until(&mut events, deadline).timed_out() {
                break;
            }
        }
        events.clone()
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

/// Routes everything except `/missing` to one upstream, rewriting `Host`.
pub struct Recording {
    pub upstream: ConnectionTarget,
    pub log: Arc<Log>,
    pub tls: Option<Arc<ClientConfig>>,
    /// How long each request header sift takes
    pub sift_delay: Duration,
    /// How many requests were routed
    pub resolved: Arc<AtomicUsize>,
}

impl Recording {
    pub fn new(upstream: SocketAddr) -> (Self, Arc<Log>) {
        let log = Arc::new(Log::default());
        let target = ConnectionTarget::plain(upstream.ip().to_string(), upstream.port());
        let director = Self {
            upstream: target,
            log: Arc::clone(&log),
            tls: None,
            sift_delay: Duration::ZERO,
            resolved: Arc::new(AtomicUsize::new(0)),
        };
        (director, log)
    }

    pub fn tls(upstream: SocketAddr, config: Arc<ClientConfig>) -> (Self, Arc<Log>) {
        let (mut director, log) = Self::new(upstream);
        director.upstream = ConnectionTarget::tls(upstream.ip().to_string(), upstream.port());
        director.tls = Some(config);
        (director, log)
    }
}

impl Director for Recording {
    fn sift_request_header(&self, name: &str, _value: &str, _cx: &MessageContext<'_>) -> Option<String> {
        if !self.sift_delay.is_zero() {
            thread::sleep(self.sift_delay);
        }
        name.eq_ignore_ascii_case("host").then(|| "upstream".to_owned())
    }

    fn resolve_upstream(&self, request: &mut HttpMessage) -> Option<ConnectionTarget> {
        self.resolved.fetch_add(1, Ordering::SeqCst);
        (!request.path().starts_with("/missing")).then(|| self.upstream.clone())
    }

    fn on_exchange_complete(&self, request: &HttpMessage, response: &HttpMessage) {
        self.log.push(Event::Complete { path: request.path().to_owned(), status: response.status() });
    }

    fn on_request_protocol_error(&self, _request: &HttpMessage, _description: &str) {
        self.log.push(Event::RequestProtocolError);
    }

    fn on_response_protocol_error(&self, _request: Option<&HttpMessage>, _response: &HttpMessage, _description: &str) {
        self.log.push(Event::ResponseProtocolError);
    }

    fn on_premature_request_closed(&self, request: &HttpMessage, _cause: &io::Error) {
        self.log.push(Event::PrematureRequest { path: request.path().to_owned() });
    }

    fn on_premature_response_closed(&self, _request: Option<&HttpMessage>, response: &HttpMessage, _cause: &io::Error) {
        self.log.push(Event::PrematureResponse { status: response.status() });
    }

    fn read_wait_backoff(&self) -> Duration {
        Duration::from_millis(1)
    }

    fn tls_client_config(&self) -> Option<Arc<ClientConfig>> {
        self.tls.clone()
    }
}

pub enum Proxy {
    Blocking(BlockingEngine),
    Selector(EventLoopPool),
}

impl Proxy {
    pub fn blocking(director: Recording) -> Self {
        Self::blocking_with(director, BlockingConfig::default())
    }

    pub fn blocking_with(director: Recording, config: BlockingConfig) -> Self {
        Self::Blocking(BlockingEngine::new(director, config))
    }

    pub fn selector(director: Recording) -> Self {
        Self::Selector(EventLoopPool::start(director, SelectorConfig::default().with_workers(2)).unwrap())
    }

    /// Opens a client connection and hands its accepted end to the proxy.
    pub fn connect(&self) -> Client {
        let (client, accepted) = socket_pair();
        let handle = match self {
            Proxy::Blocking(engine) => Some(engine.serve(accepted).unwrap()),
            Proxy::Selector(pool) => {
                pool.dispatch(accepted).unwrap();
                None
            }
        };
        Client { stream: client, handle }
    }

    /// Like [`Self::connect`], terminating TLS at the proxy.
    pub fn connect_tls(&self, server: Arc<ServerConfig>, client: Arc<ClientConfig>) -> TlsClient {
        let (stream, accepted) = socket_pair();
        let session = ServerConnection::new(server).unwrap();
        let handle = match self {
            Proxy::Blocking(engine) => {
                let transport = TlsTransport::new(session, accepted, Duration::from_millis(20)).unwrap();
                Some(engine.serve(transport).unwrap())
            }
            Proxy::Selector(pool) => {
                pool.dispatch_tls(accepted, session).unwrap();
                None
            }
        };

        let session = ClientConnection::new(client, ServerName::try_from("localhost").unwrap()).unwrap();
        TlsClient { stream: StreamOwned::new(session, stream), handle }
    }
}

fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    client.set_read_timeout(Some(TIMEOUT)).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    (client, accepted)
}

pub struct Client {
    pub stream: TcpStream,
    pub handle: Option<ExchangeHandle>,
}

impl Client {
    pub fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
    }

    pub fn read_exact(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).unwrap();
        buf
    }

    /// Everything until the proxy closes the connection.
    pub fn read_to_end(&mut self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.stream.read_to_end(&mut buf).unwrap();
        buf
    }

    /// Closes the client side and waits for the exchange to wind down.
    pub fn hang_up(self) {
        drop(self.stream);
        match self.handle {
            Some(handle) => handle.join(),
            None => thread::sleep(Duration::from_millis(200)),
        }
    }
}

pub struct TlsClient {
    pub stream: StreamOwned<ClientConnection, TcpStream>,
    pub handle: Option<ExchangeHandle>,
}

impl TlsClient {
    pub fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).unwrap();
        self.stream.flush().unwrap();
    }

    pub fn read_exact(&mut self, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf).unwrap();
        buf
    }
}

/// A self-signed certificate for `localhost` and `127.0.0.1` as server and
/// client configs.
pub fn tls_configs() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_owned(), "127.0.0.1".to_owned()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    let cert_der = CertificateDer::from(cert.cert);
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let server = ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key.into())
        .unwrap();

    let mut roots = RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

    (Arc::new(server), Arc::new(client))
}

pub fn complete(path: &str, status: i32) -> Event {
    Event::Complete { path: path.to_owned(), status }
}
