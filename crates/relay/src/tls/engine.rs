//! Record-layer engine abstraction
//!
//! A [`TlsEngine`] turns ciphertext into plaintext (`unwrap`) and plaintext
//! into ciphertext (`wrap`) over caller-supplied buffers, reporting what it
//! needs next through an [`EngineResult`]. It performs no I/O of its own; the
//! [`TlsAdapter`](super::TlsAdapter) moves bytes between the engine and a
//! socket.

use std::io::{self, Read, Write};

use rustls::{ClientConnection, ServerConnection};
use tracing::trace;

/// Outcome of one engine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// The peer closed the session
    Closed,
    /// More ciphertext is needed before anything can be produced
    BufferUnderflow,
    /// The output buffer has no room for what is ready
    BufferOverflow,
}

/// What the handshake needs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    NotHandshaking,
    /// The handshake completed during this operation
    Finished,
    /// Delegated tasks must run before the engine can continue
    NeedTask,
    /// The engine has ciphertext to send
    NeedWrap,
    /// The engine is waiting for ciphertext from the peer
    NeedUnwrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineResult {
    pub status: Status,
    pub handshake: HandshakeStatus,
    /// Input bytes taken by the operation
    pub consumed: usize,
    /// Output bytes written by the operation
    pub produced: usize,
}

impl EngineResult {
    pub fn new(status: Status, handshake: HandshakeStatus, consumed: usize, produced: usize) -> Self {
        Self { status, handshake, consumed, produced }
    }

    pub fn made_progress(&self) -> bool {
        self.consumed > 0 || self.produced > 0
    }
}

/// Work the engine hands back to be run before it can continue.
pub type DelegatedTask = Box<dyn FnOnce() + Send>;

/// A TLS session driven through explicit wrap and unwrap calls.
pub trait TlsEngine {
    /// Feeds ciphertext from `net_in` and writes plaintext into `app_in`.
    fn unwrap(&mut self, net_in: &[u8], app_in: &mut [u8]) -> io::Result<EngineResult>;

    /// Feeds plaintext from `app_out` and writes ciphertext into `net_out`.
    fn wrap(&mut self, app_out: &[u8], net_out: &mut [u8]) -> io::Result<EngineResult>;

    /// The next delegated task, if the engine is waiting on one.
    fn delegated_task(&mut self) -> Option<DelegatedTask>;

    fn handshake_status(&self) -> HandshakeStatus;

    /// Plaintext already decrypted but not yet handed out by `unwrap`.
    fn has_buffered_plaintext(&self) -> bool;
}

/// Either end of a rustls session.
#[derive(Debug)]
pub enum RustlsSession {
    Client(ClientConnection),
    Server(ServerConnection),
}

impl RustlsSession {
    pub fn read_tls(&mut self, rd: &mut dyn Read) -> io::Result<usize> {
        match self {
            RustlsSession::Client(c) => c.read_tls(rd),
            RustlsSession::Server(c) => c.read_tls(rd),
        }
    }

    pub fn write_tls(&mut self, wr: &mut dyn Write) -> io::Result<usize> {
        match self {
            RustlsSession::Client(c) => c.write_tls(wr),
            RustlsSession::Server(c) => c.write_tls(wr),
        }
    }

    pub fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            RustlsSession::Client(c) => c.process_new_packets(),
            RustlsSession::Server(c) => c.process_new_packets(),
        }
    }

    pub fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            RustlsSession::Client(c) => c.reader(),
            RustlsSession::Server(c) => c.reader(),
        }
    }

    pub fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            RustlsSession::Client(c) => c.writer(),
            RustlsSession::Server(c) => c.writer(),
        }
    }

    pub fn wants_write(&self) -> bool {
        match self {
            RustlsSession::Client(c) => c.wants_write(),
            RustlsSession::Server(c) => c.wants_write(),
        }
    }

    pub fn is_handshaking(&self) -> bool {
        match self {
            RustlsSession::Client(c) => c.is_handshaking(),
            RustlsSession::Server(c) => c.is_handshaking(),
        }
    }

    pub fn send_close_notify(&mut self) {
        match self {
            RustlsSession::Client(c) => c.send_close_notify(),
            RustlsSession::Server(c) => c.send_close_notify(),
        }
    }
}

impl From<ClientConnection> for RustlsSession {
    fn from(conn: ClientConnection) -> Self {
        RustlsSession::Client(conn)
    }
}

impl From<ServerConnection> for RustlsSession {
    fn from(conn: ServerConnection) -> Self {
        RustlsSession::Server(conn)
    }
}

pub(crate) fn tls_error(e: rustls::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// [`TlsEngine`] over a rustls session.
///
/// rustls never delegates work, so `NeedTask` is never reported.
#[derive(Debug)]
pub struct RustlsEngine {
    session: RustlsSession,
    handshaking: bool,
    peer_closed: bool,
    buffered_plaintext: usize,
}

impl RustlsEngine {
    pub fn new(session: impl Into<RustlsSession>) -> Self {
        let session = session.into();
        let handshaking = session.is_handshaking();
        Self { session, handshaking, peer_closed: false, buffered_plaintext: 0 }
    }

    pub fn session(&self) -> &RustlsSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut RustlsSession {
        &mut self.session
    }

    fn read_plaintext(&mut self, app_in: &mut [u8]) -> io::Result<usize> {
        if app_in.is_empty() {
            return Ok(0);
        }

        match self.session.reader().read(app_in) {
            Ok(0) => {
                self.peer_closed = true;
                Ok(0)
            }
            Ok(n) => {
                self.buffered_plaintext = self.buffered_plaintext.saturating_sub(n);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Reports `Finished` once, on the operation that ends the handshake.
    fn step_handshake(&mut self) -> HandshakeStatus {
        if self.handshaking && !self.session.is_handshaking() {
            self.handshaking = false;
            trace!("tls handshake finished");
            return HandshakeStatus::Finished;
        }
        self.handshake_status()
    }
}

impl TlsEngine for RustlsEngine {
    fn unwrap(&mut self, net_in: &[u8], app_in: &mut [u8]) -> io::Result<EngineResult> {
        let mut produced = self.read_plaintext(app_in)?;
        let mut consumed = 0;

        if !net_in.is_empty() && produced < app_in.len() && !self.peer_closed {
            let mut rd = net_in;
            consumed = self.session.read_tls(&mut rd)?;
            let io_state = self.session.process_new_packets().map_err(tls_error)?;
            self.buffered_plaintext = io_state.plaintext_bytes_to_read();
            produced += self.read_plaintext(&mut app_in[produced..])?;
            if io_state.peer_has_closed() && self.buffered_plaintext == 0 {
                self.peer_closed = true;
            }
        }

        let handshake = self.step_handshake();
        let status = if produced == 0 && self.peer_closed {
            Status::Closed
        } else if produced == 0 && app_in.is_empty() && self.buffered_plaintext > 0 {
            Status::BufferOverflow
        } else if produced == 0 && consumed == 0 && !self.session.wants_write() {
            Status::BufferUnderflow
        } else {
            Status::Ok
        };

        Ok(EngineResult::new(status, handshake, consumed, produced))
    }

    fn wrap(&mut self, app_out: &[u8], net_out: &mut [u8]) -> io::Result<EngineResult> {
        let consumed = if app_out.is_empty() { 0 } else { self.session.writer().write(app_out)? };

        let mut wr = &mut net_out[..];
        let produced = if self.session.wants_write() && !wr.is_empty() { self.session.write_tls(&mut wr)? } else { 0 };

        let handshake = self.step_handshake();
        let status = if produced == 0 && self.session.wants_write() { Status::BufferOverflow } else { Status::Ok };

        Ok(EngineResult::new(status, handshake, consumed, produced))
    }

    fn delegated_task(&mut self) -> Option<DelegatedTask> {
        None
    }

    fn handshake_status(&self) -> HandshakeStatus {
        if self.session.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.session.is_handshaking() {
            HandshakeStatus::NeedUnwrap
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    fn has_buffered_plaintext(&self) -> bool {
        self.buffered_plaintext > 0
    }
}
