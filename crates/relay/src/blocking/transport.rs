//! Byte transports for the blocking discipline
//!
//! Each exchange reads a transport on one thread while writing it from the
//! other, so every operation takes `&self`.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::BlockingConfig;
use crate::director::Director;
use crate::pool::{ConnectionKey, PooledConnection};
use crate::tls::{self, RustlsSession};

/// A bidirectional byte stream shared by a reading and a writing thread.
///
/// `read` returning `Ok(0)` means end-of-stream. `WouldBlock`, `TimedOut`
/// and `Interrupted` mean no data is ready yet; the caller backs off and
/// retries.
pub trait BlockingTransport: Send + Sync + 'static {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Writes all of `buf`, retrying short writes.
    fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Closes both directions, waking any thread blocked on the transport.
    fn shutdown(&self);

    /// Whether an idle transport can carry another message. Called only while
    /// no thread is reading it.
    fn is_open(&self) -> bool {
        true
    }
}

/// Runs `check` with the socket switched to non-blocking mode.
fn check_idle(socket: &TcpStream, check: impl FnOnce() -> bool) -> bool {
    if let Err(e) = socket.set_nonblocking(true) {
        trace!(cause = %e, "set nonblocking");
        return false;
    }
    let open = check();
    socket.set_nonblocking(false).is_ok() && open
}

impl BlockingTransport for TcpStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        Read::read(&mut &*self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        Write::write(&mut &*self, buf)
    }

    fn shutdown(&self) {
        if let Err(e) = TcpStream::shutdown(self, Shutdown::Both) {
            trace!(cause = %e, "tcp shutdown");
        }
    }

    /// Open while nothing is readable. End-of-stream, unsolicited bytes and
    /// errors all rule the socket out.
    fn is_open(&self) -> bool {
        check_idle(self, || {
            let mut peeked = [0u8; 1];
            match self.peek(&mut peeked) {
                Err(e) => e.kind() == io::ErrorKind::WouldBlock,
                Ok(n) => {
                    trace!(len = n, "idle socket readable");
                    false
                }
            }
        })
    }
}

/// A rustls session over a blocking socket.
///
/// The session sits behind a lock shared by the reader and the writer. The
/// socket carries a short read timeout so a reader waiting for ciphertext
/// gives the lock up regularly; the timeout surfaces as `WouldBlock` or
/// `TimedOut`.
#[derive(Debug)]
pub struct TlsTransport {
    session: Mutex<RustlsSession>,
    socket: TcpStream,
}

impl TlsTransport {
    pub fn new(session: impl Into<RustlsSession>, socket: TcpStream, read_timeout: Duration) -> io::Result<Self> {
        socket.set_read_timeout(Some(read_timeout))?;
        Ok(Self { session: Mutex::new(session.into()), socket })
    }
}

impl BlockingTransport for TlsTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut session = self.session.lock();
        loop {
            match session.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }

            while session.wants_write() {
                session.write_tls(&mut &self.socket)?;
            }

            if session.read_tls(&mut &self.socket)? == 0 {
                return Ok(0);
            }
            session.process_new_packets().map_err(tls::engine::tls_error)?;
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut session = self.session.lock();
        let n = session.writer().write(buf)?;
        while session.wants_write() {
            session.write_tls(&mut &self.socket)?;
        }
        Ok(n)
    }

    fn shutdown(&self) {
        if let Some(mut session) = self.session.try_lock() {
            session.send_close_notify();
            if let Err(e) = session.write_tls(&mut &self.socket) {
                trace!(cause = %e, "tls close notify");
            }
        }
        BlockingTransport::shutdown(&self.socket);
    }

    /// Takes in whatever records arrived while idle. Session tickets are
    /// fine; a close notification, end-of-stream or application data is not.
    fn is_open(&self) -> bool {
        let Some(mut session) = self.session.try_lock() else {
            return true;
        };
        check_idle(&self.socket, || loop {
            match session.read_tls(&mut &self.socket) {
                Ok(0) => return false,
                Ok(_) => match session.process_new_packets() {
                    Ok(state) if state.peer_has_closed() || state.plaintext_bytes_to_read() > 0 => return false,
                    Ok(_) => {}
                    Err(e) => {
                        trace!(cause = %e, "idle tls session failed");
                        return false;
                    }
                },
                Err(e) => return e.kind() == io::ErrorKind::WouldBlock,
            }
        })
    }
}

/// A pooled upstream, shared by the request and response threads.
#[derive(Clone)]
pub(crate) struct Upstream(pub(crate) Arc<dyn BlockingTransport>);

impl PooledConnection for Upstream {
    fn close(&mut self) {
        self.0.shutdown();
    }

    fn is_open(&self) -> bool {
        self.0.is_open()
    }
}

/// Opens a transport to `key`, wrapping it in TLS when the key asks for it.
pub(crate) fn connect(key: &ConnectionKey, director: &dyn Director, config: &BlockingConfig) -> io::Result<Upstream> {
    let mut last_error = io::Error::new(io::ErrorKind::NotFound, format!("{key} resolved to no address"));
    let mut socket = None;
    for addr in (key.host(), key.port()).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, config.connect_timeout()) {
            Ok(stream) => {
                socket = Some(stream);
                break;
            }
            Err(e) => {
                debug!(%key, %addr, cause = %e, "connect attempt failed");
                last_error = e;
            }
        }
    }
    let Some(socket) = socket else {
        return Err(last_error);
    };
    socket.set_nodelay(true)?;

    if !key.is_tls() {
        return Ok(Upstream(Arc::new(socket)));
    }

    let tls_config = director
        .tls_client_config()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "no client tls configuration"))?;
    let session = tls::client_session(tls_config, key)?;
    Ok(Upstream(Arc::new(TlsTransport::new(session, socket, config.upstream_read_timeout())?)))
}
