//! A registered socket, plain or TLS, as seen by the event loop

use std::io::{self, Read, Write};
use std::net::ToSocketAddrs;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, trace};

use crate::director::Director;
use crate::exchange::PendingWriteQueue;
use crate::pool::{ConnectionKey, PooledConnection};
use crate::selector::worker::{Context, Role};
use crate::tls::{self, RustlsEngine, TlsAdapter, TlsRead};
use crate::tls::adapter::is_not_ready;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    Data(usize),
    WouldBlock,
    Eof,
}

#[derive(Debug)]
pub(crate) struct Channel {
    stream: TcpStream,
    token: Token,
    tls: Option<TlsAdapter<RustlsEngine>>,
    interest: Interest,
    connecting: bool,
}

impl Channel {
    /// Registers an accepted client socket for reads.
    pub(crate) fn accepted(
        mut stream: TcpStream,
        token: Token,
        tls: Option<rustls::ServerConnection>,
        registry: &Registry,
    ) -> io::Result<Self> {
        registry.register(&mut stream, token, Interest::READABLE)?;
        let tls = tls.map(|session| TlsAdapter::new(RustlsEngine::new(session)));
        Ok(Self { stream, token, tls, interest: Interest::READABLE, connecting: false })
    }

    /// Starts a non-blocking connect to `key` and registers the socket on
    /// the caller's worker, owned by `exchange`.
    pub(crate) fn connect(
        key: &ConnectionKey,
        director: &dyn Director,
        cx: &mut Context<'_>,
        exchange: usize,
    ) -> io::Result<Self> {
        let addr = (key.host(), key.port())
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{key} resolved to no address")))?;

        let tls = if key.is_tls() {
            let config = director
                .tls_client_config()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Unsupported, "no client tls configuration"))?;
            Some(TlsAdapter::new(RustlsEngine::new(tls::client_session(config, key)?)))
        } else {
            None
        };

        let mut stream = TcpStream::connect(addr)?;
        if let Err(e) = stream.set_nodelay(true) {
            trace!(%key, cause = %e, "set nodelay");
        }

        let interest = Interest::READABLE | Interest::WRITABLE;
        let token = cx.tokens.allocate(exchange, Role::Upstream(key.clone()));
        if let Err(e) = cx.registry.register(&mut stream, token, interest) {
            cx.tokens.remove(token);
            return Err(e);
        }

        debug!(%key, %addr, ?token, "connecting upstream");
        Ok(Self { stream, token, tls, interest, connecting: true })
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn is_connecting(&self) -> bool {
        self.connecting
    }

    /// Returns `true` once the connect has completed.
    pub(crate) fn poll_connect(&mut self) -> io::Result<bool> {
        if !self.connecting {
            return Ok(true);
        }
        if let Some(e) = self.stream.take_error()? {
            return Err(e);
        }

        match self.stream.peer_addr() {
            Ok(addr) => {
                trace!(%addr, "upstream connected");
                self.connecting = false;
                Ok(true)
            }
            Err(e) if is_not_ready(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        if let Some(tls) = &mut self.tls {
            return Ok(match tls.unwrap(&mut self.stream, buf)? {
                TlsRead::Data(n) => ReadOutcome::Data(n),
                TlsRead::WouldBlock => ReadOutcome::WouldBlock,
                TlsRead::Eof => ReadOutcome::Eof,
            });
        }

        match self.stream.read(buf) {
            Ok(0) => Ok(ReadOutcome::Eof),
            Ok(n) => Ok(ReadOutcome::Data(n)),
            Err(e) if is_not_ready(&e) => Ok(ReadOutcome::WouldBlock),
            Err(e) => Err(e),
        }
    }

    /// Writes what the socket accepts right now; `Ok(0)` means not ready.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(tls) = &mut self.tls {
            return tls.wrap(&mut self.stream, buf);
        }

        match self.stream.write(buf) {
            Ok(0) => Err(io::Error::from(io::ErrorKind::WriteZero)),
            Ok(n) => Ok(n),
            Err(e) if is_not_ready(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Ciphertext still waiting for the socket.
    pub(crate) fn has_pending_output(&self) -> bool {
        self.tls.as_ref().is_some_and(TlsAdapter::has_pending_output)
    }

    /// Writes from `pending` with at most `max_attempts` write calls.
    /// Returns whether anything was written.
    pub(crate) fn write_pending(&mut self, pending: &mut PendingWriteQueue, max_attempts: usize) -> io::Result<bool> {
        let mut progress = false;
        if let Some(tls) = &mut self.tls
            && tls.has_pending_output()
        {
            if !tls.flush(&mut self.stream)? {
                return Ok(false);
            }
            progress = true;
        }

        for _ in 0..max_attempts {
            if pending.is_empty() {
                break;
            }
            let n = self.write(pending.chunk())?;
            if n == 0 {
                break;
            }
            trace!(token = ?self.token, len = n, "wrote pending bytes");
            pending.advance(n);
            progress = true;
        }
        Ok(progress)
    }

    /// Keeps `READABLE` and adds `WRITABLE` while `writable` holds.
    pub(crate) fn set_writable(&mut self, registry: &Registry, writable: bool) -> io::Result<()> {
        let interest = if writable { Interest::READABLE | Interest::WRITABLE } else { Interest::READABLE };
        if interest != self.interest {
            registry.reregister(&mut self.stream, self.token, interest)?;
            self.interest = interest;
        }
        Ok(())
    }

    pub(crate) fn deregister(&mut self, registry: &Registry) {
        if let Err(e) = registry.deregister(&mut self.stream) {
            trace!(token = ?self.token, cause = %e, "deregister");
        }
    }

    pub(crate) fn shutdown(&mut self) {
        if let Some(tls) = &mut self.tls {
            tls.engine_mut().session_mut().send_close_notify();
            if let Err(e) = tls.wrap(&mut self.stream, &[]) {
                trace!(token = ?self.token, cause = %e, "tls close notify");
            }
        }
        if let Err(e) = self.stream.shutdown(std::net::Shutdown::Both) {
            trace!(token = ?self.token, cause = %e, "shutdown");
        }
    }
}

impl PooledConnection for Channel {
    fn close(&mut self) {
        self.shutdown();
    }

    /// An idle channel is reusable only while nothing is waiting to be read:
    /// no buffered TLS input and nothing readable on the socket.
    fn is_open(&self) -> bool {
        if self.connecting {
            return true;
        }
        if self.tls.as_ref().is_some_and(TlsAdapter::has_buffered_input) {
            return false;
        }
        let mut peeked = [0u8; 1];
        match self.stream.peek(&mut peeked) {
            Err(e) => is_not_ready(&e),
            Ok(n) => {
                trace!(token = ?self.token, len = n, "idle upstream readable");
                false
            }
        }
    }
}
