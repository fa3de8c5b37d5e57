//! Record-layer adapter between a non-blocking socket and a [`TlsEngine`]
//!
//! The adapter owns the ciphertext buffers for one channel and exposes
//! application-level reads and writes. Handshake traffic is driven as a side
//! effect of those calls: an `unwrap` that needs to send will wrap and flush,
//! a `wrap` that needs to receive will unwrap.
//!
//! What happens after every engine call is decided by [`transition`], a pure
//! table over `(Op, EngineResult)`, so the control flow can be tested without
//! sockets.

use std::io::{self, Read, Write};

use bytes::{Buf, BytesMut};
use tracing::{debug, trace};

use crate::tls::engine::{EngineResult, HandshakeStatus, Status, TlsEngine};

/// Ciphertext buffer size: one maximum TLS record plus overhead
pub const TLS_BUFFER_SIZE: usize = 17 * 1024;

/// The engine operation whose result is being interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Unwrap,
    Wrap,
}

/// What the adapter does next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Repeat the same operation
    Continue,
    /// Wrap (and flush) an empty application buffer to push the handshake
    Wrap,
    /// Unwrap into an empty application buffer to push the handshake
    Unwrap,
    /// Run the engine's delegated tasks, then repeat
    RunTasks,
    /// Wait for more ciphertext from the socket
    NeedInput,
    /// The output buffer must drain, or grow, before continuing
    NeedOutput,
    /// Nothing more can happen without new input or output
    Idle,
    /// The session is closed
    Eof,
}

/// The adapter's state transition table.
pub fn transition(op: Op, result: &EngineResult) -> Step {
    match (op, result.status, result.handshake) {
        (_, Status::Closed, _) => Step::Eof,
        (_, Status::BufferUnderflow, _) => Step::NeedInput,
        (_, Status::BufferOverflow, _) => Step::NeedOutput,
        (_, Status::Ok, HandshakeStatus::NeedTask) => Step::RunTasks,
        (Op::Unwrap, Status::Ok, HandshakeStatus::NeedWrap) => Step::Wrap,
        (Op::Wrap, Status::Ok, HandshakeStatus::NeedUnwrap) => Step::Unwrap,
        (_, Status::Ok, _) if !result.made_progress() => Step::Idle,
        (_, Status::Ok, _) => Step::Continue,
    }
}

/// Result of an application-level read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsRead {
    /// This many plaintext bytes were written to the caller's buffer
    Data(usize),
    /// The socket has nothing more for now
    WouldBlock,
    /// The session or the socket is closed
    Eof,
}

/// TLS record handling for one non-blocking channel.
#[derive(Debug)]
pub struct TlsAdapter<E> {
    engine: E,
    net_in: BytesMut,
    net_out: BytesMut,
    raw_eof: bool,
}

impl<E: TlsEngine> TlsAdapter<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            net_in: BytesMut::with_capacity(TLS_BUFFER_SIZE),
            net_out: BytesMut::with_capacity(TLS_BUFFER_SIZE),
            raw_eof: false,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut E {
        &mut self.engine
    }

    /// Ciphertext produced but not yet accepted by the socket.
    pub fn has_pending_output(&self) -> bool {
        !self.net_out.is_empty()
    }

    /// Input already pulled off the socket that a further `unwrap` can
    /// deliver without a new readiness event.
    pub fn has_buffered_input(&self) -> bool {
        !self.net_in.is_empty() || self.engine.has_buffered_plaintext()
    }

    /// Reads plaintext into `app_in`, pulling ciphertext from `raw` as needed.
    pub fn unwrap<R: Read + Write>(&mut self, raw: &mut R, app_in: &mut [u8]) -> io::Result<TlsRead> {
        loop {
            let result = self.engine.unwrap(&self.net_in, app_in)?;
            self.net_in.advance(result.consumed);
            trace!(?result, "tls unwrap");

            let step = transition(Op::Unwrap, &result);
            match step {
                Step::Wrap => self.wrap_handshake(raw)?,
                Step::RunTasks => self.run_tasks(),
                _ => {}
            }

            if result.produced > 0 {
                return Ok(TlsRead::Data(result.produced));
            }

            match step {
                Step::Eof => return Ok(TlsRead::Eof),
                Step::Continue | Step::Wrap | Step::Unwrap | Step::RunTasks => {}
                Step::NeedInput | Step::Idle => {
                    if self.fill(raw)? == 0 {
                        return Ok(if self.raw_eof { TlsRead::Eof } else { TlsRead::WouldBlock });
                    }
                }
                Step::NeedOutput => {
                    debug!(len = app_in.len(), "no room for tls plaintext");
                    return Ok(TlsRead::WouldBlock);
                }
            }
        }
    }

    /// Encrypts and sends as much of `app_out` as possible.
    ///
    /// Returns the number of plaintext bytes accepted. Ciphertext that the
    /// socket could not take stays queued; see [`Self::has_pending_output`].
    pub fn wrap<W: Read + Write>(&mut self, raw: &mut W, app_out: &[u8]) -> io::Result<usize> {
        if !self.flush(raw)? {
            return Ok(0);
        }

        let mut written = 0;
        loop {
            let result = self.wrap_once(&app_out[written..])?;
            written += result.consumed;

            if !self.flush(raw)? {
                return Ok(written);
            }

            match transition(Op::Wrap, &result) {
                Step::Eof => return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tls session closed")),
                Step::Unwrap => {
                    if !self.unwrap_handshake(raw)? {
                        break;
                    }
                }
                Step::RunTasks => self.run_tasks(),
                Step::NeedOutput => self.net_out.reserve(TLS_BUFFER_SIZE),
                Step::Continue | Step::Wrap => {}
                Step::NeedInput | Step::Idle => break,
            }
        }
        Ok(written)
    }

    /// Writes queued ciphertext to `raw`. Returns `true` once nothing is left.
    pub fn flush<W: Write>(&mut self, raw: &mut W) -> io::Result<bool> {
        while !self.net_out.is_empty() {
            match raw.write(&self.net_out) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => self.net_out.advance(n),
                Err(e) if is_not_ready(&e) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    fn wrap_once(&mut self, app_out: &[u8]) -> io::Result<EngineResult> {
        let start = self.net_out.len();
        self.net_out.resize(start + TLS_BUFFER_SIZE, 0);
        let result = self.engine.wrap(app_out, &mut self.net_out[start..]);
        let produced = result.as_ref().map_or(0, |r| r.produced);
        self.net_out.truncate(start + produced);
        trace!(?result, "tls wrap");
        result
    }

    /// Wraps an empty application buffer until the engine has nothing more
    /// to send, flushing as it goes.
    fn wrap_handshake<W: Write>(&mut self, raw: &mut W) -> io::Result<()> {
        loop {
            let result = self.wrap_once(&[])?;
            if !self.flush(raw)? {
                return Ok(());
            }
            match transition(Op::Wrap, &result) {
                Step::RunTasks => self.run_tasks(),
                Step::Continue | Step::Wrap => {}
                Step::Eof => return Err(io::Error::new(io::ErrorKind::BrokenPipe, "tls session closed")),
                _ => return Ok(()),
            }
        }
    }

    /// Unwraps into an empty application buffer. Returns whether the engine
    /// made any progress.
    fn unwrap_handshake<R: Read>(&mut self, raw: &mut R) -> io::Result<bool> {
        self.fill(raw)?;
        if self.net_in.is_empty() {
            return Ok(false);
        }

        let result = self.engine.unwrap(&self.net_in, &mut [])?;
        self.net_in.advance(result.consumed);
        if transition(Op::Unwrap, &result) == Step::RunTasks {
            self.run_tasks();
        }
        Ok(result.consumed > 0)
    }

    fn run_tasks(&mut self) {
        while let Some(task) = self.engine.delegated_task() {
            task();
        }
    }

    /// Pulls one read's worth of ciphertext from `raw` into `net_in`.
    fn fill<R: Read>(&mut self, raw: &mut R) -> io::Result<usize> {
        if self.raw_eof {
            return Ok(0);
        }

        let start = self.net_in.len();
        self.net_in.resize(start + TLS_BUFFER_SIZE, 0);
        let read = raw.read(&mut self.net_in[start..]);
        let n = match read {
            Ok(0) => {
                self.raw_eof = true;
                0
            }
            Ok(n) => n,
            Err(e) if is_not_ready(&e) => 0,
            Err(e) => {
                self.net_in.truncate(start);
                return Err(e);
            }
        };
        self.net_in.truncate(start + n);
        Ok(n)
    }
}

/// A connecting socket reports `NotConnected` until the handshake with the
/// peer finishes; it is treated like any other not-ready condition.
pub(crate) fn is_not_ready(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::NotConnected)
}
