//! One exchange driven by a request thread and a response thread
//!
//! The request thread reads the client, frames requests and writes them
//! upstream. It routes each request once its head is complete and then
//! publishes the upstream under a new generation. The response thread waits
//! for a new generation, reads the upstream, frames the response and writes it
//! to the client.
//!
//! Both threads share one monitor (`shared` + `changed`). The pool has its
//! own lock, held only while an upstream is being looked up or connected.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, trace, warn};

use crate::blocking::transport::{self, BlockingTransport, Upstream};
use crate::codec::HeaderSift;
use crate::config::BlockingConfig;
use crate::director::Director;
use crate::exchange::{self, ExchangeState, Half, RequestHalf, ResponseHalf, Signal, classify_close, is_would_block};
use crate::pool::ConnectionPool;
use crate::protocol::{Direction, EndExchange, HttpMessage, ParseError};

struct Shared {
    state: ExchangeState,
    upstream: Option<Arc<dyn BlockingTransport>>,
    /// Bumped every time a request is routed
    generation: u64,
    /// The request being answered; replaced by its finished form once framed
    request: Option<HttpMessage>,
    request_done: bool,
    request_complete: bool,
    response_complete: bool,
    awaiting_response: bool,
    last_activity: Instant,
}

pub(crate) struct BlockingExchange {
    id: u64,
    director: Arc<dyn Director>,
    config: BlockingConfig,
    client: Arc<dyn BlockingTransport>,
    shared: Mutex<Shared>,
    changed: Condvar,
    pool: Mutex<ConnectionPool<Upstream>>,
}

impl fmt::Debug for BlockingExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockingExchange").field("id", &self.id).field("state", &self.state()).finish_non_exhaustive()
    }
}

impl BlockingExchange {
    pub(crate) fn new(
        id: u64,
        director: Arc<dyn Director>,
        config: BlockingConfig,
        client: Arc<dyn BlockingTransport>,
    ) -> Self {
        Self {
            id,
            director,
            config,
            client,
            shared: Mutex::new(Shared {
                state: ExchangeState::AwaitingRequestHeaders,
                upstream: None,
                generation: 0,
                request: None,
                request_done: false,
                request_complete: true,
                response_complete: true,
                awaiting_response: false,
                last_activity: Instant::now(),
            }),
            changed: Condvar::new(),
            pool: Mutex::new(ConnectionPool::new()),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> ExchangeState {
        self.shared.lock().state
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state() == ExchangeState::Closed
    }

    pub(crate) fn idle_for(&self) -> Duration {
        self.shared.lock().last_activity.elapsed()
    }

    /// Closes the exchange. Safe to call from any thread, any number of times.
    pub(crate) fn close(&self) {
        if self.mark_closed() {
            self.release();
        }
    }

    fn mark_closed(&self) -> bool {
        let mut shared = self.shared.lock();
        Self::mark_closed_locked(&mut shared, &self.changed)
    }

    fn mark_closed_locked(shared: &mut Shared, changed: &Condvar) -> bool {
        if shared.state == ExchangeState::Closed {
            return false;
        }
        shared.state = ExchangeState::Closed;
        shared.upstream = None;
        changed.notify_all();
        true
    }

    fn release(&self) {
        debug!(id = self.id, "exchange closed");
        self.client.shutdown();
        // a connect in progress holds the pool; that thread closes it once it sees the exchange closed
        if let Some(mut pool) = self.pool.try_lock() {
            pool.close_all();
        }
    }

    fn track(&self, direction: Direction, complete: bool) {
        let mut shared = self.shared.lock();
        shared.last_activity = Instant::now();
        match direction {
            Direction::Request => shared.request_complete = complete,
            Direction::Response => shared.response_complete = complete,
        }
    }

    fn backoff(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        thread::sleep(self.director.read_wait_backoff());
        true
    }

    /// Request loop: client → upstream.
    pub(crate) fn run_request(&self) {
        let mut half = exchange::request_half(&self.director);
        let size = self.director.buffer_size();
        let mut src = BytesMut::with_capacity(size);
        let mut buf = vec![0u8; size];
        let mut upstream: Option<Arc<dyn BlockingTransport>> = None;
        let mut routed = false;

        loop {
            loop {
                let signal = match half.advance(&mut src) {
                    Ok(signal) => signal,
                    Err(e) => return self.protocol_error(Direction::Request, &e, half.message()),
                };

                match signal {
                    Some(Signal::HeadersComplete) => match self.open_upstream(&mut half) {
                        Ok(Some(opened)) => {
                            upstream = Some(opened);
                            routed = true;
                        }
                        Ok(None) => return,
                        Err(end) => return self.end_exchange(&end),
                    },
                    Some(Signal::MessageDone) => self.mark_request_done(half.message()),
                    None => {}
                }

                if routed
                    && let Some(upstream) = &upstream
                    && let Err(e) = Self::flush(&mut half, upstream.as_ref())
                {
                    return self.transport_failed(Direction::Response, e, half.message());
                }
                self.track(Direction::Request, half.is_message_complete());

                match signal {
                    Some(Signal::MessageDone) => {
                        routed = false;
                        if !self.await_response() {
                            return;
                        }
                    }
                    Some(Signal::HeadersComplete) => {}
                    None => break,
                }
            }

            match self.client.read(&mut buf) {
                Ok(0) => {
                    let cause = io::Error::new(io::ErrorKind::UnexpectedEof, "client closed");
                    return self.transport_failed(Direction::Request, cause, half.message());
                }
                Ok(n) => {
                    trace!(id = self.id, len = n, "read client bytes");
                    src.extend_from_slice(&buf[..n]);
                }
                Err(e) if is_would_block(&e) => {
                    if !self.backoff() {
                        return;
                    }
                }
                Err(e) => return self.transport_failed(Direction::Request, e, half.message()),
            }
        }
    }

    /// Response loop: upstream → client, one routed request at a time.
    pub(crate) fn run_response(&self) {
        let mut half = exchange::response_half(&self.director);
        let size = self.director.buffer_size();
        let mut src = BytesMut::with_capacity(size);
        let mut buf = vec![0u8; size];
        let mut seen = 0;

        while let Some(upstream) = self.await_upstream(&mut seen, &mut half) {
            src.clear();
            if !self.forward_response(upstream.as_ref(), &mut half, &mut src, &mut buf) {
                return;
            }
        }
    }

    fn forward_response(
        &self,
        upstream: &dyn BlockingTransport,
        half: &mut ResponseHalf,
        src: &mut BytesMut,
        buf: &mut [u8],
    ) -> bool {
        loop {
            loop {
                let signal = match half.advance(src) {
                    Ok(signal) => signal,
                    Err(e) => {
                        self.protocol_error(Direction::Response, &e, half.message());
                        return false;
                    }
                };

                if let Err(e) = Self::flush(half, self.client.as_ref()) {
                    self.transport_failed(Direction::Request, e, half.message());
                    return false;
                }
                self.track(Direction::Response, half.is_message_complete());

                match signal {
                    Some(Signal::MessageDone) if half.message().is_interim() => {
                        trace!(id = self.id, status = half.message().status(), "interim response forwarded");
                    }
                    Some(Signal::MessageDone) => return self.complete_cycle(half.message()),
                    Some(Signal::HeadersComplete) => {}
                    None => break,
                }
            }

            match upstream.read(buf) {
                Ok(0) => {
                    let cause = io::Error::new(io::ErrorKind::UnexpectedEof, "upstream closed");
                    self.transport_failed(Direction::Response, cause, half.message());
                    return false;
                }
                Ok(n) => {
                    trace!(id = self.id, len = n, "read upstream bytes");
                    src.extend_from_slice(&buf[..n]);
                }
                Err(e) if is_would_block(&e) => {
                    if !self.backoff() {
                        return false;
                    }
                }
                Err(e) => {
                    self.transport_failed(Direction::Response, e, half.message());
                    return false;
                }
            }
        }
    }

    fn flush<S: HeaderSift>(half: &mut Half<S>, destination: &dyn BlockingTransport) -> io::Result<()> {
        if !half.pending().is_empty() {
            destination.write_all(half.pending().chunk())?;
            let len = half.pending().len();
            half.pending_mut().advance(len);
        }
        Ok(())
    }

    /// Routes the framed request head and publishes its upstream. `Ok(None)`
    /// means the exchange was closed before or while connecting.
    fn open_upstream(&self, half: &mut RequestHalf) -> Result<Option<Arc<dyn BlockingTransport>>, EndExchange> {
        {
            let mut shared = self.shared.lock();
            if shared.state == ExchangeState::Closed {
                trace!(id = self.id, "head complete after close");
                return Ok(None);
            }
            shared.state = ExchangeState::Connecting;
        }

        let request = half.framer_mut().message_mut();
        let key = exchange::route(self.director.as_ref(), request)?;

        let connected = {
            let mut pool = self.pool.lock();
            pool.get_or_connect(&key, |key| transport::connect(key, self.director.as_ref(), &self.config))
                .map(|upstream| Arc::clone(&upstream.0))
        };
        let upstream = connected.map_err(|e| {
            warn!(id = self.id, %key, cause = %e, "upstream connect failed");
            EndExchange::bad_gateway()
        })?;

        let mut shared = self.shared.lock();
        if shared.state == ExchangeState::Closed {
            drop(shared);
            debug!(id = self.id, %key, "closed while connecting");
            self.pool.lock().close_all();
            return Ok(None);
        }

        debug!(id = self.id, %key, generation = shared.generation + 1, "request routed");
        shared.state = ExchangeState::Forwarding;
        shared.upstream = Some(Arc::clone(&upstream));
        shared.generation += 1;
        shared.request = Some(half.message().clone());
        shared.request_done = false;
        shared.awaiting_response = true;
        self.changed.notify_all();
        Ok(Some(upstream))
    }

    fn mark_request_done(&self, request: &HttpMessage) {
        let mut shared = self.shared.lock();
        shared.request = Some(request.clone());
        shared.request_done = true;
    }

    /// Holds the request side until the paired response is done. Returns
    /// `false` if the exchange closed meanwhile.
    fn await_response(&self) -> bool {
        let mut shared = self.shared.lock();
        while shared.awaiting_response && shared.state != ExchangeState::Closed {
            self.changed.wait(&mut shared);
        }
        shared.state != ExchangeState::Closed
    }

    fn await_upstream(&self, seen: &mut u64, half: &mut ResponseHalf) -> Option<Arc<dyn BlockingTransport>> {
        let mut shared = self.shared.lock();
        while shared.state != ExchangeState::Closed && shared.generation == *seen {
            self.changed.wait(&mut shared);
        }
        if shared.state == ExchangeState::Closed {
            return None;
        }

        *seen = shared.generation;
        if let Some(request) = &shared.request {
            half.framer_mut().set_request(request.clone());
        }
        shared.upstream.clone()
    }

    fn complete_cycle(&self, response: &HttpMessage) -> bool {
        let (request, request_done) = {
            let shared = self.shared.lock();
            (shared.request.clone(), shared.request_done)
        };
        let Some(request) = request else {
            warn!(id = self.id, "response completed without a request");
            self.close();
            return false;
        };

        self.director.on_exchange_complete(&request, response);
        let keep_alive = exchange::keep_alive(&request, response, request_done);

        {
            let mut shared = self.shared.lock();
            shared.awaiting_response = false;
            self.changed.notify_all();
        }

        if !keep_alive {
            debug!(id = self.id, "connection not kept alive");
            self.close();
        }
        keep_alive
    }

    fn end_exchange(&self, end: &EndExchange) {
        info!(id = self.id, code = end.code(), message = end.message(), "end exchange");
        if !self.is_closed()
            && let Err(e) = self.client.write_all(&end.to_bytes())
        {
            debug!(id = self.id, cause = %e, "failed to write early response");
        }
        self.close();
    }

    /// The request and response to report, given the message the failing
    /// thread holds.
    fn messages(shared: &Shared, local: &HttpMessage) -> (HttpMessage, HttpMessage) {
        match local.direction() {
            Direction::Request => (local.clone(), HttpMessage::new(Direction::Response)),
            Direction::Response => {
                let request = shared.request.clone().unwrap_or_else(|| HttpMessage::new(Direction::Request));
                (request, local.clone())
            }
        }
    }

    fn transport_failed(&self, failed: Direction, cause: io::Error, local: &HttpMessage) {
        let (kind, request, response) = {
            let mut shared = self.shared.lock();
            if shared.state == ExchangeState::Closed {
                trace!(id = self.id, cause = %cause, "transport ended after close");
                return;
            }
            let response_complete = shared.response_complete && !shared.awaiting_response;
            let kind = classify_close(shared.state, failed, shared.request_complete, response_complete);
            let (request, response) = Self::messages(&shared, local);
            Self::mark_closed_locked(&mut shared, &self.changed);
            (kind, request, response)
        };

        exchange::report_close(self.director.as_ref(), kind, &request, &response, &cause);
        self.release();
    }

    fn protocol_error(&self, direction: Direction, error: &ParseError, local: &HttpMessage) {
        let (request, response) = {
            let mut shared = self.shared.lock();
            if !Self::mark_closed_locked(&mut shared, &self.changed) {
                return;
            }
            Self::messages(&shared, local)
        };

        warn!(id = self.id, %direction, cause = %error, "protocol error");
        exchange::report_protocol_error(self.director.as_ref(), direction, &request, &response, error);
        self.release();
    }
}
