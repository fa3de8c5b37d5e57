//! One exchange on an event loop
//!
//! Every readiness event for the client or one of its upstreams lands in
//! [`SelectorExchange::on_event`], which pumps both directions until nothing
//! moves: flush what is queued, then read and frame what is available. Reads
//! always run until the socket reports it has nothing more, so edge-triggered
//! readiness never strands buffered input.

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tracing::{debug, info, trace, warn};

use crate::director::Director;
use crate::exchange::{self, ExchangeState, RequestHalf, ResponseHalf, Signal, classify_close};
use crate::pool::{ConnectionKey, ConnectionPool, PooledConnection};
use crate::protocol::{Direction, EndExchange, ExchangeError};
use crate::selector::channel::{Channel, ReadOutcome};
use crate::selector::worker::{Context, Readiness, Role};

/// A source stops being read once its destination has this many read
/// buffers queued.
const BACKPRESSURE_BUFFERS: usize = 4;

pub(crate) struct SelectorExchange {
    id: usize,
    director: Arc<dyn Director>,
    state: ExchangeState,
    client: Channel,
    upstreams: ConnectionPool<Channel>,
    current: Option<ConnectionKey>,
    request: RequestHalf,
    request_src: BytesMut,
    response: ResponseHalf,
    response_src: BytesMut,
    buf: Vec<u8>,
    max_writes: usize,
    /// Request bytes may go to `current`
    request_routed: bool,
    request_done: bool,
    awaiting_response: bool,
    /// An early response or a closing cycle; close once the client has it all
    close_after_flush: bool,
}

impl SelectorExchange {
    pub(crate) fn new(id: usize, director: Arc<dyn Director>, client: Channel) -> Self {
        let size = director.buffer_size();
        Self {
            id,
            state: ExchangeState::AwaitingRequestHeaders,
            client,
            upstreams: ConnectionPool::new(),
            current: None,
            request: exchange::request_half(&director),
            request_src: BytesMut::with_capacity(size),
            response: exchange::response_half(&director),
            response_src: BytesMut::with_capacity(size),
            buf: vec![0; size],
            max_writes: director.max_write_attempts_per_event().max(1),
            request_routed: false,
            request_done: false,
            awaiting_response: false,
            close_after_flush: false,
            director,
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state == ExchangeState::Closed
    }

    /// Picks up anything the client sent before registration.
    pub(crate) fn start(&mut self, cx: &mut Context<'_>) {
        self.drive(cx);
    }

    pub(crate) fn on_event(&mut self, cx: &mut Context<'_>, role: &Role, readiness: Readiness) {
        trace!(id = self.id, ?role, readable = readiness.readable, writable = readiness.writable, "event");
        match role {
            Role::Upstream(key) if !self.is_active(key) => self.check_idle_upstream(cx, key),
            Role::Client | Role::Upstream(_) => self.drive(cx),
        }
    }

    /// The upstream currently owed a request or a response.
    fn is_active(&self, key: &ConnectionKey) -> bool {
        self.current.as_ref() == Some(key) && (self.awaiting_response || self.request_routed)
    }

    fn limit(&self) -> usize {
        self.buf.len() * BACKPRESSURE_BUFFERS
    }

    fn drive(&mut self, cx: &mut Context<'_>) {
        loop {
            match self.pump(cx) {
                Ok(()) => break,
                Err(ExchangeError::End(end)) => self.end_exchange(&end),
                Err(e) => {
                    self.fail(cx, e);
                    return;
                }
            }
        }

        if !self.is_closed()
            && let Err(e) = self.update_interest(cx)
        {
            self.fail(cx, ExchangeError::transport(Direction::Request, e));
        }
    }

    /// Writable work first, then readable work, until a full pass moves nothing.
    fn pump(&mut self, cx: &mut Context<'_>) -> Result<(), ExchangeError> {
        while !self.is_closed() {
            let mut progress = self.flush_upstream()?;
            progress |= self.flush_client()?;

            if self.close_after_flush && self.response.pending().is_empty() && !self.client.has_pending_output() {
                debug!(id = self.id, "closing after final write");
                self.close(cx);
                break;
            }

            progress |= self.read_client(cx)?;
            progress |= self.read_upstream()?;
            if !progress {
                break;
            }
        }
        Ok(())
    }

    fn request_paused(&self) -> bool {
        self.close_after_flush || (self.request_done && self.awaiting_response)
    }

    fn read_client(&mut self, cx: &mut Context<'_>) -> Result<bool, ExchangeError> {
        let mut progress = self.process_request(cx)?;
        if self.request_paused() || self.request.pending().len() > self.limit() || self.request_src.len() > self.limit()
        {
            return Ok(progress);
        }

        match self.client.read(&mut self.buf).map_err(|e| ExchangeError::transport(Direction::Request, e))? {
            ReadOutcome::Data(n) => {
                trace!(id = self.id, len = n, "read client bytes");
                self.request_src.extend_from_slice(&self.buf[..n]);
                self.process_request(cx)?;
                progress = true;
            }
            ReadOutcome::WouldBlock => {}
            ReadOutcome::Eof => {
                let cause = io::Error::new(io::ErrorKind::UnexpectedEof, "client closed");
                return Err(ExchangeError::transport(Direction::Request, cause));
            }
        }
        Ok(progress)
    }

    fn process_request(&mut self, cx: &mut Context<'_>) -> Result<bool, ExchangeError> {
        let queued = self.request.pending().len();
        let mut progress = false;
        while !self.request_paused() {
            let signal =
                self.request.advance(&mut self.request_src).map_err(|e| ExchangeError::protocol(Direction::Request, e))?;
            match signal {
                Some(Signal::HeadersComplete) => self.route(cx)?,
                Some(Signal::MessageDone) => self.request_done = true,
                None => break,
            }
            progress = true;
        }
        Ok(progress || self.request.pending().len() != queued)
    }

    fn route(&mut self, cx: &mut Context<'_>) -> Result<(), ExchangeError> {
        self.state = ExchangeState::Connecting;
        let key = exchange::route(self.director.as_ref(), self.request.framer_mut().message_mut())?;

        if self.upstreams.get_mut(&key).is_some_and(|upstream| !upstream.is_open()) {
            debug!(id = self.id, %key, "pooled upstream went away while idle");
            self.drop_upstream(cx, &key);
        }

        let id = self.id;
        let director = self.director.as_ref();
        self.upstreams.get_or_connect(&key, |key| Channel::connect(key, director, cx, id)).map_err(|e| {
            warn!(id, %key, cause = %e, "upstream connect failed");
            EndExchange::bad_gateway()
        })?;

        debug!(id, %key, "request routed");
        self.state = ExchangeState::Forwarding;
        self.current = Some(key);
        self.request_routed = true;
        self.request_done = false;
        self.awaiting_response = true;
        self.response.framer_mut().set_request(self.request.message().clone());
        self.response_src.clear();
        Ok(())
    }

    fn flush_upstream(&mut self) -> Result<bool, ExchangeError> {
        if !self.request_routed {
            return Ok(false);
        }
        let Some(upstream) = self.current.as_ref().and_then(|key| self.upstreams.get_mut(key)) else {
            return Ok(false);
        };

        match upstream.poll_connect() {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(e) => {
                warn!(id = self.id, cause = %e, "upstream connect failed");
                return Err(EndExchange::bad_gateway().into());
            }
        }

        upstream
            .write_pending(self.request.pending_mut(), self.max_writes)
            .map_err(|e| ExchangeError::transport(Direction::Response, e))
    }

    fn flush_client(&mut self) -> Result<bool, ExchangeError> {
        self.client
            .write_pending(self.response.pending_mut(), self.max_writes)
            .map_err(|e| ExchangeError::transport(Direction::Request, e))
    }

    fn read_upstream(&mut self) -> Result<bool, ExchangeError> {
        if !self.awaiting_response || self.response.pending().len() > self.limit() {
            return Ok(false);
        }
        let Some(upstream) = self.current.as_ref().and_then(|key| self.upstreams.get_mut(key)) else {
            return Ok(false);
        };
        if upstream.is_connecting() {
            return Ok(false);
        }

        match upstream.read(&mut self.buf).map_err(|e| ExchangeError::transport(Direction::Response, e))? {
            ReadOutcome::Data(n) => {
                trace!(id = self.id, len = n, "read upstream bytes");
                self.response_src.extend_from_slice(&self.buf[..n]);
                self.process_response()?;
                Ok(true)
            }
            ReadOutcome::WouldBlock => Ok(false),
            ReadOutcome::Eof => {
                let cause = io::Error::new(io::ErrorKind::UnexpectedEof, "upstream closed");
                Err(ExchangeError::transport(Direction::Response, cause))
            }
        }
    }

    fn process_response(&mut self) -> Result<(), ExchangeError> {
        loop {
            let signal = self
                .response
                .advance(&mut self.response_src)
                .map_err(|e| ExchangeError::protocol(Direction::Response, e))?;
            match signal {
                Some(Signal::HeadersComplete) => {}
                Some(Signal::MessageDone) if self.response.message().is_interim() => {
                    trace!(id = self.id, status = self.response.message().status(), "interim response framed");
                }
                Some(Signal::MessageDone) => {
                    self.complete_cycle();
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
    }

    fn complete_cycle(&mut self) {
        let request = self.request.message();
        let response = self.response.message();
        self.director.on_exchange_complete(request, response);

        let request_complete = self.request_done && self.request.is_message_complete();
        if !exchange::keep_alive(request, response, request_complete) {
            debug!(id = self.id, "connection not kept alive");
            self.close_after_flush = true;
        }
        self.awaiting_response = false;
        self.request_routed = false;
    }

    /// Reads an upstream that owes nothing. End-of-stream drops it from the
    /// pool quietly; stray bytes are discarded.
    fn check_idle_upstream(&mut self, cx: &mut Context<'_>, key: &ConnectionKey) {
        let Some(upstream) = self.upstreams.get_mut(key) else {
            return;
        };

        let cause = loop {
            match upstream.read(&mut self.buf) {
                Ok(ReadOutcome::Data(n)) => debug!(id = self.id, %key, len = n, "discarding unsolicited upstream bytes"),
                Ok(ReadOutcome::WouldBlock) => return,
                Ok(ReadOutcome::Eof) => break None,
                Err(e) => break Some(e),
            }
        };

        debug!(id = self.id, %key, cause = ?cause, "idle upstream closed");
        self.drop_upstream(cx, key);
    }

    fn drop_upstream(&mut self, cx: &mut Context<'_>, key: &ConnectionKey) {
        if let Some(mut upstream) = self.upstreams.remove(key) {
            upstream.deregister(cx.registry);
            cx.tokens.remove(upstream.token());
            upstream.shutdown();
        }
        if self.current.as_ref() == Some(key) {
            self.current = None;
        }
    }

    fn update_interest(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        let client_writable = !self.response.pending().is_empty() || self.client.has_pending_output();
        self.client.set_writable(cx.registry, client_writable)?;

        let request_queued = self.request_routed && !self.request.pending().is_empty();
        if let Some(upstream) = self.current.as_ref().and_then(|key| self.upstreams.get_mut(key)) {
            let writable = upstream.is_connecting() || request_queued || upstream.has_pending_output();
            upstream.set_writable(cx.registry, writable)?;
        }
        Ok(())
    }

    /// Queues the literal response and stops taking requests; the exchange
    /// closes once the client has it.
    fn end_exchange(&mut self, end: &EndExchange) {
        info!(id = self.id, code = end.code(), message = end.message(), "end exchange");
        self.request.pending_mut().clear();
        self.request_routed = false;
        self.awaiting_response = false;
        self.response.pending_mut().push(&end.to_bytes());
        self.close_after_flush = true;
    }

    fn fail(&mut self, cx: &mut Context<'_>, error: ExchangeError) {
        let request = self.request.message();
        let response = self.response.message();
        match &error {
            ExchangeError::Protocol { direction, source } => {
                warn!(id = self.id, %direction, cause = %source, "protocol error");
                exchange::report_protocol_error(self.director.as_ref(), *direction, request, response, source);
            }
            ExchangeError::Transport { direction, source } => {
                let response_complete = self.response.is_message_complete() && !self.awaiting_response;
                let kind = classify_close(self.state, *direction, self.request.is_message_complete(), response_complete);
                exchange::report_close(self.director.as_ref(), kind, request, response, source);
            }
            ExchangeError::End(end) => debug!(id = self.id, %end, "end exchange while closing"),
        }
        self.close(cx);
    }

    /// Deregisters and closes every channel. Safe to call more than once.
    pub(crate) fn close(&mut self, cx: &mut Context<'_>) {
        if self.is_closed() {
            return;
        }
        self.state = ExchangeState::Closed;
        debug!(id = self.id, upstreams = self.upstreams.len(), "exchange closed");

        self.client.deregister(cx.registry);
        self.client.shutdown();
        let keys: Vec<ConnectionKey> = self.upstreams.keys().cloned().collect();
        for key in &keys {
            if let Some(upstream) = self.upstreams.get_mut(key) {
                upstream.deregister(cx.registry);
            }
        }
        self.upstreams.close_all();
    }
}
