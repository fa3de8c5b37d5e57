//! Exchange coordination shared by both scheduling disciplines
//!
//! An exchange pairs one client connection with the upstream connections it
//! is routed to. Each direction is a [`Half`]: a [`MessageFramer`] plus the
//! [`PendingWriteQueue`] of framed bytes not yet accepted by the destination.
//!
//! The disciplines differ only in how bytes reach the halves and how queued
//! bytes are written out. Routing, keep-alive, and the decision whether a
//! close was premature all live here.
//!
//! # State Machine
//!
//! ```text
//! AwaitingRequestHeaders ──headers complete──▶ Connecting ──routed──▶ Forwarding
//!          │                                        │                     │
//!          └──────────────── close ─────────────────┴──────── close ──────┴──▶ Closed
//! ```

mod pending;

pub use pending::PendingWriteQueue;

use std::io;
use std::sync::Arc;

use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tracing::{debug, warn};

use crate::codec::{FrameItem, HeaderSift, MessageFramer};
use crate::director::Director;
use crate::pool::ConnectionKey;
use crate::protocol::{Direction, EndExchange, Header, HttpMessage, MessageContext, ParseError};

/// Where an exchange is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    AwaitingRequestHeaders,
    Connecting,
    Forwarding,
    Closed,
}

/// Lifecycle points a [`Half`] stops at so the coordinator can react.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The head is complete; its empty line has not been framed yet
    HeadersComplete,
    /// The message is fully framed (possibly not yet fully written)
    MessageDone,
}

/// One direction of an exchange.
#[derive(Debug)]
pub struct Half<S> {
    framer: MessageFramer<S>,
    pending: PendingWriteQueue,
}

impl<S: HeaderSift> Half<S> {
    pub fn new(framer: MessageFramer<S>) -> Self {
        Self { framer, pending: PendingWriteQueue::new() }
    }

    /// Frames buffered input, queueing forwarded bytes, until input runs out
    /// or a [`Signal`] is reached.
    ///
    /// # Errors
    ///
    /// Any framing failure; the exchange must be torn down.
    pub fn advance(&mut self, src: &mut BytesMut) -> Result<Option<Signal>, ParseError> {
        while let Some(item) = self.framer.decode(src)? {
            match item {
                FrameItem::Head(bytes) | FrameItem::Payload(bytes) | FrameItem::Framing(bytes) => {
                    self.pending.push(&bytes);
                }
                FrameItem::HeadersComplete => return Ok(Some(Signal::HeadersComplete)),
                FrameItem::MessageDone => return Ok(Some(Signal::MessageDone)),
            }
        }
        Ok(None)
    }

    /// Framing is `Done` (or not started) and every framed byte was written.
    pub fn is_message_complete(&self) -> bool {
        self.framer.is_message_complete() && self.pending.is_empty()
    }

    pub fn framer(&self) -> &MessageFramer<S> {
        &self.framer
    }

    pub fn framer_mut(&mut self) -> &mut MessageFramer<S> {
        &mut self.framer
    }

    pub fn message(&self) -> &HttpMessage {
        self.framer.message()
    }

    pub fn pending(&self) -> &PendingWriteQueue {
        &self.pending
    }

    pub fn pending_mut(&mut self) -> &mut PendingWriteQueue {
        &mut self.pending
    }
}

/// Request-side hooks backed by a [`Director`].
pub(crate) struct RequestSift(pub(crate) Arc<dyn Director>);

impl HeaderSift for RequestSift {
    fn sift_header(&self, name: &str, value: &str, cx: &MessageContext<'_>) -> Option<String> {
        self.0.sift_request_header(name, value, cx)
    }

    fn add_headers(&self, cx: &MessageContext<'_>) -> Vec<Header> {
        self.0.add_request_headers(cx)
    }
}

/// Response-side hooks backed by a [`Director`].
pub(crate) struct ResponseSift(pub(crate) Arc<dyn Director>);

impl HeaderSift for ResponseSift {
    fn sift_header(&self, name: &str, value: &str, cx: &MessageContext<'_>) -> Option<String> {
        self.0.sift_response_header(name, value, cx)
    }

    fn add_headers(&self, cx: &MessageContext<'_>) -> Vec<Header> {
        self.0.add_response_headers(cx)
    }
}

pub(crate) type RequestHalf = Half<RequestSift>;
pub(crate) type ResponseHalf = Half<ResponseSift>;

pub(crate) fn request_half(director: &Arc<dyn Director>) -> RequestHalf {
    Half::new(MessageFramer::request(RequestSift(Arc::clone(director))))
}

pub(crate) fn response_half(director: &Arc<dyn Director>) -> ResponseHalf {
    Half::new(MessageFramer::response(ResponseSift(Arc::clone(director))))
}

/// How a transport close ends an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseKind {
    /// Nothing was in flight; the connection simply went away.
    Idle,
    /// The client side failed mid-message.
    PrematureRequest,
    /// The upstream side failed mid-message.
    PrematureResponse,
}

/// Decides whether a transport close interrupted a message.
///
/// `failed` is the side whose transport reported end-of-stream or an error:
/// [`Direction::Request`] for the client, [`Direction::Response`] for the
/// upstream. `response_complete` must be `false` while a response is still
/// owed for a forwarded request. Only a `Forwarding` exchange can close
/// prematurely.
pub fn classify_close(state: ExchangeState, failed: Direction, request_complete: bool, response_complete: bool) -> CloseKind {
    if state != ExchangeState::Forwarding || (request_complete && response_complete) {
        return CloseKind::Idle;
    }

    match failed {
        Direction::Request => CloseKind::PrematureRequest,
        Direction::Response => CloseKind::PrematureResponse,
    }
}

/// Hands a premature close to the director; idle closes are only logged.
pub(crate) fn report_close(
    director: &dyn Director,
    kind: CloseKind,
    request: &HttpMessage,
    response: &HttpMessage,
    cause: &io::Error,
) {
    match kind {
        CloseKind::Idle => debug!(cause = %cause, "connection closed while idle"),
        CloseKind::PrematureRequest => director.on_premature_request_closed(request, cause),
        CloseKind::PrematureResponse => director.on_premature_response_closed(Some(request), response, cause),
    }
}

/// Hands a framing failure to the director.
pub(crate) fn report_protocol_error(
    director: &dyn Director,
    direction: Direction,
    request: &HttpMessage,
    response: &HttpMessage,
    error: &ParseError,
) {
    let description = error.to_string();
    match direction {
        Direction::Request => director.on_request_protocol_error(request, &description),
        Direction::Response => director.on_response_protocol_error(Some(request), response, &description),
    }
}

/// Resolves the upstream for a request whose head is complete.
///
/// # Errors
///
/// - `404 Not Found` when the director rejects the request
/// - `502 Bad Gateway` for a TLS target with no client TLS configuration
pub(crate) fn route(director: &dyn Director, request: &mut HttpMessage) -> Result<ConnectionKey, EndExchange> {
    match director.resolve_upstream(request) {
        None => {
            debug!(method = request.method(), path = request.path(), "no upstream for request");
            Err(EndExchange::not_found())
        }
        Some(target) if target.is_tls() && director.tls_client_config().is_none() => {
            warn!(%target, "tls upstream without client tls configuration");
            Err(EndExchange::bad_gateway())
        }
        Some(target) => Ok(target),
    }
}

/// A completed cycle keeps the connection iff both sides allow it and the
/// request was fully read before the response finished.
pub fn keep_alive(request: &HttpMessage, response: &HttpMessage, request_complete: bool) -> bool {
    request_complete && request.keep_alive() && response.keep_alive()
}

pub(crate) fn is_would_block(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut)
}
