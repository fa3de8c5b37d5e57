//! The boundary between the engine and the host application
//!
//! A [`Director`] decides where each request goes and may rewrite heads in
//! flight. It is also told how every exchange cycle ends: completed,
//! malformed, or cut short by a premature close.
//!
//! Every method except [`Director::resolve_upstream`] has a default, so the
//! smallest useful director is a router:
//!
//! ```
//! use micro_relay::director::{ConnectionTarget, Director};
//! use micro_relay::protocol::HttpMessage;
//!
//! struct Fixed;
//!
//! impl Director for Fixed {
//!     fn resolve_upstream(&self, _request: &mut HttpMessage) -> Option<ConnectionTarget> {
//!         Some(ConnectionTarget::plain("127.0.0.1", 8080))
//!     }
//! }
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::protocol::{Header, HttpMessage, MessageContext};

pub use crate::pool::ConnectionKey as ConnectionTarget;

/// Default size of a single read, in bytes
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Host application hooks consumed by both scheduling disciplines.
///
/// Implementations are shared across threads, so every method takes `&self`.
/// Hooks run on I/O threads and should return promptly.
pub trait Director: Send + Sync + 'static {
    /// Bytes requested from a transport per read.
    fn buffer_size(&self) -> usize {
        DEFAULT_BUFFER_SIZE
    }

    /// Replacement value for a received request header, if any.
    fn sift_request_header(&self, _name: &str, _value: &str, _cx: &MessageContext<'_>) -> Option<String> {
        None
    }

    /// Headers appended to the request head before its empty line.
    fn add_request_headers(&self, _cx: &MessageContext<'_>) -> Vec<Header> {
        Vec::new()
    }

    /// Replacement value for a received response header, if any.
    ///
    /// `cx.request` is the request being answered.
    fn sift_response_header(&self, _name: &str, _value: &str, _cx: &MessageContext<'_>) -> Option<String> {
        None
    }

    /// Headers appended to the response head before its empty line.
    fn add_response_headers(&self, _cx: &MessageContext<'_>) -> Vec<Header> {
        Vec::new()
    }

    /// Picks the upstream for a request whose head is complete.
    ///
    /// `None` rejects the request: the client receives `404 Not Found` and
    /// the connection closes. The request may be annotated through its
    /// attachment slot.
    fn resolve_upstream(&self, request: &mut HttpMessage) -> Option<ConnectionTarget>;

    /// A request/response cycle finished with both messages fully forwarded.
    fn on_exchange_complete(&self, request: &HttpMessage, response: &HttpMessage) {
        info!(
            method = request.method(),
            path = request.path(),
            status = response.status(),
            "exchange complete"
        );
    }

    fn on_request_protocol_error(&self, request: &HttpMessage, description: &str) {
        warn!(method = request.method(), path = request.path(), description, "request protocol error");
    }

    fn on_response_protocol_error(&self, request: Option<&HttpMessage>, response: &HttpMessage, description: &str) {
        warn!(
            path = request.map(HttpMessage::path),
            status = response.status(),
            description,
            "response protocol error"
        );
    }

    /// The client side went away while a message was still in flight.
    fn on_premature_request_closed(&self, request: &HttpMessage, cause: &io::Error) {
        warn!(method = request.method(), path = request.path(), cause = %cause, "premature request close");
    }

    /// The upstream side went away while a message was still in flight.
    fn on_premature_response_closed(&self, request: Option<&HttpMessage>, response: &HttpMessage, cause: &io::Error) {
        warn!(
            path = request.map(HttpMessage::path),
            status = response.status(),
            cause = %cause,
            "premature response close"
        );
    }

    /// Pause after a zero-byte read on a blocking transport.
    fn read_wait_backoff(&self) -> Duration {
        Duration::from_millis(10)
    }

    /// Write attempts per readiness event before the rest is queued.
    fn max_write_attempts_per_event(&self) -> usize {
        8
    }

    /// Client TLS configuration used for upstreams whose target has `tls` set.
    ///
    /// Without one, TLS targets fail with `502 Bad Gateway`.
    fn tls_client_config(&self) -> Option<Arc<rustls::ClientConfig>> {
        None
    }
}
