//! An embeddable HTTP/1.x forwarding engine
//!
//! `micro-relay` sits between a client connection and one or more upstream
//! servers. It frames requests and responses incrementally, lets the host
//! application rewrite headers and pick the upstream for every request, and
//! forwards bytes as soon as they are framed. Bodies are never buffered
//! whole.
//!
//! The host application plugs in through the [`director::Director`] trait;
//! the only method it must provide is
//! [`resolve_upstream`](director::Director::resolve_upstream).
//!
//! # Example
//!
//! ```no_run
//! use std::net::TcpListener;
//! use micro_relay::config::SelectorConfig;
//! use micro_relay::director::{ConnectionTarget, Director};
//! use micro_relay::protocol::{HttpMessage, MessageContext};
//! use micro_relay::selector::EventLoopPool;
//!
//! struct Backend;
//!
//! impl Director for Backend {
//!     fn sift_request_header(&self, name: &str, _value: &str, _cx: &MessageContext<'_>) -> Option<String> {
//!         name.eq_ignore_ascii_case("host").then(|| "127.0.0.1:8080".to_owned())
//!     }
//!
//!     fn resolve_upstream(&self, request: &mut HttpMessage) -> Option<ConnectionTarget> {
//!         request.path().starts_with("/api").then(|| ConnectionTarget::plain("127.0.0.1", 8080))
//!     }
//! }
//!
//! let pool = EventLoopPool::start(Backend, SelectorConfig::default())?;
//! let listener = TcpListener::bind("127.0.0.1:3000")?;
//! for stream in listener.incoming() {
//!     pool.dispatch(stream?)?;
//! }
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! # Architecture
//!
//! - [`codec`]: the incremental [`MessageFramer`](codec::MessageFramer), a
//!   `tokio_util` decoder shared by both directions
//! - [`protocol`]: message model and error types
//! - [`director`]: the host-application boundary
//! - [`pool`]: upstream connections cached per exchange
//! - [`exchange`]: the discipline-independent coordinator logic (routing,
//!   keep-alive, premature-close classification)
//! - [`blocking`]: two threads per exchange over blocking sockets
//! - [`selector`]: a fixed pool of mio event loops over non-blocking sockets
//! - [`tls`]: rustls-backed record layer for the selector discipline
//!
//! # Exchange lifecycle
//!
//! A request is routed once its head is complete. An absent route ends the
//! exchange with `404 Not Found`, an unreachable upstream with
//! `502 Bad Gateway`. The response to each request must finish before the
//! next request is read. A connection that closes mid-message is reported to
//! the director as a premature close; a close between messages is not.
//!
//! # Limitations
//!
//! - HTTP/1.x only; no pipelining
//! - Responses delimited by connection close are not supported
//! - Maximum head size: 64 KiB

pub mod blocking;
pub mod codec;
pub mod config;
pub mod director;
pub mod exchange;
pub mod pool;
pub mod protocol;
pub mod selector;
pub mod tls;

mod utils;
pub(crate) use utils::ensure;
