//! TLS for the forwarding engine
//!
//! - [`engine`]: the wrap/unwrap engine contract and its rustls implementation
//! - [`adapter`]: the record-layer state machine used by the selector
//!   discipline
//!
//! The blocking discipline uses [`TlsTransport`](crate::blocking::TlsTransport)
//! instead, which drives a rustls session directly over a blocking socket.

pub mod adapter;
pub mod engine;

pub use adapter::{Op, Step, TLS_BUFFER_SIZE, TlsAdapter, TlsRead, transition};
pub use engine::{EngineResult, HandshakeStatus, RustlsEngine, RustlsSession, Status, TlsEngine};

use std::io;
use std::sync::Arc;

use rustls::ClientConnection;
use rustls::pki_types::ServerName;

use crate::pool::ConnectionKey;

/// Starts a client session for `key`, using its host as the server name.
pub(crate) fn client_session(config: Arc<rustls::ClientConfig>, key: &ConnectionKey) -> io::Result<ClientConnection> {
    let server_name = ServerName::try_from(key.host().to_owned())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid server name {}: {e}", key.host())))?;
    ClientConnection::new(config, server_name).map_err(engine::tls_error)
}
