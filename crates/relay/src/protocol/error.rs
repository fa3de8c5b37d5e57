use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use http::StatusCode;
use thiserror::Error;

use crate::protocol::{Direction, Header};

/// Everything that ends an exchange other than an orderly close.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("{direction} protocol error: {source}")]
    Protocol {
        direction: Direction,
        #[source]
        source: ParseError,
    },

    #[error("{direction} transport error: {source}")]
    Transport {
        direction: Direction,
        #[source]
        source: io::Error,
    },

    #[error("exchange ended with {0}")]
    End(EndExchange),
}

impl ExchangeError {
    pub fn protocol(direction: Direction, source: ParseError) -> Self {
        Self::Protocol { direction, source }
    }

    pub fn transport(direction: Direction, source: io::Error) -> Self {
        Self::Transport { direction, source }
    }
}

impl From<EndExchange> for ExchangeError {
    fn from(end: EndExchange) -> Self {
        Self::End(end)
    }
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("unsupported transfer-encoding: {value}")]
    UnsupportedTransferEncoding { value: String },

    #[error("invalid chunk: {reason}")]
    InvalidChunk { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn unsupported_transfer_encoding<S: ToString>(str: S) -> Self {
        Self::UnsupportedTransferEncoding { value: str.to_string() }
    }

    pub fn invalid_chunk<S: ToString>(str: S) -> Self {
        Self::InvalidChunk { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// A controlled abort: a literal response is written to the client and the
/// exchange closes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code} {message}")]
pub struct EndExchange {
    code: u16,
    message: String,
    headers: Vec<Header>,
}

impl EndExchange {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), headers: Vec::new() }
    }

    /// Uses the canonical reason phrase for `status`.
    pub fn status(status: StatusCode) -> Self {
        Self::new(status.as_u16(), status.canonical_reason().unwrap_or_default())
    }

    pub fn not_found() -> Self {
        Self::status(StatusCode::NOT_FOUND)
    }

    pub fn bad_gateway() -> Self {
        Self::status(StatusCode::BAD_GATEWAY)
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    /// `HTTP/1.1 <code> <message>\r\nConnection: close\r\n[<name>: <value>\r\n]*\r\n`
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(64 + self.message.len());
        dst.put_slice(b"HTTP/1.1 ");
        dst.put_slice(self.code.to_string().as_bytes());
        dst.put_u8(b' ');
        dst.put_slice(self.message.as_bytes());
        dst.put_slice(b"\r\nConnection: close\r\n");
        for header in &self.headers {
            crate::codec::encode_header(header.name(), header.value(), &mut dst);
        }
        dst.put_slice(b"\r\n");
        dst.freeze()
    }
}
