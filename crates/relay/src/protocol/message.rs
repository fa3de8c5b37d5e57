//! HTTP message model shared by both forwarding directions.
//!
//! A [`HttpMessage`] records what the framer has seen of one request or one
//! response: its start line, its headers in wire order, and when it started and
//! finished. The bytes themselves are never retained here; they are forwarded
//! as soon as they are framed.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use http::header;

/// Which half of an exchange a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to upstream.
    Request,
    /// Upstream to client.
    Response,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Request => f.write_str("request"),
            Direction::Response => f.write_str("response"),
        }
    }
}

/// A single header field.
///
/// The name keeps the case it arrived with; comparisons against
/// framing-significant names go through [`Header::is`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    name: String,
    value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Case-insensitive name comparison.
    #[inline]
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// The first line of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    Request { method: String, path: String, version: String },
    /// `status` is `-1` when the status text is not a number.
    Response { version: String, status: i32, reason: String },
}

/// Opaque per-message slot for the host application.
pub type Attachment = Arc<dyn Any + Send + Sync>;

/// One HTTP request or response as observed on the wire.
#[derive(Debug, Clone)]
pub struct HttpMessage {
    start_line: StartLine,
    headers: Vec<Header>,
    started_at: Instant,
    finished_at: Option<Instant>,
    attachment: Option<Attachment>,
}

impl HttpMessage {
    pub(crate) fn new(direction: Direction) -> Self {
        let start_line = match direction {
            Direction::Request => {
                StartLine::Request { method: String::new(), path: String::new(), version: String::new() }
            }
            Direction::Response => StartLine::Response { version: String::new(), status: -1, reason: String::new() },
        };
        Self { start_line, headers: Vec::new(), started_at: Instant::now(), finished_at: None, attachment: None }
    }

    pub fn direction(&self) -> Direction {
        match self.start_line {
            StartLine::Request { .. } => Direction::Request,
            StartLine::Response { .. } => Direction::Response,
        }
    }

    pub fn start_line(&self) -> &StartLine {
        &self.start_line
    }

    pub(crate) fn set_start_line(&mut self, start_line: StartLine) {
        self.start_line = start_line;
    }

    /// Request method, empty for responses.
    pub fn method(&self) -> &str {
        match &self.start_line {
            StartLine::Request { method, .. } => method,
            StartLine::Response { .. } => "",
        }
    }

    /// Request target, empty for responses.
    pub fn path(&self) -> &str {
        match &self.start_line {
            StartLine::Request { path, .. } => path,
            StartLine::Response { .. } => "",
        }
    }

    pub fn version(&self) -> &str {
        match &self.start_line {
            StartLine::Request { version, .. } | StartLine::Response { version, .. } => version,
        }
    }

    /// Response status code; `-1` for requests and unparsable status text.
    pub fn status(&self) -> i32 {
        match &self.start_line {
            StartLine::Response { status, .. } => *status,
            StartLine::Request { .. } => -1,
        }
    }

    pub fn reason(&self) -> &str {
        match &self.start_line {
            StartLine::Response { reason, .. } => reason,
            StartLine::Request { .. } => "",
        }
    }

    /// Headers in the order they were received, duplicates included.
    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub(crate) fn push_header(&mut self, header: Header) {
        self.headers.push(header);
    }

    /// First value of the named header, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|h| h.is(name)).map(Header::value)
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub(crate) fn mark_started(&mut self) {
        self.started_at = Instant::now();
    }

    /// Set once the message has been fully framed.
    pub fn finished_at(&self) -> Option<Instant> {
        self.finished_at
    }

    pub(crate) fn mark_finished(&mut self) {
        self.finished_at = Some(Instant::now());
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        self.attachment.as_ref()
    }

    pub fn set_attachment(&mut self, attachment: Attachment) {
        self.attachment = Some(attachment);
    }

    /// Whether this message allows the connection to carry another cycle.
    ///
    /// HTTP/1.0 needs an explicit `Connection: keep-alive`; later versions
    /// persist unless `Connection: close` is present.
    pub fn keep_alive(&self) -> bool {
        let connection = self.connection_tokens();
        if self.version().eq_ignore_ascii_case("HTTP/1.0") {
            connection.iter().any(|t| t.eq_ignore_ascii_case("keep-alive"))
        } else {
            !connection.iter().any(|t| t.eq_ignore_ascii_case("close"))
        }
    }

    fn connection_tokens(&self) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|h| h.is(header::CONNECTION.as_str()))
            .flat_map(|h| h.value().split(','))
            .map(str::trim)
            .collect()
    }

    /// 1xx responses other than `101 Switching Protocols` precede the final response.
    pub fn is_interim(&self) -> bool {
        let status = self.status();
        (100..200).contains(&status) && status != 101
    }
}

/// What a header hook can see while a message is being framed.
#[derive(Debug, Clone, Copy)]
pub struct MessageContext<'a> {
    /// The message being framed.
    pub message: &'a HttpMessage,
    /// For responses, the request being answered.
    pub request: Option<&'a HttpMessage>,
}
