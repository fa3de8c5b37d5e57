//! Incremental framer for one direction of an HTTP/1.x exchange
//!
//! [`MessageFramer`] walks a byte stream through
//! `ReadingStatusLine → ReadingHeaders → ReadingBody → Done`, handing back
//! every forwarded byte as soon as it has been framed. It never needs more
//! than one line of the head, or any of the body, in memory at once.
//!
//! Header hooks run as each header line is read: a hook may replace the value
//! of the line just consumed, and may add headers right before the empty line
//! that ends the head. Everything else is forwarded exactly as received.
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use micro_relay::codec::{FrameItem, MessageFramer};
//! use tokio_util::codec::Decoder;
//!
//! let mut framer = MessageFramer::request(());
//! let mut buffer = BytesMut::from(&b"GET /test HTTP/1.1\r\nHost: x\r\n\r\n"[..]);
//! let mut forwarded = Vec::new();
//! while let Some(item) = framer.decode(&mut buffer).unwrap() {
//!     if let Some(bytes) = item.wire_bytes() {
//!         forwarded.extend_from_slice(bytes);
//!     }
//! }
//! assert_eq!(forwarded, b"GET /test HTTP/1.1\r\nHost: x\r\n\r\n");
//! assert!(framer.is_message_complete());
//! ```

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::codec::body::{BodyItem, BodyMode, PayloadDecoder};
use crate::codec::header::{encode_header, encode_sifted_line, parse_header_line, parse_start_line, FramingHeaders};
use crate::ensure;
use crate::protocol::{Direction, Header, HttpMessage, MessageContext, ParseError};

/// Maximum size in bytes allowed for a start line plus its header block
pub const MAX_HEADER_BYTES: usize = 64 * 1024;

/// Header mutation hooks applied while a head is being framed.
pub trait HeaderSift {
    /// Called for every received header; `Some` replaces the forwarded value.
    fn sift_header(&self, name: &str, value: &str, cx: &MessageContext<'_>) -> Option<String>;

    /// Called once per head, after the headers are complete; the result is
    /// forwarded right before the empty line.
    fn add_headers(&self, cx: &MessageContext<'_>) -> Vec<Header>;
}

/// Forwards every head untouched.
impl HeaderSift for () {
    fn sift_header(&self, _name: &str, _value: &str, _cx: &MessageContext<'_>) -> Option<String> {
        None
    }

    fn add_headers(&self, _cx: &MessageContext<'_>) -> Vec<Header> {
        Vec::new()
    }
}

/// Where the framer is within the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramingState {
    ReadingStatusLine,
    ReadingHeaders,
    ReadingBody(BodyMode),
    Done,
}

/// What one step of the framer produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameItem {
    /// Start line or header bytes, rewritten where a hook asked for it
    Head(Bytes),
    /// The header block is complete; the empty line has not been forwarded yet
    HeadersComplete,
    /// Body content
    Payload(Bytes),
    /// Transfer framing around the body content
    Framing(Bytes),
    /// The message is complete
    MessageDone,
}

impl FrameItem {
    /// The bytes to forward for this item, if any.
    pub fn wire_bytes(&self) -> Option<&Bytes> {
        match self {
            FrameItem::Head(bytes) | FrameItem::Payload(bytes) | FrameItem::Framing(bytes) => Some(bytes),
            FrameItem::HeadersComplete | FrameItem::MessageDone => None,
        }
    }
}

/// Incremental parser and forwarder for one message direction.
///
/// # State Machine
///
/// - `ReadingStatusLine`: waiting for the start line; empty lines are skipped
/// - `ReadingHeaders`: one header line per step; the empty line yields
///   [`FrameItem::HeadersComplete`], and the next step forwards added headers
///   together with the empty line
/// - `ReadingBody(mode)`: delegated to [`PayloadDecoder`]
/// - `Done`: the next byte that arrives starts a new message
pub struct MessageFramer<S> {
    direction: Direction,
    sift: S,
    state: FramingState,
    message: HttpMessage,
    request: Option<HttpMessage>,
    framing: FramingHeaders,
    head_size: usize,
    terminator: Option<Bytes>,
    payload: PayloadDecoder,
    started: bool,
}

impl<S: HeaderSift> MessageFramer<S> {
    pub fn new(direction: Direction, sift: S) -> Self {
        Self {
            direction,
            sift,
            state: FramingState::ReadingStatusLine,
            message: HttpMessage::new(direction),
            request: None,
            framing: FramingHeaders::default(),
            head_size: 0,
            terminator: None,
            payload: PayloadDecoder::empty(),
            started: false,
        }
    }

    /// Creates a framer for client-to-upstream bytes
    pub fn request(sift: S) -> Self {
        Self::new(Direction::Request, sift)
    }

    /// Creates a framer for upstream-to-client bytes
    pub fn response(sift: S) -> Self {
        Self::new(Direction::Response, sift)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> FramingState {
        self.state
    }

    /// The message currently being framed, or the last completed one while
    /// the framer is `Done`.
    pub fn message(&self) -> &HttpMessage {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut HttpMessage {
        &mut self.message
    }

    /// Pairs a response framer with the request it answers.
    pub fn set_request(&mut self, request: HttpMessage) {
        self.request = Some(request);
    }

    pub fn request_message(&self) -> Option<&HttpMessage> {
        self.request.as_ref()
    }

    /// True when no message is partially framed: either the last message
    /// reached `Done`, or not a single byte of the next one has arrived.
    pub fn is_message_complete(&self) -> bool {
        match self.state {
            FramingState::Done => true,
            FramingState::ReadingStatusLine => !self.started,
            FramingState::ReadingHeaders | FramingState::ReadingBody(_) => false,
        }
    }

    /// Starts a new message cycle. The completed message is replaced, not reused.
    fn reset(&mut self) {
        trace!(direction = %self.direction, "start next message");
        self.state = FramingState::ReadingStatusLine;
        self.message = HttpMessage::new(self.direction);
        self.framing = FramingHeaders::default();
        self.head_size = 0;
        self.terminator = None;
        self.payload = PayloadDecoder::empty();
        self.started = false;
    }

    /// Splits one LF-terminated head line off `src`, enforcing [`MAX_HEADER_BYTES`].
    fn take_head_line(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, ParseError> {
        match src.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                self.head_size += pos + 1;
                ensure!(self.head_size <= MAX_HEADER_BYTES, ParseError::too_large_header(self.head_size, MAX_HEADER_BYTES));
                Ok(Some(src.split_to(pos + 1)))
            }
            None => {
                let pending = self.head_size + src.len();
                ensure!(pending <= MAX_HEADER_BYTES, ParseError::too_large_header(pending, MAX_HEADER_BYTES));
                Ok(None)
            }
        }
    }

    fn read_header(&mut self, line: BytesMut) -> Result<FrameItem, ParseError> {
        let Some((name, value)) = parse_header_line(&line)? else {
            self.terminator = Some(line.freeze());
            trace!(direction = %self.direction, head_size = self.head_size, "headers complete");
            return Ok(FrameItem::HeadersComplete);
        };

        self.framing.observe(&name, &value)?;
        self.message.push_header(Header::new(name.as_str(), value.as_str()));

        let cx = MessageContext { message: &self.message, request: self.request.as_ref() };
        let Some(replacement) = self.sift.sift_header(&name, &value, &cx) else {
            return Ok(FrameItem::Head(line.freeze()));
        };

        trace!(name = %name, "header value replaced");
        let mut rewritten = BytesMut::with_capacity(line.len());
        encode_sifted_line(&line, &name, &replacement, &mut rewritten);
        Ok(FrameItem::Head(rewritten.freeze()))
    }

    fn finish_head(&mut self, terminator: &Bytes) -> FrameItem {
        let cx = MessageContext { message: &self.message, request: self.request.as_ref() };
        let added = self.sift.add_headers(&cx);

        let mut head = BytesMut::with_capacity(terminator.len());
        for header in added {
            encode_header(header.name(), header.value(), &mut head);
            self.message.push_header(header);
        }
        head.extend_from_slice(terminator);

        let mode = self.framing.body_mode(&self.message, self.request.as_ref());
        trace!(direction = %self.direction, ?mode, "body mode selected");
        self.payload = mode.into();
        self.state = FramingState::ReadingBody(mode);
        FrameItem::Head(head.freeze())
    }
}

impl<S: HeaderSift> Decoder for MessageFramer<S> {
    type Item = FrameItem;
    type Error = ParseError;

    /// Frames as much of `src` as possible, one item per call
    ///
    /// # Returns
    ///
    /// - `Ok(Some(item))`: the next forwarded piece or lifecycle signal
    /// - `Ok(None)`: need more data to proceed
    /// - `Err(_)`: the stream is not valid HTTP/1.x framing
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                FramingState::Done => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    self.reset();
                }

                FramingState::ReadingStatusLine => {
                    let Some(line) = self.take_head_line(src)? else {
                        if src.iter().any(|b| !matches!(b, b'\r' | b'\n')) {
                            self.started = true;
                        }
                        return Ok(None);
                    };

                    if line.iter().all(|b| matches!(b, b'\r' | b'\n')) {
                        trace!(direction = %self.direction, "skip empty line before start line");
                        self.head_size = 0;
                        continue;
                    }

                    self.started = true;
                    self.message.mark_started();
                    self.message.set_start_line(parse_start_line(self.direction, &line));
                    self.state = FramingState::ReadingHeaders;
                    return Ok(Some(FrameItem::Head(line.freeze())));
                }

                FramingState::ReadingHeaders => {
                    if let Some(terminator) = self.terminator.take() {
                        return Ok(Some(self.finish_head(&terminator)));
                    }

                    let Some(line) = self.take_head_line(src)? else {
                        return Ok(None);
                    };
                    return self.read_header(line).map(Some);
                }

                FramingState::ReadingBody(_) => {
                    let item = match self.payload.decode(src)? {
                        Some(BodyItem::Payload(bytes)) => FrameItem::Payload(bytes),
                        Some(BodyItem::Framing(bytes)) => FrameItem::Framing(bytes),
                        Some(BodyItem::Eof) => {
                            self.state = FramingState::Done;
                            self.message.mark_finished();
                            trace!(direction = %self.direction, "message done");
                            FrameItem::MessageDone
                        }
                        None => return Ok(None),
                    };
                    return Ok(Some(item));
                }
            }
        }
    }
}

impl<S> std::fmt::Debug for MessageFramer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFramer")
            .field("direction", &self.direction)
            .field("state", &self.state)
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}
