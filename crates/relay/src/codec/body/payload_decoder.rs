//! Decoder for the body of one HTTP message.
//!
//! The framing mode is chosen from the message headers once the header block
//! is complete:
//! - Chunked transfer encoding
//! - Content-Length delimited payloads
//! - Messages with no body

use crate::codec::body::chunked_decoder::ChunkedDecoder;
use crate::codec::body::length_decoder::LengthDecoder;
use crate::codec::body::BodyItem;
use crate::protocol::ParseError;
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// How the end of a body is found.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BodyMode {
    /// Exactly this many bytes follow the header block
    Fixed(u64),
    /// Chunked transfer encoding
    Chunked,
    /// No body
    None,
}

/// A unified decoder for HTTP message bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadDecoder {
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    Length(LengthDecoder),
    Chunked(ChunkedDecoder),
    NoBody,
}

impl PayloadDecoder {
    pub fn empty() -> Self {
        Self { kind: Kind::NoBody }
    }

    pub fn chunked() -> Self {
        Self { kind: Kind::Chunked(ChunkedDecoder::new()) }
    }

    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length(LengthDecoder::new(size)) }
    }

    pub fn mode(&self) -> BodyMode {
        match &self.kind {
            Kind::Length(decoder) => BodyMode::Fixed(decoder.remaining()),
            Kind::Chunked(_) => BodyMode::Chunked,
            Kind::NoBody => BodyMode::None,
        }
    }
}

impl From<BodyMode> for PayloadDecoder {
    fn from(mode: BodyMode) -> Self {
        match mode {
            BodyMode::Fixed(0) | BodyMode::None => PayloadDecoder::empty(),
            BodyMode::Fixed(size) => PayloadDecoder::fix_length(size),
            BodyMode::Chunked => PayloadDecoder::chunked(),
        }
    }
}

impl Decoder for PayloadDecoder {
    type Item = BodyItem;
    type Error = ParseError;

    /// Delegates to the decoder for the selected mode; a bodiless message
    /// reports `Eof` straight away.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::Length(length_decoder) => length_decoder.decode(src),
            Kind::Chunked(chunked_decoder) => chunked_decoder.decode(src),
            Kind::NoBody => Ok(Some(BodyItem::Eof)),
        }
    }
}
