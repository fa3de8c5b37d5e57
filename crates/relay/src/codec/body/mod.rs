//! HTTP body framing for forwarded messages
//!
//! The decoders here never buffer a whole body. Each call hands back whatever
//! prefix of the input belongs to the current body, so the caller can forward it
//! immediately.
//!
//! # Components
//!
//! - [`ChunkedDecoder`]: frames chunked transfer encoded bodies
//! - [`LengthDecoder`]: frames Content-Length delimited bodies
//! - [`PayloadDecoder`]: selects between the two, or no body at all

mod chunked_decoder;
mod length_decoder;
mod payload_decoder;

pub use chunked_decoder::ChunkState;
pub use chunked_decoder::ChunkedDecoder;
pub use length_decoder::LengthDecoder;
pub use payload_decoder::BodyMode;
pub use payload_decoder::PayloadDecoder;

use bytes::Bytes;

/// One piece of a body as it passes through a decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyItem {
    /// Message content, forwarded verbatim
    Payload(Bytes),
    /// Transfer framing around the content: chunk size lines, chunk
    /// terminators and trailers
    Framing(Bytes),
    /// The body is complete
    Eof,
}

impl BodyItem {
    /// Returns a reference to the contained bytes, `None` for `Eof`
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            BodyItem::Payload(bytes) | BodyItem::Framing(bytes) => Some(bytes),
            BodyItem::Eof => None,
        }
    }

    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, BodyItem::Eof)
    }
}
