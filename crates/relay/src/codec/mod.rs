//! HTTP/1.x framing for forwarded byte streams
//!
//! This module turns a raw byte stream into forwardable pieces while recording
//! what it has seen. It uses a state machine per direction and never holds more
//! than one head line, or any body bytes, beyond the current call.
//!
//! # Architecture
//!
//! - [`MessageFramer`]: the per-direction state machine, driven through
//!   [`tokio_util::codec::Decoder`]
//! - Head line parsing and rewriting via the [`header`] module
//! - Body framing via the [`body`] module
//!
//! # Features
//!
//! - Byte-exact forwarding: only the lines a [`HeaderSift`] hook changes or
//!   adds differ from the input
//! - Chunked transfer encoding with extensions and trailers
//! - Content-Length based payload handling
//! - Identical output however the input is fragmented

mod body;
mod framer;
mod header;

pub use body::{BodyItem, BodyMode, ChunkState, ChunkedDecoder, LengthDecoder, PayloadDecoder};
pub use framer::{FrameItem, FramingState, HeaderSift, MessageFramer, MAX_HEADER_BYTES};
pub use header::{encode_header, encode_sifted_line, parse_header_line, parse_start_line, FramingHeaders};
