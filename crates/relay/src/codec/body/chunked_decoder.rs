//! Decoder implementation for HTTP chunked transfer encoding.
//!
//! This module frames messages that use chunked transfer encoding as specified in
//! [RFC 9112 Section 7.1](https://www.rfc-editor.org/rfc/rfc9112#section-7.1).
//!
//! Nothing is decoded away: size lines, chunk terminators and trailers come out as
//! [`BodyItem::Framing`] so the wire can be reproduced byte for byte, while chunk
//! contents come out as [`BodyItem::Payload`].

use crate::codec::body::BodyItem;
use crate::ensure;
use crate::protocol::ParseError;
use bytes::BytesMut;
use httparse::Status;
use tokio_util::codec::Decoder;
use tracing::trace;
use ChunkState::*;

/// Longest size line (or trailer line) accepted before giving up.
const MAX_CHUNK_LINE: usize = 4 * 1024;

/// A decoder for handling HTTP chunked transfer encoding.
///
/// The decoder processes incoming bytes according to the chunked format:
/// - Each chunk starts with its size in hexadecimal, optionally followed by extensions
/// - Then the chunk data and CRLF
/// - A zero-sized chunk indicates the end of the message, followed by optional
///   trailer lines and a final CRLF
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: ChunkState,
}

impl ChunkedDecoder {
    /// The decoder starts in the `ReadSizeLine` state, ready to read the size of the first chunk.
    pub fn new() -> Self {
        Self { state: ReadSizeLine }
    }

    pub fn state(&self) -> ChunkState {
        self.state
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    /// Read the hex size line, extensions included
    ReadSizeLine,
    /// Forward this many more bytes of chunk data
    ReadChunkBytes(u64),
    /// Read the CRLF closing a chunk's data
    ReadChunkTerminator,
    /// Read trailer lines up to and including the final empty line
    ReadTrailerTerminator,
    /// The last chunk and its trailer have been read
    Done,
}

impl Decoder for ChunkedDecoder {
    type Item = BodyItem;
    type Error = ParseError;

    /// # Returns
    /// - `Ok(Some(BodyItem::Framing(bytes)))` for a size line, chunk terminator or trailer line
    /// - `Ok(Some(BodyItem::Payload(bytes)))` for chunk data
    /// - `Ok(Some(BodyItem::Eof))` once the final CRLF has been read
    /// - `Ok(None)` when more data is needed
    /// - `Err(ParseError)` if the chunked encoding is invalid
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.state {
            ReadSizeLine => {
                let Some(line) = take_line(src)? else {
                    return Ok(None);
                };

                ensure!(line.first().is_some_and(u8::is_ascii_hexdigit), ParseError::invalid_chunk("invalid chunk size line"));

                let size = match httparse::parse_chunk_size(&line) {
                    Ok(Status::Complete((_, size))) => size,
                    Ok(Status::Partial) | Err(_) => return Err(ParseError::invalid_chunk("invalid chunk size line")),
                };

                trace!(size, "read chunk size");
                self.state = if size == 0 { ReadTrailerTerminator } else { ReadChunkBytes(size) };
                Ok(Some(BodyItem::Framing(line.freeze())))
            }

            ReadChunkBytes(remaining) => {
                if src.is_empty() {
                    return Ok(None);
                }

                // cap remaining bytes at the max capacity of usize
                let remaining_usize = usize::try_from(remaining).unwrap_or(usize::MAX);
                let read_size = std::cmp::min(remaining_usize, src.len());
                let bytes = src.split_to(read_size).freeze();

                let left = remaining - read_size as u64;
                self.state = if left > 0 { ReadChunkBytes(left) } else { ReadChunkTerminator };

                trace!(len = bytes.len(), "read chunked bytes");
                Ok(Some(BodyItem::Payload(bytes)))
            }

            ReadChunkTerminator => {
                let len = match &src[..] {
                    [] | [b'\r'] => return Ok(None),
                    [b'\r', b'\n', ..] => 2,
                    [b'\n', ..] => 1,
                    _ => return Err(ParseError::invalid_chunk("invalid chunk body CRLF")),
                };

                self.state = ReadSizeLine;
                Ok(Some(BodyItem::Framing(src.split_to(len).freeze())))
            }

            ReadTrailerTerminator => {
                let Some(line) = take_line(src)? else {
                    return Ok(None);
                };

                if line.iter().all(|b| matches!(b, b'\r' | b'\n')) {
                    trace!("finished reading chunked data");
                    self.state = Done;
                }

                Ok(Some(BodyItem::Framing(line.freeze())))
            }

            Done => Ok(Some(BodyItem::Eof)),
        }
    }
}

/// Splits one LF-terminated line off the front of `src`.
fn take_line(src: &mut BytesMut) -> Result<Option<BytesMut>, ParseError> {
    match src.iter().position(|b| *b == b'\n') {
        Some(pos) => {
            ensure!(pos < MAX_CHUNK_LINE, ParseError::invalid_chunk("chunk line too long"));
            Ok(Some(src.split_to(pos + 1)))
        }
        None => {
            ensure!(src.len() < MAX_CHUNK_LINE, ParseError::invalid_chunk("chunk line too long"));
            Ok(None)
        }
    }
}
