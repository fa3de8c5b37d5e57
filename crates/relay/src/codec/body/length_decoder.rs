//! Decoder for bodies delimited by a Content-Length header, as defined in
//! [RFC 9112 Section 6.3](https://www.rfc-editor.org/rfc/rfc9112#section-6.3).

use std::cmp;

use crate::codec::body::BodyItem;
use crate::protocol::ParseError;
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// Forwards exactly `length` payload bytes, in as many pieces as they arrive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthDecoder {
    /// The number of bytes remaining to be read from the payload
    length: u64,
}

impl LengthDecoder {
    pub fn new(length: u64) -> Self {
        Self { length }
    }

    pub fn remaining(&self) -> u64 {
        self.length
    }
}

impl Decoder for LengthDecoder {
    type Item = BodyItem;
    type Error = ParseError;

    /// # Returns
    /// * `Ok(Some(BodyItem::Eof))` when all bytes have been read
    /// * `Ok(Some(BodyItem::Payload(bytes)))` with at most `remaining` bytes
    /// * `Ok(None)` when more data is needed
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.length == 0 {
            return Ok(Some(BodyItem::Eof));
        }

        if src.is_empty() {
            return Ok(None);
        }

        let len = cmp::min(self.length, src.len() as u64);
        #[allow(clippy::cast_possible_truncation, reason = "len is bounded by src.len()")]
        let bytes = src.split_to(len as usize).freeze();

        self.length -= bytes.len() as u64;
        Ok(Some(BodyItem::Payload(bytes)))
    }
}
