//! Header line serialization for heads that are rewritten in flight.
//!
//! Only lines that a hook changes or adds go through here; every other byte of
//! a forwarded head is passed on exactly as received.

use bytes::{BufMut, BytesMut};

/// Appends `name: value\r\n` to `dst`.
pub fn encode_header(name: &str, value: &str, dst: &mut BytesMut) {
    dst.reserve(name.len() + value.len() + 4);
    dst.put_slice(name.as_bytes());
    dst.put_slice(b": ");
    dst.put_slice(value.as_bytes());
    dst.put_slice(b"\r\n");
}

/// Rewrites a received header line with a new value.
///
/// The field name keeps its original spelling and the line keeps its
/// original terminator (`\r\n` or a bare `\n`).
pub fn encode_sifted_line(original: &[u8], name: &str, value: &str, dst: &mut BytesMut) {
    let terminator: &[u8] = if original.ends_with(b"\r\n") { b"\r\n" } else { b"\n" };
    dst.reserve(name.len() + value.len() + 2 + terminator.len());
    dst.put_slice(name.as_bytes());
    dst.put_slice(b": ");
    dst.put_slice(value.as_bytes());
    dst.put_slice(terminator);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_plain_header() {
        let mut dst = BytesMut::new();
        encode_header("X-Forwarded-For", "10.0.0.1", &mut dst);
        assert_eq!(&dst[..], b"X-Forwarded-For: 10.0.0.1\r\n");
    }

    #[test]
    fn sifted_line_keeps_terminator() {
        let mut dst = BytesMut::new();
        encode_sifted_line(b"host: a\n", "host", "b", &mut dst);
        assert_eq!(&dst[..], b"host: b\n");

        dst.clear();
        encode_sifted_line(b"Host: a\r\n", "Host", "b", &mut dst);
        assert_eq!(&dst[..], b"Host: b\r\n");
    }
}
