use bytes::{Buf, BytesMut};

/// Framed bytes waiting for their destination to accept them, in order.
#[derive(Debug, Default)]
pub struct PendingWriteQueue {
    buf: BytesMut,
}

impl PendingWriteQueue {
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// The unwritten bytes, oldest first.
    pub fn chunk(&self) -> &[u8] {
        &self.buf
    }

    /// Drops `n` bytes that the destination accepted.
    pub fn advance(&mut self, n: usize) {
        self.buf.advance(n);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
