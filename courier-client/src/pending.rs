//! Outbound command buffering and byte accounting.

use bytes::{BufMut, Bytes, BytesMut};

/// Ordered queue of serialized, not-yet-written commands.
///
/// `size` always equals the byte sum of the queued commands; it returns to
/// zero when the queue is taken for a write.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    chunks: Vec<Bytes>,
    size: usize,
}

impl Pending {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a serialized command, preserving enqueue order.
    pub fn push(&mut self, cmd: Bytes) {
        self.size += cmd.len();
        self.chunks.push(cmd);
    }

    /// Bytes currently queued.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Takes the entire queue coalesced into one contiguous buffer, resetting
    /// the byte counter to zero. Returns `None` when nothing is queued.
    pub fn take(&mut self) -> Option<Bytes> {
        if self.chunks.is_empty() {
            return None;
        }
        let mut buf = BytesMut::with_capacity(self.size);
        for chunk in self.chunks.drain(..) {
            buf.put_slice(&chunk);
        }
        self.size = 0;
        Some(buf.freeze())
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_tracks_pushes() {
        let mut pending = Pending::new();
        assert_eq!(pending.size(), 0);

        pending.push(Bytes::from_static(b"PING\r\n"));
        assert_eq!(pending.size(), 6);

        pending.push(Bytes::from_static(b"PUB foo 2\r\nhi\r\n"));
        assert_eq!(pending.size(), 6 + 15);
    }

    #[test]
    fn test_take_coalesces_in_order_and_resets() {
        let mut pending = Pending::new();
        pending.push(Bytes::from_static(b"SUB foo 1\r\n"));
        pending.push(Bytes::from_static(b"PING\r\n"));

        let buf = pending.take().unwrap();
        assert_eq!(&buf[..], b"SUB foo 1\r\nPING\r\n");
        assert_eq!(pending.size(), 0);
        assert!(pending.is_empty());
        assert!(pending.take().is_none());
    }

    #[test]
    fn test_clear() {
        let mut pending = Pending::new();
        pending.push(Bytes::from_static(b"PING\r\n"));
        pending.clear();
        assert_eq!(pending.size(), 0);
        assert!(pending.take().is_none());
    }
}
