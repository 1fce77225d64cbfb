//! Move-only packet buffers.
//!
//! A [`Packet`] is an opaque byte buffer with reserved headroom and
//! tailroom and a fixed annotation area. The scheduler never inspects
//! packet contents; its only contract is that `push`/`pull` calls between
//! elements transfer exclusive ownership forward. Ownership transfer is a
//! move; disposal is the explicit consuming [`Packet::kill`].

use std::time::Instant;

/// Bytes of annotation space carried by every packet.
pub const ANNO_SIZE: usize = 48;

/// Default headroom reserved in front of the payload, enough for a link
/// header to be prepended without reallocating.
pub const DEFAULT_HEADROOM: usize = 28;

/// An owned network packet.
pub struct Packet {
    buf: Box<[u8]>,
    /// Payload start offset into `buf`; bytes before it are headroom.
    start: usize,
    /// Payload end offset; bytes after it are tailroom.
    end: usize,
    anno: [u8; ANNO_SIZE],
    timestamp: Option<Instant>,
}

impl Packet {
    /// Allocates a zero-filled packet of `len` payload bytes with the
    /// default headroom and no tailroom.
    pub fn new(len: usize) -> Packet {
        Packet::with_headroom(DEFAULT_HEADROOM, len, 0)
    }

    /// Allocates a zero-filled packet with explicit headroom and tailroom.
    pub fn with_headroom(headroom: usize, len: usize, tailroom: usize) -> Packet {
        let buf = vec![0u8; headroom + len + tailroom].into_boxed_slice();
        Packet {
            buf,
            start: headroom,
            end: headroom + len,
            anno: [0; ANNO_SIZE],
            timestamp: None,
        }
    }

    /// Allocates a packet holding a copy of `data`, with default headroom.
    pub fn from_slice(data: &[u8]) -> Packet {
        let mut p = Packet::new(data.len());
        p.data_mut().copy_from_slice(data);
        p
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn headroom(&self) -> usize {
        self.start
    }

    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.end
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..self.end]
    }

    /// Prepends `n` bytes, taking them from headroom. Reallocates with
    /// fresh headroom when the current headroom is too small.
    pub fn push(&mut self, n: usize) -> &mut [u8] {
        if n > self.start {
            self.expand_headroom(n);
        }
        self.start -= n;
        &mut self.buf[self.start..self.start + n]
    }

    /// Strips `n` bytes off the front of the payload.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the payload length.
    pub fn pull(&mut self, n: usize) {
        assert!(n <= self.len(), "pull({n}) beyond packet length {}", self.len());
        self.start += n;
    }

    /// Extends the payload by `n` bytes at the tail, reallocating if the
    /// tailroom is too small. The new bytes are zeroed.
    pub fn put(&mut self, n: usize) -> &mut [u8] {
        if n > self.tailroom() {
            self.expand_tailroom(n);
        }
        let at = self.end;
        self.end += n;
        &mut self.buf[at..self.end]
    }

    /// Trims `n` bytes off the tail of the payload.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the payload length.
    pub fn take(&mut self, n: usize) {
        assert!(n <= self.len(), "take({n}) beyond packet length {}", self.len());
        self.end -= n;
    }

    pub fn anno(&self) -> &[u8; ANNO_SIZE] {
        &self.anno
    }

    pub fn anno_mut(&mut self) -> &mut [u8; ANNO_SIZE] {
        &mut self.anno
    }

    pub fn timestamp(&self) -> Option<Instant> {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, t: Instant) {
        self.timestamp = Some(t);
    }

    /// Destroys the packet. Equivalent to dropping it; the explicit call
    /// marks intentional disposal at the end of a processing path.
    pub fn kill(self) {}

    fn expand_headroom(&mut self, need: usize) {
        let headroom = need.max(DEFAULT_HEADROOM);
        let len = self.len();
        let tailroom = self.tailroom();
        let mut buf = vec![0u8; headroom + len + tailroom].into_boxed_slice();
        buf[headroom..headroom + len].copy_from_slice(self.data());
        self.buf = buf;
        self.start = headroom;
        self.end = headroom + len;
    }

    fn expand_tailroom(&mut self, need: usize) {
        let len = self.len();
        let mut buf = vec![0u8; self.start + len + need].into_boxed_slice();
        buf[self.start..self.start + len].copy_from_slice(self.data());
        self.buf = buf;
        self.end = self.start + len;
    }
}

impl Clone for Packet {
    fn clone(&self) -> Packet {
        let mut p = Packet::with_headroom(self.headroom(), self.len(), self.tailroom());
        p.data_mut().copy_from_slice(self.data());
        p.anno = self.anno;
        p.timestamp = self.timestamp;
        p
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("headroom", &self.headroom())
            .field("tailroom", &self.tailroom())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_within_headroom() {
        let mut p = Packet::from_slice(&[1, 2, 3]);
        let hdr = p.push(2);
        hdr.copy_from_slice(&[9, 9]);
        assert_eq!(p.data(), &[9, 9, 1, 2, 3]);
        assert_eq!(p.headroom(), DEFAULT_HEADROOM - 2);
    }

    #[test]
    fn test_push_reallocates_without_headroom() {
        let mut p = Packet::with_headroom(0, 2, 0);
        p.data_mut().copy_from_slice(&[7, 8]);
        p.push(4).copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(p.data(), &[1, 2, 3, 4, 7, 8]);
    }

    #[test]
    fn test_pull_then_put() {
        let mut p = Packet::from_slice(&[1, 2, 3, 4]);
        p.pull(2);
        assert_eq!(p.data(), &[3, 4]);
        p.put(1)[0] = 5;
        assert_eq!(p.data(), &[3, 4, 5]);
    }

    #[test]
    #[should_panic(expected = "pull(5)")]
    fn test_pull_past_end_panics() {
        let mut p = Packet::from_slice(&[1, 2, 3]);
        p.pull(5);
    }

    #[test]
    fn test_anno_roundtrip() {
        let mut p = Packet::new(0);
        p.anno_mut()[0] = 0xAB;
        assert_eq!(p.anno()[0], 0xAB);
    }
}
