//!
//! Fixed-capacity circular byte buffer used by every `Object` to hold
//! bytes read from one participant before they are drained to its
//! readers, or written out to its own fd.
//!
//! `append` overwrites the oldest unread bytes on overflow and raises a
//! sticky overflow flag rather than growing or blocking.
//!

/// Default ring capacity. `2 * MAX_BUF_SIZE` from `common.h` so that both
/// `capacity >= 2 * replay_len` and `capacity >= replay_len + max_socket_line`
/// hold for the stock `CONMAN_REPLAY_LEN`/`MAX_SOCK_LINE` values (see
/// DESIGN.md Open Questions).
pub const DEFAULT_CAPACITY: usize = 16 * 1024;

/// Number of trailing bytes replayed to a client that just linked to a
/// console (`CONMAN_REPLAY_LEN` in `common.h`).
pub const REPLAY_LEN: usize = 4096;

/// A single-producer/single-consumer circular buffer with overwrite-on-full
/// semantics. Not thread-safe by itself — a ring is only ever touched by
/// the mux thread once its owning object is installed in the registry, so
/// no internal locking is needed.
pub struct RingBuffer {
    data: Box<[u8]>,
    /// Index of the next byte to be read.
    read: usize,
    /// Index of the next byte to be written.
    write: usize,
    /// Set when `append` has overwritten unread bytes; cleared by the
    /// caller once the backpressure notice has been emitted.
    overflowed: bool,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 1, "ring capacity must allow at least one byte");
        RingBuffer {
            data: vec![0u8; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
            overflowed: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// One slot is always kept empty so `write == read` unambiguously means
    /// empty; unread data therefore never exceeds `capacity() - 1`.
    fn usable(&self) -> usize {
        self.capacity() - 1
    }

    /// Number of unread bytes currently held.
    pub fn len(&self) -> usize {
        let cap = self.capacity();
        (self.write + cap - self.read) % cap
    }

    pub fn is_empty(&self) -> bool {
        self.write == self.read
    }

    /// Free space before the ring must start overwriting unread bytes.
    pub fn free_space(&self) -> usize {
        self.usable() - self.len()
    }

    /// True if unread data has been silently overwritten since the flag
    /// was last cleared.
    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn clear_overflow(&mut self) {
        self.overflowed = false;
    }

    /// Copies `bytes` into the ring, advancing the write cursor modulo
    /// capacity. If `bytes` is longer than the ring can ever hold, only the
    /// trailing usable-capacity bytes are kept. Oldest unread bytes are
    /// dropped (advancing the read cursor) to make room when `bytes` would
    /// otherwise push unread data past `capacity() - 1`, and the overflow
    /// flag is raised.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let cap = self.capacity();
        let usable = self.usable();
        let bytes = if bytes.len() > usable {
            self.overflowed = true;
            &bytes[bytes.len() - usable..]
        } else {
            bytes
        };

        let incoming = bytes.len();
        let avail = usable - self.len();
        if incoming > avail {
            let drop = incoming - avail;
            self.read = (self.read + drop) % cap;
            self.overflowed = true;
        }

        let first = cap - self.write;
        if incoming <= first {
            self.data[self.write..self.write + incoming].copy_from_slice(bytes);
        } else {
            self.data[self.write..cap].copy_from_slice(&bytes[..first]);
            self.data[..incoming - first].copy_from_slice(&bytes[first..]);
        }
        self.write = (self.write + incoming) % cap;
    }

    /// Returns the largest contiguous slice of unread bytes starting at
    /// the read cursor. The caller must call `consume(n)` with `n <=
    /// slice.len()` after making progress; never returns more than
    /// `capacity - 1` bytes in total across repeated calls without an
    /// intervening `consume` (testable property 3).
    pub fn readable_span(&self) -> &[u8] {
        if self.is_empty() {
            return &[];
        }
        let cap = self.capacity();
        if self.write > self.read {
            &self.data[self.read..self.write]
        } else {
            &self.data[self.read..cap]
        }
    }

    /// Advances the read cursor by `n` bytes (which must not exceed the
    /// length of the last `readable_span()`).
    pub fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        let cap = self.capacity();
        debug_assert!(n <= self.len());
        self.read = (self.read + n) % cap;
    }

    /// Copies up to `REPLAY_LEN` trailing bytes (the suffix ending at the
    /// current write cursor) without disturbing the read cursor. Used when
    /// linking a new client to a console.
    pub fn replay_tail(&self, max: usize) -> Vec<u8> {
        let n = self.len().min(max);
        if n == 0 {
            return Vec::new();
        }
        let cap = self.capacity();
        // Start position of the trailing `n` bytes, counted back from `write`.
        let start = (self.write + cap - n) % cap;
        let mut out = Vec::with_capacity(n);
        if start < self.write {
            out.extend_from_slice(&self.data[start..self.write]);
        } else {
            out.extend_from_slice(&self.data[start..cap]);
            out.extend_from_slice(&self.data[..self.write]);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_ring_is_empty() {
        let r = RingBuffer::new(8);
        assert!(r.is_empty());
        assert_eq!(r.len(), 0);
        assert_eq!(r.free_space(), 7);
    }

    #[test]
    fn append_and_consume_roundtrip() {
        let mut r = RingBuffer::new(8);
        r.append(b"abcd");
        assert_eq!(r.len(), 4);
        assert_eq!(r.readable_span(), b"abcd");
        r.consume(4);
        assert!(r.is_empty());
    }

    #[test]
    fn wrap_without_overflow() {
        let mut r = RingBuffer::new(8);
        r.append(b"abcdef");
        r.consume(6);
        r.append(b"ghij"); // wraps around but fits in free space (8 avail, only used 0 after consume)
        assert_eq!(r.len(), 4);
        // spans until physical end, then wraps; collect via repeated consume.
        let mut collected = Vec::new();
        loop {
            let span = r.readable_span();
            if span.is_empty() {
                break;
            }
            collected.extend_from_slice(span);
            let n = span.len();
            r.consume(n);
        }
        assert_eq!(collected, b"ghij");
        assert!(!r.overflowed());
    }

    #[test]
    fn overflow_never_exceeds_capacity_minus_one_readable() {
        // property 3: unread data never exceeds N-1 bytes.
        let cap = 8;
        let mut r = RingBuffer::new(cap);
        for _ in 0..5 {
            r.append(b"abcdefghij"); // 10 bytes into an 8 byte ring, repeatedly
        }
        assert!(r.len() <= cap - 1);
        assert!(r.overflowed());
    }

    #[test]
    fn overflow_sets_flag_and_drops_oldest() {
        let mut r = RingBuffer::new(4);
        r.append(b"ab");
        r.append(b"cdef"); // overflows: oldest unread bytes dropped to keep len() <= 3
        assert!(r.overflowed());
        assert_eq!(r.len(), 3);
        let mut collected = Vec::new();
        loop {
            let span = r.readable_span();
            if span.is_empty() {
                break;
            }
            collected.extend_from_slice(span);
            let n = span.len();
            r.consume(n);
        }
        assert_eq!(collected, b"def");
    }

    #[test]
    fn replay_tail_bounded_by_available_and_max() {
        let mut r = RingBuffer::new(16);
        r.append(b"0123456789");
        assert_eq!(r.replay_tail(100), b"0123456789".to_vec());
        assert_eq!(r.replay_tail(4), b"6789".to_vec());
        // replay does not disturb the read cursor.
        assert_eq!(r.len(), 10);
    }

    #[test]
    fn replay_bound_property() {
        // property 4: client receives at most min(B, replay_len) bytes.
        let mut r = RingBuffer::new(DEFAULT_CAPACITY);
        r.append(b"short");
        let replay = r.replay_tail(REPLAY_LEN);
        assert_eq!(replay.len(), 5.min(REPLAY_LEN));
    }
}
