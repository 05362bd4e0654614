//! A fixed-capacity single-producer/single-consumer ring buffer, the
//! lighter-weight alternative to a [`crate::SlabTrain`] used by the
//! splitter-style taper destination.

use std::sync::{Condvar, Mutex};

struct RingShared {
    buf: Vec<u8>,
    head: usize,
    tail: usize,
    count: usize,
    eof: bool,
    cancelled: bool,
}

/// A byte ring buffer of capacity `M`, where `count = (head - tail) mod M`
/// is maintained as an invariant by every mutating operation.
///
/// Unlike a [`crate::SlabTrain`], a `RingBuffer` has no cursors and no
/// reuse bookkeeping: one producer calls [`RingBuffer::write`], one
/// consumer calls [`RingBuffer::read`], and both block on the buffer's own
/// condition variables rather than an external semaphore.
pub struct RingBuffer {
    shared: Mutex<RingShared>,
    space_available: Condvar,
    data_available: Condvar,
}

impl RingBuffer {
    /// Creates a ring buffer whose capacity is `min_capacity` rounded up to
    /// the nearest multiple of `block_size` (or `min_capacity` itself if
    /// `block_size` is zero).
    #[must_use]
    pub fn new(min_capacity: usize, block_size: usize) -> Self {
        let capacity = if block_size == 0 {
            min_capacity.max(1)
        } else {
            min_capacity.div_ceil(block_size).max(1) * block_size
        };
        Self {
            shared: Mutex::new(RingShared {
                buf: vec![0u8; capacity],
                head: 0,
                tail: 0,
                count: 0,
                eof: false,
                cancelled: false,
            }),
            space_available: Condvar::new(),
            data_available: Condvar::new(),
        }
    }

    /// The buffer's fixed allocation size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .buf
            .len()
    }

    /// The number of unread bytes currently buffered.
    #[must_use]
    pub fn fill_level(&self) -> usize {
        self.shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .count
    }

    /// Writes as much of `data` as fits, blocking for space to free up as
    /// needed, and returns the number of bytes actually written (always
    /// `data.len()` unless the buffer is cancelled mid-write).
    pub fn write(&self, mut data: &[u8]) -> usize {
        let mut written = 0;
        let mut guard = self
            .shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while !data.is_empty() {
            if guard.cancelled {
                break;
            }
            let capacity = guard.buf.len();
            while guard.count == capacity && !guard.cancelled {
                guard = self
                    .space_available
                    .wait(guard)
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
            }
            if guard.cancelled {
                break;
            }

            let capacity = guard.buf.len();
            let free = capacity - guard.count;
            let chunk = data.len().min(free);
            let head = guard.head;
            let first = chunk.min(capacity - head);
            guard.buf[head..head + first].copy_from_slice(&data[..first]);
            if chunk > first {
                guard.buf[..chunk - first].copy_from_slice(&data[first..chunk]);
            }
            guard.head = (head + chunk) % capacity;
            guard.count += chunk;
            data = &data[chunk..];
            written += chunk;

            drop(guard);
            self.data_available.notify_all();
            guard = self
                .shared
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        written
    }

    /// Reads up to `out.len()` bytes, blocking until at least one byte is
    /// available, EOF is reached, or the buffer is cancelled. Returns the
    /// number of bytes read; `0` means EOF or cancellation, never a
    /// zero-length `out`.
    pub fn read(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let mut guard = self
            .shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while guard.count == 0 && !guard.eof && !guard.cancelled {
            guard = self
                .data_available
                .wait(guard)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        if guard.count == 0 {
            return 0;
        }

        let capacity = guard.buf.len();
        let chunk = out.len().min(guard.count);
        let tail = guard.tail;
        let first = chunk.min(capacity - tail);
        out[..first].copy_from_slice(&guard.buf[tail..tail + first]);
        if chunk > first {
            out[first..chunk].copy_from_slice(&guard.buf[..chunk - first]);
        }
        guard.tail = (tail + chunk) % capacity;
        guard.count -= chunk;

        drop(guard);
        self.space_available.notify_all();
        chunk
    }

    /// Marks the buffer as having no further data, waking any blocked
    /// reader once its remaining bytes are drained.
    pub fn set_eof(&self) {
        let mut guard = self
            .shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.eof = true;
        drop(guard);
        self.data_available.notify_all();
    }

    /// `true` once `set_eof` has been called and every buffered byte has
    /// been read.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        let guard = self
            .shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.eof && guard.count == 0
    }

    /// `true` once [`RingBuffer::cancel`] has been called. Lets a caller
    /// tell a cancelled-short `read`/`write` apart from a genuine I/O
    /// failure reported through some other channel.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .cancelled
    }

    /// Cancels the buffer, waking every blocked reader and writer
    /// immediately; further `write`/`read` calls return `0` or a short
    /// count without blocking.
    pub fn cancel(&self) {
        let mut guard = self
            .shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.cancelled = true;
        drop(guard);
        self.space_available.notify_all();
        self.data_available.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::RingBuffer;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn write_then_read_round_trips() {
        let ring = RingBuffer::new(16, 1);
        assert_eq!(ring.write(b"hello"), 5);
        let mut out = [0u8; 5];
        assert_eq!(ring.read(&mut out), 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn wraps_around_capacity() {
        let ring = RingBuffer::new(4, 1);
        ring.write(b"ab");
        let mut out = [0u8; 2];
        ring.read(&mut out);
        ring.write(b"cdef");
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(&out, b"cdef");
    }

    #[test]
    fn capacity_rounds_up_to_block_size() {
        let ring = RingBuffer::new(10, 4);
        assert_eq!(ring.capacity(), 12);
    }

    #[test]
    fn read_returns_zero_at_eof_once_drained() {
        let ring = RingBuffer::new(8, 1);
        ring.write(b"hi");
        ring.set_eof();
        let mut out = [0u8; 2];
        assert_eq!(ring.read(&mut out), 2);
        let mut out = [0u8; 1];
        assert_eq!(ring.read(&mut out), 0);
        assert!(ring.is_drained());
    }

    #[test]
    fn producer_blocks_until_consumer_frees_space() {
        let ring = Arc::new(RingBuffer::new(4, 1));
        ring.write(b"abcd");

        let ring_clone = Arc::clone(&ring);
        let writer = thread::spawn(move || ring_clone.write(b"ef"));

        thread::sleep(std::time::Duration::from_millis(20));
        let mut out = [0u8; 2];
        ring.read(&mut out);

        assert_eq!(writer.join().unwrap(), 2);
    }

    #[test]
    fn cancel_wakes_blocked_reader_and_writer() {
        let ring = Arc::new(RingBuffer::new(2, 1));
        ring.write(b"xy");

        let ring_clone = Arc::clone(&ring);
        let writer = thread::spawn(move || ring_clone.write(b"z"));

        let ring_clone = Arc::clone(&ring);
        thread::sleep(std::time::Duration::from_millis(20));
        ring_clone.cancel();

        assert_eq!(writer.join().unwrap(), 0);
    }

    proptest::proptest! {
        /// For any sequence of single-threaded write/read chunk sizes against
        /// a small ring, the bytes read back equal the bytes written, in
        /// order -- the `count = (head - tail) mod capacity` bookkeeping
        /// never loses or duplicates a byte across a wraparound.
        #[test]
        fn write_read_preserves_byte_order(
            capacity in 1usize..32,
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..16), 0..20),
        ) {
            let ring = RingBuffer::new(capacity, 1);
            let mut expected = Vec::new();
            let mut actual = Vec::new();

            for chunk in &chunks {
                let mut remaining = chunk.as_slice();
                while !remaining.is_empty() {
                    let written = ring.write(remaining);
                    if written == 0 {
                        break;
                    }
                    expected.extend_from_slice(&remaining[..written]);
                    remaining = &remaining[written..];

                    let mut out = vec![0u8; written];
                    let read = ring.read(&mut out);
                    actual.extend_from_slice(&out[..read]);
                }
            }

            prop_assert_eq!(actual, expected);
            prop_assert!(ring.fill_level() <= ring.capacity());
        }
    }
}
