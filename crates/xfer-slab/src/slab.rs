//! A fixed-capacity, reusable byte buffer and the linked "slab train" that
//! shares a sequence of them between up to four concurrent cursors.

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

/// A heap-backed byte buffer with a fixed capacity, usable data starting at
/// `offset` and spanning `len` bytes, and a transfer-wide monotonic serial
/// number.
///
/// Invariant: `offset + len <= capacity()` always holds.
#[derive(Clone)]
pub struct Slab {
    data: Vec<u8>,
    offset: usize,
    len: usize,
    serial: u64,
}

impl fmt::Debug for Slab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slab")
            .field("capacity", &self.data.len())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("serial", &self.serial)
            .finish()
    }
}

impl Slab {
    /// Creates an empty slab with the given capacity and serial number.
    #[must_use]
    pub fn with_capacity(capacity: usize, serial: u64) -> Self {
        Self {
            data: vec![0u8; capacity],
            offset: 0,
            len: 0,
            serial,
        }
    }

    /// The slab's fixed allocation size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The slab's serial number, unique within one transfer.
    #[must_use]
    pub const fn serial(&self) -> u64 {
        self.serial
    }

    /// The offset of valid data within the allocation.
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// The number of valid, unconsumed bytes.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// `true` if the slab has no remaining unconsumed bytes.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The slab's valid data.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.len]
    }

    /// The writable region following the current valid data, used by a
    /// producer filling the slab incrementally.
    pub fn spare_capacity_mut(&mut self) -> &mut [u8] {
        let start = self.offset + self.len;
        &mut self.data[start..]
    }

    /// Records that `n` freshly written bytes starting at
    /// `offset + len` are now valid.
    pub fn extend_len(&mut self, n: usize) {
        debug_assert!(self.offset + self.len + n <= self.data.len());
        self.len += n;
    }

    /// Advances `offset` by `n` and decreases `len` by `n`, marking the
    /// first `n` bytes as consumed.
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len);
        self.offset += n;
        self.len -= n;
    }

    /// Reclaims the unused prefix (when `offset > 4 * len`) by shifting data
    /// to the front of the allocation, then shrinks the backing allocation
    /// when it has grown to more than `2 * len + offset`.
    ///
    /// Bounds memory growth from variable-sized producer writes that
    /// repeatedly call [`Slab::merge`].
    pub fn heatshrink(&mut self) {
        if self.len > 0 && self.offset > 4 * self.len {
            self.data.copy_within(self.offset..self.offset + self.len, 0);
            self.offset = 0;
        }
        let needed = self.len + self.offset;
        if self.data.len() > 2 * self.len + self.offset {
            self.data.truncate(needed.max(1));
            self.data.shrink_to_fit();
        }
    }

    /// Combines two slabs' data into one, consuming both and returning a
    /// single slab containing `a`'s bytes followed by `b`'s bytes.
    ///
    /// Prefers an in-place strategy: if `a`'s bytes fit in the unused prefix
    /// of `b`'s allocation, `b` is reused and `a` is freed; if `b`'s bytes
    /// fit in the unused suffix of `a`'s allocation, `a` is reused and `b` is
    /// freed. Otherwise `a` is reallocated to fit both and `b` is freed.
    #[must_use]
    pub fn merge(a: Self, b: Self) -> Self {
        if a.len <= b.offset {
            let mut b = b;
            let dest_start = b.offset - a.len;
            b.data[dest_start..b.offset].copy_from_slice(a.bytes());
            b.offset = dest_start;
            b.len += a.len;
            b.serial = a.serial;
            return b;
        }

        if b.len <= a.data.len() - (a.offset + a.len) {
            let mut a = a;
            let dest_start = a.offset + a.len;
            a.data[dest_start..dest_start + b.len].copy_from_slice(b.bytes());
            a.len += b.len;
            return a;
        }

        let mut grown = vec![0u8; a.len + b.len];
        grown[..a.len].copy_from_slice(a.bytes());
        grown[a.len..].copy_from_slice(b.bytes());
        Self {
            data: grown,
            offset: 0,
            len: a.len + b.len,
            serial: a.serial,
        }
    }
}

/// One node of a [`SlabTrain`]: an immutable slab plus a link to its
/// successor, shared by every cursor that has reached it.
pub struct SlabNode {
    slab: Slab,
    next: Mutex<Option<SlabHandle>>,
}

impl SlabNode {
    /// The slab stored at this node.
    #[must_use]
    pub fn slab(&self) -> &Slab {
        &self.slab
    }
}

/// A shared, reference-counted handle to one node of a slab train.
///
/// `Arc::strong_count` on a handle held only by the train's tail cursor is
/// the refcount described in the specification: a count of 1 means no
/// other cursor still needs this slab, so it is safe to reclaim.
pub type SlabHandle = Arc<SlabNode>;

/// Follows the train one step past `handle`, returning the next node if one
/// has been linked yet.
#[must_use]
pub fn next_of(handle: &SlabHandle) -> Option<SlabHandle> {
    handle.next.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
}

struct TrainShared {
    oldest: Option<SlabHandle>,
    newest: Option<SlabHandle>,
    extant: u64,
    next_serial: u64,
    cancelled: bool,
}

/// A linked sequence of [`Slab`]s, shared by up to four advancing cursors
/// (conventionally named `reader`, `device`, `mem_cache`, and
/// `disk_cacher` by callers in `xfer-taper`).
///
/// [`SlabTrain::alloc`] bounds total memory to `max_slabs * slab_size` by
/// blocking until either fewer than `max_slabs` slabs are outstanding or the
/// oldest slab becomes reclaimable (its only remaining owner is the train's
/// own `oldest` cursor).
pub struct SlabTrain {
    shared: Mutex<TrainShared>,
    slab_cond: Condvar,
    slab_free_cond: Condvar,
    slab_size: usize,
    max_slabs: u64,
}

impl SlabTrain {
    /// Creates an empty train with the given per-slab capacity and maximum
    /// number of outstanding slabs.
    #[must_use]
    pub fn new(slab_size: usize, max_slabs: u64) -> Self {
        Self {
            shared: Mutex::new(TrainShared {
                oldest: None,
                newest: None,
                extant: 0,
                next_serial: 0,
                cancelled: false,
            }),
            slab_cond: Condvar::new(),
            slab_free_cond: Condvar::new(),
            slab_size,
            max_slabs: max_slabs.max(2),
        }
    }

    /// The fixed per-slab capacity this train was configured with.
    #[must_use]
    pub const fn slab_size(&self) -> usize {
        self.slab_size
    }

    /// Returns a fresh, exclusively-owned [`Slab`] ready to be filled and
    /// later linked with [`SlabTrain::push`].
    ///
    /// If `force` is `false`, blocks until either fewer than `max_slabs`
    /// slabs are outstanding or the oldest slab in the train is reclaimable,
    /// reusing its allocation in that case. Returns `None` if the train is
    /// cancelled while waiting, or was already cancelled.
    ///
    /// If `force` is `true`, never blocks: it reclaims the oldest slab if
    /// possible, otherwise always allocates fresh, ignoring `max_slabs`.
    pub fn alloc(&self, force: bool) -> Option<Slab> {
        let mut guard = self
            .shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if guard.cancelled {
                return None;
            }

            let reclaimable = guard
                .oldest
                .as_ref()
                .is_some_and(|oldest| Arc::strong_count(oldest) == 1);

            if force || guard.extant < self.max_slabs || reclaimable {
                break;
            }

            guard = self
                .slab_free_cond
                .wait(guard)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }

        let reclaimable = guard
            .oldest
            .as_ref()
            .is_some_and(|oldest| Arc::strong_count(oldest) == 1);

        if reclaimable {
            let oldest = guard.oldest.take().expect("checked reclaimable above");
            guard.oldest = next_of(&oldest);
            guard.extant -= 1;
            let node = Arc::try_unwrap(oldest)
                .unwrap_or_else(|_| unreachable!("strong_count checked to be 1 under the lock"));
            let mut reused = node.slab;
            reused.offset = 0;
            reused.len = 0;
            return Some(reused);
        }

        Some(Slab::with_capacity(self.slab_size, 0))
    }

    /// Links `slab` onto the tail of the train, assigning it the next
    /// serial number, and returns a shared handle to it. Signals any thread
    /// waiting in a cursor-advance call.
    pub fn push(&self, mut slab: Slab) -> SlabHandle {
        let mut guard = self
            .shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        slab.serial = guard.next_serial;
        guard.next_serial += 1;
        guard.extant += 1;

        let node = Arc::new(SlabNode {
            slab,
            next: Mutex::new(None),
        });

        if let Some(newest) = guard.newest.take() {
            *newest
                .next
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Arc::clone(&node));
        } else {
            guard.oldest = Some(Arc::clone(&node));
        }
        guard.newest = Some(Arc::clone(&node));

        drop(guard);
        self.slab_cond.notify_all();
        node
    }

    /// Blocks until a slab past `after` (or the first slab, if `after` is
    /// `None`) is available, or the train is cancelled.
    #[must_use]
    pub fn wait_next(&self, after: Option<&SlabHandle>) -> Option<SlabHandle> {
        let mut guard = self
            .shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if guard.cancelled {
                return None;
            }
            let candidate = match after {
                Some(handle) => next_of(handle),
                None => guard.oldest.clone(),
            };
            if candidate.is_some() {
                return candidate;
            }
            guard = self
                .slab_cond
                .wait(guard)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Informs the train that a cursor has advanced and released its
    /// reference to a slab, so any `alloc` waiting on reclamation should
    /// re-check its condition.
    pub fn notify_cursor_advanced(&self) {
        self.slab_free_cond.notify_all();
    }

    /// Marks the train cancelled, waking every thread blocked in `alloc` or
    /// `wait_next`.
    pub fn cancel(&self) {
        let mut guard = self
            .shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.cancelled = true;
        drop(guard);
        self.slab_cond.notify_all();
        self.slab_free_cond.notify_all();
    }

    /// The number of slabs currently linked into the train.
    #[must_use]
    pub fn extant(&self) -> u64 {
        self.shared
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extant
    }
}

#[cfg(test)]
mod tests {
    use super::{Slab, SlabTrain, next_of};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn consume_advances_offset_and_shrinks_len() {
        let mut slab = Slab::with_capacity(16, 0);
        slab.spare_capacity_mut()[..4].copy_from_slice(b"abcd");
        slab.extend_len(4);
        slab.consume(2);
        assert_eq!(slab.bytes(), b"cd");
    }

    #[test]
    fn merge_prefers_growing_a_when_b_has_no_room() {
        let mut a = Slab::with_capacity(4, 0);
        a.spare_capacity_mut().copy_from_slice(b"abcd");
        a.extend_len(4);

        let mut b = Slab::with_capacity(4, 1);
        b.spare_capacity_mut().copy_from_slice(b"efgh");
        b.extend_len(4);

        let merged = Slab::merge(a, b);
        assert_eq!(merged.bytes(), b"abcdefgh");
    }

    #[test]
    fn merge_reuses_b_prefix_when_a_fits_before_offset() {
        // b occupies the back half of an 8-byte allocation (offset=4, len=4),
        // leaving 4 bytes of headroom before its offset for a's bytes.
        let mut b = Slab::with_capacity(8, 5);
        b.spare_capacity_mut().copy_from_slice(b"XXXXefgh");
        b.extend_len(8);
        b.consume(4);
        assert_eq!(b.bytes(), b"efgh");

        let mut a = Slab::with_capacity(4, 4);
        a.spare_capacity_mut().copy_from_slice(b"abcd");
        a.extend_len(4);

        let merged = Slab::merge(a, b);
        assert_eq!(merged.bytes(), b"abcdefgh");
    }

    #[test]
    fn heatshrink_reclaims_prefix_when_far_ahead() {
        let mut slab = Slab::with_capacity(100, 0);
        slab.extend_len(100);
        slab.consume(91); // offset=91, len=9; 91 > 4*9
        slab.heatshrink();
        assert_eq!(slab.offset(), 0);
        assert_eq!(slab.len(), 9);
    }

    #[test]
    fn alloc_reuses_reclaimable_oldest_slab() {
        let train = SlabTrain::new(1024, 2);
        let s1 = train.alloc(false).unwrap();
        let h1 = train.push(s1);
        drop(h1); // strong_count now 1 (train's own oldest link)

        let s2 = train.alloc(false).unwrap();
        let h2 = train.push(s2);
        drop(h2);

        // max_slabs=2, extant=2: next alloc must reclaim the oldest (serial 0).
        let reused = train.alloc(false).unwrap();
        assert_eq!(reused.capacity(), 1024);
    }

    #[test]
    fn alloc_blocks_until_reclaimable_or_under_cap() {
        let train = Arc::new(SlabTrain::new(64, 2));
        let s1 = train.alloc(false).unwrap();
        let h1 = train.push(s1);
        let s2 = train.alloc(false).unwrap();
        let h2 = train.push(s2);

        // Both slabs are held by a caller-side handle, so a third alloc
        // should block until one is released.
        let train_clone = Arc::clone(&train);
        let blocked = thread::spawn(move || train_clone.alloc(false));

        thread::sleep(Duration::from_millis(20));
        drop(h1);
        train.notify_cursor_advanced();

        let result = blocked.join().unwrap();
        assert!(result.is_some());
        drop(h2);
    }

    #[test]
    fn cancel_wakes_blocked_alloc() {
        let train = Arc::new(SlabTrain::new(64, 1));
        let s1 = train.alloc(false).unwrap();
        let h1 = train.push(s1);

        let train_clone = Arc::clone(&train);
        let blocked = thread::spawn(move || train_clone.alloc(false));

        thread::sleep(Duration::from_millis(20));
        train.cancel();
        let result = blocked.join().unwrap();
        assert!(result.is_none());
        drop(h1);
    }

    #[test]
    fn push_links_train_and_next_of_walks_it() {
        let train = SlabTrain::new(16, 4);
        let s1 = train.alloc(false).unwrap();
        let h1 = train.push(s1);
        let s2 = train.alloc(false).unwrap();
        let h2 = train.push(s2);

        let next = next_of(&h1).unwrap();
        assert_eq!(next.slab().serial(), h2.slab().serial());
    }
}
