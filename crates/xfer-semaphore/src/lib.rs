#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! A counting semaphore protecting a signed `i32` value, used by the transfer
//! engine's bounded queue and slab allocator to implement backpressure.
//!
//! Unlike a textbook semaphore, [`Semaphore::decrement`] can wait for an
//! arbitrary, caller-supplied amount (including zero), and the value can be
//! forced to an arbitrary number at any time via [`Semaphore::force_adjust`]
//! or [`Semaphore::force_set`] to implement cooperative shutdown: a producer
//! thread waiting in `decrement` wakes up, notices the forced value, and can
//! choose to abandon its wait instead of blocking forever.
//!
//! # Invariants
//!
//! Every `decrement(n)` call that returns has executed atomically with
//! respect to concurrent updates of the guarded value: no other thread's
//! `increment`/`decrement`/`force_*` call is "sliced" across that read.
//!
//! # Examples
//!
//! ```
//! use xfer_semaphore::Semaphore;
//!
//! let sem = Semaphore::new(0);
//! sem.increment(3);
//! sem.decrement(2);
//! assert_eq!(sem.value(), 1);
//! ```

use std::sync::{Condvar, Mutex};

/// The guarded value plus a generation counter bumped by every `force_*`
/// call, so a blocked [`Semaphore::decrement`] can tell "value became big
/// enough" apart from "a force happened while I was asleep" even when both
/// land on the same wakeup.
struct Inner {
    value: i32,
    force_generation: u64,
}

/// A counting semaphore with force-set, wait-empty, and integer-valued
/// decrement, as described by `device-src/semaphore.h` in the original
/// Amanda sources.
pub struct Semaphore {
    inner: Mutex<Inner>,
    decrement_cond: Condvar,
    zero_cond: Condvar,
}

impl Semaphore {
    /// Creates a semaphore with the given initial value.
    #[must_use]
    pub fn new(value: i32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                value,
                force_generation: 0,
            }),
            decrement_cond: Condvar::new(),
            zero_cond: Condvar::new(),
        }
    }

    /// Returns the current value without waiting.
    #[must_use]
    pub fn value(&self) -> i32 {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner).value
    }

    /// Blocks until the guarded value is at least `n`, or until a `force_*`
    /// call lands while waiting, then subtracts `n`.
    ///
    /// `n` may be zero, which is useful paired with [`Semaphore::force_set`]
    /// to make a waiter return immediately once a shutdown has been forced:
    /// callers that want to observe a force without consuming any value pass
    /// `n = 0` and compare [`Semaphore::value`] after this returns.
    pub fn decrement(&self, n: u32) {
        let n = i64::from(n);
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let start_generation = guard.force_generation;
        loop {
            if i64::from(guard.value) >= n || guard.force_generation != start_generation {
                break;
            }
            guard = self
                .decrement_cond
                .wait(guard)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        let before = guard.value;
        guard.value = guard.value.saturating_sub(n as i32);
        if before > 0 && guard.value <= 0 {
            self.zero_cond.notify_all();
        }
    }

    /// Adds `n` to the guarded value and wakes any thread blocked in
    /// [`Semaphore::decrement`].
    pub fn increment(&self, n: u32) {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.value = guard.value.saturating_add(n as i32);
        drop(guard);
        self.decrement_cond.notify_all();
    }

    /// Blocks until the guarded value is less than or equal to zero.
    pub fn wait_empty(&self) {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while guard.value > 0 {
            guard = self
                .zero_cond
                .wait(guard)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Unconditionally adds `delta` to the guarded value (which may be
    /// negative), ignoring the usual blocking semantics, and wakes every
    /// waiter so it can re-evaluate its condition.
    pub fn force_adjust(&self, delta: i32) {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.value = guard.value.saturating_add(delta);
        guard.force_generation = guard.force_generation.wrapping_add(1);
        let now_empty = guard.value <= 0;
        drop(guard);
        self.decrement_cond.notify_all();
        if now_empty {
            self.zero_cond.notify_all();
        }
    }

    /// Unconditionally sets the guarded value and wakes every waiter.
    ///
    /// Used to signal shutdown or abort: a producer parked in
    /// [`Semaphore::decrement`] wakes, observes the forced value, and can
    /// exit instead of waiting for real progress that will never come.
    pub fn force_set(&self, value: i32) {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        guard.value = value;
        guard.force_generation = guard.force_generation.wrapping_add(1);
        let now_empty = guard.value <= 0;
        drop(guard);
        self.decrement_cond.notify_all();
        if now_empty {
            self.zero_cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Semaphore;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn decrement_subtracts_when_available() {
        let sem = Semaphore::new(5);
        sem.decrement(3);
        assert_eq!(sem.value(), 2);
    }

    #[test]
    fn decrement_blocks_until_increment() {
        let sem = Arc::new(Semaphore::new(0));
        let worker = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                sem.decrement(4);
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert_eq!(sem.value(), 0);
        sem.increment(4);
        worker.join().unwrap();
        assert_eq!(sem.value(), 0);
    }

    #[test]
    fn wait_empty_returns_once_nonpositive() {
        let sem = Arc::new(Semaphore::new(2));
        let worker = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                sem.wait_empty();
            })
        };

        thread::sleep(Duration::from_millis(20));
        sem.decrement(2);
        worker.join().unwrap();
    }

    #[test]
    fn force_set_wakes_blocked_decrement() {
        let sem = Arc::new(Semaphore::new(0));
        let worker = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                // value is 0, so decrement(1) genuinely blocks in the
                // condvar wait loop until force_set wakes it.
                sem.decrement(1);
                sem.value()
            })
        };

        thread::sleep(Duration::from_millis(20));
        sem.force_set(i32::MIN);
        let observed = worker.join().unwrap();
        assert_eq!(observed, i32::MIN);
    }

    #[test]
    fn force_adjust_does_not_block_and_notifies_waiters() {
        let sem = Arc::new(Semaphore::new(0));
        let worker = {
            let sem = Arc::clone(&sem);
            thread::spawn(move || {
                sem.decrement(1);
            })
        };

        thread::sleep(Duration::from_millis(20));
        sem.force_adjust(5);
        worker.join().unwrap();
        assert_eq!(sem.value(), 4);
    }

    #[test]
    fn decrement_zero_never_blocks_when_value_nonnegative() {
        let sem = Semaphore::new(0);
        sem.decrement(0);
        assert_eq!(sem.value(), 0);
    }
}
