//! A shared cancellation signal, replacing the original engine's "set a
//! flag, then broadcast every condvar that might be waiting on it" pattern
//! (spec §9 Design Notes) with an explicit token each wait composes with its
//! own real condition.
//!
//! A single [`std::sync::Condvar`] can only be paired with the
//! [`std::sync::Mutex`] that produced the guard passed to `wait`, so a
//! shared token cannot literally be the same condvar every unrelated wait
//! blocks on. Instead, [`CancellationToken::wait_while`] polls: it waits on
//! the caller's own condvar for a bounded interval, then checks the token,
//! then re-checks the caller's predicate -- matching spec §5's requirement
//! that "threads check cancelled both before waiting and after each wait
//! return" without inventing a new locking primitive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// The outcome of a [`CancellationToken::wait_while`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate became false: the real condition the caller was
    /// waiting for is now satisfied.
    Ready,
    /// The token was cancelled before the predicate became false.
    Cancelled,
}

/// A cancellation signal any number of worker threads can observe, shared
/// via `Arc` between a transfer's elements and the transfer itself.
#[derive(Debug, Default)]
pub struct CancellationToken {
    cancelled: AtomicBool,
}

impl CancellationToken {
    /// Creates a token that has not yet been cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
        }
    }

    /// Marks the token cancelled. Idempotent; every thread polling
    /// [`CancellationToken::is_cancelled`] or blocked in
    /// [`CancellationToken::wait_while`] observes this within one poll
    /// interval.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// `true` once [`CancellationToken::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Blocks on `condvar`/`guard` while `predicate(&*guard)` holds, waking
    /// early if this token is cancelled.
    ///
    /// Checks the token and the predicate before ever waiting, and again
    /// after every wake, so a cancellation or a real notification that
    /// arrived just before the call is never missed.
    pub fn wait_while<'a, T, F>(
        &self,
        mutex: &'a Mutex<T>,
        condvar: &Condvar,
        mut predicate: F,
    ) -> (MutexGuard<'a, T>, WaitOutcome)
    where
        F: FnMut(&T) -> bool,
    {
        let mut guard = mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if self.is_cancelled() {
                return (guard, WaitOutcome::Cancelled);
            }
            if !predicate(&guard) {
                return (guard, WaitOutcome::Ready);
            }
            let (next, _timed_out) = condvar
                .wait_timeout(guard, POLL_INTERVAL)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            guard = next;
        }
    }
}
