//! Atomically swappable file descriptors, and the raw read/write/close
//! syscall wrappers elements use to speak the `ReadFd`/`WriteFd`
//! mechanisms directly, the way the original engine does.
//!
//! Per the specification's redesign guidance, a raw `i32` is never passed
//! across a public element-construction boundary without being wrapped
//! first; internally, mechanism negotiation still deals in plain
//! descriptors the way upstream/downstream elements peek at each other's
//! `_input_fd`/`_output_fd` fields.

use std::io;
use std::sync::Mutex;

/// Sentinel meaning "no descriptor here", matching the original engine's use
/// of `-1`.
pub const NO_FD: i32 = -1;

/// A file descriptor slot that can be atomically read, replaced, or taken,
/// serialised by its own lock rather than a single engine-wide mutex (the
/// specification's `fd_swap_lock` becomes one lock per cell rather than one
/// shared lock, since distinct elements never contend over the same cell).
#[derive(Debug)]
pub struct FdCell(Mutex<i32>);

impl Default for FdCell {
    fn default() -> Self {
        Self::new()
    }
}

impl FdCell {
    /// Creates an empty cell.
    #[must_use]
    pub fn new() -> Self {
        Self(Mutex::new(NO_FD))
    }

    /// Creates a cell already holding `fd`.
    #[must_use]
    pub fn with_fd(fd: i32) -> Self {
        Self(Mutex::new(fd))
    }

    /// Peeks at the current descriptor without taking ownership of it.
    #[must_use]
    pub fn get(&self) -> i32 {
        *self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Atomically replaces the held descriptor with `new_fd`, returning the
    /// previous value.
    pub fn swap(&self, new_fd: i32) -> i32 {
        let mut guard = self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        std::mem::replace(&mut guard, new_fd)
    }

    /// Takes the held descriptor, leaving [`NO_FD`] behind.
    pub fn take(&self) -> i32 {
        self.swap(NO_FD)
    }
}

/// Reads from `fd` into `buf`, returning the number of bytes read (`0` at
/// EOF), via the raw `read(2)` syscall.
#[allow(unsafe_code)]
pub fn read_fd(fd: i32, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Writes all of `buf` to `fd` via the raw `write(2)` syscall, looping over
/// short writes.
#[allow(unsafe_code)]
pub fn write_fd_all(fd: i32, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        buf = &buf[n as usize..];
    }
    Ok(())
}

/// Closes `fd` via the raw `close(2)` syscall, warning rather than failing
/// if the close itself reports an error (per spec §4.8 teardown: "warn but
/// do not fail if a close returns an error").
#[allow(unsafe_code)]
pub fn close_fd(fd: i32) {
    if fd == NO_FD {
        return;
    }
    let rc = unsafe { libc::close(fd) };
    if rc != 0 {
        #[cfg(feature = "tracing")]
        tracing::warn!(fd, error = %io::Error::last_os_error(), "close failed during element teardown");
    }
}

#[cfg(test)]
mod tests {
    use super::{FdCell, NO_FD};

    #[test]
    fn swap_returns_previous_value() {
        let cell = FdCell::new();
        assert_eq!(cell.swap(5), NO_FD);
        assert_eq!(cell.swap(7), 5);
        assert_eq!(cell.get(), 7);
    }

    #[test]
    fn take_leaves_sentinel_behind() {
        let cell = FdCell::with_fd(9);
        assert_eq!(cell.take(), 9);
        assert_eq!(cell.get(), NO_FD);
    }
}
