//! Errors `Transfer::start` can fail with.

use thiserror::Error;
use xfer_element::ElementError;

use crate::status::TransferStatus;

/// Errors from building or starting a transfer.
///
/// Running failures (a source/filter/destination that cannot continue once
/// data is flowing) are not modeled here: they reach the controller
/// asynchronously as an `Error` message on [`crate::Transfer::inbox`],
/// followed by `Cancel` and `Done`, per spec §7 -- by the time data is
/// flowing, failure can no longer be reported through a call stack.
#[derive(Debug, Error)]
pub enum TransferError {
    /// `start` was called with fewer than two elements (no source/destination
    /// pair to link).
    #[error("a transfer needs at least a source and a destination")]
    NotEnoughElements,
    /// The linker found no way to wire the given elements end to end.
    #[error("no mechanism chain links this element sequence: {0}")]
    NoMechanismChain(#[source] ElementError),
    /// An element's `setup()` failed before any element was started.
    #[error("element setup failed: {0}")]
    Setup(#[source] ElementError),
    /// `start` was called while the transfer was not in the state it
    /// requires.
    #[error("invalid transfer state: expected {expected}, found {found:?}")]
    InvalidState {
        /// The state `start` requires.
        expected: &'static str,
        /// The state the transfer was actually in.
        found: TransferStatus,
    },
}
