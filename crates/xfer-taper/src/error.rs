//! Errors a taper destination's controller-facing methods can return.

use thiserror::Error;

/// Errors from [`crate::TaperDestCacher`]/[`crate::TaperDestSplitter`]/
/// [`crate::TaperDestDirectTcp`]'s `start_part`/`use_device` calls.
///
/// Failures that occur once data is already flowing -- a device write that
/// fails partway through a part -- are not modeled here: they reach the
/// controller asynchronously as `PartDone { successful: false, .. }`
/// followed by an `Error` message, per spec §7, rather than through a call's
/// return value.
#[derive(Debug, Error)]
pub enum TaperError {
    /// The device reported end-of-media synchronously, e.g. refusing to
    /// start a retried part because the volume is already full. The normal
    /// in-flight case is reported as `PartDone { eom: true, .. }`, not this
    /// variant.
    #[error("device reported end of media")]
    DeviceEom,
    /// The requested operation cannot be satisfied, e.g. a retry requested
    /// where no caching retains the part's bytes, or `start_part` called
    /// before any device was attached.
    #[error("{0}")]
    Permanent(String),
    /// `use_device` was called with a device whose block size does not
    /// match the one already committed to mid-transfer. The previous device
    /// remains active.
    #[error("device block size {new} does not match in-flight block size {expected}")]
    BlockSizeMismatch {
        /// The block size already committed to for this transfer.
        expected: usize,
        /// The new device's block size.
        new: usize,
    },
    /// Reading previously-spilled bytes back from the disk cache failed.
    #[error("disk cache read failed: {0}")]
    CacheRead(#[source] std::io::Error),
}
