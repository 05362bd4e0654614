//! The `Device` trait: the external collaborator every taper destination
//! writes through. Real tape drives, virtual tape libraries, and changer
//! control are out of scope for this engine (spec §1/§4 Non-goals); this
//! trait is the seam where a concrete driver plugs in.

use thiserror::Error;

use xfer_queue::StreamingRequirement;

/// Identifies the on-media file a part is written to, and the label the
/// controller wants recorded in its header block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartHeader {
    /// Zero-based part number within the overall dump.
    pub part_number: u64,
    /// On-media file number this part should occupy.
    pub file_number: u64,
    /// Free-form label text written into the part's header block.
    pub label: String,
}

/// The device ran out of space on the current volume. Not fatal on its own:
/// callers report it as `PartDone { successful: false, eom: true, .. }` and
/// let the controller decide whether a fresh volume and a retry follow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceEom;

/// A device operation failed for a reason other than end-of-media.
#[derive(Debug, Error)]
#[error("device error: {0}")]
pub struct DeviceError(pub String);

/// The outcome of one [`Device::write_block`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The block was written in full.
    Wrote,
    /// The device reached end-of-media partway through this block; the part
    /// ends here, successful only up to the bytes written before this call.
    Eom,
}

/// The outcome of one [`DirectTcpDevice::receive_directtcp`] call: how much
/// of the part was pulled off the connection before it stopped, and why.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectTcpOutcome {
    /// Bytes the device read off the connection and wrote to media.
    pub bytes: u64,
    /// `true` if the connection reached EOF (the remote peer closed its
    /// write side) before `max_bytes` was reached.
    pub eof: bool,
    /// `true` if the device reported end-of-media partway through.
    pub eom: bool,
}

/// A [`Device`] capable of taking its part data directly off an open
/// DirectTCP connection instead of through buffers handed to it by the
/// engine, per spec §4.11 and GLOSSARY ("DirectTCP"). Only
/// [`crate::TaperDestDirectTcp`] requires this; the buffered destinations
/// never call it, which is why it is a separate trait rather than a
/// required `Device` method every test double would need to implement.
pub trait DirectTcpDevice: Device {
    /// Pulls bytes from `stream` into the part most recently started by
    /// [`Device::start_file`], stopping at `max_bytes` (if `Some`),
    /// connection EOF, or end-of-media, whichever comes first.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] for any failure other than end-of-media or a
    /// clean connection close.
    fn receive_directtcp(
        &self,
        stream: &mut std::net::TcpStream,
        max_bytes: Option<u64>,
    ) -> Result<DirectTcpOutcome, DeviceError>;
}

/// The external collaborator a taper destination writes a split part to.
///
/// Implementations are expected to be cheaply cloned behind an `Arc` and
/// shared between the controller (which calls [`Device::block_size`] and
/// [`Device::streaming_requirement`] while sizing buffers) and the
/// destination's own worker thread (which calls the rest).
pub trait Device: Send + Sync {
    /// Starts a new on-media file for `header`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceEom`] if the volume is already full; the caller
    /// reports a zero-length, unsuccessful part rather than treating this as
    /// fatal.
    fn start_file(&self, header: &PartHeader) -> Result<(), DeviceEom>;

    /// Writes one block. Every call is sized to [`Device::block_size`]
    /// except possibly the last of a part.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] for any failure other than end-of-media.
    fn write_block(&self, data: &[u8]) -> Result<WriteOutcome, DeviceError>;

    /// Finishes the file started by the most recent [`Device::start_file`].
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] if finishing fails. Per spec §4.9 step 4 this
    /// is a real failure even when every preceding write succeeded: a
    /// device may buffer internally and only surface a problem at close.
    fn finish_file(&self) -> Result<(), DeviceError>;

    /// The block size every write to this device must be a multiple of.
    fn block_size(&self) -> usize;

    /// How eagerly this device needs its input buffered ahead of writing to
    /// avoid a media underrun.
    fn streaming_requirement(&self) -> StreamingRequirement;
}

#[cfg(test)]
mod tests {
    use super::{Device, DeviceEom, WriteOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use xfer_queue::StreamingRequirement;

    /// A minimal in-memory device used only to exercise the trait's shape;
    /// fuller doubles live in `xfer-test-support`.
    struct RecordingDevice {
        block_size: usize,
        written: Mutex<Vec<u8>>,
        calls: AtomicUsize,
    }

    impl Device for RecordingDevice {
        fn start_file(&self, _header: &super::PartHeader) -> Result<(), DeviceEom> {
            Ok(())
        }

        fn write_block(&self, data: &[u8]) -> Result<WriteOutcome, super::DeviceError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.written.lock().unwrap().extend_from_slice(data);
            Ok(WriteOutcome::Wrote)
        }

        fn finish_file(&self) -> Result<(), super::DeviceError> {
            Ok(())
        }

        fn block_size(&self) -> usize {
            self.block_size
        }

        fn streaming_requirement(&self) -> StreamingRequirement {
            StreamingRequirement::None
        }
    }

    #[test]
    fn write_block_accumulates_bytes_in_order() {
        let device = RecordingDevice {
            block_size: 4,
            written: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        };
        device.write_block(b"abcd").unwrap();
        device.write_block(b"efgh").unwrap();
        assert_eq!(device.written.lock().unwrap().as_slice(), b"abcdefgh");
        assert_eq!(device.calls.load(Ordering::Relaxed), 2);
    }
}
