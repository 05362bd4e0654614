#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! Test doubles and deterministic data generators shared by the transfer
//! engine's own integration tests and any embedding application's tests.
//!
//! Not part of the engine itself -- this crate is a dev-dependency only,
//! matching how the teacher workspace keeps its own `test-support` crate
//! out of the product dependency graph.

use std::io::Read;
use std::net::TcpStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

use xfer_taper::{
    Device, DeviceError, DeviceEom, DirectTcpDevice, DirectTcpOutcome, PartHeader, StreamingRequirement,
    WriteOutcome,
};

/// Deterministically regenerates the bytes a `RandomSource::new(length, seed)`
/// would emit, for integration tests that want to assert exact content
/// rather than only a length and a CRC.
#[must_use]
pub fn expected_random_bytes(length: u64, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buf = vec![0u8; length as usize];
    rng.fill_bytes(&mut buf);
    buf
}

/// Builds the bytes a `PatternSource::new(length, pattern)` would emit.
#[must_use]
pub fn expected_pattern_bytes(length: u64, pattern: &[u8]) -> Vec<u8> {
    assert!(!pattern.is_empty(), "pattern must be non-empty");
    let mut buf = Vec::with_capacity(length as usize);
    while (buf.len() as u64) < length {
        let take = ((length as usize) - buf.len()).min(pattern.len());
        buf.extend_from_slice(&pattern[..take]);
    }
    buf
}

/// An in-memory [`Device`] double recording every block it is handed, able
/// to simulate an end-of-media signal after a configured byte count.
///
/// Shared by `xfer-taper`'s own unit tests (which define smaller
/// single-purpose doubles inline) and the workspace's end-to-end
/// integration tests, which need one device reused across several part
/// retries and therefore want richer introspection.
pub struct FakeDevice {
    block_size: usize,
    streaming_requirement: StreamingRequirement,
    eom_after: Option<u64>,
    written: Mutex<Vec<u8>>,
    total_written: AtomicU64,
    files_started: AtomicU64,
    headers: Mutex<Vec<PartHeader>>,
}

impl FakeDevice {
    /// Creates a device with no end-of-media simulation.
    #[must_use]
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            streaming_requirement: StreamingRequirement::None,
            eom_after: None,
            written: Mutex::new(Vec::new()),
            total_written: AtomicU64::new(0),
            files_started: AtomicU64::new(0),
            headers: Mutex::new(Vec::new()),
        }
    }

    /// Creates a device that reports end-of-media as soon as
    /// `eom_after` total bytes (across every part written so far) have
    /// been accepted.
    #[must_use]
    pub fn with_eom_after(block_size: usize, eom_after: u64) -> Self {
        Self {
            eom_after: Some(eom_after),
            ..Self::new(block_size)
        }
    }

    /// Sets the streaming requirement this device reports, builder-style.
    #[must_use]
    pub fn with_streaming_requirement(mut self, requirement: StreamingRequirement) -> Self {
        self.streaming_requirement = requirement;
        self
    }

    /// Every byte accepted by [`Device::write_block`] or
    /// [`DirectTcpDevice::receive_directtcp`] so far, across every part.
    #[must_use]
    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// How many times [`Device::start_file`] has been called.
    #[must_use]
    pub fn files_started(&self) -> u64 {
        self.files_started.load(Ordering::Relaxed)
    }

    /// The header passed to every [`Device::start_file`] call, in order.
    #[must_use]
    pub fn headers(&self) -> Vec<PartHeader> {
        self.headers.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    fn at_eom(&self, about_to_write: usize) -> bool {
        match self.eom_after {
            Some(limit) => self.total_written.load(Ordering::Relaxed) + about_to_write as u64 > limit,
            None => false,
        }
    }
}

impl Device for FakeDevice {
    fn start_file(&self, header: &PartHeader) -> Result<(), DeviceEom> {
        if self.at_eom(0) {
            return Err(DeviceEom);
        }
        self.files_started.fetch_add(1, Ordering::Relaxed);
        self.headers.lock().unwrap_or_else(std::sync::PoisonError::into_inner).push(header.clone());
        Ok(())
    }

    fn write_block(&self, data: &[u8]) -> Result<WriteOutcome, DeviceError> {
        if self.at_eom(data.len()) {
            return Ok(WriteOutcome::Eom);
        }
        self.written.lock().unwrap_or_else(std::sync::PoisonError::into_inner).extend_from_slice(data);
        self.total_written.fetch_add(data.len() as u64, Ordering::Relaxed);
        Ok(WriteOutcome::Wrote)
    }

    fn finish_file(&self) -> Result<(), DeviceError> {
        Ok(())
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn streaming_requirement(&self) -> StreamingRequirement {
        self.streaming_requirement
    }
}

impl DirectTcpDevice for FakeDevice {
    fn receive_directtcp(
        &self,
        stream: &mut TcpStream,
        max_bytes: Option<u64>,
    ) -> Result<DirectTcpOutcome, DeviceError> {
        let mut buf = vec![0u8; self.block_size.max(1)];
        let mut bytes = 0u64;
        loop {
            if let Some(limit) = max_bytes {
                if bytes >= limit {
                    return Ok(DirectTcpOutcome { bytes, eof: false, eom: false });
                }
            }
            if self.at_eom(buf.len()) {
                return Ok(DirectTcpOutcome { bytes, eof: false, eom: true });
            }
            let want = match max_bytes {
                Some(limit) => buf.len().min((limit - bytes) as usize),
                None => buf.len(),
            };
            match stream.read(&mut buf[..want]) {
                Ok(0) => return Ok(DirectTcpOutcome { bytes, eof: true, eom: false }),
                Ok(n) => {
                    self.written.lock().unwrap_or_else(std::sync::PoisonError::into_inner).extend_from_slice(&buf[..n]);
                    self.total_written.fetch_add(n as u64, Ordering::Relaxed);
                    bytes += n as u64;
                }
                Err(err) => return Err(DeviceError(err.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expected_random_bytes_is_deterministic_and_seed_sensitive() {
        let a = expected_random_bytes(4096, 7);
        let b = expected_random_bytes(4096, 7);
        let c = expected_random_bytes(4096, 8);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn expected_pattern_bytes_repeats_and_truncates() {
        assert_eq!(expected_pattern_bytes(7, &[1, 2, 3]), vec![1, 2, 3, 1, 2, 3, 1]);
    }

    #[test]
    fn fake_device_reports_eom_once_threshold_crossed() {
        let device = FakeDevice::with_eom_after(4, 6);
        device.start_file(&PartHeader::default()).unwrap();
        assert_eq!(device.write_block(&[1, 2, 3, 4]).unwrap(), WriteOutcome::Wrote);
        assert_eq!(device.write_block(&[5, 6, 7, 8]).unwrap(), WriteOutcome::Eom);
        assert_eq!(device.written(), vec![1, 2, 3, 4]);
    }
}
