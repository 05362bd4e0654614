//! [`TaperDestSplitter`]: a lighter split-part destination than
//! [`crate::TaperDestCacher`], backed by a [`RingBuffer`] instead of a slab
//! train. It retains nothing of its own; retry only works when the
//! controller keeps the splitter informed of where earlier bytes were
//! spilled, via [`TaperDestSplitter::cache_inform`].
//!
//! Grounded on spec §4.10.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use xfer_element::{ElementArc, ElementCore, XferElement};
use xfer_message::{Message, MessageSender, PartDone};
use xfer_slab::{round_up, FileSlice, FileSliceList, RingBuffer};

use crate::config::SplitterConfig;
use crate::device::{Device, PartHeader, WriteOutcome};
use crate::error::TaperError;

struct State {
    device: Option<Arc<dyn Device>>,
    paused: bool,
    header: PartHeader,
    retry: bool,
    cancelled: bool,
}

struct PartAttempt {
    bytes: u64,
    eof: bool,
    eom: bool,
    failed: bool,
    /// Set when this attempt stopped because the ring was cancelled, not
    /// because of a device or I/O error. Per spec, cancellation is "not
    /// an error", so `run_device_thread` must not turn this into
    /// `post_error`.
    cancelled: bool,
}

/// A split-part destination that buffers a [`Device`]'s input through a
/// [`RingBuffer`], per spec §4.10.
pub struct TaperDestSplitter {
    core: ElementCore,
    config: SplitterConfig,
    part_size: u64,
    ring: RingBuffer,
    state: Mutex<State>,
    state_cond: Condvar,
    sender: Mutex<Option<MessageSender>>,
    bytes_in_part: AtomicU64,
    slices: Mutex<FileSliceList>,
}

impl std::fmt::Debug for TaperDestSplitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaperDestSplitter")
            .field("core", &self.core)
            .field("part_size", &self.part_size)
            .finish_non_exhaustive()
    }
}

static SPLITTER_MECH_PAIRS: &[xfer_element::MechPair] =
    &[xfer_element::MechPair::new(xfer_element::Mechanism::PushBuffer, xfer_element::Mechanism::None, 1, 1)];

impl TaperDestSplitter {
    /// Creates a splitter destination. `block_size` must match the device
    /// that will later be attached via [`TaperDestSplitter::use_device`].
    #[must_use]
    pub fn new(config: SplitterConfig, block_size: usize) -> ElementArc {
        let part_size = round_up(config.part_size, block_size as u64);
        let ring_capacity = if config.max_memory == 0 {
            block_size.max(1) as u64
        } else {
            config.max_memory
        };

        let core = ElementCore::new("taper-dest-splitter");
        core.set_mechs(xfer_element::Mechanism::PushBuffer, xfer_element::Mechanism::None);
        core.set_can_generate_eof(true);

        Arc::new(Self {
            core,
            part_size,
            ring: RingBuffer::new(ring_capacity as usize, block_size),
            state: Mutex::new(State {
                device: None,
                paused: true,
                header: PartHeader::default(),
                retry: false,
                cancelled: false,
            }),
            state_cond: Condvar::new(),
            sender: Mutex::new(None),
            bytes_in_part: AtomicU64::new(0),
            slices: Mutex::new(FileSliceList::new()),
            config,
        })
    }

    /// Attaches (or replaces) the device this destination writes through.
    ///
    /// # Errors
    ///
    /// Returns [`TaperError::BlockSizeMismatch`] if a device is already
    /// active and `device`'s block size differs from it; the previously
    /// attached device remains in use.
    pub fn use_device(&self, device: Arc<dyn Device>) -> Result<(), TaperError> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(existing) = &state.device {
            if existing.block_size() != device.block_size() {
                return Err(TaperError::BlockSizeMismatch {
                    expected: existing.block_size(),
                    new: device.block_size(),
                });
            }
        }
        state.device = Some(device);
        Ok(())
    }

    /// Starts (or retries) the next part, described by `header`.
    ///
    /// # Errors
    ///
    /// Returns [`TaperError::Permanent`] if no device has been attached yet,
    /// or if `retry` is requested while this splitter was not configured to
    /// expect [`TaperDestSplitter::cache_inform`] calls, since it then
    /// retains nothing of any part once its bytes leave the ring buffer.
    pub fn start_part(&self, retry: bool, header: PartHeader) -> Result<(), TaperError> {
        if retry && !self.config.expect_cache_inform {
            return Err(TaperError::Permanent(
                "splitter has no cache-inform configured; cannot retry a part".into(),
            ));
        }
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.device.is_none() {
            return Err(TaperError::Permanent("start_part called before use_device".into()));
        }
        state.header = header;
        state.retry = retry;
        state.paused = false;
        drop(state);
        self.state_cond.notify_all();
        Ok(())
    }

    /// Tells the splitter that bytes `[offset, offset + length)` of
    /// `filename` hold a copy of data already handed to
    /// [`TaperDestSplitter::push_buffer`], so a later retry can replay them
    /// without the source resending anything.
    pub fn cache_inform(&self, filename: PathBuf, offset: u64, length: u64) {
        self.slices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(FileSlice { filename, offset, length });
    }

    /// Bytes written to the device so far in the part currently in flight.
    #[must_use]
    pub fn get_part_bytes_written(&self) -> u64 {
        self.bytes_in_part.load(Ordering::Relaxed)
    }

    fn sender(&self) -> MessageSender {
        self.sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .expect("splitter's sender is set before its device thread runs")
    }

    fn post_part_done(&self, part: PartDone) {
        self.sender().post(Message::new(self.core.handle(), xfer_message::MessageKind::PartDone(part)));
    }

    fn post_done(&self) {
        self.sender().post(Message::done(self.core.handle()));
    }

    fn post_error(&self, text: impl Into<String>) {
        self.sender().post(Message::error(self.core.handle(), text));
    }

    fn read_from_ring(&self, device: &Arc<dyn Device>) -> PartAttempt {
        let block_size = device.block_size().max(1);
        let limit = if self.part_size == 0 { None } else { Some(self.part_size) };
        let mut buf = vec![0u8; block_size];
        let mut bytes = 0u64;
        let (mut eof, mut eom, mut failed) = (false, false, false);

        loop {
            if let Some(limit) = limit {
                if bytes >= limit {
                    break;
                }
            }
            let want = match limit {
                Some(limit) => block_size.min((limit - bytes) as usize),
                None => block_size,
            };
            let n = self.ring.read(&mut buf[..want]);
            if n == 0 {
                if self.ring.is_drained() {
                    eof = true;
                } else if self.ring.is_cancelled() {
                    return PartAttempt { bytes, eof, eom, failed, cancelled: true };
                } else {
                    failed = true;
                }
                break;
            }
            match device.write_block(&buf[..n]) {
                Ok(WriteOutcome::Wrote) => {
                    bytes += n as u64;
                    self.bytes_in_part.fetch_add(n as u64, Ordering::Relaxed);
                }
                Ok(WriteOutcome::Eom) => {
                    eom = true;
                    break;
                }
                Err(_) => {
                    failed = true;
                    break;
                }
            }
        }

        PartAttempt { bytes, eof, eom, failed, cancelled: false }
    }

    fn replay_from_slices(&self, device: &Arc<dyn Device>) -> PartAttempt {
        let slices: Vec<FileSlice> = self
            .slices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect();
        let block_size = device.block_size().max(1);
        let limit = if self.part_size == 0 { None } else { Some(self.part_size) };
        let mut bytes = 0u64;
        let (mut eof, mut eom, mut failed) = (false, false, false);

        'outer: for slice in &slices {
            if let Some(limit) = limit {
                if bytes >= limit {
                    break;
                }
            }
            let mut file = match File::open(&slice.filename) {
                Ok(file) => file,
                Err(_) => {
                    failed = true;
                    break;
                }
            };
            if file.seek(SeekFrom::Start(slice.offset)).is_err() {
                failed = true;
                break;
            }
            let mut remaining = slice.length;
            if let Some(limit) = limit {
                remaining = remaining.min(limit - bytes);
            }
            let mut buf = vec![0u8; block_size];
            while remaining > 0 {
                let want = (block_size as u64).min(remaining) as usize;
                let n = match file.read(&mut buf[..want]) {
                    Ok(n) => n,
                    Err(_) => {
                        failed = true;
                        break 'outer;
                    }
                };
                if n == 0 {
                    failed = true;
                    break 'outer;
                }
                match device.write_block(&buf[..n]) {
                    Ok(WriteOutcome::Wrote) => {
                        bytes += n as u64;
                        self.bytes_in_part.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Ok(WriteOutcome::Eom) => {
                        eom = true;
                        break 'outer;
                    }
                    Err(_) => {
                        failed = true;
                        break 'outer;
                    }
                }
                remaining -= n as u64;
            }
        }

        // An unsplit transfer has exactly one part; once its cached bytes
        // are exhausted without error there is nothing further to retry.
        // A split transfer's retried part says nothing about the stream's
        // own end, so `eof` stays false and the next part follows normally.
        if !eom && !failed && limit.is_none() {
            eof = true;
        }

        PartAttempt { bytes, eof, eom, failed, cancelled: false }
    }

    fn run_device_thread(me: ElementArc) {
        let dest = downcast(&me);

        loop {
            let (header, retry, device) = {
                let mut state = dest.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                loop {
                    if state.cancelled {
                        dest.post_done();
                        return;
                    }
                    if !state.paused {
                        break;
                    }
                    state = dest.state_cond.wait(state).unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                state.paused = true;
                let device = state.device.clone().expect("start_part requires use_device first");
                (state.header.clone(), state.retry, device)
            };

            dest.bytes_in_part.store(0, Ordering::Relaxed);
            let started_at = Instant::now();

            if device.start_file(&header).is_err() {
                dest.post_part_done(PartDone::new(
                    false,
                    true,
                    false,
                    0,
                    started_at.elapsed().as_secs_f64(),
                    header.part_number,
                    header.file_number,
                ));
                continue;
            }

            let attempt = if retry {
                dest.replay_from_slices(&device)
            } else {
                dest.read_from_ring(&device)
            };

            let finish_result = device.finish_file();
            let successful = !attempt.cancelled && !attempt.eom && !attempt.failed && finish_result.is_ok();

            dest.post_part_done(PartDone::new(
                successful,
                attempt.eom,
                attempt.eof,
                attempt.bytes,
                started_at.elapsed().as_secs_f64(),
                header.part_number,
                header.file_number,
            ));

            if successful {
                dest.slices
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .consume(attempt.bytes);
            }

            // Cancellation is not a device error (spec §7): an attempt
            // that stopped because the ring was cancelled must not be
            // reported through `post_error`.
            if attempt.cancelled {
                dest.post_done();
                return;
            }

            if attempt.failed || (finish_result.is_err() && !attempt.eom) {
                dest.post_error("device write failed");
                dest.ring.cancel();
                dest.post_done();
                return;
            }

            if dest.core.is_cancelled() && !dest.core.expect_eof() {
                dest.post_done();
                return;
            }

            if attempt.eof && successful {
                dest.post_done();
                return;
            }
        }
    }
}

fn downcast(me: &ElementArc) -> &TaperDestSplitter {
    let any: &dyn std::any::Any = me.as_ref();
    any.downcast_ref::<TaperDestSplitter>()
        .expect("xfer-taper only ever spawns splitter threads for TaperDestSplitter")
}

impl XferElement for TaperDestSplitter {
    fn core(&self) -> &ElementCore {
        &self.core
    }

    fn mech_pairs(&self) -> &'static [xfer_element::MechPair] {
        SPLITTER_MECH_PAIRS
    }

    fn start(&self, me: ElementArc, sender: MessageSender) -> bool {
        *self.sender.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sender);
        thread::spawn(move || TaperDestSplitter::run_device_thread(me));
        true
    }

    fn cancel(&self, expect_eof: bool) -> bool {
        let can_generate_eof = self.core.begin_cancel(expect_eof);
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.cancelled = true;
        }
        self.state_cond.notify_all();
        self.ring.cancel();
        can_generate_eof
    }

    fn push_buffer(&self, data: Option<Vec<u8>>) {
        match data {
            None => self.ring.set_eof(),
            Some(bytes) => {
                let mut remaining: &[u8] = &bytes;
                while !remaining.is_empty() {
                    let n = self.ring.write(remaining);
                    if n == 0 {
                        // Cancelled: the invariant is that push_buffer frees
                        // whatever it was given immediately rather than
                        // retrying or blocking further.
                        return;
                    }
                    remaining = &remaining[n..];
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceError, PartHeader};
    use std::sync::atomic::AtomicU64 as DeviceAtomicU64;
    use tempfile::tempdir;
    use xfer_queue::StreamingRequirement;

    struct MemDevice {
        block_size: usize,
        eom_after: Option<u64>,
        written: Mutex<Vec<u8>>,
        total_written: DeviceAtomicU64,
    }

    impl MemDevice {
        fn new(block_size: usize) -> Arc<Self> {
            Arc::new(Self {
                block_size,
                eom_after: None,
                written: Mutex::new(Vec::new()),
                total_written: DeviceAtomicU64::new(0),
            })
        }

        fn with_eom_after(block_size: usize, eom_after: u64) -> Arc<Self> {
            Arc::new(Self {
                block_size,
                eom_after: Some(eom_after),
                written: Mutex::new(Vec::new()),
                total_written: DeviceAtomicU64::new(0),
            })
        }
    }

    impl Device for MemDevice {
        fn start_file(&self, _header: &PartHeader) -> Result<(), crate::device::DeviceEom> {
            Ok(())
        }

        fn write_block(&self, data: &[u8]) -> Result<WriteOutcome, DeviceError> {
            if let Some(limit) = self.eom_after {
                if self.total_written.load(Ordering::Relaxed) >= limit {
                    return Ok(WriteOutcome::Eom);
                }
            }
            self.written.lock().unwrap().extend_from_slice(data);
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
            StreamingRequirement::None
        }
    }

    fn drain_part_done(bus: &xfer_message::MessageBus, count: usize) -> Vec<PartDone> {
        let mut parts = Vec::new();
        while parts.len() < count {
            let msg = bus.recv().expect("message expected");
            if let xfer_message::MessageKind::PartDone(part) = msg.kind() {
                parts.push(part.clone());
            }
        }
        parts
    }

    fn downcast_splitter(element: &ElementArc) -> &TaperDestSplitter {
        let any: &dyn std::any::Any = element.as_ref();
        any.downcast_ref::<TaperDestSplitter>().unwrap()
    }

    #[test]
    fn no_split_baseline_produces_one_part() {
        let config = SplitterConfig {
            max_memory: 256 * 1024,
            part_size: 0,
            expect_cache_inform: false,
        };
        let element = TaperDestSplitter::new(config, 64 * 1024);
        let bus = xfer_message::MessageBus::new();
        let splitter = downcast_splitter(&element);
        splitter.use_device(MemDevice::new(64 * 1024)).unwrap();

        element.start(Arc::clone(&element), bus.sender());
        splitter
            .start_part(false, PartHeader { part_number: 1, file_number: 1, label: String::new() })
            .unwrap();

        element.push_buffer(Some(vec![3u8; 512 * 1024]));
        element.push_buffer(None);

        let parts = drain_part_done(&bus, 1);
        assert!(parts[0].successful);
        assert!(parts[0].eof);
        assert_eq!(parts[0].size, 512 * 1024);
    }

    #[test]
    fn retry_without_cache_inform_is_rejected() {
        let config = SplitterConfig {
            max_memory: 64 * 1024,
            part_size: 0,
            expect_cache_inform: false,
        };
        let element = TaperDestSplitter::new(config, 4096);
        let splitter = downcast_splitter(&element);
        splitter.use_device(MemDevice::new(4096)).unwrap();

        let err = splitter
            .start_part(true, PartHeader { part_number: 1, file_number: 1, label: String::new() })
            .unwrap_err();
        assert!(matches!(err, TaperError::Permanent(_)));
    }

    #[test]
    fn cache_inform_retry_replays_bytes_after_simulated_eom() {
        let dir = tempdir().unwrap();
        let spool_path = dir.path().join("spool.0");
        let payload = vec![5u8; 256 * 1024];
        std::fs::write(&spool_path, &payload).unwrap();

        let config = SplitterConfig {
            max_memory: 512 * 1024,
            part_size: 256 * 1024,
            expect_cache_inform: true,
        };
        let element = TaperDestSplitter::new(config, 4096);
        let bus = xfer_message::MessageBus::new();
        let splitter = downcast_splitter(&element);
        let failing = MemDevice::with_eom_after(4096, 64 * 1024);
        splitter.use_device(failing).unwrap();
        splitter.cache_inform(spool_path.clone(), 0, payload.len() as u64);

        element.start(Arc::clone(&element), bus.sender());
        splitter
            .start_part(false, PartHeader { part_number: 1, file_number: 1, label: String::new() })
            .unwrap();
        element.push_buffer(Some(payload.clone()));

        let first = drain_part_done(&bus, 1);
        assert!(!first[0].successful);
        assert!(first[0].eom);

        let good = MemDevice::new(4096);
        splitter.use_device(good).unwrap();
        splitter
            .start_part(true, PartHeader { part_number: 1, file_number: 1, label: String::new() })
            .unwrap();

        let second = drain_part_done(&bus, 1);
        assert!(second[0].successful);
        assert_eq!(second[0].size, payload.len() as u64);
    }
}
