//! [`TaperDestCacher`]: a split-part destination that buffers through a
//! [`SlabTrain`], retaining enough of each part to retry it without
//! rereading the source when `caching_mode` permits.
//!
//! Grounded on spec §4.9. The slab train's four conventional cursors
//! (`reader`, `device`, `mem_cache`, `disk_cacher`) are not separate fields
//! here: `reader` is simply the slab [`TaperDestCacher::push_buffer`] is
//! currently filling, `device` is a local variable inside the device
//! thread's loop, and `mem_cache`/`disk_cacher` collapse into whichever
//! retention strategy `caching_mode` selects (a held [`SlabHandle`] for
//! memory caching, a spool file plus offset map for disk caching).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use xfer_element::{ElementArc, ElementCore, XferElement};
use xfer_message::{Message, MessageSender, PartDone};
use xfer_slab::{max_slabs_for, round_part_size, slab_size_for, slabs_per_part_for, SlabHandle, SlabTrain};

use crate::config::{CacherConfig, CachingMode};
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
    /// Set when this attempt stopped because the transfer was cancelled,
    /// not because of a device error. Per spec, cancellation is "not an
    /// error", so `run_device_thread` must not turn this into `post_error`.
    cancelled: bool,
    /// The serial of the first slab this attempt consumed, used to index
    /// `serial_to_offset` for a later disk-cache retry. `None` only if the
    /// train was cancelled before any slab was read.
    first_serial: Option<u64>,
}

/// A split-part destination that buffers a [`Device`]'s input through a
/// [`SlabTrain`], per spec §4.9.
pub struct TaperDestCacher {
    core: ElementCore,
    config: CacherConfig,
    slab_size: usize,
    slabs_per_part: Option<u64>,
    train: SlabTrain,
    reader_slab: Mutex<Option<xfer_slab::Slab>>,
    state: Mutex<State>,
    state_cond: Condvar,
    sender: Mutex<Option<MessageSender>>,
    bytes_in_part: AtomicU64,
    disk_write_file: Mutex<Option<File>>,
    disk_read_file: Mutex<Option<File>>,
    serial_to_offset: Mutex<BTreeMap<u64, u64>>,
    disk_thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for TaperDestCacher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaperDestCacher")
            .field("core", &self.core)
            .field("slab_size", &self.slab_size)
            .finish_non_exhaustive()
    }
}

static CACHER_MECH_PAIRS: &[xfer_element::MechPair] =
    &[xfer_element::MechPair::new(xfer_element::Mechanism::PushBuffer, xfer_element::Mechanism::None, 1, 1)];

impl TaperDestCacher {
    /// Creates a cacher destination. `block_size` must match the device
    /// that will later be attached via [`TaperDestCacher::use_device`].
    #[must_use]
    pub fn new(config: CacherConfig, block_size: usize) -> ElementArc {
        let disk_caching = config.caching_mode == CachingMode::Disk;
        let part_size = round_part_size(
            config.part_size,
            slab_size_for(block_size as u64, config.part_size, config.max_memory, disk_caching),
        );
        let slab_size = slab_size_for(block_size as u64, part_size, config.max_memory, disk_caching) as usize;
        let slabs_per_part = if part_size == 0 {
            None
        } else {
            Some(slabs_per_part_for(part_size, slab_size as u64))
        };
        let max_slabs = max_slabs_for(
            config.caching_mode == CachingMode::Memory,
            slabs_per_part.unwrap_or(2),
            config.max_memory,
            slab_size as u64,
        );

        let core = ElementCore::new("taper-dest-cacher");
        core.set_mechs(xfer_element::Mechanism::PushBuffer, xfer_element::Mechanism::None);
        core.set_can_generate_eof(true);

        Arc::new(Self {
            core,
            config,
            slab_size,
            slabs_per_part,
            train: SlabTrain::new(slab_size, max_slabs),
            reader_slab: Mutex::new(None),
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
            disk_write_file: Mutex::new(None),
            disk_read_file: Mutex::new(None),
            serial_to_offset: Mutex::new(BTreeMap::new()),
            disk_thread: Mutex::new(None),
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
    /// or if `retry` is requested while `caching_mode` is
    /// [`CachingMode::None`], which retains nothing to retry from.
    pub fn start_part(&self, retry: bool, header: PartHeader) -> Result<(), TaperError> {
        if retry && self.config.caching_mode == CachingMode::None {
            return Err(TaperError::Permanent(
                "cacher has no caching configured; cannot retry a part".into(),
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
            .expect("cacher's sender is set before its device thread runs")
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

    fn spawn_disk_thread_if_needed(me: &ElementArc) {
        let dest = downcast(me);
        if dest.config.caching_mode != CachingMode::Disk {
            return;
        }
        let dir = dest
            .config
            .disk_cache_dirname
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let write_file = match tempfile::tempfile_in(&dir) {
            Ok(file) => file,
            Err(err) => {
                dest.post_error(format!("cannot create disk cache file in {}: {err}", dir.display()));
                dest.train.cancel();
                return;
            }
        };
        let read_file = match write_file.try_clone() {
            Ok(file) => file,
            Err(err) => {
                dest.post_error(format!("cannot duplicate disk cache handle: {err}"));
                dest.train.cancel();
                return;
            }
        };
        *dest.disk_write_file.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(write_file);
        *dest.disk_read_file.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(read_file);

        let me = Arc::clone(me);
        let handle = thread::spawn(move || downcast(&me).run_disk_cache_thread());
        *dest.disk_thread.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
    }

    fn run_disk_cache_thread(&self) {
        let mut cursor: Option<SlabHandle> = None;
        let mut offset: u64 = 0;
        loop {
            let Some(handle) = self.train.wait_next(cursor.as_ref()) else {
                return;
            };
            let slab = handle.slab();
            let bytes = slab.bytes();
            let is_final = bytes.len() < self.slab_size;
            let write_ok = {
                let mut guard = self.disk_write_file.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                guard.as_mut().is_some_and(|file| file.write_all(bytes).is_ok())
            };
            if !write_ok {
                return;
            }
            self.serial_to_offset
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(slab.serial(), offset);
            offset += bytes.len() as u64;
            cursor = Some(handle);
            self.train.notify_cursor_advanced();
            if is_final {
                return;
            }
            if self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).cancelled {
                return;
            }
        }
    }

    fn walk_and_write(&self, device: &Arc<dyn Device>, cursor: &mut Option<SlabHandle>) -> PartAttempt {
        let mut bytes = 0u64;
        let (mut eof, mut eom, mut failed) = (false, false, false);
        let mut slabs_done = 0u64;
        let mut first_serial = None;
        let block_size = device.block_size().max(1);

        loop {
            // `wait_next` returns `None` only when the train has been
            // cancelled (its own contract); that is a user-requested
            // cancellation, not a device failure, so this is not `failed`.
            let Some(handle) = self.train.wait_next(cursor.as_ref()) else {
                return PartAttempt { bytes, eof: false, eom: false, failed: false, cancelled: true, first_serial };
            };
            if first_serial.is_none() {
                first_serial = Some(handle.slab().serial());
            }
            let data = handle.slab().bytes().to_vec();
            let is_short = data.len() < self.slab_size;

            for chunk in data.chunks(block_size) {
                match device.write_block(chunk) {
                    Ok(WriteOutcome::Wrote) => {
                        bytes += chunk.len() as u64;
                        self.bytes_in_part.fetch_add(chunk.len() as u64, Ordering::Relaxed);
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

            *cursor = Some(handle);
            self.train.notify_cursor_advanced();
            slabs_done += 1;

            if eom || failed {
                break;
            }
            if is_short {
                eof = true;
                break;
            }
            if let Some(limit) = self.slabs_per_part {
                if slabs_done >= limit {
                    break;
                }
            }
        }

        PartAttempt { bytes, eof, eom, failed, cancelled: false, first_serial }
    }

    fn retry_from_disk(&self, device: &Arc<dyn Device>, part_first_serial: u64) -> Option<PartAttempt> {
        let offset = *self
            .serial_to_offset
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&part_first_serial)?;

        let mut guard = self.disk_read_file.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let file = guard.as_mut()?;
        if file.seek(SeekFrom::Start(offset)).is_err() {
            return Some(PartAttempt { bytes: 0, eof: false, eom: false, failed: true, cancelled: false, first_serial: Some(part_first_serial) });
        }

        let mut bytes = 0u64;
        let (mut eof, mut eom, mut failed) = (false, false, false);
        let mut slabs_done = 0u64;
        let block_size = device.block_size().max(1);
        let mut buf = vec![0u8; self.slab_size];

        loop {
            let n = match file.read(&mut buf) {
                Ok(n) => n,
                Err(_) => {
                    failed = true;
                    break;
                }
            };
            let at_part_boundary = self.slabs_per_part.is_some_and(|limit| slabs_done >= limit);
            if n == 0 {
                if self.slabs_per_part.is_none() {
                    eof = true;
                } else {
                    failed = true;
                }
                break;
            }
            for chunk in buf[..n].chunks(block_size) {
                match device.write_block(chunk) {
                    Ok(WriteOutcome::Wrote) => {
                        bytes += chunk.len() as u64;
                        self.bytes_in_part.fetch_add(chunk.len() as u64, Ordering::Relaxed);
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
            slabs_done += 1;
            if eom || failed {
                break;
            }
            if n < buf.len() {
                // A disk-cache retry reads back bytes already confirmed
                // spooled for this part; a short read here means the spool
                // is missing data, not a legitimate end of stream, unless
                // splitting is disabled and we are at the true end.
                if self.slabs_per_part.is_none() {
                    eof = true;
                } else {
                    failed = true;
                }
                break;
            }
            if at_part_boundary {
                break;
            }
        }

        Some(PartAttempt { bytes, eof, eom, failed, cancelled: false, first_serial: Some(part_first_serial) })
    }

    fn run_device_thread(me: ElementArc) {
        let dest = downcast(&me);
        let mut cursor: Option<SlabHandle> = None;
        let mut part_anchor: Option<SlabHandle> = None;
        let mut part_first_serial: Option<u64> = None;

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

            if !retry {
                part_anchor = cursor.clone();
                part_first_serial = None;
            }

            let attempt = if retry {
                match dest.config.caching_mode {
                    CachingMode::Memory => {
                        cursor = part_anchor.clone();
                        dest.walk_and_write(&device, &mut cursor)
                    }
                    CachingMode::Disk => {
                        let Some(first_serial) = part_first_serial else {
                            dest.post_error("retry requested with no recorded part start");
                            dest.train.cancel();
                            dest.post_done();
                            return;
                        };
                        match dest.retry_from_disk(&device, first_serial) {
                            Some(attempt) => attempt,
                            None => PartAttempt {
                                bytes: 0,
                                eof: false,
                                eom: false,
                                failed: true,
                                cancelled: false,
                                first_serial: Some(first_serial),
                            },
                        }
                    }
                    CachingMode::None => unreachable!("start_part rejects retry without caching"),
                }
            } else {
                dest.walk_and_write(&device, &mut cursor)
            };

            if !retry {
                part_first_serial = attempt.first_serial;
            }

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
                part_anchor = None;
                dest.train.notify_cursor_advanced();
            }

            // Cancellation is not a device error (spec §7): a part attempt
            // that stopped because the slab train was cancelled must not
            // be reported through `post_error`.
            if attempt.cancelled {
                dest.post_done();
                return;
            }

            if attempt.failed || (finish_result.is_err() && !attempt.eom) {
                dest.post_error("device write failed");
                dest.train.cancel();
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

fn downcast(me: &ElementArc) -> &TaperDestCacher {
    let any: &dyn std::any::Any = me.as_ref();
    any.downcast_ref::<TaperDestCacher>()
        .expect("xfer-taper only ever spawns cacher threads for TaperDestCacher")
}

impl XferElement for TaperDestCacher {
    fn core(&self) -> &ElementCore {
        &self.core
    }

    fn mech_pairs(&self) -> &'static [xfer_element::MechPair] {
        CACHER_MECH_PAIRS
    }

    fn start(&self, me: ElementArc, sender: MessageSender) -> bool {
        *self.sender.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sender);

        TaperDestCacher::spawn_disk_thread_if_needed(&me);
        thread::spawn(move || TaperDestCacher::run_device_thread(me));
        true
    }

    fn cancel(&self, expect_eof: bool) -> bool {
        let can_generate_eof = self.core.begin_cancel(expect_eof);
        {
            let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.cancelled = true;
        }
        self.state_cond.notify_all();
        self.train.cancel();
        // The disk-cache thread reads the slab train independently of the
        // device thread; join it so a cancelled disk-cache write can never
        // race the `Done` this cancel unblocks the device thread into
        // posting.
        let handle = self
            .disk_thread
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        can_generate_eof
    }

    fn push_buffer(&self, data: Option<Vec<u8>>) {
        let mut guard = self.reader_slab.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match data {
            None => {
                let slab = guard.take().unwrap_or_else(|| xfer_slab::Slab::with_capacity(self.slab_size, 0));
                self.train.push(slab);
                self.train.notify_cursor_advanced();
            }
            Some(bytes) => {
                let mut remaining: &[u8] = &bytes;
                while !remaining.is_empty() {
                    if guard.is_none() {
                        let Some(fresh) = self.train.alloc(false) else { return };
                        *guard = Some(fresh);
                    }
                    let slab = guard.as_mut().expect("just ensured Some");
                    let space = slab.spare_capacity_mut().len();
                    let take = space.min(remaining.len());
                    slab.spare_capacity_mut()[..take].copy_from_slice(&remaining[..take]);
                    slab.extend_len(take);
                    remaining = &remaining[take..];
                    if slab.spare_capacity_mut().is_empty() {
                        let full = guard.take().expect("just filled it");
                        self.train.push(full);
                        self.train.notify_cursor_advanced();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacherConfig;
    use crate::device::{DeviceError, PartHeader};
    use std::sync::atomic::{AtomicU64, AtomicUsize};
    use xfer_queue::StreamingRequirement;

    struct MemDevice {
        block_size: usize,
        eom_after: Option<u64>,
        written: Mutex<Vec<u8>>,
        total_written: AtomicU64,
        start_calls: AtomicUsize,
    }

    impl MemDevice {
        fn new(block_size: usize) -> Arc<Self> {
            Arc::new(Self {
                block_size,
                eom_after: None,
                written: Mutex::new(Vec::new()),
                total_written: AtomicU64::new(0),
                start_calls: AtomicUsize::new(0),
            })
        }

        fn with_eom_after(block_size: usize, eom_after: u64) -> Arc<Self> {
            Arc::new(Self {
                block_size,
                eom_after: Some(eom_after),
                written: Mutex::new(Vec::new()),
                total_written: AtomicU64::new(0),
                start_calls: AtomicUsize::new(0),
            })
        }
    }

    impl Device for MemDevice {
        fn start_file(&self, _header: &PartHeader) -> Result<(), crate::device::DeviceEom> {
            self.start_calls.fetch_add(1, Ordering::Relaxed);
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

    fn drain_part_done(sender_rx: &xfer_message::MessageBus, count: usize) -> Vec<PartDone> {
        let mut parts = Vec::new();
        while parts.len() < count {
            let msg = sender_rx.recv().expect("message expected");
            if let xfer_message::MessageKind::PartDone(part) = msg.kind() {
                parts.push(part.clone());
            }
        }
        parts
    }

    #[test]
    fn no_split_baseline_produces_one_part() {
        let config = CacherConfig {
            max_memory: 1024 * 1024,
            part_size: 0,
            caching_mode: CachingMode::None,
            disk_cache_dirname: None,
        };
        let element = TaperDestCacher::new(config, 64 * 1024);
        let bus = xfer_message::MessageBus::new();
        let device = MemDevice::new(64 * 1024);

        let cacher = {
            let any: &dyn std::any::Any = element.as_ref();
            any.downcast_ref::<TaperDestCacher>().unwrap()
        };
        cacher.use_device(device).unwrap();

        element.start(Arc::clone(&element), bus.sender());
        cacher.start_part(false, PartHeader { part_number: 1, file_number: 1, label: String::new() }).unwrap();

        let data = vec![7u8; 1024 * 1024];
        element.push_buffer(Some(data));
        element.push_buffer(None);

        let parts = drain_part_done(&bus, 1);
        assert_eq!(parts.len(), 1);
        assert!(parts[0].eof);
        assert!(parts[0].successful);
        assert_eq!(parts[0].size, 1024 * 1024);
    }

    #[test]
    fn memory_retry_succeeds_after_simulated_eom() {
        let part_size = 3 * 1024 * 1024u64;
        let config = CacherConfig {
            max_memory: 4 * 1024 * 1024,
            part_size,
            caching_mode: CachingMode::Memory,
            disk_cache_dirname: None,
        };
        let element = TaperDestCacher::new(config, 64 * 1024);
        let bus = xfer_message::MessageBus::new();
        let failing_device = MemDevice::with_eom_after(64 * 1024, 2 * 1024 * 1024);

        let cacher = {
            let any: &dyn std::any::Any = element.as_ref();
            any.downcast_ref::<TaperDestCacher>().unwrap()
        };
        cacher.use_device(failing_device).unwrap();
        element.start(Arc::clone(&element), bus.sender());
        cacher
            .start_part(false, PartHeader { part_number: 1, file_number: 1, label: String::new() })
            .unwrap();

        let data = vec![9u8; part_size as usize];
        element.push_buffer(Some(data));

        let first = drain_part_done(&bus, 1);
        assert!(!first[0].successful);
        assert!(first[0].eom);

        let good_device = MemDevice::new(64 * 1024);
        cacher.use_device(good_device).unwrap();
        cacher
            .start_part(true, PartHeader { part_number: 1, file_number: 1, label: String::new() })
            .unwrap();

        let second = drain_part_done(&bus, 1);
        assert!(second[0].successful);
        assert_eq!(second[0].size, part_size);
    }
}
