//! [`TaperDestDirectTcp`]: a split-part destination that hands its part data
//! to the [`Device`] directly off an accepted TCP connection, never copying
//! bytes through host memory. Grounded on spec §4.11.
//!
//! Unlike [`crate::TaperDestCacher`] and [`crate::TaperDestSplitter`], this
//! destination retains nothing: it cannot retry a part, so an end-of-media
//! signal partway through a part fails the whole transfer rather than
//! producing a retryable `PartDone`.

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use xfer_element::{ElementArc, ElementCore, ElementError, XferElement};
use xfer_message::{Message, MessageSender, PartDone};

use crate::config::DirectTcpDestConfig;
use crate::device::{DirectTcpDevice, DirectTcpOutcome, PartHeader};
use crate::error::TaperError;

/// How often the accept loop re-checks `cancelled` while waiting for the
/// one client connection this element expects, per spec §5's requirement
/// that a blocking `accept` be interruptible by cancellation.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct State {
    device: Option<Arc<dyn DirectTcpDevice>>,
    connection: Option<TcpStream>,
    paused: bool,
    header: PartHeader,
    cancelled: bool,
}

static DIRECTTCP_DEST_MECH_PAIRS: &[xfer_element::MechPair] =
    &[xfer_element::MechPair::new(xfer_element::Mechanism::DirectTcpListen, xfer_element::Mechanism::None, 0, 0)];

/// A split-part destination that receives a part's bytes through a
/// DirectTCP connection instead of `push_buffer` calls, per spec §4.11.
pub struct TaperDestDirectTcp {
    core: ElementCore,
    part_size: u64,
    listener_count: usize,
    listeners: Mutex<Vec<TcpListener>>,
    listen_addrs: Mutex<Vec<SocketAddr>>,
    state: Mutex<State>,
    state_cond: Condvar,
    sender: Mutex<Option<MessageSender>>,
}

impl std::fmt::Debug for TaperDestDirectTcp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaperDestDirectTcp")
            .field("core", &self.core)
            .field("part_size", &self.part_size)
            .finish_non_exhaustive()
    }
}

impl TaperDestDirectTcp {
    /// Creates a DirectTCP destination. Listener sockets are not opened
    /// until [`XferElement::setup`] runs.
    #[must_use]
    pub fn new(config: DirectTcpDestConfig) -> ElementArc {
        let core = ElementCore::new("taper-dest-directtcp");
        core.set_mechs(xfer_element::Mechanism::DirectTcpListen, xfer_element::Mechanism::None);
        core.set_can_generate_eof(true);

        Arc::new(Self {
            core,
            part_size: config.part_size,
            listener_count: config.listener_count.max(1),
            listeners: Mutex::new(Vec::with_capacity(config.listener_count.max(1))),
            listen_addrs: Mutex::new(Vec::new()),
            state: Mutex::new(State {
                device: None,
                connection: None,
                paused: true,
                header: PartHeader::default(),
                cancelled: false,
            }),
            state_cond: Condvar::new(),
            sender: Mutex::new(None),
        })
    }

    /// The addresses a remote DirectTCP device should be given so it can
    /// dial in, available only after [`XferElement::setup`] has run.
    #[must_use]
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listen_addrs.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// Attaches the device that will pull bytes off the accepted
    /// connection.
    pub fn use_device(&self, device: Arc<dyn DirectTcpDevice>) {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).device = Some(device);
    }

    /// Starts (never retries) the next part, described by `header`.
    ///
    /// # Errors
    ///
    /// Returns [`TaperError::Permanent`] if `retry` is `true` (DirectTCP
    /// retains no bytes to retry from), or if no device has been attached
    /// yet via [`TaperDestDirectTcp::use_device`].
    pub fn start_part(&self, retry: bool, header: PartHeader) -> Result<(), TaperError> {
        if retry {
            return Err(TaperError::Permanent(
                "directtcp destination has no buffering; a failed part cannot be retried".into(),
            ));
        }
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.device.is_none() {
            return Err(TaperError::Permanent("start_part called before use_device".into()));
        }
        state.header = header;
        state.paused = false;
        drop(state);
        self.state_cond.notify_all();
        Ok(())
    }

    fn sender(&self) -> MessageSender {
        self.sender
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
            .expect("directtcp destination's sender is set before its device thread runs")
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

    fn is_cancelled(&self) -> bool {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner).cancelled
    }

    /// Accepts the single client connection this element expects, polling
    /// `cancelled` between attempts so cancellation during a long wait for
    /// a remote dialer is bounded, per spec §5.
    fn accept_one(&self) -> Option<TcpStream> {
        let listeners = std::mem::take(&mut *self.listeners.lock().unwrap_or_else(std::sync::PoisonError::into_inner));
        for listener in &listeners {
            let _ = listener.set_nonblocking(true);
        }
        loop {
            if self.is_cancelled() {
                return None;
            }
            for listener in &listeners {
                match listener.accept() {
                    Ok((stream, _)) => {
                        let _ = stream.set_nonblocking(false);
                        return Some(stream);
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(_) => continue,
                }
            }
            thread::sleep(ACCEPT_POLL_INTERVAL);
        }
    }

    fn run_device_thread(me: ElementArc) {
        let dest = downcast(&me);

        let Some(mut connection) = dest.accept_one() else {
            dest.post_done();
            return;
        };
        {
            let mut state = dest.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            state.connection = connection.try_clone().ok();
        }

        loop {
            let (header, device) = {
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
                (state.header.clone(), device)
            };

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
                dest.post_done();
                return;
            }

            let max_bytes = if dest.part_size == 0 { None } else { Some(dest.part_size) };
            let outcome = device.receive_directtcp(&mut connection, max_bytes);

            let (bytes, eof, eom, recv_failed) = match outcome {
                Ok(DirectTcpOutcome { bytes, eof, eom }) => (bytes, eof, eom, false),
                Err(_) => (0, false, false, true),
            };

            // `cancel()` shuts the connection down to unblock a receive in
            // progress; that makes `receive_directtcp` return `Err`, but it
            // is a user-requested cancellation, not a device error (spec
            // §7), so it must not be reported through `post_error`.
            let cancelled = recv_failed && dest.is_cancelled();

            let finish_result = device.finish_file();
            let successful = !cancelled && !eom && !recv_failed && finish_result.is_ok();

            dest.post_part_done(PartDone::new(
                successful,
                eom,
                eof,
                bytes,
                started_at.elapsed().as_secs_f64(),
                header.part_number,
                header.file_number,
            ));

            if cancelled {
                dest.post_done();
                return;
            }

            if eom || recv_failed || finish_result.is_err() {
                // No buffering means no retry path: EOM or any failure here
                // fails the whole transfer, per spec §4.11.
                dest.post_error("directtcp device write failed");
                let _ = connection.shutdown(std::net::Shutdown::Both);
                dest.post_done();
                return;
            }

            if dest.core.is_cancelled() && !dest.core.expect_eof() {
                dest.post_done();
                return;
            }

            if eof {
                dest.post_done();
                return;
            }
        }
    }
}

fn downcast(me: &ElementArc) -> &TaperDestDirectTcp {
    let any: &dyn std::any::Any = me.as_ref();
    any.downcast_ref::<TaperDestDirectTcp>()
        .expect("xfer-taper only ever spawns directtcp device threads for TaperDestDirectTcp")
}

impl XferElement for TaperDestDirectTcp {
    fn core(&self) -> &ElementCore {
        &self.core
    }

    fn mech_pairs(&self) -> &'static [xfer_element::MechPair] {
        DIRECTTCP_DEST_MECH_PAIRS
    }

    fn setup(&self) -> Result<(), ElementError> {
        let mut listeners = self.listeners.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut addrs = self.listen_addrs.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for _ in 0..self.listener_count {
            let listener = TcpListener::bind(("127.0.0.1", 0))?;
            addrs.push(listener.local_addr()?);
            listeners.push(listener);
        }
        Ok(())
    }

    fn start(&self, me: ElementArc, sender: MessageSender) -> bool {
        *self.sender.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(sender);
        thread::spawn(move || TaperDestDirectTcp::run_device_thread(me));
        true
    }

    fn cancel(&self, expect_eof: bool) -> bool {
        let can_generate_eof = self.core.begin_cancel(expect_eof);
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.cancelled = true;
        if let Some(connection) = &state.connection {
            let _ = connection.shutdown(std::net::Shutdown::Both);
        }
        drop(state);
        self.state_cond.notify_all();
        can_generate_eof
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceError, DeviceEom, WriteOutcome};
    use std::io::Read;
    use std::sync::atomic::{AtomicU64, Ordering};
    use xfer_queue::StreamingRequirement;

    struct EchoDevice {
        block_size: usize,
        eom_after: Option<u64>,
        total: AtomicU64,
    }

    impl Device for EchoDevice {
        fn start_file(&self, _header: &PartHeader) -> Result<(), DeviceEom> {
            Ok(())
        }

        fn write_block(&self, _data: &[u8]) -> Result<WriteOutcome, DeviceError> {
            unreachable!("directtcp devices read from the stream directly")
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

    impl DirectTcpDevice for EchoDevice {
        fn receive_directtcp(
            &self,
            stream: &mut TcpStream,
            max_bytes: Option<u64>,
        ) -> Result<DirectTcpOutcome, DeviceError> {
            let mut buf = vec![0u8; self.block_size];
            let mut bytes = 0u64;
            loop {
                if let Some(limit) = self.eom_after {
                    if self.total.load(Ordering::Relaxed) + bytes >= limit {
                        return Ok(DirectTcpOutcome { bytes, eof: false, eom: true });
                    }
                }
                let want = match max_bytes {
                    Some(limit) if limit - bytes < buf.len() as u64 => (limit - bytes) as usize,
                    _ => buf.len(),
                };
                if want == 0 {
                    return Ok(DirectTcpOutcome { bytes, eof: false, eom: false });
                }
                match stream.read(&mut buf[..want]) {
                    Ok(0) => {
                        self.total.fetch_add(bytes, Ordering::Relaxed);
                        return Ok(DirectTcpOutcome { bytes, eof: true, eom: false });
                    }
                    Ok(n) => bytes += n as u64,
                    Err(_) => return Err(DeviceError("read failed".into())),
                }
            }
        }
    }

    fn downcast_dest(element: &ElementArc) -> &TaperDestDirectTcp {
        let any: &dyn std::any::Any = element.as_ref();
        any.downcast_ref::<TaperDestDirectTcp>().unwrap()
    }

    #[test]
    fn single_part_transfer_over_accepted_connection() {
        let element = TaperDestDirectTcp::new(DirectTcpDestConfig { part_size: 0, listener_count: 1 });
        element.setup().unwrap();
        let dest = downcast_dest(&element);
        let addr = dest.listen_addrs()[0];
        dest.use_device(Arc::new(EchoDevice { block_size: 4096, eom_after: None, total: AtomicU64::new(0) }));

        let bus = xfer_message::MessageBus::new();
        element.start(Arc::clone(&element), bus.sender());

        let mut client = TcpStream::connect(addr).unwrap();
        use std::io::Write;
        let payload = vec![7u8; 64 * 1024];
        client.write_all(&payload).unwrap();
        drop(client);

        dest.start_part(false, PartHeader { part_number: 1, file_number: 1, label: String::new() }).unwrap();

        let mut part = None;
        loop {
            let msg = bus.recv().expect("message expected");
            if let xfer_message::MessageKind::PartDone(p) = msg.kind() {
                part = Some(p.clone());
            }
            if matches!(msg.kind(), xfer_message::MessageKind::Done { .. }) {
                break;
            }
        }
        let part = part.expect("a PartDone was posted");
        assert!(part.successful);
        assert!(part.eof);
        assert_eq!(part.size, payload.len() as u64);
    }

    #[test]
    fn retry_is_always_rejected() {
        let element = TaperDestDirectTcp::new(DirectTcpDestConfig { part_size: 0, listener_count: 1 });
        element.setup().unwrap();
        let dest = downcast_dest(&element);
        dest.use_device(Arc::new(EchoDevice { block_size: 4096, eom_after: None, total: AtomicU64::new(0) }));
        let err = dest
            .start_part(true, PartHeader { part_number: 1, file_number: 1, label: String::new() })
            .unwrap_err();
        assert!(matches!(err, TaperError::Permanent(_)));
    }
}
