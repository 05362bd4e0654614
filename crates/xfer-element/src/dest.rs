//! Destination elements: the downstream-most node of every pipeline, always
//! with `output_mech = None`.

use std::fs::File;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::IntoRawFd;
use std::sync::Mutex;

use xfer_message::MessageSender;

use crate::element::{ElementArc, ElementCore, XferElement};
use crate::error::ElementError;
use crate::mechanism::{MechPair, Mechanism};

/// Writes the stream to a caller-supplied file descriptor, never closing it
/// (mirrors [`crate::source::FdSource`]'s dup-without-close contract).
#[derive(Debug)]
pub struct FdDest {
    core: ElementCore,
}

static FD_DEST_MECH_PAIRS: &[MechPair] = &[MechPair::new(Mechanism::WriteFd, Mechanism::None, 0, 0)];

impl FdDest {
    /// Creates a destination writing to a duplicate of `fd`.
    ///
    /// # Errors
    ///
    /// Returns [`ElementError::Resource`] if the descriptor cannot be
    /// duplicated.
    #[allow(unsafe_code)]
    pub fn new(fd: i32) -> Result<ElementArc, ElementError> {
        let dup_fd = unsafe { libc::dup(fd) };
        if dup_fd < 0 {
            return Err(ElementError::Io(std::io::Error::last_os_error()));
        }
        let core = ElementCore::new("fd-dest");
        core.set_mechs(Mechanism::WriteFd, Mechanism::None);
        core.input_fd().swap(dup_fd);
        Ok(std::sync::Arc::new(Self { core }))
    }
}

impl XferElement for FdDest {
    fn core(&self) -> &ElementCore {
        &self.core
    }

    fn mech_pairs(&self) -> &'static [MechPair] {
        FD_DEST_MECH_PAIRS
    }

    fn start(&self, _me: ElementArc, _sender: MessageSender) -> bool {
        false
    }

    fn cancel(&self, expect_eof: bool) -> bool {
        self.core.begin_cancel(expect_eof)
    }
}

/// Writes the stream to a file, truncating any existing contents.
#[derive(Debug)]
pub struct FileDest {
    core: ElementCore,
}

static FILE_DEST_MECH_PAIRS: &[MechPair] = &[MechPair::new(Mechanism::WriteFd, Mechanism::None, 0, 0)];

impl FileDest {
    /// Creates a destination writing to `path`, creating or truncating it.
    ///
    /// # Errors
    ///
    /// Returns [`ElementError::Io`] if the file cannot be created.
    #[allow(unsafe_code)]
    pub fn new(path: impl AsRef<std::path::Path>) -> Result<ElementArc, ElementError> {
        let file = File::create(path)?;
        let core = ElementCore::new("file-dest");
        core.set_mechs(Mechanism::WriteFd, Mechanism::None);
        core.input_fd().swap(file.into_raw_fd());
        Ok(std::sync::Arc::new(Self { core }))
    }
}

impl XferElement for FileDest {
    fn core(&self) -> &ElementCore {
        &self.core
    }

    fn mech_pairs(&self) -> &'static [MechPair] {
        FILE_DEST_MECH_PAIRS
    }

    fn start(&self, _me: ElementArc, _sender: MessageSender) -> bool {
        false
    }

    fn cancel(&self, expect_eof: bool) -> bool {
        self.core.begin_cancel(expect_eof)
    }
}

/// Drops every byte it receives, optionally verifying the stream matches a
/// [`crate::source::RandomSource`] sequence generated from the same seed --
/// the round-trip check used by spill and retry tests where buffering the
/// whole stream just to compare it would be wasteful.
#[derive(Debug)]
pub struct NullDest {
    core: ElementCore,
    verify: Mutex<Option<VerifyState>>,
}

#[derive(Debug)]
struct VerifyState {
    rng: rand::rngs::StdRng,
    mismatch: bool,
}

static NULL_DEST_MECH_PAIRS: &[MechPair] = &[MechPair::new(Mechanism::PushBuffer, Mechanism::None, 0, 0)];

impl NullDest {
    /// Creates a destination that discards everything it receives.
    #[must_use]
    pub fn new() -> ElementArc {
        let core = ElementCore::new("null-dest");
        core.set_mechs(Mechanism::PushBuffer, Mechanism::None);
        std::sync::Arc::new(Self {
            core,
            verify: Mutex::new(None),
        })
    }

    /// Creates a destination that discards everything it receives, while
    /// verifying the bytes match a [`crate::source::RandomSource`] sequence
    /// seeded from `seed`. Use [`NullDest::verified_ok`] after the transfer
    /// completes to check whether a mismatch was observed.
    #[must_use]
    pub fn with_verification(seed: u64) -> ElementArc {
        let core = ElementCore::new("null-dest");
        core.set_mechs(Mechanism::PushBuffer, Mechanism::None);
        std::sync::Arc::new(Self {
            core,
            verify: Mutex::new(Some(VerifyState {
                rng: rand::SeedableRng::seed_from_u64(seed),
                mismatch: false,
            })),
        })
    }

    /// `true` if no verification was requested, or if every byte received so
    /// far matched the expected sequence.
    #[must_use]
    pub fn verified_ok(&self) -> bool {
        self.verify
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .is_none_or(|state| !state.mismatch)
    }
}

impl XferElement for NullDest {
    fn core(&self) -> &ElementCore {
        &self.core
    }

    fn mech_pairs(&self) -> &'static [MechPair] {
        NULL_DEST_MECH_PAIRS
    }

    fn start(&self, _me: ElementArc, _sender: MessageSender) -> bool {
        false
    }

    fn cancel(&self, expect_eof: bool) -> bool {
        self.core.begin_cancel(expect_eof)
    }

    fn push_buffer(&self, data: Option<Vec<u8>>) {
        let Some(bytes) = data else { return };
        let mut guard = self.verify.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(state) = guard.as_mut() {
            use rand::RngCore;
            let mut expected = vec![0u8; bytes.len()];
            state.rng.fill_bytes(&mut expected);
            if expected != bytes {
                state.mismatch = true;
            }
        }
    }
}

/// Accumulates the whole stream in memory, doubling its backing buffer as
/// needed up to `max_size`; cancels itself with an error if the stream would
/// exceed that cap. Matches `xfer-src/dest-buffer.c`.
#[derive(Debug)]
pub struct BufferDest {
    core: ElementCore,
    max_size: usize,
    buf: Mutex<Vec<u8>>,
    overflowed: std::sync::atomic::AtomicBool,
}

static BUFFER_DEST_MECH_PAIRS: &[MechPair] = &[MechPair::new(Mechanism::PushBuffer, Mechanism::None, 1, 0)];

impl BufferDest {
    /// Creates a destination that will buffer up to `max_size` bytes.
    #[must_use]
    pub fn new(max_size: usize) -> ElementArc {
        let core = ElementCore::new("buffer-dest");
        core.set_mechs(Mechanism::PushBuffer, Mechanism::None);
        std::sync::Arc::new(Self {
            core,
            max_size,
            buf: Mutex::new(Vec::new()),
            overflowed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// The bytes accumulated so far.
    #[must_use]
    pub fn get(&self) -> Vec<u8> {
        self.buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    /// `true` if a `push_buffer` call was refused because it would have
    /// exceeded `max_size`.
    #[must_use]
    pub fn overflowed(&self) -> bool {
        self.overflowed.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl XferElement for BufferDest {
    fn core(&self) -> &ElementCore {
        &self.core
    }

    fn mech_pairs(&self) -> &'static [MechPair] {
        BUFFER_DEST_MECH_PAIRS
    }

    fn start(&self, _me: ElementArc, _sender: MessageSender) -> bool {
        false
    }

    fn cancel(&self, expect_eof: bool) -> bool {
        self.core.begin_cancel(expect_eof)
    }

    fn push_buffer(&self, data: Option<Vec<u8>>) {
        let Some(bytes) = data else { return };
        if bytes.is_empty() {
            return;
        }
        let mut buf = self.buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if buf.len() + bytes.len() > self.max_size {
            self.overflowed.store(true, std::sync::atomic::Ordering::Relaxed);
            self.core.begin_cancel(false);
            return;
        }
        buf.extend_from_slice(&bytes);
    }
}

/// Listens for a single incoming direct-TCP connection; the complement of
/// [`crate::source::DirectTcpListenSource`]. Matches
/// `xfer-src/dest-directtcp-listen.c`.
#[derive(Debug)]
pub struct DirectTcpListenDest {
    core: ElementCore,
    listener: Mutex<Option<TcpListener>>,
    addr: Mutex<Option<SocketAddr>>,
}

static DIRECTTCP_LISTEN_DEST_MECH_PAIRS: &[MechPair] =
    &[MechPair::new(Mechanism::DirectTcpListen, Mechanism::None, 0, 0)];

impl DirectTcpListenDest {
    /// Creates a destination that will listen on an OS-assigned loopback
    /// port.
    #[must_use]
    pub fn new() -> ElementArc {
        let core = ElementCore::new("directtcp-listen-dest");
        core.set_mechs(Mechanism::DirectTcpListen, Mechanism::None);
        std::sync::Arc::new(Self {
            core,
            listener: Mutex::new(None),
            addr: Mutex::new(None),
        })
    }

    /// The address an upstream `DirectTcpConnect`-tagged neighbor should
    /// dial, available only after [`XferElement::setup`] has run.
    #[must_use]
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        *self.addr.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl XferElement for DirectTcpListenDest {
    fn core(&self) -> &ElementCore {
        &self.core
    }

    fn mech_pairs(&self) -> &'static [MechPair] {
        DIRECTTCP_LISTEN_DEST_MECH_PAIRS
    }

    fn setup(&self) -> Result<(), ElementError> {
        let listener = TcpListener::bind(("127.0.0.1", 0))?;
        let addr = listener.local_addr()?;
        *self.listener.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(listener);
        *self.addr.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(addr);
        Ok(())
    }

    fn start(&self, _me: ElementArc, _sender: MessageSender) -> bool {
        false
    }

    fn cancel(&self, expect_eof: bool) -> bool {
        self.core.begin_cancel(expect_eof)
    }
}

/// Dials a caller-supplied TCP address; the complement of
/// [`crate::source::DirectTcpConnectSource`]. Matches
/// `xfer-src/dest-directtcp-connect.c`.
#[derive(Debug)]
pub struct DirectTcpConnectDest {
    core: ElementCore,
    addrs: Vec<SocketAddr>,
    stream: Mutex<Option<TcpStream>>,
}

static DIRECTTCP_CONNECT_DEST_MECH_PAIRS: &[MechPair] =
    &[MechPair::new(Mechanism::DirectTcpConnect, Mechanism::None, 0, 0)];

impl DirectTcpConnectDest {
    /// Creates a destination that will later dial one of `addrs`.
    ///
    /// # Panics
    ///
    /// Panics if `addrs` is empty.
    #[must_use]
    pub fn new(addrs: Vec<SocketAddr>) -> ElementArc {
        assert!(!addrs.is_empty(), "directtcp connect dest requires at least one address");
        let core = ElementCore::new("directtcp-connect-dest");
        core.set_mechs(Mechanism::DirectTcpConnect, Mechanism::None);
        std::sync::Arc::new(Self {
            core,
            addrs,
            stream: Mutex::new(None),
        })
    }

    /// The addresses this element will dial, in preference order.
    #[must_use]
    pub fn addrs(&self) -> &[SocketAddr] {
        &self.addrs
    }
}

impl XferElement for DirectTcpConnectDest {
    fn core(&self) -> &ElementCore {
        &self.core
    }

    fn mech_pairs(&self) -> &'static [MechPair] {
        DIRECTTCP_CONNECT_DEST_MECH_PAIRS
    }

    fn setup(&self) -> Result<(), ElementError> {
        let stream = self
            .addrs
            .iter()
            .find_map(|addr| TcpStream::connect(addr).ok())
            .ok_or_else(|| {
                ElementError::Resource(format!("could not connect to any of {:?}", self.addrs))
            })?;
        *self.stream.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(stream);
        Ok(())
    }

    fn start(&self, _me: ElementArc, _sender: MessageSender) -> bool {
        false
    }

    fn cancel(&self, expect_eof: bool) -> bool {
        let can_generate_eof = self.core.begin_cancel(expect_eof);
        if let Some(stream) = self.stream.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        can_generate_eof
    }
}

#[cfg(test)]
mod tests {
    use super::{BufferDest, NullDest};
    use crate::element::XferElement;

    #[test]
    fn buffer_dest_accumulates_pushed_bytes() {
        let dest = BufferDest::new(1024);
        dest.push_buffer(Some(vec![1, 2, 3]));
        dest.push_buffer(Some(vec![4, 5]));
        assert_eq!(dest.get(), vec![1, 2, 3, 4, 5]);
        assert!(!dest.overflowed());
    }

    #[test]
    fn buffer_dest_refuses_to_exceed_max_size() {
        let dest = BufferDest::new(4);
        dest.push_buffer(Some(vec![1, 2, 3]));
        dest.push_buffer(Some(vec![4, 5]));
        assert!(dest.overflowed());
        assert!(dest.get().len() <= 4);
    }

    #[test]
    fn null_dest_verification_detects_mismatch() {
        let dest = NullDest::with_verification(42);
        let dyn_dest: std::sync::Arc<dyn XferElement> = dest;
        dyn_dest.push_buffer(Some(vec![0, 0, 0, 0]));
        let null = {
            let any: &dyn std::any::Any = dyn_dest.as_ref();
            any.downcast_ref::<NullDest>().unwrap()
        };
        assert!(!null.verified_ok());
    }

    #[test]
    fn null_dest_verification_accepts_matching_sequence() {
        let dest = NullDest::with_verification(42);
        let source = crate::source::RandomSource::new(16, 42);
        let dyn_dest: std::sync::Arc<dyn XferElement> = dest;
        while let Some(chunk) = source.pull_buffer() {
            dyn_dest.push_buffer(Some(chunk));
        }
        let null = {
            let any: &dyn std::any::Any = dyn_dest.as_ref();
            any.downcast_ref::<NullDest>().unwrap()
        };
        assert!(null.verified_ok());
    }
}
