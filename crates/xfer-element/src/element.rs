//! The `XferElement` trait every pipeline node implements, and the shared
//! bookkeeping ([`ElementCore`]) every concrete element embeds instead of
//! inheriting it, since Rust has no base-class field inheritance: the
//! original engine's `XferElement` GObject base struct becomes a plain
//! struct field plus a handful of default-implemented trait methods that
//! delegate to it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use xfer_message::{ElementRef, MessageSender};

use crate::error::ElementError;
use crate::fd::{read_fd, FdCell};
use crate::handle::ElementIdentity;
use crate::mechanism::{MechPair, Mechanism};

/// A reference-counted handle to any concrete transfer element.
pub type ElementArc = Arc<dyn XferElement>;

/// The virtual-method contract every pipeline node implements: a source, a
/// filter, a destination, or the mechanism glue the linker inserts between
/// incompatible neighbors.
///
/// See spec §4.5. Every method mirrors one virtual method of the original
/// `XferElementClass`; `core()` exposes the shared state that class used to
/// keep as instance fields on the common base struct.
pub trait XferElement: fmt::Debug + Send + Sync + std::any::Any {
    /// The shared bookkeeping (mechs, neighbors, cancellation flags) common
    /// to every element.
    fn core(&self) -> &ElementCore;

    /// The mechanism pairs this element is willing to run, terminated
    /// implicitly by the end of the slice (no `(None, None)` sentinel is
    /// needed in Rust).
    fn mech_pairs(&self) -> &'static [MechPair];

    /// Prepares file descriptors or listen addresses. Called for every
    /// element before `start` is called for any of them.
    ///
    /// # Errors
    ///
    /// Returns [`ElementError`] if the element cannot acquire what it needs
    /// to run; the caller posts `Error`+`Cancel` and skips `start`.
    fn setup(&self) -> Result<(), ElementError> {
        Ok(())
    }

    /// Tells a source how many bytes it will ultimately emit, so it can
    /// suppress trailing padding. Most elements ignore this.
    fn set_size(&self, _size: u64) {}

    /// Begins processing. `me` is a strong reference to this same element,
    /// handed back so a worker thread spawned here can clone it to reach
    /// its own neighbors later without borrowing `self` across threads.
    ///
    /// Returns `true` iff this element will eventually post `Done`.
    fn start(&self, me: ElementArc, sender: MessageSender) -> bool;

    /// Stops processing. If `expect_eof` is `true`, this element must drain
    /// upstream until EOF and propagate it downstream; otherwise it must
    /// not drain. Returns `true` iff this element can itself generate an
    /// EOF (so the transfer is guaranteed to reach `Done` eventually).
    fn cancel(&self, expect_eof: bool) -> bool;

    /// Pulls the next buffer. Required when this element's output mech is
    /// [`Mechanism::PullBuffer`]; `None` signals EOF.
    fn pull_buffer(&self) -> Option<Vec<u8>> {
        unreachable!(
            "{} does not implement pull_buffer but was linked with output mech PullBuffer",
            self.core().kind_name()
        )
    }

    /// Pushes a buffer, or `None` for EOF. Required when this element's
    /// input mech is [`Mechanism::PushBuffer`].
    fn push_buffer(&self, _data: Option<Vec<u8>>) {
        unreachable!(
            "{} does not implement push_buffer but was linked with input mech PushBuffer",
            self.core().kind_name()
        )
    }
}

/// Bookkeeping shared by every [`XferElement`] implementation: assigned
/// mechanisms, neighbor links, cancellation state, and the identity used as
/// the origin of posted messages.
pub struct ElementCore {
    identity: Arc<ElementIdentity>,
    mechs: Mutex<(Mechanism, Mechanism)>,
    upstream: Mutex<Option<Weak<dyn XferElement>>>,
    downstream: Mutex<Option<Weak<dyn XferElement>>>,
    cancelled: AtomicBool,
    expect_eof: AtomicBool,
    can_generate_eof: AtomicBool,
    size_limit: Mutex<Option<u64>>,
    input_fd: FdCell,
    output_fd: FdCell,
}

impl fmt::Debug for ElementCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElementCore")
            .field("id", &self.identity.id())
            .field("kind_name", &self.identity.kind_name())
            .field("mechs", &*self.mechs.lock().unwrap_or_else(std::sync::PoisonError::into_inner))
            .finish_non_exhaustive()
    }
}

impl ElementCore {
    /// Creates a fresh core for an element of the given kind, with no
    /// mechanisms assigned yet (the linker assigns them) and
    /// `can_generate_eof = false` (set explicitly by elements that can).
    #[must_use]
    pub fn new(kind_name: &'static str) -> Self {
        Self {
            identity: ElementIdentity::new(kind_name),
            mechs: Mutex::new((Mechanism::None, Mechanism::None)),
            upstream: Mutex::new(None),
            downstream: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            expect_eof: AtomicBool::new(false),
            can_generate_eof: AtomicBool::new(false),
            size_limit: Mutex::new(None),
            input_fd: FdCell::new(),
            output_fd: FdCell::new(),
        }
    }

    /// This element's process-wide unique id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.identity.id()
    }

    /// This element's human-readable kind name.
    #[must_use]
    pub fn kind_name(&self) -> &str {
        self.identity.kind_name()
    }

    /// A reference-counted handle usable as the origin of a posted message.
    #[must_use]
    pub fn handle(&self) -> ElementRef {
        Arc::clone(&self.identity) as ElementRef
    }

    /// The mechanisms the linker assigned this element, or `(None, None)`
    /// before linking.
    #[must_use]
    pub fn mechs(&self) -> (Mechanism, Mechanism) {
        *self.mechs.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Records the mechanisms the linker assigned this element.
    pub fn set_mechs(&self, input: Mechanism, output: Mechanism) {
        *self.mechs.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = (input, output);
    }

    /// Wires this element's neighbor links. Weak, so a linear chain of
    /// elements never forms a reference cycle between adjacent pairs; the
    /// owning `Transfer` holds the only strong references.
    pub fn set_neighbors(&self, upstream: Option<&ElementArc>, downstream: Option<&ElementArc>) {
        *self.upstream.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            upstream.map(Arc::downgrade);
        *self.downstream.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            downstream.map(Arc::downgrade);
    }

    /// The upstream neighbor, if it is still alive.
    #[must_use]
    pub fn upstream(&self) -> Option<ElementArc> {
        self.upstream
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// The downstream neighbor, if it is still alive.
    #[must_use]
    pub fn downstream(&self) -> Option<ElementArc> {
        self.downstream
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .and_then(Weak::upgrade)
    }

    /// Declares whether this element can generate an EOF on request, i.e.
    /// whether a `cancel(expect_eof=false)` call on it should be counted
    /// towards "the transfer will eventually reach `Done`".
    pub fn set_can_generate_eof(&self, value: bool) {
        self.can_generate_eof.store(value, Ordering::Relaxed);
    }

    /// `true` once [`ElementCore::begin_cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// `true` if the most recent `cancel` call passed `expect_eof = true`.
    #[must_use]
    pub fn expect_eof(&self) -> bool {
        self.expect_eof.load(Ordering::Relaxed)
    }

    /// Records a `cancel` call's bookkeeping and returns this element's
    /// `can_generate_eof`. Matches the original base class's default
    /// `cancel` implementation; concrete elements call this first, then do
    /// whatever thread-stopping and draining their own mechanism needs.
    pub fn begin_cancel(&self, expect_eof: bool) -> bool {
        self.cancelled.store(true, Ordering::Relaxed);
        self.expect_eof.store(expect_eof, Ordering::Relaxed);
        self.can_generate_eof.load(Ordering::Relaxed)
    }

    /// Records the byte limit set via `set_size`.
    pub fn set_size_limit(&self, n: u64) {
        *self.size_limit.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(n);
    }

    /// The byte limit set via `set_size`, if any.
    #[must_use]
    pub fn size_limit(&self) -> Option<u64> {
        *self.size_limit.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The file descriptor cell backing a `ReadFd`/`WriteFd` input
    /// mechanism, for elements that expose one.
    #[must_use]
    pub fn input_fd(&self) -> &FdCell {
        &self.input_fd
    }

    /// The file descriptor cell backing a `ReadFd`/`WriteFd` output
    /// mechanism, for elements that expose one.
    #[must_use]
    pub fn output_fd(&self) -> &FdCell {
        &self.output_fd
    }
}

/// Drains `upstream` by reading from `fd` until EOF, discarding the bytes.
/// Used by a `cancel(expect_eof = true)` implementation whose input
/// mechanism is `ReadFd`, so a SIGPIPE or a hung upstream writer cannot
/// result from an abrupt stop.
pub fn drain_fd(fd: i32) {
    let mut buf = [0u8; 64 * 1024];
    loop {
        match read_fd(fd, &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }
}

/// Drains `upstream` by pulling buffers until EOF, discarding them. Used by
/// a `cancel(expect_eof = true)` implementation whose input mechanism is
/// `PullBuffer`.
pub fn drain_pull(upstream: &ElementArc) {
    while upstream.pull_buffer().is_some() {}
}
