//! [`Transfer`]: owns the linked element chain, the lifecycle state machine,
//! and the message bus, and runs the inbox dispatcher that turns `Cancel`,
//! `Done`, and `Error` messages from elements into state transitions (spec
//! §4.4, §4.8).

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use xfer_element::{ElementArc, Linker};
use xfer_message::{CrcAttachment, ElementHandle, ElementRef, Message, MessageBus, MessageKind};

use crate::error::TransferError;
use crate::status::TransferStatus;
use crate::token::CancellationToken;

static NEXT_TRANSFER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct TransferIdentity {
    id: u64,
}

impl ElementHandle for TransferIdentity {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind_name(&self) -> &str {
        "transfer"
    }
}

struct Lifecycle {
    status: TransferStatus,
    active_element_count: i32,
    final_crc: Option<CrcAttachment>,
    /// The transfer holds a strong reference to itself from `start()` until
    /// `Done`, so it survives even if every external handle is dropped
    /// while elements are still draining (spec §4.8 step 1).
    self_ref: Option<Arc<Transfer>>,
}

/// Owns an element chain's lifecycle: linking, setup, start, and the
/// cancel/drain orchestration driven by messages elements post to its
/// internal bus.
///
/// Constructed from an unlinked vector of elements via [`Transfer::new`],
/// then driven through its states by [`Transfer::start`] and (optionally)
/// [`Transfer::cancel`]. The controller reads [`Transfer::inbox`] for
/// `Info`/`PartDone`/`Ready`/`Error` and the single terminal `Done`.
pub struct Transfer {
    id: u64,
    identity: Arc<TransferIdentity>,
    elements: Mutex<Vec<ElementArc>>,
    lifecycle: Mutex<Lifecycle>,
    status_cond: Condvar,
    /// What elements post to; drained by the dispatcher thread.
    engine_bus: MessageBus,
    /// What the controller reads.
    outbox: MessageBus,
    cancel_requested: AtomicBool,
    cancellation: CancellationToken,
}

impl fmt::Debug for Transfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Transfer {
    /// Creates a transfer owning `elements`, in state [`TransferStatus::Init`].
    ///
    /// `elements` need not be linked yet; [`Transfer::start`] runs the
    /// linker.
    #[must_use]
    pub fn new(elements: Vec<ElementArc>) -> Arc<Self> {
        let id = NEXT_TRANSFER_ID.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self {
            id,
            identity: Arc::new(TransferIdentity { id }),
            elements: Mutex::new(elements),
            lifecycle: Mutex::new(Lifecycle {
                status: TransferStatus::Init,
                active_element_count: 0,
                final_crc: None,
                self_ref: None,
            }),
            status_cond: Condvar::new(),
            engine_bus: MessageBus::new(),
            outbox: MessageBus::new(),
            cancel_requested: AtomicBool::new(false),
            cancellation: CancellationToken::new(),
        })
    }

    /// A reference-counted handle usable as the origin of this transfer's
    /// own messages (its synthetic `Done`, and `Error`/`Done` posted when
    /// `start` fails before any element runs).
    #[must_use]
    pub fn handle(&self) -> ElementRef {
        Arc::clone(&self.identity) as ElementRef
    }

    /// The cancellation signal this transfer raises once a `Cancel` has
    /// been accepted. Shared with elements (taper destinations, in
    /// particular) that need to wake their own worker threads without a
    /// unified condvar.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// This transfer's current lifecycle state.
    #[must_use]
    pub fn status(&self) -> TransferStatus {
        self.lifecycle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .status
    }

    /// The bus the controller reads: `Info`, `PartDone`, `Ready`, `Error`,
    /// and exactly one terminal `Done`, per spec invariant 3.
    #[must_use]
    pub fn inbox(&self) -> &MessageBus {
        &self.outbox
    }

    /// Blocks until this transfer has reached [`TransferStatus::Running`]
    /// or any later state. Used by elements whose pull side may be called
    /// before `start()` has finished wiring neighbors.
    pub fn wait_running(&self) {
        self.wait_until_ordinal(TransferStatus::Running.ordinal());
    }

    /// Blocks until this transfer has reached [`TransferStatus::Cancelled`]
    /// or [`TransferStatus::Done`].
    pub fn wait_until_cancelled(&self) {
        self.wait_until_ordinal(TransferStatus::Cancelled.ordinal());
    }

    fn wait_until_ordinal(&self, target: u8) {
        let mut guard = self.lifecycle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        while guard.status.ordinal() < target {
            guard = self
                .status_cond
                .wait(guard)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// Runs the linker, sets up and starts every element, and transitions
    /// to [`TransferStatus::Running`], per spec §4.8.
    ///
    /// `offset` is reserved: no current source element supports seeking to
    /// a non-zero start offset, so it has no effect. If `size` is nonzero
    /// it is passed to the linked chain's source via `set_size`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::InvalidState`] if this transfer is not in
    /// [`TransferStatus::Init`], [`TransferError::NotEnoughElements`] if
    /// fewer than two elements were given, [`TransferError::NoMechanismChain`]
    /// if the linker cannot wire them together, or
    /// [`TransferError::Setup`] if any element's `setup()` fails (in which
    /// case an `Error` and the transfer's terminal `Done` are still posted
    /// to [`Transfer::inbox`], so an event-loop controller that does not
    /// inspect this return value still observes a consistent exit).
    pub fn start(self: &Arc<Self>, offset: u64, size: u64) -> Result<(), TransferError> {
        {
            let status = self.status();
            if status != TransferStatus::Init {
                return Err(TransferError::InvalidState {
                    expected: "Init",
                    found: status,
                });
            }
        }

        let raw_elements = std::mem::take(&mut *self.elements.lock().unwrap_or_else(std::sync::PoisonError::into_inner));
        if raw_elements.len() < 2 {
            return Err(TransferError::NotEnoughElements);
        }

        let linked = Linker::link(raw_elements).map_err(TransferError::NoMechanismChain)?;
        *self.elements.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = linked.clone();

        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            lifecycle.self_ref = Some(Arc::clone(self));
            lifecycle.status = TransferStatus::Start;
        }
        self.status_cond.notify_all();

        self.spawn_dispatcher();

        for element in &linked {
            if let Err(err) = element.setup() {
                self.engine_bus.sender().post(Message::error(self.handle(), err.to_string()));
                self.engine_bus.sender().post(Message::done(self.handle()));
                return Err(TransferError::Setup(err));
            }
        }

        let _ = offset;
        if size > 0 {
            if let Some(source) = linked.first() {
                source.set_size(size);
            }
        }

        let sender = self.engine_bus.sender();
        let mut will_emit_done = 0i32;
        for element in linked.iter().rev() {
            if element.start(Arc::clone(element), sender.clone()) {
                will_emit_done += 1;
            }
        }

        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            lifecycle.status = TransferStatus::Running;
            lifecycle.active_element_count = will_emit_done;
        }
        self.status_cond.notify_all();

        if will_emit_done == 0 {
            self.engine_bus.sender().post(Message::done(self.handle()));
        }

        Ok(())
    }

    /// Requests cancellation. Idempotent: only the first call posts a
    /// `Cancel`; actual shutdown happens in the inbox dispatcher thread,
    /// not on this call's stack.
    pub fn cancel(&self) {
        if self
            .cancel_requested
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.engine_bus.sender().post(Message::cancel(self.handle()));
        }
    }

    fn spawn_dispatcher(self: &Arc<Self>) {
        let transfer = Arc::clone(self);
        thread::spawn(move || {
            for msg in transfer.engine_bus.iter() {
                if transfer.dispatch(&msg) {
                    break;
                }
            }
        });
    }

    /// Handles one message from `engine_bus`. Returns `true` once the
    /// transfer has reached its terminal `Done` and the dispatcher should
    /// stop.
    fn dispatch(&self, msg: &Message) -> bool {
        match msg.kind() {
            MessageKind::Cancel => {
                self.handle_cancel(msg);
                false
            }
            MessageKind::Done { crc } => self.handle_done(msg.origin(), crc.clone()),
            MessageKind::Error(_) => {
                self.outbox.sender().post(msg.clone());
                self.cancel();
                false
            }
            MessageKind::Info(_) | MessageKind::PartDone(_) | MessageKind::Ready => {
                self.outbox.sender().post(msg.clone());
                false
            }
        }
    }

    fn handle_cancel(&self, msg: &Message) {
        {
            let status = self.status();
            if matches!(status, TransferStatus::Cancelling | TransferStatus::Cancelled | TransferStatus::Done) {
                return;
            }
        }

        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            lifecycle.status = TransferStatus::Cancelling;
        }
        self.status_cond.notify_all();

        let mut any_can_generate_eof = false;
        for element in self.elements.lock().unwrap_or_else(std::sync::PoisonError::into_inner).iter() {
            if element.cancel(false) {
                any_can_generate_eof = true;
            }
        }

        if !any_can_generate_eof {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                transfer_id = self.id,
                "no element can generate EOF on cancel; transfer may only end when a surrounding I/O completes"
            );
        }

        self.cancellation.cancel();

        {
            let mut lifecycle = self.lifecycle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            lifecycle.status = TransferStatus::Cancelled;
        }
        self.status_cond.notify_all();

        self.outbox.sender().post(msg.clone());
    }

    /// `origin` is either an element (decrements the active-element count)
    /// or this transfer itself (the zero-elements-will-finish case from
    /// `start`, or a setup failure) -- either way it can tip the count to
    /// zero and finish the transfer.
    fn handle_done(&self, origin: &ElementRef, crc: Option<CrcAttachment>) -> bool {
        let is_self_origin = origin.id() == self.id && origin.kind_name() == "transfer";

        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if crc.is_some() {
            lifecycle.final_crc = crc;
        }
        if !is_self_origin {
            lifecycle.active_element_count -= 1;
        }
        if !is_self_origin && lifecycle.active_element_count > 0 {
            return false;
        }

        lifecycle.status = TransferStatus::Done;
        let final_crc = lifecycle.final_crc.take();
        let self_ref = lifecycle.self_ref.take();
        drop(lifecycle);
        self.status_cond.notify_all();

        self.outbox
            .sender()
            .post(Message::new(self.handle(), MessageKind::Done { crc: final_crc }));

        drop(self_ref);
        true
    }
}
