#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! Typed, asynchronous messages carried from transfer elements to the
//! controller that drives a [`Transfer`](https://docs.rs/xfer-transfer):
//! `Info`, `Error`, `Done`, `Cancel`, `PartDone`, and `Ready`.
//!
//! # Design
//!
//! A [`Message`] is reference-counted back to its origin element through
//! [`ElementRef`] (an `Arc<dyn ElementHandle>`) rather than holding a raw
//! pointer, so a message can never dangle between `post` and delivery — the
//! element it names stays alive for at least as long as the message does.
//! Elements themselves hold no references to messages, so no reference
//! cycle can form.
//!
//! The bus itself is a thin wrapper over [`crossbeam_channel`]'s
//! multi-producer, single-consumer unbounded channel; any thread may obtain
//! a [`MessageSender`] and `post` to it, while the owning controller drains
//! the bus from its own event loop via [`MessageBus::recv`] or
//! [`MessageBus::iter`]. The bus retains its own sender internally so the
//! channel never disconnects on its own; controllers exit their loop upon
//! observing `Done`, per spec invariant 3 ("exactly one `Done` is posted per
//! transfer; it is the last message from that transfer"), not upon the
//! channel closing.

use std::fmt;
use std::sync::Arc;

use xfer_crc::Crc32c;

/// A lightweight, `Send + Sync` handle identifying the transfer element that
/// originated a message.
///
/// Concrete `XferElement` implementations provide this so that `xfer-message`
/// does not need to depend on `xfer-element` (avoiding a crate cycle, since
/// elements need to construct and post messages).
pub trait ElementHandle: fmt::Debug + Send + Sync {
    /// A small integer unique within one transfer, stable for the lifetime
    /// of the element.
    fn id(&self) -> u64;

    /// A human-readable element kind, e.g. `"fd-source"` or
    /// `"taper-cacher"`, used in log output and message `Debug` impls.
    fn kind_name(&self) -> &str;
}

/// A reference-counted handle to a message's origin element.
pub type ElementRef = Arc<dyn ElementHandle>;

/// A CRC-32C value attached to a `PartDone` or `Done` message, per the
/// transfer engine's wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrcAttachment {
    /// The polynomial used to compute `value` (always CRC-32C, `0x82F63B78`).
    pub polynomial: u32,
    /// The computed CRC value.
    pub value: u32,
    /// The number of bytes the CRC was computed over.
    pub size: u64,
}

impl From<Crc32c> for CrcAttachment {
    fn from(crc: Crc32c) -> Self {
        let (value, size) = crc.finalize();
        Self {
            polynomial: crc.polynomial(),
            value,
            size,
        }
    }
}

/// Attributes of a `PartDone` message: a split part of a taper destination
/// has finished, successfully or not.
#[derive(Clone, Debug, PartialEq)]
pub struct PartDone {
    /// `true` if the whole part was written successfully.
    pub successful: bool,
    /// `true` if the device reported end-of-media while handling this part.
    pub eom: bool,
    /// `true` if this was the last part of the transfer (source EOF).
    pub eof: bool,
    /// Bytes written to (or read from) the part.
    pub size: u64,
    /// Wall-clock time spent writing, in seconds. Never negative.
    pub duration: f64,
    /// Zero-based part number within the overall dump.
    pub part_number: u64,
    /// On-media file number used for this part, or 0 if none was used.
    pub file_number: u64,
    /// CRC-32C of the part's contents, if a CRC filter is present upstream.
    pub crc: Option<CrcAttachment>,
}

impl PartDone {
    /// Creates a `PartDone` payload, clamping a negative `duration` to zero
    /// since spec invariants forbid a negative duration from ever being
    /// observed downstream.
    #[must_use]
    pub fn new(
        successful: bool,
        eom: bool,
        eof: bool,
        size: u64,
        duration: f64,
        part_number: u64,
        file_number: u64,
    ) -> Self {
        Self {
            successful,
            eom,
            eof,
            size,
            duration: duration.max(0.0),
            part_number,
            file_number,
            crc: None,
        }
    }

    /// Attaches a CRC-32C value to this `PartDone` payload.
    #[must_use]
    pub fn with_crc(mut self, crc: impl Into<CrcAttachment>) -> Self {
        self.crc = Some(crc.into());
        self
    }
}

/// The kind and payload of a [`Message`].
#[derive(Clone, Debug, PartialEq)]
pub enum MessageKind {
    /// Informational message suitable for display to the user.
    Info(String),
    /// An error from an element. Always followed by a `Cancel` schedule.
    Error(String),
    /// The transfer is done. Posted exactly once, after every `PartDone`
    /// and `Error` generated by the transfer.
    Done {
        /// CRC-32C over the whole transfer, if a CRC filter is present.
        crc: Option<CrcAttachment>,
    },
    /// The transfer is being cancelled; data may still be draining.
    Cancel,
    /// A split part has finished.
    PartDone(PartDone),
    /// An element finished additional startup work successfully.
    Ready,
}

/// Version tag for the message wire format. Bumped only when the meaning
/// of, or removal of, an existing field requires one; additive extensions
/// never require a bump.
pub const MESSAGE_VERSION: u16 = 1;

/// A single message flowing from a transfer element to its controller.
#[derive(Clone, Debug)]
pub struct Message {
    origin: ElementRef,
    version: u16,
    kind: MessageKind,
}

impl Message {
    /// Creates a message from `origin`, tagging it with
    /// [`MESSAGE_VERSION`].
    #[must_use]
    pub fn new(origin: ElementRef, kind: MessageKind) -> Self {
        Self {
            origin,
            version: MESSAGE_VERSION,
            kind,
        }
    }

    /// The element that produced this message.
    #[must_use]
    pub fn origin(&self) -> &ElementRef {
        &self.origin
    }

    /// The message's wire format version.
    #[must_use]
    pub const fn version(&self) -> u16 {
        self.version
    }

    /// The message's kind and payload.
    #[must_use]
    pub const fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// Convenience constructor for an `Info` message.
    #[must_use]
    pub fn info(origin: ElementRef, text: impl Into<String>) -> Self {
        Self::new(origin, MessageKind::Info(text.into()))
    }

    /// Convenience constructor for an `Error` message.
    #[must_use]
    pub fn error(origin: ElementRef, text: impl Into<String>) -> Self {
        Self::new(origin, MessageKind::Error(text.into()))
    }

    /// Convenience constructor for a `Done` message with no CRC attachment.
    #[must_use]
    pub fn done(origin: ElementRef) -> Self {
        Self::new(origin, MessageKind::Done { crc: None })
    }

    /// Convenience constructor for a `Cancel` message.
    #[must_use]
    pub fn cancel(origin: ElementRef) -> Self {
        Self::new(origin, MessageKind::Cancel)
    }

    /// Convenience constructor for a `Ready` message.
    #[must_use]
    pub fn ready(origin: ElementRef) -> Self {
        Self::new(origin, MessageKind::Ready)
    }
}

/// The sending half of a [`MessageBus`]; cheaply `Clone`-able and
/// `Send + Sync`, so every worker thread spawned by an element can hold its
/// own copy.
#[derive(Clone)]
pub struct MessageSender {
    inner: crossbeam_channel::Sender<Message>,
}

impl MessageSender {
    /// Posts a message to the bus. Never blocks: the bus is unbounded, since
    /// a full bus would otherwise let a slow controller deadlock a worker
    /// thread that must not stall (see spec §5, "no element method may block
    /// the controller's message-dispatch thread").
    pub fn post(&self, message: Message) {
        #[cfg(feature = "tracing")]
        tracing::trace!(kind = ?message.kind(), origin = ?message.origin(), "posting message");
        // The receiver outlives every sender for the lifetime of a Transfer,
        // so a send error here would indicate the controller dropped the bus
        // while workers were still active -- a programming error upstream,
        // not a condition this crate can usefully recover from.
        let _ = self.inner.send(message);
    }
}

impl fmt::Debug for MessageSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSender").finish_non_exhaustive()
    }
}

/// An MPSC inbox of [`Message`]s, owned by a `Transfer` and drained by its
/// controller.
pub struct MessageBus {
    sender: crossbeam_channel::Sender<Message>,
    receiver: crossbeam_channel::Receiver<Message>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    /// Creates a new, empty message bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    /// Returns a new handle that can post messages to this bus from any
    /// thread.
    #[must_use]
    pub fn sender(&self) -> MessageSender {
        MessageSender {
            inner: self.sender.clone(),
        }
    }

    /// Blocks until a message is available.
    ///
    /// # Errors
    ///
    /// Returns an error if every [`MessageSender`] has been dropped and the
    /// bus will never receive another message.
    pub fn recv(&self) -> Result<Message, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Returns a message if one is already queued, without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the bus is empty or disconnected.
    pub fn try_recv(&self) -> Result<Message, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Blocks until a message is available or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout, or if every [`MessageSender`] has been
    /// dropped and the bus will never receive another message.
    pub fn recv_timeout(&self, timeout: std::time::Duration) -> Result<Message, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Iterates messages as they arrive, blocking between each. Since the
    /// bus retains its own sender, this iterator does not end on its own;
    /// callers should `take_while` or `break` on the message kind they are
    /// waiting for (typically `Done`).
    pub fn iter(&self) -> crossbeam_channel::Iter<'_, Message> {
        self.receiver.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::{ElementHandle, Message, MessageBus, MessageKind, PartDone};
    use std::sync::Arc;
    use std::thread;

    #[derive(Debug)]
    struct FakeElement(u64, &'static str);

    impl ElementHandle for FakeElement {
        fn id(&self) -> u64 {
            self.0
        }

        fn kind_name(&self) -> &str {
            self.1
        }
    }

    fn origin() -> Arc<dyn ElementHandle> {
        Arc::new(FakeElement(1, "test-source"))
    }

    #[test]
    fn post_and_recv_round_trips() {
        let bus = MessageBus::new();
        let sender = bus.sender();
        sender.post(Message::info(origin(), "hello"));

        let received = bus.recv().unwrap();
        match received.kind() {
            MessageKind::Info(text) => assert_eq!(text, "hello"),
            other => panic!("unexpected kind: {other:?}"),
        }
    }

    #[test]
    fn multiple_threads_can_post() {
        let bus = MessageBus::new();
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let sender = bus.sender();
            let origin: Arc<dyn ElementHandle> = Arc::new(FakeElement(i, "worker"));
            handles.push(thread::spawn(move || {
                sender.post(Message::info(origin, format!("from {i}")));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut count = 0;
        for _ in 0..8 {
            bus.recv().unwrap();
            count += 1;
        }
        assert_eq!(count, 8);
    }

    #[test]
    fn part_done_duration_never_negative() {
        let part = PartDone::new(true, false, false, 100, -5.0, 1, 1);
        assert_eq!(part.duration, 0.0);
    }

    #[test]
    fn iter_yields_messages_as_posted() {
        let bus = MessageBus::new();
        let sender = bus.sender();
        sender.post(Message::ready(origin()));
        sender.post(Message::done(origin()));

        let mut iter = bus.iter();
        assert!(matches!(iter.next().unwrap().kind(), MessageKind::Ready));
        assert!(matches!(
            iter.next().unwrap().kind(),
            MessageKind::Done { .. }
        ));
    }
}
