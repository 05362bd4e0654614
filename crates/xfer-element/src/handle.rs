//! Lightweight, reference-counted identity for a transfer element, used as
//! the origin of every [`xfer_message::Message`] it posts.
//!
//! A [`Message`](xfer_message::Message) holds an `Arc` to an
//! [`ElementIdentity`] rather than to the element itself, so the message bus
//! never needs to know about the full `XferElement` trait (avoiding a crate
//! cycle between `xfer-element` and `xfer-message`), and an element can be
//! dropped independently of any message it has already posted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use xfer_message::ElementHandle;

static NEXT_ELEMENT_ID: AtomicU64 = AtomicU64::new(1);

/// A small integer unique within one process, plus a human-readable kind
/// name, identifying one transfer element.
#[derive(Debug)]
pub struct ElementIdentity {
    id: u64,
    kind_name: &'static str,
}

impl ElementIdentity {
    /// Allocates a fresh identity with the next process-wide serial number.
    #[must_use]
    pub fn new(kind_name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ELEMENT_ID.fetch_add(1, Ordering::Relaxed),
            kind_name,
        })
    }
}

impl ElementHandle for ElementIdentity {
    fn id(&self) -> u64 {
        self.id
    }

    fn kind_name(&self) -> &str {
        self.kind_name
    }
}
