#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! Owns a linked chain of [`xfer_element::XferElement`]s and drives it
//! through the transfer lifecycle (spec §4.8): [`Transfer::new`] takes an
//! unlinked [`Vec`] of elements, [`Transfer::start`] runs the linker and
//! starts them, and the internal dispatcher thread turns the `Cancel`,
//! `Done`, and `Error` messages elements post into state transitions,
//! forwarding everything else (`Info`, `PartDone`, `Ready`) to
//! [`Transfer::inbox`] for the controller to read.
//!
//! # Design
//!
//! Two message buses, not one: `engine_bus` is what elements post to and
//! the dispatcher drains; `outbox` is what the controller reads. Keeping
//! them separate means the dispatcher can intercept lifecycle-relevant
//! messages (`Cancel`, `Done`) without the controller racing it to see them
//! first, while still forwarding every message it does not need to act on.
//!
//! [`token::CancellationToken`] is the shared cancellation signal handed to
//! elements (taper destinations, in particular) whose worker threads block
//! on their own condition and need to wake without a dedicated channel.

mod error;
mod status;
mod token;
mod transfer;

pub use error::TransferError;
pub use status::TransferStatus;
pub use token::{CancellationToken, WaitOutcome};
pub use transfer::Transfer;
