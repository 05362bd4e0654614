#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! Split-part tape destinations: [`TaperDestCacher`] (buffers a part in RAM
//! or on disk so it can be retried without rereading the source),
//! [`TaperDestSplitter`] (a lighter ring-buffer destination that retries via
//! an externally-supplied cache-inform callback instead of its own spill
//! file), and [`TaperDestDirectTcp`] (hands a raw TCP connection to the
//! device directly, with no retry at all). All three speak
//! [`xfer_element::Mechanism::PushBuffer`] on their input side and `None` on
//! their output side, and write through the [`Device`] trait -- the seam
//! where a concrete tape drive or virtual tape library plugs in (out of
//! scope for this engine, per spec §1/§4 Non-goals).
//!
//! # Design
//!
//! Every destination owns a `state_mutex`-protected struct describing the
//! in-flight part (device handle, pause flag, header) separately from the
//! buffering primitive feeding it (a [`xfer_slab::SlabTrain`] for the
//! cacher, a [`xfer_slab::RingBuffer`] for the splitter). Lock order is
//! `state_mutex` before the buffering primitive's own lock, never the
//! reverse, per spec §5; in practice the two are rarely held together since
//! the buffering primitives manage their own internal locking.
//!
//! [`CachingMode::None`] and [`CachingMode::Memory`] retain bytes by simply
//! holding a [`xfer_slab::SlabHandle`] to the first slab of the current
//! part: as long as that handle is alive, [`xfer_slab::SlabTrain::alloc`]
//! cannot reclaim it or anything after it, so a retry just rewinds the
//! local cursor back to the held handle. [`CachingMode::Disk`] instead
//! spills every slab to a temporary file as it is produced and looks up the
//! file offset of the failed part's first byte to retry.

mod cacher;
mod config;
mod device;
mod directtcp;
mod error;
mod splitter;

pub use cacher::TaperDestCacher;
pub use config::{CacherConfig, CachingMode, DirectTcpDestConfig, SplitterConfig};
pub use device::{Device, DeviceError, DeviceEom, DirectTcpDevice, DirectTcpOutcome, PartHeader, WriteOutcome};
pub use directtcp::TaperDestDirectTcp;
pub use error::TaperError;
pub use splitter::TaperDestSplitter;

/// How eagerly a [`Device`] needs data buffered ahead of it before writing
/// begins, re-exported here since it is defined where the prebuffering
/// policy it drives (`xfer-queue`'s `run_queue`) already lives, and every
/// taper destination shares that same policy against its own buffering
/// primitive.
pub use xfer_queue::StreamingRequirement;
