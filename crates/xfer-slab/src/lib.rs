#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! Buffering primitives shared by the transfer engine's taper destinations:
//!
//! - [`Slab`] / [`SlabTrain`]: fixed-capacity reusable byte buffers linked
//!   into a train, shared by up to four advancing cursors (`reader`,
//!   `device`, `mem_cache`, `disk_cacher`, by convention of callers in
//!   `xfer-taper`).
//! - [`RingBuffer`]: a lighter-weight single-producer/single-consumer ring,
//!   used where a full slab train is unnecessary.
//! - [`FileSlice`] / [`FileSliceList`]: cache-inform bookkeeping for bytes
//!   spilled to disk, so a retried part can find its data without
//!   rereading the source.
//! - [`slab_size_for`], [`slabs_per_part_for`], [`max_slabs_for`],
//!   [`round_part_size`]: the sizing policy a taper destination uses to
//!   derive its buffering geometry from block size, part size, and memory
//!   budget.
//!
//! # Design
//!
//! A slab's refcount is not a field on [`Slab`] itself; it is simply
//! `Arc::strong_count` on the [`SlabHandle`] that wraps it once linked into
//! a train. A slab becomes reclaimable exactly when the train's own
//! `oldest` link is the only remaining strong reference, which is what
//! [`SlabTrain::alloc`] blocks on.

mod file_slice;
mod policy;
mod ring;
mod slab;

pub use file_slice::{FileSlice, FileSliceList};
pub use policy::{max_slabs_for, round_part_size, round_up, slab_size_for, slabs_per_part_for};
pub use ring::RingBuffer;
pub use slab::{next_of, Slab, SlabHandle, SlabNode, SlabTrain};
