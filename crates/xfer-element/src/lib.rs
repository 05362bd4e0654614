#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! # Overview
//!
//! The pipeline-node layer of the transfer engine: the [`XferElement`]
//! trait every source, filter, and destination implements; the shared
//! [`ElementCore`] bookkeeping they all embed; the closed set of inter-element
//! [`Mechanism`]s; the [`Glue`] element the linker inserts between
//! mismatched neighbors; and the [`Linker`] itself.
//!
//! Concrete element kinds live in [`source`], [`filter`], and [`dest`]; each
//! is grounded on one of the original engine's element implementations
//! (`source-fd.c`, `filter-xor.c`, `dest-buffer.c`, and so on).
//!
//! # Design
//!
//! Every concrete element is `unsafe_code`-free except where it must call a
//! raw descriptor-duplicating or descriptor-reading syscall directly
//! ([`fd`]); those call sites are narrow and each carries a comment
//! explaining why no safe alternative exists.

pub mod dest;
mod element;
mod error;
mod fd;
pub mod filter;
mod glue;
mod handle;
pub mod linker;
mod mechanism;
pub mod source;

pub use element::{drain_fd, drain_pull, ElementArc, ElementCore, XferElement};
pub use error::ElementError;
pub use fd::{close_fd, read_fd, write_fd_all, FdCell, NO_FD};
pub use glue::Glue;
pub use linker::Linker;
pub use mechanism::{MechPair, Mechanism};
