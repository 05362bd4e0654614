//! Configuration structs for the three taper destination kinds.

use std::path::PathBuf;

/// How a [`crate::TaperDestCacher`] retains bytes so a failed part can be
/// retried without rereading the source.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CachingMode {
    /// No retry is possible: slabs are reclaimed as soon as the device has
    /// consumed them.
    #[default]
    None,
    /// The whole part is retained in the slab train (bounded by `max_slabs`
    /// slabs) until it succeeds.
    Memory,
    /// Slabs are spilled to a temporary file as the device consumes them,
    /// and read back from disk to retry.
    Disk,
}

/// Configuration for [`crate::TaperDestCacher`].
#[derive(Clone, Debug)]
pub struct CacherConfig {
    /// Total memory budget for the slab train, in bytes.
    pub max_memory: u64,
    /// Size of one split part, in bytes. `0` disables splitting: the whole
    /// stream is written as a single part.
    pub part_size: u64,
    /// How retry data is retained.
    pub caching_mode: CachingMode,
    /// Directory to spill cache files into. Required when `caching_mode` is
    /// [`CachingMode::Disk`].
    pub disk_cache_dirname: Option<PathBuf>,
}

/// Configuration for [`crate::TaperDestSplitter`].
#[derive(Clone, Debug)]
pub struct SplitterConfig {
    /// Total memory budget for the ring buffer, in bytes.
    pub max_memory: u64,
    /// Size of one split part, in bytes. `0` disables splitting.
    pub part_size: u64,
    /// `true` if the controller will supply `cache_inform` calls, enabling
    /// retry by re-reading previously-spilled bytes from disk.
    pub expect_cache_inform: bool,
}

/// Configuration for [`crate::TaperDestDirectTcp`].
#[derive(Clone, Copy, Debug)]
pub struct DirectTcpDestConfig {
    /// Size of one split part, in bytes. `0` disables splitting.
    pub part_size: u64,
    /// Number of TCP listeners to open, one per configured remote address.
    pub listener_count: usize,
}

impl Default for DirectTcpDestConfig {
    fn default() -> Self {
        Self {
            part_size: 0,
            listener_count: 1,
        }
    }
}
