//! Cache-inform bookkeeping: the list of on-disk byte ranges a splitter-style
//! taper destination has spilled to, so a caller that wants its data back
//! (e.g. to retry a failed part) can find it without rereading the source.

use std::collections::VecDeque;
use std::path::PathBuf;

/// One contiguous range of a spool file holding previously-written bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileSlice {
    /// The spool file containing this range.
    pub filename: PathBuf,
    /// Byte offset of the range's start within `filename`.
    pub offset: u64,
    /// Length of the range, in bytes.
    pub length: u64,
}

/// An ordered, singly-linked sequence of [`FileSlice`]s describing where a
/// destination's already-written bytes can be found on disk, oldest first.
///
/// Consuming from the front (via [`FileSliceList::consume`]) is the common
/// case, matching how a cache-inform reader walks the list in the order
/// bytes were spilled.
#[derive(Default)]
pub struct FileSliceList {
    slices: VecDeque<FileSlice>,
}

impl FileSliceList {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a new slice to the end of the list.
    pub fn push_back(&mut self, slice: FileSlice) {
        self.slices.push_back(slice);
    }

    /// `true` if the list holds no slices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// The total length, in bytes, described by every slice in the list.
    #[must_use]
    pub fn total_length(&self) -> u64 {
        self.slices.iter().map(|slice| slice.length).sum()
    }

    /// Removes `n` bytes' worth of slices from the front of the list,
    /// trimming a partially-consumed slice in place rather than dropping it
    /// whole.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds [`FileSliceList::total_length`].
    pub fn consume(&mut self, mut n: u64) {
        while n > 0 {
            let front = self
                .slices
                .front_mut()
                .expect("consume called with n exceeding total_length");
            if front.length > n {
                front.offset += n;
                front.length -= n;
                n = 0;
            } else {
                n -= front.length;
                self.slices.pop_front();
            }
        }
    }

    /// Iterates the list's slices in order.
    pub fn iter(&self) -> impl Iterator<Item = &FileSlice> {
        self.slices.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::{FileSlice, FileSliceList};
    use std::path::PathBuf;

    fn slice(offset: u64, length: u64) -> FileSlice {
        FileSlice {
            filename: PathBuf::from("spool.0"),
            offset,
            length,
        }
    }

    #[test]
    fn consume_trims_partial_front_slice() {
        let mut list = FileSliceList::new();
        list.push_back(slice(0, 100));
        list.push_back(slice(100, 50));

        list.consume(40);

        assert_eq!(list.total_length(), 110);
        let front = list.iter().next().unwrap();
        assert_eq!(front.offset, 40);
        assert_eq!(front.length, 60);
    }

    #[test]
    fn consume_drops_whole_slices_spanning_boundary() {
        let mut list = FileSliceList::new();
        list.push_back(slice(0, 100));
        list.push_back(slice(100, 50));

        list.consume(120);

        assert_eq!(list.total_length(), 30);
        let front = list.iter().next().unwrap();
        assert_eq!(front.offset, 120);
        assert_eq!(front.length, 30);
    }

    #[test]
    fn empty_list_reports_zero_length() {
        let list = FileSliceList::new();
        assert!(list.is_empty());
        assert_eq!(list.total_length(), 0);
    }
}
