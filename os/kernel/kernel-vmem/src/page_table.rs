//! # Memory Page Table

pub mod pd;
pub mod pt;

pub use pd::{DirectoryIndex, PageDirectory, PdEntry, PdEntryKind};
pub use pt::{PageTable, PtEntry, TableIndex};

use kernel_memory_addresses::VirtualAddress;

#[inline]
#[must_use]
pub const fn split_indices(va: VirtualAddress) -> (DirectoryIndex, TableIndex) {
    (DirectoryIndex::from(va), TableIndex::from(va))
}
