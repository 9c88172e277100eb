//! # Page Table (PT)
//!
//! The leaf paging level:
//!
//! - [`TableIndex`]: index type for VA bits `[21:12]`.
//! - [`PtEntry`]: a PT entry (PTE). Entries always map 4 KiB pages.
//! - [`PageTable`]: a 4 KiB-aligned array of 1024 PTEs.
//!
//! ## Invariants & Notes
//!
//! - [`PtEntry::make_4k`] forces `PS=0` and `present=1`.
//! - A copy-on-write entry is never writable; [`PtEntry::make_4k`]
//!   debug-asserts this.
//! - After modifying active mappings, the caller must perform any required
//!   TLB maintenance.

use crate::{PageEntryBits, PteFlags};
use kernel_info::memory::PT_ENTRIES;
use kernel_memory_addresses::{FrameNumber, VirtualAddress};

/// Index into the Page Table (derived from VA bits `[21:12]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TableIndex(u16);

/// A single Page Table entry (PTE).
#[doc(alias = "PTE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PtEntry(PageEntryBits);

/// The Page Table: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PtEntry; PT_ENTRIES],
}

impl TableIndex {
    /// Extract bits `[21:12]` of `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(va.table_index() as u16)
    }

    /// ### Debug assertions
    /// - Asserts `v < 1024` in debug builds.
    #[inline]
    #[must_use]
    pub const fn new(v: u16) -> Self {
        debug_assert!(v < 1024);
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Every slot of a table.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..1024).map(Self)
    }
}

impl PtEntry {
    /// Create a zero (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(PageEntryBits::new())
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.0.present()
    }

    /// Expose the underlying bitfield.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> PageEntryBits {
        self.0
    }

    /// If present, return the mapped frame and the entry's flags.
    #[inline]
    #[must_use]
    pub const fn page_4k(self) -> Option<(FrameNumber, PteFlags)> {
        if !self.is_present() {
            return None;
        }
        Some((self.0.frame(), self.0.flags()))
    }

    /// Create a 4 KiB leaf mapping `frame` with `flags | PRESENT`.
    #[inline]
    #[must_use]
    pub const fn make_4k(frame: FrameNumber, flags: PteFlags) -> Self {
        let mut bits = PageEntryBits::from_parts(frame, flags);
        bits.set_large_page(false);
        bits.set_present(true);
        debug_assert!(
            !(bits.copy_on_write() && bits.writable()),
            "COW leaves must be read-only"
        );
        Self(bits)
    }

    /// Return the raw 32-bit value (flags + address).
    #[inline]
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0.into_bits()
    }
}

impl PageTable {
    /// Create a fully zeroed Page Table (all entries non-present).
    #[inline]
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PtEntry::zero(); PT_ENTRIES],
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, i: TableIndex) -> PtEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: TableIndex, e: PtEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    pub const fn set_zero(&mut self, i: TableIndex) {
        self.set(i, PtEntry::zero());
    }
}
