//! # Page Directory (PD)
//!
//! The top paging level of 32-bit x86:
//!
//! - [`DirectoryIndex`]: index type for virtual-address bits `[31:22]`.
//! - [`PdEntry`]: a PD entry that either points to a page table (`PS=0`)
//!   or maps a 4 MiB superpage (`PS=1`).
//! - [`PdEntryKind`]: decoded view of an entry.
//! - [`PageDirectory`]: a 4 KiB-aligned array of 1024 entries.
//!
//! ## Invariants & Notes
//!
//! - [`PdEntry::make_table`] forces `PS=0`; [`PdEntry::make_superpage`]
//!   forces `PS=1` and requires a 4 MiB-aligned base.
//! - TLB maintenance is the caller’s responsibility after mutating active
//!   mappings.

use crate::{PageEntryBits, PteFlags};
use kernel_info::memory::{PD_ENTRIES, PD_SHIFT, PT_SIZE};
use kernel_memory_addresses::{FrameNumber, PhysicalAddress, VirtualAddress};

/// Index into the Page Directory (derived from VA bits `[31:22]`).
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DirectoryIndex(u16);

/// Decoded view of a present directory entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PdEntryKind {
    /// Points to a page table stored in the given frame.
    NextTable(FrameNumber, PteFlags),
    /// Maps the 4 MiB physical range starting at the given address.
    Superpage(PhysicalAddress, PteFlags),
}

/// A single Page Directory entry (PDE).
#[doc(alias = "PDE")]
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PdEntry(PageEntryBits);

/// The Page Directory: 1024 entries, 4 KiB-aligned.
#[doc(alias = "PD")]
#[repr(C, align(4096))]
pub struct PageDirectory {
    entries: [PdEntry; PD_ENTRIES],
}

impl DirectoryIndex {
    /// Extract bits `[31:22]` of `va`.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn from(va: VirtualAddress) -> Self {
        Self::new(va.directory_index() as u16)
    }

    /// Construct from a raw `u16`.
    ///
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

    /// First virtual address covered by this slot.
    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new((self.0 as u32) << PD_SHIFT)
    }

    /// All slots strictly below this one.
    pub fn below(self) -> impl Iterator<Item = Self> {
        (0..self.0).map(Self)
    }

    /// This slot and every slot after it.
    pub fn onwards(self) -> impl Iterator<Item = Self> {
        (self.0..1024).map(Self)
    }
}

impl PdEntry {
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

    /// Entry pointing to the page table in `table`.
    #[inline]
    #[must_use]
    pub const fn make_table(table: FrameNumber, flags: PteFlags) -> Self {
        let mut bits = PageEntryBits::from_parts(table, flags);
        bits.set_large_page(false);
        bits.set_present(true);
        Self(bits)
    }

    /// Entry mapping the 4 MiB superpage at `base`.
    #[inline]
    #[must_use]
    pub const fn make_superpage(base: PhysicalAddress, flags: PteFlags) -> Self {
        debug_assert!(base.as_u32().is_multiple_of(PT_SIZE));
        let mut bits = PageEntryBits::from_parts(base.frame(), flags);
        bits.set_large_page(true);
        bits.set_present(true);
        Self(bits)
    }

    /// Decode a present entry; `None` if not present.
    #[inline]
    #[must_use]
    pub const fn kind(self) -> Option<PdEntryKind> {
        if !self.0.present() {
            return None;
        }
        if self.0.large_page() {
            Some(PdEntryKind::Superpage(
                self.0.physical_address(),
                self.0.flags(),
            ))
        } else {
            Some(PdEntryKind::NextTable(self.0.frame(), self.0.flags()))
        }
    }

    /// The table frame if this entry points to one.
    #[inline]
    #[must_use]
    pub const fn next_table(self) -> Option<FrameNumber> {
        match self.kind() {
            Some(PdEntryKind::NextTable(frame, _)) => Some(frame),
            _ => None,
        }
    }
}

impl PageDirectory {
    #[inline]
    #[must_use]
    pub const fn get(&self, i: DirectoryIndex) -> PdEntry {
        self.entries[i.as_usize()]
    }

    #[inline]
    pub const fn set(&mut self, i: DirectoryIndex, e: PdEntry) {
        self.entries[i.as_usize()] = e;
    }

    #[inline]
    pub const fn set_zero(&mut self, i: DirectoryIndex) {
        self.set(i, PdEntry::zero());
    }
}
