//! # Page Table Manager
//!
//! Walks and edits the two-level tables of any [`AddressSpace`], keeping
//! the allocator's reference counts in step with the installed leaves.
//!
//! ## Highlights
//!
//! - [`PageTableManager::walk`] finds (and optionally creates) the leaf
//!   slot for a virtual address.
//! - [`PageTableManager::insert`] installs a mapping, replacing whatever
//!   was there before.
//! - [`PageTableManager::lookup`] / [`PageTableManager::remove`] query and
//!   drop single mappings.
//! - [`PageTableManager::map_segment`] maps a run of consecutive frames.
//!
//! ## Design
//!
//! - The manager borrows the allocator, the physical mapper and the MMU
//!   for the duration of one operation; it owns nothing.
//! - `unsafe` is confined to borrowing a frame as a typed table through
//!   the [`PhysMapper`]; every such borrow ends before the next one starts.
//! - TLB entries are invalidated only when the edited space is the active
//!   one. Inactive spaces are flushed wholesale when they are loaded.

use crate::page_table::{DirectoryIndex, PdEntry, PdEntryKind, PtEntry, TableIndex};
use crate::{
    AddressSpace, FrameAlloc, Mmu, PageEntryBits, PhysMapper, PteFlags, VmError, directory_mut,
    frame_bytes_mut, table_mut,
};
use kernel_info::memory::{KERNBASE, PAGE_SIZE};
use kernel_memory_addresses::{FrameNumber, VirtualAddress};
use log::{debug, trace, warn};

/// Location of the entry that translates one virtual page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LeafSlot {
    /// An entry in a second-level page table.
    Table {
        /// Frame holding the page table.
        table: FrameNumber,
        /// Slot within the table.
        index: TableIndex,
    },
    /// A superpage entry in the directory itself (reserved region only).
    Superpage {
        /// Frame holding the page directory.
        directory: FrameNumber,
        /// Slot within the directory.
        index: DirectoryIndex,
    },
}

/// Borrowing façade over the frame allocator, the physical mapper and the
/// MMU.
pub struct PageTableManager<'a, A: FrameAlloc, M: PhysMapper, H: Mmu> {
    pub(crate) frames: &'a mut A,
    pub(crate) mapper: &'a M,
    pub(crate) mmu: &'a mut H,
}

impl<'a, A: FrameAlloc, M: PhysMapper, H: Mmu> PageTableManager<'a, A, M, H> {
    pub const fn new(frames: &'a mut A, mapper: &'a M, mmu: &'a mut H) -> Self {
        Self {
            frames,
            mapper,
            mmu,
        }
    }

    #[must_use]
    pub const fn frames(&self) -> &A {
        &*self.frames
    }

    pub const fn frames_mut(&mut self) -> &mut A {
        &mut *self.frames
    }

    #[must_use]
    pub const fn mmu(&self) -> &H {
        &*self.mmu
    }

    pub const fn mmu_mut(&mut self) -> &mut H {
        &mut *self.mmu
    }

    /// Whether `space` is the currently loaded translation.
    #[must_use]
    pub fn is_active(&self, space: AddressSpace) -> bool {
        self.mmu.active_address_space() == Some(space.root_phys())
    }

    /// Find the leaf slot for `va`.
    ///
    /// - In the reserved region the directory slot itself is returned; it
    ///   must hold a present superpage and is never created.
    /// - Otherwise, if the covering page table is absent, `None` is returned
    ///   unless `create` is set, in which case a zeroed table is allocated,
    ///   referenced once and installed with present | writable | user.
    ///
    /// # Errors
    /// - [`VmError::OutOfMemory`] if a table was needed and none could be
    ///   allocated. Nothing is changed in that case.
    pub fn walk(
        &mut self,
        space: AddressSpace,
        va: VirtualAddress,
        create: bool,
    ) -> Result<Option<LeafSlot>, VmError> {
        if create {
            self.ensure_slot(space, va).map(Some)
        } else {
            Ok(self.find_slot(space, va))
        }
    }

    pub(crate) fn find_slot(&self, space: AddressSpace, va: VirtualAddress) -> Option<LeafSlot> {
        let pd = DirectoryIndex::from(va);
        // SAFETY: `space.root()` holds a page directory.
        let entry = unsafe { directory_mut(self.mapper, space.root()) }.get(pd);

        if va.as_u32() >= KERNBASE {
            assert!(
                matches!(entry.kind(), Some(PdEntryKind::Superpage(..))),
                "reserved region at {va} is not mapped by a superpage"
            );
            return Some(LeafSlot::Superpage {
                directory: space.root(),
                index: pd,
            });
        }

        match entry.kind()? {
            PdEntryKind::NextTable(table, _) => Some(LeafSlot::Table {
                table,
                index: TableIndex::from(va),
            }),
            PdEntryKind::Superpage(..) => panic!("superpage below the reserved region at {va}"),
        }
    }

    fn ensure_slot(&mut self, space: AddressSpace, va: VirtualAddress) -> Result<LeafSlot, VmError> {
        if let Some(slot) = self.find_slot(space, va) {
            return Ok(slot);
        }

        let table = self.frames.alloc_frame().ok_or(VmError::OutOfMemory)?;
        self.zero_frame(table);
        self.frames.incref(table);

        let pd = DirectoryIndex::from(va);
        // SAFETY: `space.root()` holds a page directory.
        unsafe { directory_mut(self.mapper, space.root()) }
            .set(pd, PdEntry::make_table(table, PteFlags::TABLE));
        debug!("page table {table} installed for {} in {space}", pd.base());

        Ok(LeafSlot::Table {
            table,
            index: TableIndex::from(va),
        })
    }

    /// Raw contents of a leaf slot.
    #[must_use]
    pub fn read_slot(&self, slot: LeafSlot) -> PageEntryBits {
        match slot {
            // SAFETY: slots only ever name table and directory frames.
            LeafSlot::Table { table, index } => unsafe { table_mut(self.mapper, table) }.get(index).bits(),
            LeafSlot::Superpage { directory, index } => {
                unsafe { directory_mut(self.mapper, directory) }.get(index).bits()
            }
        }
    }

    fn write_leaf(&self, table: FrameNumber, index: TableIndex, entry: PtEntry) {
        // SAFETY: `table` was obtained from a present directory entry.
        unsafe { table_mut(self.mapper, table) }.set(index, entry);
    }

    /// Map `frame` at `va` with `perm | PRESENT`, replacing any existing
    /// mapping.
    ///
    /// Re-inserting the frame already mapped at `va` only updates the
    /// permission bits; its reference count is unchanged.
    ///
    /// # Errors
    /// - [`VmError::ReservedRegion`] for addresses at or above `KERNBASE`.
    /// - [`VmError::OutOfMemory`] if a page table was needed and could not
    ///   be allocated. No mapping is installed in that case.
    pub fn insert(
        &mut self,
        space: AddressSpace,
        frame: FrameNumber,
        va: VirtualAddress,
        perm: PteFlags,
    ) -> Result<(), VmError> {
        if va.as_u32() >= KERNBASE {
            return Err(VmError::ReservedRegion(va));
        }

        // Pin the frame so removing an identical mapping cannot free it.
        self.frames.incref(frame);
        self.remove(space, va);
        self.frames.release(frame);

        let LeafSlot::Table { table, index } = self.ensure_slot(space, va)? else {
            unreachable!("user addresses are never mapped by superpages");
        };
        self.write_leaf(table, index, PtEntry::make_4k(frame, perm));
        self.frames.incref(frame);

        trace!("{space}: {} -> {frame} {perm:?}", va.page_base());
        Ok(())
    }

    /// The frame mapped at `va` and the slot holding the mapping.
    #[must_use]
    pub fn lookup(&self, space: AddressSpace, va: VirtualAddress) -> Option<(FrameNumber, LeafSlot)> {
        let slot = self.find_slot(space, va)?;
        let bits = self.read_slot(slot);
        if !bits.present() {
            return None;
        }
        let frame = match slot {
            LeafSlot::Table { .. } => bits.frame(),
            #[allow(clippy::cast_possible_truncation)]
            LeafSlot::Superpage { .. } => bits.frame() + va.table_index() as u32,
        };
        Some((frame, slot))
    }

    /// Drop the mapping at `va`, if any.
    ///
    /// The target frame loses one reference (and is freed at zero), the
    /// leaf is cleared and, if `space` is active, the TLB entry is
    /// invalidated. Superpages in the reserved region are left alone.
    pub fn remove(&mut self, space: AddressSpace, va: VirtualAddress) {
        let Some((frame, slot)) = self.lookup(space, va) else {
            return;
        };
        let LeafSlot::Table { table, index } = slot else {
            warn!("refusing to unmap reserved region at {va}");
            return;
        };

        self.frames.decref(frame);
        self.write_leaf(table, index, PtEntry::zero());
        if self.is_active(space) {
            self.mmu.invalidate(va);
        }
        trace!("{space}: {} unmapped", va.page_base());
    }

    /// Map `⌈len / PAGE_SIZE⌉` consecutive frames starting at `first` to
    /// consecutive pages starting at `va`.
    ///
    /// # Errors
    /// Stops at, and returns, the first failing [`insert`](Self::insert).
    /// Pages mapped before the failure stay mapped.
    pub fn map_segment(
        &mut self,
        space: AddressSpace,
        first: FrameNumber,
        va: VirtualAddress,
        len: u32,
        perm: PteFlags,
    ) -> Result<(), VmError> {
        let pages = len.div_ceil(PAGE_SIZE);
        for i in 0..pages {
            self.insert(space, first + i, va + i * PAGE_SIZE, perm)?;
        }
        Ok(())
    }

    /// Fill `frame` with zeros.
    pub fn zero_frame(&self, frame: FrameNumber) {
        // SAFETY: any frame may be viewed as bytes.
        unsafe { frame_bytes_mut(self.mapper, frame) }.fill(0);
    }

    /// Copy the full contents of `src` into `dst`.
    pub fn copy_frame(&self, src: FrameNumber, dst: FrameNumber) {
        if src == dst {
            return;
        }
        // SAFETY: distinct frames never overlap.
        let (s, d) = unsafe {
            (
                frame_bytes_mut(self.mapper, src),
                frame_bytes_mut(self.mapper, dst),
            )
        };
        d.copy_from_slice(s);
    }

    /// Copy bytes out of `frame`, starting `offset` bytes into it.
    ///
    /// # Panics
    /// If the range runs past the end of the frame.
    pub fn read_frame(&self, frame: FrameNumber, offset: usize, dst: &mut [u8]) {
        // SAFETY: any frame may be viewed as bytes.
        let bytes = unsafe { frame_bytes_mut(self.mapper, frame) };
        dst.copy_from_slice(&bytes[offset..offset + dst.len()]);
    }

    /// Copy bytes into `frame`, starting `offset` bytes into it.
    ///
    /// # Panics
    /// If the range runs past the end of the frame.
    pub fn write_frame(&self, frame: FrameNumber, offset: usize, src: &[u8]) {
        // SAFETY: any frame may be viewed as bytes.
        let bytes = unsafe { frame_bytes_mut(self.mapper, frame) };
        bytes[offset..offset + src.len()].copy_from_slice(src);
    }
}
