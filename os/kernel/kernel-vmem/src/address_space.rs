//! # Address Space (32-bit x86, directory-rooted)
//!
//! An [`AddressSpace`] names the frame holding a page directory. It is a
//! plain `Copy` handle; all edits go through a
//! [`PageTableManager`](crate::PageTableManager).
//!
//! ## Lifecycle
//!
//! - [`AddressSpace::bootstrap`] builds the boot directory: superpages
//!   covering `[KERNBASE, 4 GiB)` onto physical memory from address zero.
//! - [`AddressSpace::create`] makes a fresh space whose user half is empty
//!   and whose reserved region shares the boot directory's entries.
//! - [`AddressSpace::destroy`] unmaps every user page, frees every page
//!   table and finally the directory.
//!
//! ## Reference counts
//!
//! The directory frame carries a single reference owned by the space.
//! Each page table carries one reference owned by its directory entry.

use crate::page_table::{DirectoryIndex, PdEntry, PdEntryKind, TableIndex};
use crate::{FrameAlloc, Mmu, PageTableManager, PhysMapper, PteFlags, VmError, directory_mut};
use core::fmt;
use kernel_info::memory::{KERNBASE, PD_SHIFT};
use kernel_memory_addresses::{FrameNumber, PhysicalAddress, VirtualAddress};
use log::{debug, info};

/// Handle to a single, concrete address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct AddressSpace {
    root: FrameNumber,
}

impl AddressSpace {
    /// Wrap a frame already holding a page directory.
    #[inline]
    #[must_use]
    pub const fn from_root(root: FrameNumber) -> Self {
        Self { root }
    }

    /// Frame of the page directory.
    #[inline]
    #[must_use]
    pub const fn root(self) -> FrameNumber {
        self.root
    }

    /// Physical address of the page directory, as loaded into CR3.
    #[inline]
    #[must_use]
    pub const fn root_phys(self) -> PhysicalAddress {
        self.root.base()
    }

    /// First directory slot of the reserved region.
    const fn kernel_slots() -> DirectoryIndex {
        DirectoryIndex::from(VirtualAddress::new(KERNBASE))
    }

    /// Build the boot page directory.
    ///
    /// # Errors
    /// - [`VmError::OutOfMemory`] if no frame is left for the directory.
    pub fn bootstrap<A: FrameAlloc, M: PhysMapper, H: Mmu>(
        vm: &mut PageTableManager<'_, A, M, H>,
    ) -> Result<Self, VmError> {
        let space = Self::allocate_root(vm)?;
        // SAFETY: freshly allocated and zeroed directory frame.
        let dir = unsafe { directory_mut(vm.mapper, space.root) };
        let first = Self::kernel_slots();
        for pd in first.onwards() {
            let phys = PhysicalAddress::new(((pd.as_usize() - first.as_usize()) as u32) << PD_SHIFT);
            dir.set(pd, PdEntry::make_superpage(phys, PteFlags::WRITABLE | PteFlags::GLOBAL));
        }
        info!("boot directory {space} maps {} at physical 0", VirtualAddress::new(KERNBASE));
        Ok(space)
    }

    /// Create a fresh address space sharing `kernel`'s reserved region.
    ///
    /// # Errors
    /// - [`VmError::OutOfMemory`] if no frame is left for the directory.
    pub fn create<A: FrameAlloc, M: PhysMapper, H: Mmu>(
        vm: &mut PageTableManager<'_, A, M, H>,
        kernel: Self,
    ) -> Result<Self, VmError> {
        let space = Self::allocate_root(vm)?;
        let first = Self::kernel_slots();
        for pd in first.onwards() {
            // SAFETY: distinct directory frames; each borrow is dropped at once.
            let entry = unsafe { directory_mut(vm.mapper, kernel.root) }.get(pd);
            unsafe { directory_mut(vm.mapper, space.root) }.set(pd, entry);
        }
        debug!("address space {space} created");
        Ok(space)
    }

    fn allocate_root<A: FrameAlloc, M: PhysMapper, H: Mmu>(
        vm: &mut PageTableManager<'_, A, M, H>,
    ) -> Result<Self, VmError> {
        let root = vm.frames.alloc_frame().ok_or(VmError::OutOfMemory)?;
        vm.zero_frame(root);
        vm.frames.incref(root);
        Ok(Self { root })
    }

    /// Tear down this address space.
    ///
    /// Every present user leaf is removed (its frame loses a reference),
    /// every page table is freed and finally the directory itself. If the
    /// space is active, `kernel` is loaded first.
    pub fn destroy<A: FrameAlloc, M: PhysMapper, H: Mmu>(
        self,
        vm: &mut PageTableManager<'_, A, M, H>,
        kernel: Self,
    ) {
        if vm.is_active(self) {
            kernel.activate(vm.mmu);
        }

        for pd in Self::kernel_slots().below() {
            // SAFETY: `self.root` holds a page directory.
            let entry = unsafe { directory_mut(vm.mapper, self.root) }.get(pd);
            let Some(PdEntryKind::NextTable(table, _)) = entry.kind() else {
                continue;
            };
            for pt in TableIndex::all() {
                let va = VirtualAddress::from_indices(pd.as_usize(), pt.as_usize());
                vm.remove(self, va);
            }
            // SAFETY: as above.
            unsafe { directory_mut(vm.mapper, self.root) }.set_zero(pd);
            vm.frames.decref(table);
        }

        let freed = vm.frames.decref(self.root);
        debug_assert!(freed, "page directory {self} still referenced");
        debug!("address space {self} destroyed");
    }

    /// Load this space into the MMU.
    pub fn activate<H: Mmu>(self, mmu: &mut H) {
        mmu.load_address_space(self.root_phys());
    }
}

impl fmt::Display for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AS[{}]", self.root_phys())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::Rig;

    #[test]
    fn bootstrap_maps_reserved_region_with_superpages() {
        let mut rig = Rig::new(16);
        let mut vm = rig.vm();
        let kernel = AddressSpace::bootstrap(&mut vm).unwrap();

        let dir = unsafe { directory_mut(&rig.phys, kernel.root()) };
        assert!(!dir.get(DirectoryIndex::new(0x3BF)).is_present());
        assert_eq!(
            dir.get(DirectoryIndex::new(0x3C0)).kind(),
            Some(PdEntryKind::Superpage(
                PhysicalAddress::new(0),
                PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::PS | PteFlags::GLOBAL
            ))
        );
        match dir.get(DirectoryIndex::new(0x3FF)).kind() {
            Some(PdEntryKind::Superpage(base, _)) => assert_eq!(base.as_u32(), 0x0FC0_0000),
            other => panic!("expected superpage, got {other:?}"),
        }
        assert_eq!(rig.frames.refcount(kernel.root()), 1);
    }

    #[test]
    fn create_shares_kernel_entries_only() {
        let mut rig = Rig::new(16);
        let (kernel, user) = rig.spaces();
        assert_ne!(kernel, user);

        let k = unsafe { directory_mut(&rig.phys, kernel.root()) };
        let u = unsafe { directory_mut(&rig.phys, user.root()) };
        for pd in 0..1024u16 {
            let pd = DirectoryIndex::new(pd);
            if pd < AddressSpace::kernel_slots() {
                assert!(!u.get(pd).is_present());
            } else {
                assert_eq!(u.get(pd), k.get(pd));
            }
        }
        assert_eq!(rig.frames.refcount(user.root()), 1);
    }

    #[test]
    fn destroy_returns_every_frame() {
        let mut rig = Rig::new(32);
        let (kernel, user) = rig.spaces();
        // The user directory comes back on top of what is free now.
        let baseline = rig.frames.free_count() + 1;

        let pages: alloc::vec::Vec<_> = (0..3).map(|_| rig.frames.alloc_frame().unwrap()).collect();
        let mut vm = rig.vm();
        vm.insert(user, pages[0], VirtualAddress::new(0x0080_0000), PteFlags::USER).unwrap();
        vm.insert(user, pages[1], VirtualAddress::new(0x0080_1000), PteFlags::USER).unwrap();
        vm.insert(user, pages[2], VirtualAddress::new(0x00C0_0000), PteFlags::USER).unwrap();
        user.activate(vm.mmu_mut());

        user.destroy(&mut vm, kernel);
        assert!(vm.is_active(kernel));
        assert_eq!(rig.frames.free_count(), baseline);
        assert!(rig.frames.is_free(user.root()));
        assert!(!rig.frames.is_free(kernel.root()));
    }

    #[test]
    fn destroy_keeps_frames_shared_with_others() {
        let mut rig = Rig::new(32);
        let (kernel, a) = rig.spaces();
        let b = AddressSpace::create(&mut rig.vm(), kernel).unwrap();
        let page = rig.frames.alloc_frame().unwrap();

        let mut vm = rig.vm();
        vm.insert(a, page, VirtualAddress::new(0x1000), PteFlags::USER).unwrap();
        vm.insert(b, page, VirtualAddress::new(0x1000), PteFlags::USER).unwrap();
        a.destroy(&mut vm, kernel);

        assert_eq!(vm.frames().refcount(page), 1);
        assert_eq!(vm.lookup(b, VirtualAddress::new(0x1000)).map(|(f, _)| f), Some(page));
    }
}
