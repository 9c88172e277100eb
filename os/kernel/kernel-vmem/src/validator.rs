//! # User Memory Access Validator
//!
//! Before the kernel dereferences a pointer handed in by a user
//! environment it checks, page by page, that the environment itself could
//! perform the access. The check never faults the kernel; it reports the
//! first address that would fail.

use crate::{AddressSpace, FrameAlloc, Mmu, PageTableManager, PhysMapper, PteFlags};
use kernel_info::memory::{PAGE_SIZE, UTOP};
use kernel_memory_addresses::VirtualAddress;

/// A user range failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("user memory fault at {address}")]
pub struct MemoryFault {
    /// First inaccessible address: `va` itself if the first page fails,
    /// otherwise the base of the first failing page.
    pub address: VirtualAddress,
}

impl<A: FrameAlloc, M: PhysMapper, H: Mmu> PageTableManager<'_, A, M, H> {
    /// Check that `[va, va + len)` lies below [`UTOP`] and that every page
    /// it touches is present with all bits of `perm`.
    ///
    /// An empty range starting on a page boundary always passes.
    ///
    /// # Errors
    /// - [`MemoryFault`] naming the first inaccessible address.
    pub fn check_user_access(
        &self,
        space: AddressSpace,
        va: VirtualAddress,
        len: u32,
        perm: PteFlags,
    ) -> Result<(), MemoryFault> {
        let required = perm | PteFlags::PRESENT;
        let start = u64::from(va.page_base().as_u32());
        let end = (u64::from(va.as_u32()) + u64::from(len)).next_multiple_of(u64::from(PAGE_SIZE));

        let mut page = start;
        while page < end {
            #[allow(clippy::cast_possible_truncation)]
            let fault = MemoryFault {
                address: VirtualAddress::new(page.max(u64::from(va.as_u32())) as u32),
            };
            if page >= u64::from(UTOP) {
                return Err(fault);
            }
            #[allow(clippy::cast_possible_truncation)]
            let granted = self
                .lookup(space, VirtualAddress::new(page as u32))
                .is_some_and(|(_, slot)| self.read_slot(slot).grants(required));
            if !granted {
                return Err(fault);
            }
            page += u64::from(PAGE_SIZE);
        }
        Ok(())
    }
}
