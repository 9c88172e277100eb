//! # Mapping Inspection
//!
//! Read-only views over an address space's page tables for debugging and
//! tests. Nothing here allocates frames or touches reference counts.

use crate::page_table::{DirectoryIndex, PdEntryKind, TableIndex};
use crate::{
    AddressSpace, FrameAlloc, Mmu, PageEntryBits, PageTableManager, PhysMapper, PteFlags,
    directory_mut, table_mut,
};
use alloc::vec::Vec;
use core::fmt;
use kernel_info::memory::{KERNBASE, PAGE_SIZE};
use kernel_memory_addresses::{FrameNumber, PhysicalAddress, VirtualAddress};
use log::info;

/// One present 4 KiB user mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub va: VirtualAddress,
    pub frame: FrameNumber,
    pub flags: PteFlags,
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bit = |flag, c| if self.flags.contains(flag) { c } else { '-' };
        write!(
            f,
            "{} -> {} {}{}{}{}",
            self.va,
            self.frame.base(),
            bit(PteFlags::USER, 'u'),
            bit(PteFlags::WRITABLE, 'w'),
            bit(PteFlags::COPY_ON_WRITE, 'c'),
            bit(PteFlags::PRESENT, 'p'),
        )
    }
}

impl<A: FrameAlloc, M: PhysMapper, H: Mmu> PageTableManager<'_, A, M, H> {
    /// The raw leaf entry translating `va`, present or not, if a slot exists.
    #[must_use]
    pub fn read_leaf(&self, space: AddressSpace, va: VirtualAddress) -> Option<PageEntryBits> {
        self.find_slot(space, va).map(|slot| self.read_slot(slot))
    }

    /// Translate `va` to a physical address, including superpages.
    #[must_use]
    pub fn translate(&self, space: AddressSpace, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.lookup(space, va)
            .map(|(frame, _)| frame.base() + va.page_offset())
    }

    /// Every present leaf below the reserved region, in address order.
    #[must_use]
    pub fn mappings(&self, space: AddressSpace) -> Vec<Mapping> {
        let mut out = Vec::new();
        let reserved = DirectoryIndex::from(VirtualAddress::new(KERNBASE));
        for pd in reserved.below() {
            // SAFETY: `space.root()` holds a page directory.
            let entry = unsafe { directory_mut(self.mapper, space.root()) }.get(pd);
            let Some(PdEntryKind::NextTable(table, _)) = entry.kind() else {
                continue;
            };
            // SAFETY: present non-superpage entries point at page tables.
            let pt = unsafe { table_mut(self.mapper, table) };
            for index in TableIndex::all() {
                if let Some((frame, flags)) = pt.get(index).page_4k() {
                    out.push(Mapping {
                        va: VirtualAddress::from_indices(pd.as_usize(), index.as_usize()),
                        frame,
                        flags,
                    });
                }
            }
        }
        out
    }

    /// Log every page in `[from, to)` with its translation.
    pub fn dump_mapping(&self, space: AddressSpace, from: VirtualAddress, to: VirtualAddress) {
        info!("{space}: mappings {from}..{to}");
        let mut page = u64::from(from.page_base().as_u32());
        while page < u64::from(to.as_u32()) {
            #[allow(clippy::cast_possible_truncation)]
            let va = VirtualAddress::new(page as u32);
            match self.lookup(space, va) {
                Some((frame, slot)) => {
                    let mapping = Mapping {
                        va,
                        frame,
                        flags: self.read_slot(slot).flags(),
                    };
                    info!("  {mapping}");
                }
                None => info!("  {va} unmapped"),
            }
            page += u64::from(PAGE_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::Rig;

    #[test]
    fn mappings_lists_present_leaves_in_order() {
        let mut rig = Rig::new(32);
        let (_, space) = rig.spaces();
        let a = rig.frames.alloc_frame().unwrap();
        let b = rig.frames.alloc_frame().unwrap();

        let mut vm = rig.vm();
        vm.insert(space, b, VirtualAddress::new(0x00C0_0000), PteFlags::USER).unwrap();
        vm.insert(space, a, VirtualAddress::new(0x0080_3000), PteFlags::USER | PteFlags::WRITABLE)
            .unwrap();

        let all = vm.mappings(space);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].va, VirtualAddress::new(0x0080_3000));
        assert_eq!(all[0].frame, a);
        assert!(all[0].flags.contains(PteFlags::WRITABLE));
        assert_eq!(all[1].va, VirtualAddress::new(0x00C0_0000));
        assert_eq!(all[1].frame, b);
    }

    #[test]
    fn translate_adds_page_offset() {
        let mut rig = Rig::new(32);
        let (_, space) = rig.spaces();
        let a = rig.frames.alloc_frame().unwrap();

        let mut vm = rig.vm();
        vm.insert(space, a, VirtualAddress::new(0x0080_0000), PteFlags::USER).unwrap();
        assert_eq!(
            vm.translate(space, VirtualAddress::new(0x0080_0ABC)),
            Some(a.base() + 0xABC)
        );
        assert_eq!(
            vm.translate(space, VirtualAddress::new(KERNBASE + 0x1234)),
            Some(PhysicalAddress::new(0x1234))
        );
        assert_eq!(vm.translate(space, VirtualAddress::new(0x0080_1000)), None);
        assert!(vm.read_leaf(space, VirtualAddress::new(0x0080_0000)).is_some_and(|e| e.user_access()));

        let shown = alloc::format!("{}", vm.mappings(space)[0]);
        assert!(shown.ends_with("u--p"), "{shown}");
    }
}
