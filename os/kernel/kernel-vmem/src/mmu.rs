//! # MMU Abstraction
//!
//! The page-table code never touches the processor directly. Loading an
//! address space and dropping stale TLB entries go through [`Mmu`], which
//! the kernel implements with `mov cr3` / `invlpg` ([`X86Mmu`]) and tests
//! implement with [`SoftMmu`], which only records what was asked of it.

use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Hardware operations needed by the memory core.
pub trait Mmu {
    /// Make the page directory at `root` the active translation.
    fn load_address_space(&mut self, root: PhysicalAddress);

    /// Physical address of the active page directory, if any was loaded.
    fn active_address_space(&self) -> Option<PhysicalAddress>;

    /// Drop any cached translation for the page containing `va` in the
    /// active address space.
    fn invalidate(&mut self, va: VirtualAddress);
}

/// Recording MMU for hosted execution.
#[derive(Debug, Default, Clone)]
pub struct SoftMmu {
    active: Option<PhysicalAddress>,
    loads: usize,
    invalidated: Vec<VirtualAddress>,
}

impl SoftMmu {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            active: None,
            loads: 0,
            invalidated: Vec::new(),
        }
    }

    /// Number of address-space switches so far.
    #[must_use]
    pub const fn loads(&self) -> usize {
        self.loads
    }

    /// Every page invalidated so far, in order.
    #[must_use]
    pub fn invalidated(&self) -> &[VirtualAddress] {
        &self.invalidated
    }

    pub fn clear_invalidated(&mut self) {
        self.invalidated.clear();
    }
}

impl Mmu for SoftMmu {
    fn load_address_space(&mut self, root: PhysicalAddress) {
        self.active = Some(root);
        self.loads += 1;
    }

    fn active_address_space(&self) -> Option<PhysicalAddress> {
        self.active
    }

    fn invalidate(&mut self, va: VirtualAddress) {
        self.invalidated.push(va.page_base());
    }
}

/// The real thing: CR3 and `invlpg`.
#[cfg(all(feature = "asm", any(target_arch = "x86", target_arch = "x86_64")))]
#[derive(Debug, Default)]
pub struct X86Mmu;

#[cfg(all(feature = "asm", any(target_arch = "x86", target_arch = "x86_64")))]
impl Mmu for X86Mmu {
    fn load_address_space(&mut self, root: PhysicalAddress) {
        use kernel_registers::StoreRegisterUnsafe;
        use kernel_registers::cr3::Cr3;
        // SAFETY: only constructed by the kernel, which runs at CPL0 with the
        // kernel region mapped identically in every directory.
        unsafe { Cr3::from_directory_phys(root).store_unsafe() }
    }

    fn active_address_space(&self) -> Option<PhysicalAddress> {
        use kernel_registers::LoadRegisterUnsafe;
        use kernel_registers::cr3::Cr3;
        // SAFETY: see `load_address_space`.
        Some(unsafe { Cr3::load_unsafe() }.directory_phys())
    }

    fn invalidate(&mut self, va: VirtualAddress) {
        // SAFETY: see `load_address_space`.
        unsafe { kernel_registers::tlb::invalidate_page(va) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_mmu_records() {
        let mut mmu = SoftMmu::new();
        assert_eq!(mmu.active_address_space(), None);
        mmu.load_address_space(PhysicalAddress::new(0x3000));
        mmu.invalidate(VirtualAddress::new(0x0080_0123));
        assert_eq!(mmu.active_address_space(), Some(PhysicalAddress::new(0x3000)));
        assert_eq!(mmu.loads(), 1);
        assert_eq!(mmu.invalidated(), &[VirtualAddress::new(0x0080_0000)]);
    }
}
