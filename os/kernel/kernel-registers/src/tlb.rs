//! TLB maintenance.

use kernel_memory_addresses::VirtualAddress;

/// Drop the TLB entry for the page containing `va` (`invlpg`).
///
/// # Safety
/// Privileged instruction; must run at CPL0 with paging enabled.
#[cfg(all(feature = "asm", any(target_arch = "x86", target_arch = "x86_64")))]
#[inline]
pub unsafe fn invalidate_page(va: VirtualAddress) {
    let addr = va.as_usize();
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) addr, options(nostack, preserves_flags));
    }
}
