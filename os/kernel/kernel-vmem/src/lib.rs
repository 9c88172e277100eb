//! # Virtual Memory Support
//!
//! Two-level 32-bit x86 paging for the kernel and its user environments.
//!
//! ## What you get
//! - A [`PageTableManager`] that walks, populates and tears down page
//!   tables while keeping every frame's reference count in step with the
//!   leaf entries that point at it.
//! - An [`AddressSpace`] handle naming one page directory, plus helpers to
//!   build the boot directory and fresh per-environment spaces from it.
//! - A user-memory [validator](validator) for system-call arguments.
//! - Read-only [inspection](inspect) of installed mappings.
//! - An [`Mmu`] abstraction for CR3 loads and TLB invalidation, with a
//!   recording software implementation for hosted tests.
//! - Page-table [`PteFlags`] and the raw [`PageEntryBits`].
//! - The allocator/mapper interface ([`FrameAlloc`], [`PhysMapper`]).
//!
//! ## Virtual Address → Physical Address Walk
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//!
//!  CR3 → Page Directory ─┬─► PDE, PS=0 → Page Table → PTE → 4 KiB frame
//!                        └─► PDE, PS=1 → 4 MiB superpage
//! ```
//!
//! Directory entries that point to a table carry present | writable | user,
//! the union of everything a leaf below may grant. The leaf narrows the
//! effective permission. Superpages only appear in the reserved region
//! starting at [`KERNBASE`](info::KERNBASE) and are shared, read-only from
//! this crate's point of view, by every address space.
//!
//! ## Reference counting
//!
//! A present leaf contributes exactly one reference to its target frame. A
//! page-table frame is held by one reference from its directory entry. The
//! directory frame is held by the address space itself. When a count drops
//! to zero the frame returns to the allocator immediately.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod address_space;
pub mod inspect;
pub mod manager;
pub mod mmu;
mod page_entry_bits;
pub mod page_table;
pub mod validator;

extern crate alloc;

pub use crate::address_space::AddressSpace;
pub use crate::manager::{LeafSlot, PageTableManager};
pub use crate::mmu::{Mmu, SoftMmu};
pub use crate::page_entry_bits::PageEntryBits;
pub use crate::page_table::{PageDirectory, PageTable};
pub use crate::validator::MemoryFault;
use kernel_memory_addresses::{FrameNumber, PhysicalAddress, VirtualAddress};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

bitflags::bitflags! {
    /// Permission and status bits of a 32-bit page-table entry.
    ///
    /// The same low 12 bits appear in directory entries and leaf entries.
    /// Bits 9–11 are ignored by the hardware; the kernel uses bit 11 to mark
    /// copy-on-write leaves.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct PteFlags: u32 {
        /// Entry is valid.
        const PRESENT  = 1 << 0;

        /// Page is writable.
        ///
        /// If cleared the page is read-only for user mode, and for the
        /// kernel as well when CR0.WP is set.
        const WRITABLE = 1 << 1;

        /// Page is accessible from user mode (CPL=3).
        const USER     = 1 << 2;

        /// Write-through caching enabled.
        const WT       = 1 << 3;

        /// Caching disabled for this page.
        const CD       = 1 << 4;

        /// Set by the processor on any access through this entry.
        const ACCESSED = 1 << 5;

        /// Set by the processor on the first write through a leaf.
        const DIRTY    = 1 << 6;

        /// Directory entry maps a 4 MiB superpage instead of a table.
        const PS       = 1 << 7;

        /// Global page; survives CR3 reloads when CR4.PGE is enabled.
        const GLOBAL   = 1 << 8;

        /// First OS-available bit.
        const AVAIL0   = 1 << 9;

        /// Second OS-available bit.
        const AVAIL1   = 1 << 10;

        /// Copy-on-write marker (third OS-available bit).
        ///
        /// A COW leaf is never writable. A write to it faults and the
        /// owner receives a private copy.
        const COPY_ON_WRITE = 1 << 11;

        /// All three OS-available bits.
        const AVAIL = Self::AVAIL0.bits() | Self::AVAIL1.bits() | Self::COPY_ON_WRITE.bits();

        /// Bits user environments may pass to the memory system calls.
        const SYSCALL = Self::PRESENT.bits() | Self::WRITABLE.bits() | Self::USER.bits() | Self::AVAIL.bits();
    }
}

impl PteFlags {
    /// Bits a directory entry pointing to a page table always carries.
    pub const TABLE: Self = Self::PRESENT.union(Self::WRITABLE).union(Self::USER);
}

/// Errors raised while manipulating page tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// No frame was available for a page table.
    #[error("out of memory while allocating a page table")]
    OutOfMemory,
    /// The address lies in the reserved superpage region.
    #[error("address {0} lies in the reserved kernel region")]
    ReservedRegion(VirtualAddress),
}

/// Reference-counted physical frame allocator used by the page-table code.
///
/// Frames handed out by [`alloc_frame`](Self::alloc_frame) start with a
/// count of zero; the caller that stores the frame somewhere takes the
/// first reference.
pub trait FrameAlloc {
    /// Allocate one 4 KiB frame, or `None` when memory is exhausted.
    fn alloc_frame(&mut self) -> Option<FrameNumber>;

    /// Return an unreferenced frame to the pool.
    fn free_frame(&mut self, frame: FrameNumber);

    /// Current reference count of `frame`.
    fn refcount(&self, frame: FrameNumber) -> u16;

    /// Take one reference on `frame`.
    fn incref(&mut self, frame: FrameNumber);

    /// Drop one reference on `frame` without freeing it at zero.
    ///
    /// Used to undo a temporary pin.
    fn release(&mut self, frame: FrameNumber);

    /// Drop one reference on `frame`, freeing it when none remain.
    ///
    /// Returns `true` if the frame went back to the pool.
    fn decref(&mut self, frame: FrameNumber) -> bool {
        self.release(frame);
        if self.refcount(frame) == 0 {
            self.free_frame(frame);
            true
        } else {
            false
        }
    }
}

/// Converts physical addresses to *temporarily* usable references in the
/// current virtual address space.
///
/// Typical patterns:
/// - **Kernel**: physical memory is visible at [`KERNBASE`](info::KERNBASE)
///   plus the physical address.
/// - **Tests**: a heap-backed model of RAM indexed by frame number.
///
/// # Safety
/// - You must ensure `pa` is mapped as writable for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference.
    ///
    /// # Safety
    /// See the trait documentation.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

/// Borrow the page directory stored in `frame`.
///
/// # Safety
/// - `frame` must hold a page directory.
/// - No other live reference to the same frame may be used while the
///   returned one is alive.
#[inline]
unsafe fn directory_mut<'a, M: PhysMapper>(m: &M, frame: FrameNumber) -> &'a mut PageDirectory {
    unsafe { m.phys_to_mut::<PageDirectory>(frame.base()) }
}

/// Borrow the page table stored in `frame`.
///
/// # Safety
/// Same requirements as [`directory_mut`].
#[inline]
unsafe fn table_mut<'a, M: PhysMapper>(m: &M, frame: FrameNumber) -> &'a mut PageTable {
    unsafe { m.phys_to_mut::<PageTable>(frame.base()) }
}

/// Borrow the raw bytes of `frame`.
///
/// # Safety
/// Same requirements as [`directory_mut`].
#[inline]
unsafe fn frame_bytes_mut<'a, M: PhysMapper>(
    m: &M,
    frame: FrameNumber,
) -> &'a mut [u8; info::PAGE_SIZE as usize] {
    unsafe { m.phys_to_mut::<[u8; info::PAGE_SIZE as usize]>(frame.base()) }
}

/// Align `x` down to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_down;
/// assert_eq!(align_down(0,      4096), 0);
/// assert_eq!(align_down(4095,   4096), 0);
/// assert_eq!(align_down(8191,   4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u32, a: u32) -> u32 {
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// ### Preconditions
/// - `a` must be **non-zero** and a **power of two**.
/// - `x + (a - 1)` must **not overflow** `u32`.
///
/// ### Examples
/// ```rust
/// # use kernel_vmem::align_up;
/// assert_eq!(align_up(0,       4096), 0);
/// assert_eq!(align_up(1,       4096), 4096);
/// assert_eq!(align_up(4097,    4096), 8192);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u32, a: u32) -> u32 {
    (x + a - 1) & !(a - 1)
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Host models of physical memory and a reference-counting allocator.

    use super::*;
    use alloc::vec::Vec;
    use core::cell::UnsafeCell;

    /// A 4 KiB-aligned raw frame. We use this as our "physical RAM" backing store in tests.
    #[repr(C, align(4096))]
    struct Aligned4K(UnsafeCell<[u8; 4096]>);

    /// A tiny in-memory "RAM". Physical addresses are byte offsets from 0.
    pub struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        pub fn with_frames(n: usize) -> Self {
            let mut v = Vec::with_capacity(n);
            for _ in 0..n {
                v.push(Aligned4K(UnsafeCell::new([0u8; 4096])));
            }
            Self { frames: v }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = pa.frame().index();
            let off = pa.page_offset() as usize;
            assert!(idx < self.frames.len(), "{pa} outside test RAM");
            unsafe { &mut *self.frames[idx].0.get().cast::<u8>().add(off).cast::<T>() }
        }
    }

    /// Refcounting allocator handing out frames in ascending order.
    pub struct TestFrames {
        refs: Vec<u16>,
        free: Vec<FrameNumber>,
    }

    impl TestFrames {
        pub fn new(n: usize) -> Self {
            Self {
                refs: alloc::vec![0; n],
                free: (0..n).rev().map(FrameNumber::from_index).collect(),
            }
        }

        pub fn free_count(&self) -> usize {
            self.free.len()
        }

        pub fn is_free(&self, frame: FrameNumber) -> bool {
            self.free.contains(&frame)
        }

        /// Make the next allocations fail.
        pub fn exhaust(&mut self) -> Vec<FrameNumber> {
            core::mem::take(&mut self.free)
        }
    }

    impl FrameAlloc for TestFrames {
        fn alloc_frame(&mut self) -> Option<FrameNumber> {
            self.free.pop()
        }

        fn free_frame(&mut self, frame: FrameNumber) {
            assert_eq!(self.refs[frame.index()], 0);
            self.free.push(frame);
        }

        fn refcount(&self, frame: FrameNumber) -> u16 {
            self.refs[frame.index()]
        }

        fn incref(&mut self, frame: FrameNumber) {
            self.refs[frame.index()] += 1;
        }

        fn release(&mut self, frame: FrameNumber) {
            assert!(self.refs[frame.index()] > 0, "negative refcount on {frame}");
            self.refs[frame.index()] -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn syscall_mask() {
        assert_eq!(PteFlags::SYSCALL.bits(), 0xE07);
        assert!(PteFlags::AVAIL.contains(PteFlags::COPY_ON_WRITE));
        assert_eq!(PteFlags::TABLE.bits(), 0x7);
    }

    #[test]
    fn decref_frees_at_zero() {
        let mut frames = TestFrames::new(4);
        let f = frames.alloc_frame().unwrap();
        frames.incref(f);
        frames.incref(f);
        assert!(!frames.decref(f));
        assert!(!frames.is_free(f));
        assert!(frames.decref(f));
        assert!(frames.is_free(f));
    }

    #[test]
    fn test_phys_frames_are_independent() {
        let phys = TestPhys::with_frames(2);
        unsafe {
            frame_bytes_mut(&phys, FrameNumber::new(0))[0] = 0xAA;
            assert_eq!(frame_bytes_mut(&phys, FrameNumber::new(1))[0], 0);
            assert_eq!(frame_bytes_mut(&phys, FrameNumber::new(0))[0], 0xAA);
        }
    }
}
