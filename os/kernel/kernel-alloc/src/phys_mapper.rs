//! # Physical Mappers
//!
//! The page-table code works on physical addresses but can only dereference
//! virtual ones. A [`PhysMapper`] bridges the two.
//!
//! - In the kernel, every physical address is visible at `KERNBASE + pa`
//!   through the boot superpages; [`KernbasePhysMapper`] adds the offset.
//! - On the host, [`HostPhysMemory`] keeps a vector of page-aligned frames
//!   and indexes it by frame number.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::HostPhysMemory;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::PhysMapper;
//!
//! let ram = HostPhysMemory::with_frames(4);
//! unsafe {
//!     let word: &mut u32 = ram.phys_to_mut(PhysicalAddress::new(0x2010));
//!     *word = 7;
//!     assert_eq!(*ram.phys_to_mut::<u32>(PhysicalAddress::new(0x2010)), 7);
//! }
//! ```

use alloc::vec::Vec;
use core::cell::UnsafeCell;
use kernel_info::memory::{KERNBASE, PAGE_SIZE};
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for the kernel's direct map of physical memory at
/// [`KERNBASE`].
///
/// # Safety
/// - The boot superpages must be installed in the active address space and
///   cover the referenced physical range.
pub struct KernbasePhysMapper;

impl PhysMapper for KernbasePhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        debug_assert!(pa.as_u32() < 0u32.wrapping_sub(KERNBASE), "{pa} beyond the direct map");
        let va = KERNBASE.wrapping_add(pa.as_u32()) as usize as *mut T;
        // SAFETY: Caller guarantees the physical address is covered by the direct map.
        unsafe { &mut *va }
    }
}

#[repr(C, align(4096))]
struct HostFrame(UnsafeCell<[u8; PAGE_SIZE as usize]>);

/// Heap-backed model of physical RAM; physical address `pa` is byte
/// `pa % 4096` of frame `pa / 4096`.
pub struct HostPhysMemory {
    frames: Vec<HostFrame>,
}

impl HostPhysMemory {
    /// `n` zero-filled frames.
    #[must_use]
    pub fn with_frames(n: usize) -> Self {
        Self {
            frames: (0..n)
                .map(|_| HostFrame(UnsafeCell::new([0; PAGE_SIZE as usize])))
                .collect(),
        }
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

impl PhysMapper for HostPhysMemory {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let frame = pa.frame().index();
        assert!(frame < self.frames.len(), "{pa} outside host RAM");
        debug_assert!(
            pa.page_offset() as usize + size_of::<T>() <= PAGE_SIZE as usize,
            "{pa} access crosses a frame boundary"
        );
        let base = self.frames[frame].0.get().cast::<u8>();
        // SAFETY: The offset stays inside the frame; the caller upholds the
        // aliasing and type requirements of `PhysMapper`.
        unsafe { &mut *base.add(pa.page_offset() as usize).cast::<T>() }
    }
}
