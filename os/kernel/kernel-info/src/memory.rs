//! # Memory Layout
//!
//! ```text
//! 4 GiB        ┌──────────────────────────────┐
//!              │  Physical memory, superpages │
//! KERNBASE     ├──────────────────────────────┤ 0xF000_0000
//!              │  Kernel stacks, MMIO         │
//! ULIM         ├──────────────────────────────┤ 0xEF80_0000
//!              │  Read-only kernel exports    │
//! UTOP         ├──────────────────────────────┤ 0xEEC0_0000
//! UXSTACKTOP   │  Exception stack page        │
//!              ├──────────────────────────────┤
//!              │  Empty guard page            │
//! USTACKTOP    ├──────────────────────────────┤ 0xEEBF_E000
//!              │  Normal user stack (grows ↓) │
//!              │              ...             │
//! UTEXT        ├──────────────────────────────┤ 0x0080_0000
//! PFTEMP       │  Scratch page for COW repair │ 0x007F_F000
//! UTEMP        ├──────────────────────────────┤ 0x0040_0000
//!              │  Unmapped                    │
//! 0            └──────────────────────────────┘
//! ```

/// Size of a physical frame and of a leaf mapping.
pub const PAGE_SIZE: u32 = 4096;

/// log2([`PAGE_SIZE`]).
pub const PAGE_SHIFT: u32 = 12;

/// Number of entries in a second-level page table.
pub const PT_ENTRIES: usize = 1024;

/// Number of entries in a page directory.
pub const PD_ENTRIES: usize = 1024;

/// Bytes covered by one page directory entry (4 MiB).
pub const PT_SIZE: u32 = PAGE_SIZE * PT_ENTRIES as u32;

/// log2([`PT_SIZE`]).
pub const PD_SHIFT: u32 = 22;

/// Start of the reserved high region. Everything from here up to 4 GiB
/// is mapped with directory-level superpages onto physical memory from
/// address zero and is shared by every address space.
pub const KERNBASE: u32 = 0xF000_0000;

/// Upper bound of memory the kernel exposes to user environments at all.
pub const ULIM: u32 = 0xEF80_0000;

/// Isolation boundary: user-controlled mappings live strictly below.
pub const UTOP: u32 = 0xEEC0_0000;

/// Top of the one-page user exception stack.
pub const UXSTACKTOP: u32 = UTOP;

/// Top of the normal user stack. One guard page sits between it and the
/// exception stack.
pub const USTACKTOP: u32 = UTOP - 2 * PAGE_SIZE;

/// Where user program text begins.
pub const UTEXT: u32 = 2 * PT_SIZE;

/// Scratch page used while building a child's private stack.
pub const UTEMP: u32 = PT_SIZE;

/// Scratch page used by the copy-on-write fault handler.
pub const PFTEMP: u32 = UTEMP + PT_SIZE - PAGE_SIZE;

/// Largest block order managed by the buddy allocator (blocks of
/// `2^MAX_ORDER` frames).
pub const MAX_ORDER: usize = 11;

/// Default capacity of the environment table.
pub const NENV: usize = 1024;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(PT_SIZE == 1 << PD_SHIFT);
    assert!(KERNBASE.is_multiple_of(PT_SIZE));
    assert!(UTOP < ULIM && ULIM < KERNBASE);
    assert!(UTOP.is_multiple_of(PAGE_SIZE));
    assert!(PFTEMP < UTEXT && UTEMP < PFTEMP);
    assert!(USTACKTOP > UTEXT);
    assert!(NENV.is_power_of_two());
};
