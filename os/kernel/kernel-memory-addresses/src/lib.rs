//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw 32-bit addresses and physical frame
//! numbers used by the paging and allocation code.
//!
//! ## Overview
//!
//! | Type | Description |
//! |------|-------------|
//! | [`VirtualAddress`] | An address translated by the page tables of some address space. |
//! | [`PhysicalAddress`] | A byte address in physical memory. |
//! | [`FrameNumber`] | The index of a 4 KiB physical frame (`address >> 12`). |
//!
//! Keeping the three apart at the type level prevents the classic bugs of
//! handing a virtual address to the allocator or storing a frame index in
//! a page-table entry where a byte address was expected.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0x0080_1234);
//! assert_eq!(va.directory_index(), 2);
//! assert_eq!(va.table_index(), 1);
//! assert_eq!(va.page_offset(), 0x234);
//!
//! let frame = FrameNumber::new(5);
//! assert_eq!(frame.base(), PhysicalAddress::new(0x5000));
//! assert_eq!(PhysicalAddress::new(0x5FFF).frame(), frame);
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`
//!   and `Hash`, making them suitable as map keys.
//! - All index and alignment computations are `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod frame_number;
mod physical_address;
mod virtual_address;

pub use frame_number::FrameNumber;
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

pub use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE};
