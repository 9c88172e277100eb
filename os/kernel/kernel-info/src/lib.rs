//! # Kernel Memory Configuration
//!
//! Compile-time constants shared by every memory subsystem: the page
//! geometry of two-level 32-bit paging, the virtual address space layout
//! seen by user environments, the buddy allocator's order limit and the
//! default size of the environment table.
//!
//! ## Paging geometry
//!
//! ```text
//! | 31‒22 | 21‒12 | 11‒0   |
//! |  PD   |  PT   | Offset |
//! ```
//!
//! A page directory holds 1024 entries, each covering 4 MiB either through
//! a page table of 1024 leaf entries or, in the reserved high region, as a
//! single superpage.
//!
//! ## Consistency
//!
//! The layout is checked by `const` assertions in [`memory`]; an
//! inconsistent edit fails the build rather than a boot.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
