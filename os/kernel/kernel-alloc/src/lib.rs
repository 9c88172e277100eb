//! # Kernel Physical Memory Allocation
//!
//! This crate owns physical memory: which frames are free, how many
//! references each allocated frame carries, and how the kernel reaches a
//! frame's bytes.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │           kernel-vmem page-table manager            │
//! │    • calls FrameAlloc / PhysMapper                  │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Buddy allocator ([`buddy`])            │
//! │    • power-of-two blocks, orders 0..=MAX_ORDER      │
//! │    • split on allocate, merge on free               │
//! │    • per-frame reference counts                     │
//! └─────────────────┬───────────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────────┐
//! │          Frame descriptor arena ([`frame`])         │
//! │    • one PageInfo per physical frame                │
//! │    • free lists linked by frame number              │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Physical Mapper ([`phys_mapper`])
//!
//! - [`KernbasePhysMapper`](phys_mapper::KernbasePhysMapper): the kernel sees
//!   all of physical memory at `KERNBASE + pa`.
//! - [`HostPhysMemory`](phys_mapper::HostPhysMemory): a heap-backed RAM
//!   model so that the allocator, the page-table code and everything above
//!   them run as ordinary host tests.
//!
//! ## Usage
//! ```rust
//! use kernel_alloc::buddy::{BuddyAllocator, FramePoolConfig};
//! use kernel_vmem::FrameAlloc;
//!
//! let mut pool = BuddyAllocator::from_config(&FramePoolConfig::new(64).reserve(0..1));
//! let frame = pool.alloc_frame().unwrap();
//! pool.incref(frame);
//! assert!(pool.decref(frame));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod buddy;
pub mod frame;
mod free_list;
pub mod phys_mapper;

pub use crate::buddy::{BuddyAllocator, FramePoolConfig};

/// Errors raised by the frame allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// No free block of the requested order or larger.
    #[error("out of memory allocating a block of order {order}")]
    OutOfMemory { order: usize },
}
