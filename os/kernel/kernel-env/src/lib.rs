//! # User Environments
//!
//! The process side of the memory core: an environment table with a
//! round-robin scheduler, the memory system calls, copy-on-write
//! [fork](Kernel::fork), rendezvous [IPC](Kernel::ipc_try_send) with
//! optional page transfer, and page-fault dispatch.
//!
//! Everything hangs off one [`Kernel`] value that owns the
//! [buddy allocator](kernel_alloc::BuddyAllocator), the physical mapper and
//! the [`Mmu`](kernel_vmem::Mmu). There is no global state.
//!
//! ```text
//!  trap ─► Kernel::syscall_trap ─► Syscall::decode ─► Kernel::dispatch
//!                                                        │
//!            ┌────────────┬───────────────┬──────────────┤
//!            ▼            ▼               ▼              ▼
//!       page_alloc     exofork         ipc_recv     ipc_try_send
//!       page_map       set_status         │              │
//!       page_unmap        │               └── Suspend ───┘
//!            └────────────┴──► PageTableManager ─► BuddyAllocator
//! ```
//!
//! ## Example
//!
//! ```rust
//! use kernel_alloc::FramePoolConfig;
//! use kernel_alloc::phys_mapper::HostPhysMemory;
//! use kernel_env::Kernel;
//! use kernel_memory_addresses::VirtualAddress;
//! use kernel_vmem::SoftMmu;
//!
//! let pool = FramePoolConfig::new(256).reserve(0..1);
//! let mut kernel = Kernel::new(&pool, HostPhysMemory::with_frames(256), SoftMmu::new(), 8).unwrap();
//!
//! let parent = kernel.env_create(b"hello").unwrap();
//! kernel.env_run(parent).unwrap();
//! let forked = kernel.fork().unwrap();
//!
//! kernel.env_run(forked.child).unwrap();
//! let mut buf = [0u8; 5];
//! kernel.user_read(VirtualAddress::new(0x0080_0000), &mut buf).unwrap();
//! assert_eq!(&buf, b"hello");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod env;
mod error;
pub mod fault;
pub mod fork;
mod ipc;
mod kernel;
pub mod syscall;
mod uaccess;

pub use crate::env::{EnvId, EnvStatus, TrapFrame};
pub use crate::error::KernelError;
pub use crate::fault::PageFaultError;
pub use crate::fork::Forked;
pub use crate::kernel::Kernel;
pub use crate::syscall::{Resume, Syscall, Sysno};
