//! # Page Faults
//!
//! Faults raised by user environments are dispatched to the environment's
//! [`FaultHandler`]. An environment without a handler is destroyed; a fault
//! raised by the kernel itself is a bug and panics.

use crate::env::FaultHandler;
use crate::{Kernel, KernelError};
use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{Mmu, PhysMapper};
use log::warn;

/// Page-fault error code layout (32-bit x86).
///
/// Each bit describes the condition that caused the page fault.
/// Reference: Intel SDM Vol. 3A, §6.15 "Page-Fault Exception (#PF)".
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PageFaultError {
    /// 0 = non-present page.
    /// 1 = protection violation (page present but access disallowed).
    pub present: bool, // bit 0

    /// 0 = read or execute.
    /// 1 = write access.
    pub write: bool, // bit 1

    /// 0 = supervisor (CPL 0–2).
    /// 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// 1 = caused by reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    /// 1 = instruction fetch (execute access).
    pub instruction_fetch: bool, // bit 4

    #[bits(27)]
    __: u32, // reserved / ignored bits
}

impl PageFaultError {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page"
        } else if self.instruction_fetch() {
            "Instruction fetch on protected page"
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

impl<M: PhysMapper, H: Mmu> Kernel<M, H> {
    /// Handle a page fault at `va` raised by the running environment.
    ///
    /// # Errors
    /// - [`KernelError::Fault`] if the environment has no handler; it has
    ///   been destroyed.
    /// - Whatever the handler fails with; the environment has been
    ///   destroyed in that case as well.
    ///
    /// # Panics
    /// If the fault was raised in supervisor mode.
    pub fn page_fault(&mut self, va: VirtualAddress, err: PageFaultError) -> Result<(), KernelError> {
        assert!(err.user(), "kernel page fault at {va}: {}", err.explain());
        let index = self.current_index()?;
        let env = self.envs.get_mut(index);
        env.page_faults += 1;
        let id = env.id;

        let Some(handler) = env.fault_handler else {
            warn!("{id} user fault va {va}: {}", err.explain());
            self.env_free(index);
            return Err(KernelError::Fault);
        };
        let handled = match handler {
            FaultHandler::CopyOnWrite => self.cow_fault(va, err),
        };
        if let Err(e) = handled {
            warn!("{id} could not resolve fault at {va}: {e}");
            self.env_free(index);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_bits() {
        let err = PageFaultError::from_bits(0b111);
        assert!(err.present() && err.write() && err.user());
        assert_eq!(err.explain(), "Write access to protected page");
        assert_eq!(PageFaultError::new().with_user(true).into_bits(), 0b100);
        assert_eq!(PageFaultError::new().explain(), "Non-present page");
    }
}
