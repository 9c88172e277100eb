//! # User Memory Access
//!
//! Loads and stores performed by the running environment, emulated by a
//! software walk of its page tables. An access the hardware would refuse
//! raises a page fault through [`Kernel::page_fault`] and is retried once
//! after the handler returns, just as the processor re-executes the
//! faulting instruction.

use crate::fault::PageFaultError;
use crate::{Kernel, KernelError};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{FrameNumber, VirtualAddress};
use kernel_vmem::{AddressSpace, Mmu, PhysMapper};
use log::warn;

impl<M: PhysMapper, H: Mmu> Kernel<M, H> {
    /// Copy `dst.len()` bytes at `va` out of the running environment.
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if nothing is running.
    /// - [`KernelError::Fault`] if the access faults and the fault cannot
    ///   be resolved; the environment has been destroyed.
    pub fn user_read(&mut self, va: VirtualAddress, dst: &mut [u8]) -> Result<(), KernelError> {
        let mut done = 0;
        while done < dst.len() {
            let at = va + chunk_offset(done);
            let len = page_chunk(at, dst.len() - done);
            let frame = self.user_page(at, false)?;
            self.vm()
                .read_frame(frame, at.page_offset() as usize, &mut dst[done..done + len]);
            done += len;
        }
        Ok(())
    }

    /// Copy `src` into the running environment at `va`.
    ///
    /// # Errors
    /// As [`user_read`](Self::user_read).
    pub fn user_write(&mut self, va: VirtualAddress, src: &[u8]) -> Result<(), KernelError> {
        let mut done = 0;
        while done < src.len() {
            let at = va + chunk_offset(done);
            let len = page_chunk(at, src.len() - done);
            let frame = self.user_page(at, true)?;
            self.vm()
                .write_frame(frame, at.page_offset() as usize, &src[done..done + len]);
            done += len;
        }
        Ok(())
    }

    /// Frame backing `va` for a user access, faulting at most once.
    fn user_page(&mut self, va: VirtualAddress, write: bool) -> Result<FrameNumber, KernelError> {
        let index = self.current_index()?;
        let err = match self.probe(self.space_of(index)?, va, write) {
            Ok(frame) => return Ok(frame),
            Err(err) => err,
        };
        self.page_fault(va, err)?;

        self.probe(self.space_of(index)?, va, write).map_err(|err| {
            warn!(
                "{} fault at {va} persists after handler: {}",
                self.envs.get(index).id,
                err.explain()
            );
            self.env_free(index);
            KernelError::Fault
        })
    }

    /// What the processor would do for a user access to `va` in `space`.
    fn probe(
        &mut self,
        space: AddressSpace,
        va: VirtualAddress,
        write: bool,
    ) -> Result<FrameNumber, PageFaultError> {
        let vm = self.vm();
        let err = PageFaultError::new().with_user(true).with_write(write);
        let (frame, slot) = vm.lookup(space, va).ok_or(err)?;
        let leaf = vm.read_slot(slot);
        if !leaf.user_access() || (write && !leaf.writable()) {
            return Err(err.with_present(true));
        }
        Ok(frame)
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn chunk_offset(done: usize) -> u32 {
    done as u32
}

/// Bytes of a `remaining`-byte access at `at` that fall in `at`'s page.
fn page_chunk(at: VirtualAddress, remaining: usize) -> usize {
    ((PAGE_SIZE - at.page_offset()) as usize).min(remaining)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_stop_at_page_boundaries() {
        assert_eq!(page_chunk(VirtualAddress::new(0x0080_0ffe), 5), 2);
        assert_eq!(page_chunk(VirtualAddress::new(0x0080_1000), 5), 5);
        assert_eq!(page_chunk(VirtualAddress::new(0x0080_1000), 9000), 4096);
    }
}
