//! # Copy-on-Write Fork
//!
//! [`Kernel::fork`] builds a child out of the memory system calls alone:
//!
//! ```text
//!  exofork ─► duppage [UTEXT, high water) ─► private stacks ─► Runnable
//! ```
//!
//! Writable pages end up mapped read-only with the
//! [`COPY_ON_WRITE`](PteFlags::COPY_ON_WRITE) bit in both environments. The
//! first write by either side faults into [`Kernel::cow_fault`], which gives
//! the writer a private copy. Read-only pages stay shared for good. The
//! normal and exception stacks are copied eagerly since they are written
//! right away.

use crate::env::{EnvId, EnvStatus, FaultHandler};
use crate::fault::PageFaultError;
use crate::syscall::Resume;
use crate::{Kernel, KernelError};
use kernel_info::memory::{PAGE_SIZE, PFTEMP, USTACKTOP, UTEMP, UTEXT, UXSTACKTOP};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{Mmu, PhysMapper, PteFlags};
use log::{info, warn};

/// Permission of a private, writable user page.
const PRIVATE: PteFlags = PteFlags::USER
    .union(PteFlags::PRESENT)
    .union(PteFlags::WRITABLE);

/// Outcome of a successful [`Kernel::fork`] as seen by the parent.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Forked {
    /// The new, runnable child. Also placed in the parent's `eax`.
    pub child: EnvId,
    /// How the parent continues: it yields so the child gets to run.
    pub resume: Resume,
}

impl<M: PhysMapper, H: Mmu> Kernel<M, H> {
    /// Fork the running environment with copy-on-write sharing.
    ///
    /// The parent's copy-on-write fault handler is installed first and is
    /// inherited by the child. The child resumes from the parent's saved
    /// registers with `0` in `eax`.
    ///
    /// # Errors
    /// - [`KernelError::NoFreeEnv`] if the environment table is full.
    /// - [`KernelError::NoMem`] if frames run out; the half-built child is
    ///   destroyed again.
    pub fn fork(&mut self) -> Result<Forked, KernelError> {
        let parent = self.current_index()?;
        self.envs.get_mut(parent).fault_handler = Some(FaultHandler::CopyOnWrite);

        let child = self.sys_exofork()?;
        if let Err(e) = self.populate_child(parent, child) {
            warn!("{} fork failed: {e}", self.envs.get(parent).id);
            self.env_free(child.index());
            return Err(e);
        }
        self.envs.get_mut(child.index()).status = EnvStatus::Runnable;
        self.envs.get_mut(parent).tf.eax = child.as_u32();

        info!("{} forked {child}", self.envs.get(parent).id);
        Ok(Forked {
            child,
            resume: Resume::Yield,
        })
    }

    fn populate_child(&mut self, parent: usize, child: EnvId) -> Result<(), KernelError> {
        let space = self.space_of(parent)?;
        let high_water = self.envs.get(parent).high_water.as_u32();
        let end = high_water.min(USTACKTOP - PAGE_SIZE);

        for page in (UTEXT..end).step_by(PAGE_SIZE as usize) {
            let va = VirtualAddress::new(page);
            if self.vm().lookup(space, va).is_some() {
                self.duppage(child, va)?;
            }
        }
        self.private_page(child, VirtualAddress::new(USTACKTOP - PAGE_SIZE))?;
        self.private_page(child, VirtualAddress::new(UXSTACKTOP - PAGE_SIZE))?;

        let env = self.envs.get_mut(child.index());
        env.high_water = VirtualAddress::new(high_water);
        env.fault_handler = Some(FaultHandler::CopyOnWrite);
        Ok(())
    }

    /// Share the running environment's page at `va` with `child`.
    ///
    /// Writable and copy-on-write pages become read-only copy-on-write in
    /// both environments; the parent's own entry is rewritten so it can no
    /// longer write to the shared frame. Other pages are shared as they are.
    ///
    /// # Errors
    /// - [`KernelError::NoMem`] if the child needs a page table and none is
    ///   left.
    pub fn duppage(&mut self, child: EnvId, va: VirtualAddress) -> Result<(), KernelError> {
        let space = self.space_of(self.current_index()?)?;
        let Some(leaf) = self.vm().read_leaf(space, va) else {
            return Ok(());
        };
        let mut perm = leaf.flags() & PteFlags::SYSCALL;
        if perm.intersects(PteFlags::WRITABLE | PteFlags::COPY_ON_WRITE) {
            perm = perm.difference(PteFlags::WRITABLE) | PteFlags::COPY_ON_WRITE;
            self.sys_page_map(EnvId::CURRENT, va, child, va, perm)?;
            self.sys_page_map(EnvId::CURRENT, va, EnvId::CURRENT, va, perm)
        } else {
            self.sys_page_map(EnvId::CURRENT, va, child, va, perm)
        }
    }

    /// Give `child` a fresh page at `va` holding a copy of the running
    /// environment's page there, if it has one.
    fn private_page(&mut self, child: EnvId, va: VirtualAddress) -> Result<(), KernelError> {
        let scratch = VirtualAddress::new(UTEMP);
        self.sys_page_alloc(child, va, PRIVATE)?;
        self.sys_page_map(child, va, EnvId::CURRENT, scratch, PRIVATE)?;

        let space = self.space_of(self.current_index()?)?;
        let vm = self.vm();
        if let (Some((src, _)), Some((dst, _))) = (vm.lookup(space, va), vm.lookup(space, scratch)) {
            vm.copy_frame(src, dst);
        }
        self.sys_page_unmap(EnvId::CURRENT, scratch)
    }

    /// Resolve a write fault on a copy-on-write page of the running
    /// environment by giving it a private, writable copy.
    ///
    /// The copy is built at the scratch page `PFTEMP` and then mapped over
    /// `va`, so the faulting page stays mapped throughout.
    ///
    /// # Errors
    /// - [`KernelError::Fault`] if the fault is not a write to a present
    ///   copy-on-write page.
    /// - [`KernelError::NoMem`] if no frame is left for the copy.
    pub(crate) fn cow_fault(&mut self, va: VirtualAddress, err: PageFaultError) -> Result<(), KernelError> {
        let space = self.space_of(self.current_index()?)?;
        let cow = self
            .vm()
            .read_leaf(space, va)
            .is_some_and(|leaf| leaf.present() && leaf.copy_on_write());
        if !(err.write() && cow) {
            warn!("unhandled fault at {va}: {}, not a copy-on-write write", err.explain());
            return Err(KernelError::Fault);
        }

        let page = va.page_base();
        let scratch = VirtualAddress::new(PFTEMP);
        self.sys_page_alloc(EnvId::CURRENT, scratch, PRIVATE)?;
        {
            let vm = self.vm();
            if let (Some((old, _)), Some((new, _))) = (vm.lookup(space, page), vm.lookup(space, scratch)) {
                vm.copy_frame(old, new);
            }
        }
        self.sys_page_map(EnvId::CURRENT, scratch, EnvId::CURRENT, page, PRIVATE)?;
        self.sys_page_unmap(EnvId::CURRENT, scratch)
    }
}
