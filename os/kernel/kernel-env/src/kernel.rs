//! # Kernel State
//!
//! [`Kernel`] bundles everything the system calls operate on: the frame
//! allocator, the physical mapper, the MMU, the environment table and the
//! boot address space. There is no global state; the boot code builds one
//! value and every operation borrows it.

use crate::env::{EnvId, EnvStatus, EnvTable, FL_IF};
use crate::KernelError;
use alloc::vec::Vec;
use kernel_alloc::buddy::{BuddyAllocator, FramePoolConfig};
use kernel_info::memory::{PAGE_SIZE, USTACKTOP, UTEXT, UTOP};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{AddressSpace, FrameAlloc, Mmu, PageTableManager, PhysMapper, PteFlags};
use log::{debug, info, warn};

/// The memory core of the kernel together with its environments.
pub struct Kernel<M: PhysMapper, H: Mmu> {
    frames: BuddyAllocator,
    mapper: M,
    mmu: H,
    pub(crate) envs: EnvTable,
    kernel_space: AddressSpace,
    pub(crate) current: Option<usize>,
    console: Vec<u8>,
}

impl<M: PhysMapper, H: Mmu> Kernel<M, H> {
    /// Build the frame pool, the boot page directory and an empty
    /// environment table of `capacity` slots, then load the boot directory.
    ///
    /// # Errors
    /// - [`KernelError::NoMem`] if the pool has no frame for the boot
    ///   directory.
    pub fn new(
        pool: &FramePoolConfig,
        mapper: M,
        mut mmu: H,
        capacity: usize,
    ) -> Result<Self, KernelError> {
        let mut frames = BuddyAllocator::from_config(pool);
        let kernel_space = {
            let mut vm = PageTableManager::new(&mut frames, &mapper, &mut mmu);
            AddressSpace::bootstrap(&mut vm)?
        };
        kernel_space.activate(&mut mmu);
        Ok(Self {
            frames,
            mapper,
            mmu,
            envs: EnvTable::new(capacity),
            kernel_space,
            current: None,
            console: Vec::new(),
        })
    }

    /// Borrow the page-table manager.
    pub fn vm(&mut self) -> PageTableManager<'_, BuddyAllocator, M, H> {
        PageTableManager::new(&mut self.frames, &self.mapper, &mut self.mmu)
    }

    #[must_use]
    pub const fn frames(&self) -> &BuddyAllocator {
        &self.frames
    }

    #[must_use]
    pub const fn mmu(&self) -> &H {
        &self.mmu
    }

    #[must_use]
    pub const fn envs(&self) -> &EnvTable {
        &self.envs
    }

    #[must_use]
    pub const fn kernel_space(&self) -> AddressSpace {
        self.kernel_space
    }

    /// Everything written with `cputs` so far.
    #[must_use]
    pub fn console(&self) -> &[u8] {
        &self.console
    }

    pub(crate) fn console_write(&mut self, bytes: &[u8]) {
        self.console.extend_from_slice(bytes);
    }

    /// Id of the running environment.
    #[must_use]
    pub fn curenv(&self) -> Option<EnvId> {
        self.current.map(|i| self.envs.get(i).id)
    }

    /// Slot of the running environment.
    pub(crate) fn current_index(&self) -> Result<usize, KernelError> {
        self.current.ok_or(KernelError::BadEnv)
    }

    /// Resolve an id on behalf of the running environment.
    pub(crate) fn resolve(&self, id: EnvId, check_perm: bool) -> Result<usize, KernelError> {
        self.envs.resolve(id, self.current, check_perm)
    }

    /// Address space of the environment in slot `index`.
    pub(crate) fn space_of(&self, index: usize) -> Result<AddressSpace, KernelError> {
        self.envs.get(index).space.ok_or(KernelError::BadEnv)
    }

    /// Address space of the environment `id`, without a permission check.
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if `id` does not name a live environment.
    pub fn space(&self, id: EnvId) -> Result<AddressSpace, KernelError> {
        self.space_of(self.resolve(id, false)?)
    }

    /// Allocate an environment with an empty user address space.
    ///
    /// The new environment is not runnable and its trap frame is zero apart
    /// from the interrupt flag.
    ///
    /// # Errors
    /// - [`KernelError::NoFreeEnv`] if every slot is taken.
    /// - [`KernelError::NoMem`] if no frame is left for the page directory.
    pub fn env_alloc(&mut self, parent: EnvId) -> Result<EnvId, KernelError> {
        let index = self.envs.free_slot().ok_or(KernelError::NoFreeEnv)?;
        let kernel = self.kernel_space;
        let space = AddressSpace::create(&mut self.vm(), kernel)?;
        let id = self.envs.occupy(index, parent, space);
        info!("{} new env {id}", self.curenv().unwrap_or_default());
        Ok(id)
    }

    /// Create a runnable environment whose program is `image`, loaded
    /// writable at `UTEXT`, with one stack page below `USTACKTOP`.
    ///
    /// # Errors
    /// As [`env_alloc`](Self::env_alloc); on a later failure the
    /// half-built environment is destroyed again.
    pub fn env_create(&mut self, image: &[u8]) -> Result<EnvId, KernelError> {
        let id = self.env_alloc(EnvId::CURRENT)?;
        let index = id.index();
        let built = self
            .load_image(
                index,
                VirtualAddress::new(UTEXT),
                image,
                PteFlags::USER | PteFlags::WRITABLE,
            )
            .and_then(|()| {
                self.region_alloc(
                    index,
                    VirtualAddress::new(USTACKTOP - PAGE_SIZE),
                    PAGE_SIZE,
                    PteFlags::USER | PteFlags::WRITABLE,
                )
            });
        if let Err(e) = built {
            self.env_free(index);
            return Err(e);
        }

        let env = self.envs.get_mut(index);
        env.tf.eip = UTEXT;
        env.tf.esp = USTACKTOP;
        env.tf.eflags = FL_IF;
        env.status = EnvStatus::Runnable;
        Ok(id)
    }

    /// Map fresh zeroed pages over `[va, va + len)` in slot `index`.
    fn region_alloc(
        &mut self,
        index: usize,
        va: VirtualAddress,
        len: u32,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        let space = self.space_of(index)?;
        let start = va.page_base().as_u32();
        let end = kernel_vmem::align_up(va.as_u32() + len, PAGE_SIZE);
        let mut vm = self.vm();
        for page in (start..end).step_by(PAGE_SIZE as usize) {
            let frame = vm.frames_mut().alloc_frame().ok_or(KernelError::NoMem)?;
            vm.zero_frame(frame);
            if let Err(e) = vm.insert(space, frame, VirtualAddress::new(page), perm) {
                vm.frames_mut().free_frame(frame);
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Copy `data` into freshly mapped pages at `va` and move the program
    /// region's end past it.
    ///
    /// # Errors
    /// - [`KernelError::NoMem`] if pages or page tables cannot be allocated.
    /// - [`KernelError::Inval`] if the region is not below `UTOP`.
    pub(crate) fn load_image(
        &mut self,
        index: usize,
        va: VirtualAddress,
        data: &[u8],
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        let len = u32::try_from(data.len()).map_err(|_| KernelError::Inval)?;
        let end = va.checked_add(len).ok_or(KernelError::Inval)?;
        if end.as_u32() > UTOP {
            return Err(KernelError::Inval);
        }
        self.region_alloc(index, va, len, perm)?;

        let space = self.space_of(index)?;
        let vm = self.vm();
        let mut offset = 0usize;
        while offset < data.len() {
            #[allow(clippy::cast_possible_truncation)]
            let at = va + offset as u32;
            let chunk = (PAGE_SIZE - at.page_offset()) as usize;
            let chunk = chunk.min(data.len() - offset);
            let Some((frame, _)) = vm.lookup(space, at) else {
                return Err(KernelError::Fault);
            };
            vm.write_frame(frame, at.page_offset() as usize, &data[offset..offset + chunk]);
            offset += chunk;
        }

        let env = self.envs.get_mut(index);
        let ceil = end.page_ceil().unwrap_or(end);
        if ceil.as_u32() > env.high_water.as_u32() {
            env.high_water = ceil;
        }
        debug!("{} loaded {len} bytes at {va}", env.id);
        Ok(())
    }

    /// Free the environment in slot `index`: tear down its address space and
    /// release the slot.
    pub(crate) fn env_free(&mut self, index: usize) {
        let id = self.envs.get(index).id;
        let kernel = self.kernel_space;
        if let Some(space) = self.envs.vacate(index) {
            space.destroy(&mut self.vm(), kernel);
        }
        if self.current == Some(index) {
            self.current = None;
        }
        info!("{} free env {id}", self.curenv().unwrap_or_default());
    }

    /// Destroy environment `id`.
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if `id` is not the caller or one of its
    ///   children.
    pub fn env_destroy(&mut self, id: EnvId) -> Result<(), KernelError> {
        let index = self.resolve(id, true)?;
        if Some(index) == self.current {
            info!("{} exiting gracefully", self.envs.get(index).id);
        } else {
            info!(
                "{} destroying {}",
                self.curenv().unwrap_or_default(),
                self.envs.get(index).id
            );
        }
        self.env_free(index);
        Ok(())
    }

    /// Make environment `id` the running one and load its address space.
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if `id` does not name a live environment.
    pub fn env_run(&mut self, id: EnvId) -> Result<(), KernelError> {
        let index = self.resolve(id, false)?;
        self.run_index(index)
    }

    fn run_index(&mut self, index: usize) -> Result<(), KernelError> {
        let space = self.space_of(index)?;
        self.current = Some(index);
        self.envs.get_mut(index).runs += 1;
        space.activate(&mut self.mmu);
        Ok(())
    }

    /// Pick the next runnable environment round-robin and run it.
    ///
    /// Returns the id of the environment now running, or `None` with the
    /// boot directory loaded if nothing is runnable.
    pub fn schedule(&mut self) -> Option<EnvId> {
        if let Some(index) = self.envs.next_runnable(self.current)
            && self.run_index(index).is_ok()
        {
            let id = self.envs.get(index).id;
            debug!("picking environment {id}");
            return Some(id);
        }
        info!("nothing runnable");
        self.current = None;
        self.kernel_space.activate(&mut self.mmu);
        None
    }

    /// Check that environment slot `index` may access `[va, va + len)` with
    /// `perm | USER`.
    ///
    /// # Errors
    /// - [`MemoryFault`](kernel_vmem::MemoryFault) naming the first bad
    ///   address.
    pub(crate) fn user_mem_check(
        &mut self,
        index: usize,
        va: VirtualAddress,
        len: u32,
        perm: PteFlags,
    ) -> Result<(), kernel_vmem::MemoryFault> {
        let space = self
            .space_of(index)
            .map_err(|_| kernel_vmem::MemoryFault { address: va })?;
        self.vm().check_user_access(space, va, len, perm | PteFlags::USER)
    }

    /// [`user_mem_check`](Self::user_mem_check), destroying the owning
    /// environment on failure.
    ///
    /// # Errors
    /// - [`KernelError::Fault`] after the environment has been destroyed.
    pub fn user_mem_assert(
        &mut self,
        id: EnvId,
        va: VirtualAddress,
        len: u32,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        let index = self.resolve(id, false)?;
        if let Err(fault) = self.user_mem_check(index, va, len, perm) {
            warn!(
                "{} user_mem_check assertion failure for va {}",
                self.envs.get(index).id,
                fault.address
            );
            self.env_free(index);
            return Err(fault.into());
        }
        Ok(())
    }
}
