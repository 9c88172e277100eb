//! # System Calls
//!
//! User environments enter the kernel with the call number in `eax` and up
//! to five arguments in `edx, ecx, ebx, edi, esi`. [`Syscall::decode`] turns
//! those raw words into a typed request; [`Kernel::dispatch`] executes it on
//! behalf of the running environment and says how to continue through a
//! [`Resume`] value:
//!
//! ```text
//!  trap ─► decode ─► dispatch ─┬─ Return(v) ─► eax := v, resume caller
//!                              ├─ Suspend   ─► caller blocked, schedule
//!                              └─ Yield     ─► schedule
//! ```
//!
//! Memory system calls accept only the permission bits in
//! [`PteFlags::SYSCALL`] and require `USER | PRESENT`.

use crate::env::{EnvId, EnvStatus, FL_IF, TrapFrame};
use crate::{Kernel, KernelError};
use alloc::vec;
use kernel_info::memory::UTOP;
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{FrameAlloc, Mmu, PhysMapper, PteFlags};
use log::{info, trace};

/// System-call numbers.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Sysno {
    Cputs = 0,
    Getenvid = 2,
    EnvDestroy = 3,
    PageAlloc = 4,
    PageMap = 5,
    PageUnmap = 6,
    Exofork = 7,
    EnvSetStatus = 8,
    EnvSetTrapframe = 9,
    Yield = 11,
    IpcTrySend = 12,
    IpcRecv = 13,
}

impl TryFrom<u32> for Sysno {
    type Error = KernelError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        Ok(match raw {
            0 => Self::Cputs,
            2 => Self::Getenvid,
            3 => Self::EnvDestroy,
            4 => Self::PageAlloc,
            5 => Self::PageMap,
            6 => Self::PageUnmap,
            7 => Self::Exofork,
            8 => Self::EnvSetStatus,
            9 => Self::EnvSetTrapframe,
            11 => Self::Yield,
            12 => Self::IpcTrySend,
            13 => Self::IpcRecv,
            _ => return Err(KernelError::Inval),
        })
    }
}

/// A decoded system-call request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Syscall {
    Cputs {
        va: VirtualAddress,
        len: u32,
    },
    Getenvid,
    EnvDestroy {
        env: EnvId,
    },
    PageAlloc {
        env: EnvId,
        va: VirtualAddress,
        perm: PteFlags,
    },
    PageMap {
        src_env: EnvId,
        src_va: VirtualAddress,
        dst_env: EnvId,
        dst_va: VirtualAddress,
        perm: PteFlags,
    },
    PageUnmap {
        env: EnvId,
        va: VirtualAddress,
    },
    Exofork,
    EnvSetStatus {
        env: EnvId,
        status: u32,
    },
    EnvSetTrapframe {
        env: EnvId,
        frame: VirtualAddress,
    },
    Yield,
    IpcTrySend {
        env: EnvId,
        value: u32,
        src: Option<VirtualAddress>,
        perm: PteFlags,
    },
    IpcRecv {
        dst: Option<VirtualAddress>,
    },
}

/// An address argument where zero means "none".
fn optional_va(raw: u32) -> Option<VirtualAddress> {
    (raw != 0).then(|| VirtualAddress::new(raw))
}

impl Syscall {
    /// Decode the raw call number and argument words.
    ///
    /// Permission words keep only bits [`PteFlags`] knows; validation of
    /// their values is left to the individual calls.
    ///
    /// # Errors
    /// - [`KernelError::Inval`] for an unknown call number.
    pub fn decode(sysno: u32, a: [u32; 5]) -> Result<Self, KernelError> {
        let va = VirtualAddress::new;
        let env = EnvId::from_raw;
        let perm = PteFlags::from_bits_retain;
        Ok(match Sysno::try_from(sysno)? {
            Sysno::Cputs => Self::Cputs {
                va: va(a[0]),
                len: a[1],
            },
            Sysno::Getenvid => Self::Getenvid,
            Sysno::EnvDestroy => Self::EnvDestroy { env: env(a[0]) },
            Sysno::PageAlloc => Self::PageAlloc {
                env: env(a[0]),
                va: va(a[1]),
                perm: perm(a[2]),
            },
            Sysno::PageMap => Self::PageMap {
                src_env: env(a[0]),
                src_va: va(a[1]),
                dst_env: env(a[2]),
                dst_va: va(a[3]),
                perm: perm(a[4]),
            },
            Sysno::PageUnmap => Self::PageUnmap {
                env: env(a[0]),
                va: va(a[1]),
            },
            Sysno::Exofork => Self::Exofork,
            Sysno::EnvSetStatus => Self::EnvSetStatus {
                env: env(a[0]),
                status: a[1],
            },
            Sysno::EnvSetTrapframe => Self::EnvSetTrapframe {
                env: env(a[0]),
                frame: va(a[1]),
            },
            Sysno::Yield => Self::Yield,
            Sysno::IpcTrySend => Self::IpcTrySend {
                env: env(a[0]),
                value: a[1],
                src: optional_va(a[2]),
                perm: perm(a[3]),
            },
            Sysno::IpcRecv => Self::IpcRecv {
                dst: optional_va(a[0]),
            },
        })
    }
}

/// How the caller of a system call continues.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Resume {
    /// Return this value in `eax` and keep running the caller.
    Return(i32),
    /// The caller blocked; run someone else until it is woken.
    Suspend,
    /// The caller gave up the processor, or no longer exists.
    Yield,
}

impl From<Result<i32, KernelError>> for Resume {
    fn from(r: Result<i32, KernelError>) -> Self {
        Self::Return(r.unwrap_or_else(KernelError::code))
    }
}

/// Check a page address argument: page aligned and below `UTOP`.
pub(crate) fn check_user_page(va: VirtualAddress) -> Result<(), KernelError> {
    if va.is_page_aligned() && va.as_u32() < UTOP {
        Ok(())
    } else {
        Err(KernelError::Inval)
    }
}

/// Check a permission argument: `USER | PRESENT` set, nothing outside
/// [`PteFlags::SYSCALL`].
pub(crate) fn check_user_perm(perm: PteFlags) -> Result<(), KernelError> {
    let required = PteFlags::USER | PteFlags::PRESENT;
    if perm.contains(required) && PteFlags::SYSCALL.contains(perm) {
        Ok(())
    } else {
        Err(KernelError::Inval)
    }
}

const fn id_result(id: EnvId) -> i32 {
    id.as_u32().cast_signed()
}

impl<M: PhysMapper, H: Mmu> Kernel<M, H> {
    /// Handle a system-call trap of the running environment: decode its
    /// registers, execute the call and continue as it asks.
    ///
    /// Returns the environment running afterwards.
    pub fn syscall_trap(&mut self) -> Option<EnvId> {
        let index = self.current?;
        let (sysno, args) = self.envs.get(index).tf.syscall_args();
        let resume = match Syscall::decode(sysno, args) {
            Ok(call) => self.dispatch(call),
            Err(e) => Resume::Return(e.code()),
        };
        self.complete(resume)
    }

    /// Apply a [`Resume`] to the running environment.
    ///
    /// Returns the environment running afterwards.
    pub fn complete(&mut self, resume: Resume) -> Option<EnvId> {
        match resume {
            Resume::Return(value) => {
                let index = self.current?;
                self.envs.get_mut(index).tf.eax = value.cast_unsigned();
                self.curenv()
            }
            Resume::Suspend | Resume::Yield => self.schedule(),
        }
    }

    /// Execute `call` on behalf of the running environment.
    pub fn dispatch(&mut self, call: Syscall) -> Resume {
        trace!("{} syscall {call:?}", self.curenv().unwrap_or_default());
        match call {
            Syscall::Cputs { va, len } => self.sys_cputs(va, len),
            Syscall::Getenvid => Resume::Return(self.curenv().map_or(0, id_result)),
            Syscall::EnvDestroy { env } => self.sys_env_destroy(env),
            Syscall::PageAlloc { env, va, perm } => {
                self.sys_page_alloc(env, va, perm).map(|()| 0).into()
            }
            Syscall::PageMap {
                src_env,
                src_va,
                dst_env,
                dst_va,
                perm,
            } => self
                .sys_page_map(src_env, src_va, dst_env, dst_va, perm)
                .map(|()| 0)
                .into(),
            Syscall::PageUnmap { env, va } => self.sys_page_unmap(env, va).map(|()| 0).into(),
            Syscall::Exofork => self.sys_exofork().map(id_result).into(),
            Syscall::EnvSetStatus { env, status } => {
                self.sys_env_set_status(env, status).map(|()| 0).into()
            }
            Syscall::EnvSetTrapframe { env, frame } => self.sys_env_set_trapframe(env, frame),
            Syscall::Yield => Resume::Yield,
            Syscall::IpcTrySend {
                env,
                value,
                src,
                perm,
            } => self.ipc_try_send(env, value, src, perm).map(i32::from).into(),
            Syscall::IpcRecv { dst } => match self.ipc_recv(dst) {
                Ok(()) => Resume::Suspend,
                Err(e) => Resume::Return(e.code()),
            },
        }
    }

    /// Print `[va, va + len)` of the caller's memory to the console.
    ///
    /// A bad range destroys the caller.
    fn sys_cputs(&mut self, va: VirtualAddress, len: u32) -> Resume {
        if self
            .user_mem_assert(EnvId::CURRENT, va, len, PteFlags::empty())
            .is_err()
        {
            return Resume::Yield;
        }
        let mut text = vec![0u8; len as usize];
        if self.user_read(va, &mut text).is_err() {
            return Resume::Yield;
        }
        info!("{}", core::str::from_utf8(&text).unwrap_or("<binary>"));
        self.console_write(&text);
        Resume::Return(0)
    }

    fn sys_env_destroy(&mut self, env: EnvId) -> Resume {
        let was_current = self.resolve(env, true).ok() == self.current;
        match self.env_destroy(env) {
            Ok(()) if was_current => Resume::Yield,
            Ok(()) => Resume::Return(0),
            Err(e) => Resume::Return(e.code()),
        }
    }

    /// Allocate a zeroed page and map it at `va` in `env` with `perm`,
    /// replacing any existing mapping.
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if the caller may not act on `env`.
    /// - [`KernelError::Inval`] for a misaligned `va`, `va >= UTOP` or bad
    ///   permission bits.
    /// - [`KernelError::NoMem`] if no frame or page table is available.
    pub fn sys_page_alloc(
        &mut self,
        env: EnvId,
        va: VirtualAddress,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        let index = self.resolve(env, true)?;
        check_user_page(va)?;
        check_user_perm(perm)?;

        let space = self.space_of(index)?;
        let mut vm = self.vm();
        let frame = vm.frames_mut().alloc_frame().ok_or(KernelError::NoMem)?;
        vm.zero_frame(frame);
        if let Err(e) = vm.insert(space, frame, va, perm) {
            vm.frames_mut().free_frame(frame);
            return Err(e.into());
        }
        Ok(())
    }

    /// Map the page at `src_va` in `src_env` at `dst_va` in `dst_env`.
    ///
    /// # Errors
    /// - [`KernelError::Inval`] for misaligned or out-of-range addresses, bad
    ///   permission bits, an unmapped source or `WRITABLE` requested for a
    ///   read-only source.
    /// - [`KernelError::BadEnv`] if the caller may not act on either
    ///   environment.
    /// - [`KernelError::NoMem`] if a page table is needed and none is left.
    pub fn sys_page_map(
        &mut self,
        src_env: EnvId,
        src_va: VirtualAddress,
        dst_env: EnvId,
        dst_va: VirtualAddress,
        perm: PteFlags,
    ) -> Result<(), KernelError> {
        check_user_page(src_va)?;
        check_user_page(dst_va)?;
        let src = self.resolve(src_env, true)?;
        let dst = self.resolve(dst_env, true)?;
        check_user_perm(perm)?;

        let (src_space, dst_space) = (self.space_of(src)?, self.space_of(dst)?);
        let mut vm = self.vm();
        let (frame, slot) = vm.lookup(src_space, src_va).ok_or(KernelError::Inval)?;
        if perm.contains(PteFlags::WRITABLE) && !vm.read_slot(slot).writable() {
            return Err(KernelError::Inval);
        }
        vm.insert(dst_space, frame, dst_va, perm)?;
        Ok(())
    }

    /// Unmap `va` in `env`; unmapped addresses are fine.
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if the caller may not act on `env`.
    /// - [`KernelError::Inval`] for a misaligned `va` or `va >= UTOP`.
    pub fn sys_page_unmap(&mut self, env: EnvId, va: VirtualAddress) -> Result<(), KernelError> {
        let index = self.resolve(env, true)?;
        check_user_page(va)?;
        let space = self.space_of(index)?;
        self.vm().remove(space, va);
        Ok(())
    }

    /// Create a child of the caller with an empty address space and a copy
    /// of the caller's registers, except that the child sees `0` in `eax`.
    /// The child is not runnable.
    ///
    /// # Errors
    /// - [`KernelError::NoFreeEnv`] if the table is full.
    /// - [`KernelError::NoMem`] if the child's page directory cannot be
    ///   allocated.
    pub fn sys_exofork(&mut self) -> Result<EnvId, KernelError> {
        let parent = self.current_index()?;
        let parent_id = self.envs.get(parent).id;
        let child = self.env_alloc(parent_id)?;

        let tf = self.envs.get(parent).tf;
        let env = self.envs.get_mut(child.index());
        env.tf = TrapFrame { eax: 0, ..tf };
        env.status = EnvStatus::NotRunnable;
        Ok(child)
    }

    /// Set the status of `env` to runnable (1) or not runnable (2).
    ///
    /// # Errors
    /// - [`KernelError::Inval`] for any other status value.
    /// - [`KernelError::BadEnv`] if the caller may not act on `env`.
    pub fn sys_env_set_status(&mut self, env: EnvId, status: u32) -> Result<(), KernelError> {
        let status = EnvStatus::from_user(status).ok_or(KernelError::Inval)?;
        let index = self.resolve(env, true)?;
        self.envs.get_mut(index).status = status;
        Ok(())
    }

    /// Replace the registers of `env` with `tf`, keeping interrupts enabled.
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if the caller may not act on `env`.
    /// - [`KernelError::Inval`] if `tf` would resume at or above `UTOP`.
    pub fn env_set_trapframe(&mut self, env: EnvId, tf: TrapFrame) -> Result<(), KernelError> {
        let index = self.resolve(env, true)?;
        if tf.eip >= UTOP || tf.esp > UTOP {
            return Err(KernelError::Inval);
        }
        self.envs.get_mut(index).tf = TrapFrame {
            eflags: tf.eflags | FL_IF,
            ..tf
        };
        Ok(())
    }

    /// [`env_set_trapframe`](Self::env_set_trapframe) with the frame read
    /// from the caller's memory at `frame`. A bad pointer destroys the
    /// caller.
    fn sys_env_set_trapframe(&mut self, env: EnvId, frame: VirtualAddress) -> Resume {
        #[allow(clippy::cast_possible_truncation)]
        let size = TrapFrame::SIZE as u32;
        if self
            .user_mem_assert(EnvId::CURRENT, frame, size, PteFlags::empty())
            .is_err()
        {
            return Resume::Yield;
        }
        let mut bytes = [0u8; TrapFrame::SIZE];
        if self.user_read(frame, &mut bytes).is_err() {
            return Resume::Yield;
        }
        self.env_set_trapframe(env, TrapFrame::from_bytes(&bytes))
            .map(|()| 0)
            .into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_maps_register_words() {
        let call = Syscall::decode(5, [0, 0x0080_0000, 0x1001, 0x0040_0000, 0x7]).unwrap();
        assert_eq!(
            call,
            Syscall::PageMap {
                src_env: EnvId::CURRENT,
                src_va: VirtualAddress::new(0x0080_0000),
                dst_env: EnvId::from_raw(0x1001),
                dst_va: VirtualAddress::new(0x0040_0000),
                perm: PteFlags::USER | PteFlags::WRITABLE | PteFlags::PRESENT,
            }
        );
        assert_eq!(
            Syscall::decode(13, [0; 5]),
            Ok(Syscall::IpcRecv { dst: None })
        );
        assert_eq!(Syscall::decode(1, [0; 5]), Err(KernelError::Inval));
        assert_eq!(Syscall::decode(99, [0; 5]), Err(KernelError::Inval));
    }

    #[test]
    fn permission_words_must_be_user_present_subset() {
        assert!(check_user_perm(PteFlags::USER | PteFlags::PRESENT).is_ok());
        assert!(check_user_perm(PteFlags::SYSCALL).is_ok());
        assert!(check_user_perm(PteFlags::USER).is_err());
        assert!(
            check_user_perm(PteFlags::USER | PteFlags::PRESENT | PteFlags::GLOBAL).is_err()
        );
    }

    #[test]
    fn page_arguments_must_be_aligned_user_addresses() {
        assert!(check_user_page(VirtualAddress::new(0)).is_ok());
        assert!(check_user_page(VirtualAddress::new(UTOP - 0x1000)).is_ok());
        assert!(check_user_page(VirtualAddress::new(UTOP)).is_err());
        assert!(check_user_page(VirtualAddress::new(0x0080_0010)).is_err());
    }

    #[test]
    fn error_results_become_negative_codes() {
        assert_eq!(Resume::from(Err(KernelError::IpcNotRecv)), Resume::Return(-7));
        assert_eq!(Resume::from(Ok(1)), Resume::Return(1));
    }
}
