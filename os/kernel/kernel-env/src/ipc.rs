//! # Rendezvous IPC
//!
//! A receiver blocks in [`Kernel::ipc_recv`], optionally naming the page
//! where it will accept a mapping. A sender's [`Kernel::ipc_try_send`]
//! either completes the rendezvous at once or fails with
//! [`KernelError::IpcNotRecv`]; senders never block, so retrying is up to
//! user space.
//!
//! ```text
//!  receiver                         sender
//!  ipc_recv(dst) ── NotRunnable ─┐
//!                                 ├─ ipc_try_send(value, src, perm)
//!  resumes, eax = 0 ◄─ Runnable ─┘      returns 1 if a page moved
//! ```
//!
//! A page moves only when both sides ask for it: the sender passes a source
//! page and the receiver declared a destination.

use crate::env::{EnvId, EnvStatus};
use crate::syscall::{check_user_page, check_user_perm};
use crate::{Kernel, KernelError};
use kernel_memory_addresses::{FrameNumber, VirtualAddress};
use kernel_vmem::{Mmu, PhysMapper, PteFlags};
use log::debug;

impl<M: PhysMapper, H: Mmu> Kernel<M, H> {
    /// Block the running environment until a message arrives.
    ///
    /// With `dst`, a page sent along with the message is mapped there,
    /// replacing whatever was mapped before.
    ///
    /// # Errors
    /// - [`KernelError::Inval`] if `dst` is misaligned or not below `UTOP`.
    /// - [`KernelError::BadEnv`] if no environment is running.
    pub fn ipc_recv(&mut self, dst: Option<VirtualAddress>) -> Result<(), KernelError> {
        if let Some(va) = dst {
            check_user_page(va)?;
        }
        let index = self.current_index()?;
        let env = self.envs.get_mut(index);
        env.ipc.recving = true;
        env.ipc.dst_va = dst;
        env.status = EnvStatus::NotRunnable;
        debug!("{} waiting for a message", env.id);
        Ok(())
    }

    /// Deliver `value`, and optionally the page at `src` with `perm`, to
    /// `target` if it is blocked in [`ipc_recv`](Self::ipc_recv).
    ///
    /// Returns whether a page was mapped into the receiver. On success the
    /// receiver becomes runnable with `0` as the result of its receive.
    ///
    /// # Errors
    /// - [`KernelError::Inval`] if `src` is misaligned, not below `UTOP`,
    ///   unmapped, `perm` is not a valid user permission or asks for
    ///   `WRITABLE` on a read-only page.
    /// - [`KernelError::BadEnv`] if `target` does not exist.
    /// - [`KernelError::IpcNotRecv`] if `target` is not receiving.
    /// - [`KernelError::NoMem`] if the receiver needed a page table and
    ///   none was left; nothing is delivered then.
    pub fn ipc_try_send(
        &mut self,
        target: EnvId,
        value: u32,
        src: Option<VirtualAddress>,
        perm: PteFlags,
    ) -> Result<bool, KernelError> {
        let sender = self.current_index()?;
        let sender_id = self.envs.get(sender).id;

        let page = match src {
            Some(va) => Some(self.outgoing_page(sender, va, perm)?),
            None => None,
        };

        let receiver = self.resolve(target, false)?;
        let ipc = self.envs.get(receiver).ipc;
        if !ipc.recving {
            return Err(KernelError::IpcNotRecv);
        }

        let mut granted = PteFlags::empty();
        if let (Some(frame), Some(dst)) = (page, ipc.dst_va) {
            let space = self.space_of(receiver)?;
            self.vm().insert(space, frame, dst, perm)?;
            granted = perm;
        }

        let env = self.envs.get_mut(receiver);
        env.ipc.recving = false;
        env.ipc.from = sender_id;
        env.ipc.value = value;
        env.ipc.perm = granted;
        env.tf.eax = 0;
        env.status = EnvStatus::Runnable;
        debug!(
            "{sender_id} sent {value:#x} to {}{}",
            env.id,
            if granted.is_empty() { "" } else { " with a page" }
        );
        Ok(!granted.is_empty())
    }

    /// Validate the page a sender offers and find its frame.
    fn outgoing_page(
        &mut self,
        sender: usize,
        va: VirtualAddress,
        perm: PteFlags,
    ) -> Result<FrameNumber, KernelError> {
        check_user_page(va)?;
        check_user_perm(perm)?;
        let space = self.space_of(sender)?;
        let vm = self.vm();
        let (frame, slot) = vm.lookup(space, va).ok_or(KernelError::Inval)?;
        if perm.contains(PteFlags::WRITABLE) && !vm.read_slot(slot).writable() {
            return Err(KernelError::Inval);
        }
        Ok(frame)
    }
}
