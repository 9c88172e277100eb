//! # Environments
//!
//! An environment is a user process: a saved register set, an address
//! space and the rendezvous state used by IPC. The [`EnvTable`] is a fixed
//! array of records addressed by [`EnvId`], whose low bits select the slot
//! and whose high bits carry a generation so that stale ids are rejected
//! after a slot is reused.

use crate::KernelError;
use alloc::vec::Vec;
use core::fmt;
use kernel_info::memory::{NENV, UTEXT};
use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{AddressSpace, PteFlags};

/// Bits of an [`EnvId`] below this shift never hold the generation.
const GENERATION_SHIFT: u32 = 12;

#[allow(clippy::cast_possible_truncation)]
const INDEX_MASK: u32 = NENV as u32 - 1;

/// Interrupt-enable flag in `eflags`.
pub const FL_IF: u32 = 1 << 9;

/// Environment identifier: generation in the high bits, slot index in the
/// low bits.
///
/// At the system-call boundary the id `0` means "the calling environment".
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct EnvId(u32);

impl EnvId {
    /// The calling environment, or no environment at all as a parent id.
    pub const CURRENT: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Slot in the environment table.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        (self.0 & INDEX_MASK) as usize
    }

    /// The id for the next occupant of slot `index`, given the id of the
    /// previous one.
    fn next_generation(previous: Self, index: usize) -> Self {
        let mut generation = previous.0.wrapping_add(1 << GENERATION_SHIFT) & !INDEX_MASK;
        // Keep ids positive so they never collide with error codes.
        if generation == 0 || generation > i32::MAX as u32 {
            generation = 1 << GENERATION_SHIFT;
        }
        #[allow(clippy::cast_possible_truncation)]
        Self(generation | index as u32)
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:08x}]", self.0)
    }
}

/// Scheduling state of an environment slot.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum EnvStatus {
    #[default]
    Free = 0,
    Runnable = 1,
    NotRunnable = 2,
}

impl EnvStatus {
    /// Statuses a user environment may request for another one.
    #[must_use]
    pub const fn from_user(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Runnable),
            2 => Some(Self::NotRunnable),
            _ => None,
        }
    }
}

/// Saved user register state.
///
/// The general-purpose registers are in `pushal` order followed by what the
/// processor pushes on a trap from user mode. A user environment hands the
/// kernel a trap frame as ten consecutive little-endian words in exactly
/// this order.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TrapFrame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    /// System-call number on entry, return value on exit.
    pub eax: u32,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
}

impl TrapFrame {
    /// Size of the user-visible encoding in bytes.
    pub const SIZE: usize = 10 * 4;

    /// Decode the user-visible encoding.
    #[must_use]
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut words = [0u32; 10];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        let [edi, esi, ebp, ebx, edx, ecx, eax, eip, eflags, esp] = words;
        Self {
            edi,
            esi,
            ebp,
            ebx,
            edx,
            ecx,
            eax,
            eip,
            eflags,
            esp,
        }
    }

    /// Encode into the user-visible layout.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let words = [
            self.edi, self.esi, self.ebp, self.ebx, self.edx, self.ecx, self.eax, self.eip,
            self.eflags, self.esp,
        ];
        let mut out = [0u8; Self::SIZE];
        for (chunk, word) in out.chunks_exact_mut(4).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// System-call number and arguments, in the register convention
    /// `eax, edx, ecx, ebx, edi, esi`.
    #[must_use]
    pub const fn syscall_args(&self) -> (u32, [u32; 5]) {
        (self.eax, [self.edx, self.ecx, self.ebx, self.edi, self.esi])
    }
}

/// How page faults of an environment are resolved.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FaultHandler {
    /// Write faults on copy-on-write pages get a private copy; any other
    /// fault is fatal.
    CopyOnWrite,
}

/// Rendezvous state of the receiving side of IPC.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct IpcState {
    /// Blocked in `ipc_recv`, waiting for a sender.
    pub recving: bool,
    /// Where a granted page should be mapped, as declared at receive time.
    pub dst_va: Option<VirtualAddress>,
    /// Sender of the last delivered message.
    pub from: EnvId,
    /// Value of the last delivered message.
    pub value: u32,
    /// Permission of the page granted with the last message; empty if none.
    pub perm: PteFlags,
}

/// One slot of the environment table.
#[derive(Clone, Debug)]
pub struct Env {
    pub id: EnvId,
    pub parent: EnvId,
    pub status: EnvStatus,
    pub tf: TrapFrame,
    pub space: Option<AddressSpace>,
    /// End of the program region; fork duplicates `[UTEXT, high_water)`.
    pub high_water: VirtualAddress,
    pub fault_handler: Option<FaultHandler>,
    /// Number of page faults raised by this environment.
    pub page_faults: u32,
    pub ipc: IpcState,
    /// Times this environment was picked by the scheduler.
    pub runs: u32,
}

impl Env {
    fn vacant() -> Self {
        Self {
            id: EnvId::CURRENT,
            parent: EnvId::CURRENT,
            status: EnvStatus::Free,
            tf: TrapFrame::default(),
            space: None,
            high_water: VirtualAddress::new(UTEXT),
            fault_handler: None,
            page_faults: 0,
            ipc: IpcState::default(),
            runs: 0,
        }
    }

    #[must_use]
    pub const fn is_free(&self) -> bool {
        matches!(self.status, EnvStatus::Free)
    }
}

/// Fixed-capacity table of environments.
pub struct EnvTable {
    envs: Vec<Env>,
}

impl EnvTable {
    /// A table with `capacity` free slots.
    ///
    /// # Panics
    /// If `capacity` is zero or exceeds [`NENV`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity <= NENV,
            "environment table capacity {capacity} outside 1..={NENV}"
        );
        Self {
            envs: (0..capacity).map(|_| Env::vacant()).collect(),
        }
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.envs.len()
    }

    /// Lowest free slot.
    #[must_use]
    pub fn free_slot(&self) -> Option<usize> {
        self.envs.iter().position(Env::is_free)
    }

    /// Occupy the free slot `index` with a fresh, not yet runnable
    /// environment.
    pub(crate) fn occupy(&mut self, index: usize, parent: EnvId, space: AddressSpace) -> EnvId {
        let slot = &mut self.envs[index];
        debug_assert!(slot.is_free(), "slot {index} is occupied");
        let id = EnvId::next_generation(slot.id, index);
        *slot = Env {
            id,
            parent,
            status: EnvStatus::NotRunnable,
            tf: TrapFrame {
                eflags: FL_IF,
                ..TrapFrame::default()
            },
            space: Some(space),
            ..Env::vacant()
        };
        id
    }

    /// Mark slot `index` free and hand back its address space.
    pub(crate) fn vacate(&mut self, index: usize) -> Option<AddressSpace> {
        let slot = &mut self.envs[index];
        let space = slot.space.take();
        let id = slot.id;
        *slot = Env::vacant();
        // The stale id survives so the next occupant gets a new generation.
        slot.id = id;
        space
    }

    /// Resolve `id` to a slot index.
    ///
    /// [`EnvId::CURRENT`] names `current`. With `check_perm`, the target
    /// must be `current` itself or one of its immediate children.
    ///
    /// # Errors
    /// - [`KernelError::BadEnv`] if the id is stale, the slot is free or the
    ///   permission check fails.
    pub fn resolve(
        &self,
        id: EnvId,
        current: Option<usize>,
        check_perm: bool,
    ) -> Result<usize, KernelError> {
        if id == EnvId::CURRENT {
            return current.ok_or(KernelError::BadEnv);
        }
        let index = id.index();
        let env = self.envs.get(index).ok_or(KernelError::BadEnv)?;
        if env.is_free() || env.id != id {
            return Err(KernelError::BadEnv);
        }
        if check_perm {
            let Some(cur) = current.map(|c| &self.envs[c]) else {
                return Err(KernelError::BadEnv);
            };
            if env.id != cur.id && env.parent != cur.id {
                return Err(KernelError::BadEnv);
            }
        }
        Ok(index)
    }

    /// Round-robin choice of the next runnable environment after `after`.
    ///
    /// Slot 0 is the idle environment: it is only chosen when nothing else
    /// is runnable. The environment at `after` may be chosen again.
    #[must_use]
    pub fn next_runnable(&self, after: Option<usize>) -> Option<usize> {
        let n = self.envs.len();
        let start = after.unwrap_or(0);
        (1..=n)
            .map(|step| (start + step) % n)
            .find(|&i| i != 0 && self.envs[i].status == EnvStatus::Runnable)
            .or_else(|| (self.envs[0].status == EnvStatus::Runnable).then_some(0))
    }

    #[must_use]
    pub fn get(&self, index: usize) -> &Env {
        &self.envs[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut Env {
        &mut self.envs[index]
    }

    /// Occupied slots.
    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.envs.iter().filter(|e| !e.is_free())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::FrameNumber;

    fn space(n: u32) -> AddressSpace {
        AddressSpace::from_root(FrameNumber::new(n))
    }

    #[test]
    fn ids_carry_generation_and_index() {
        let mut table = EnvTable::new(4);
        let a = table.occupy(0, EnvId::CURRENT, space(1));
        let b = table.occupy(1, a, space(2));
        assert_eq!(a.as_u32(), 0x1000);
        assert_eq!(b.as_u32(), 0x1001);
        assert_eq!(b.index(), 1);

        table.vacate(1);
        let c = table.occupy(1, a, space(3));
        assert_eq!(c.as_u32(), 0x2001);
        assert_eq!(table.resolve(b, Some(0), false), Err(KernelError::BadEnv));
        assert_eq!(table.resolve(c, Some(0), false), Ok(1));
    }

    #[test]
    fn permission_check_allows_self_and_children_only() {
        let mut table = EnvTable::new(4);
        let a = table.occupy(0, EnvId::CURRENT, space(1));
        let b = table.occupy(1, a, space(2));
        let c = table.occupy(2, b, space(3));

        assert_eq!(table.resolve(EnvId::CURRENT, Some(0), true), Ok(0));
        assert_eq!(table.resolve(b, Some(0), true), Ok(1));
        assert_eq!(table.resolve(c, Some(0), true), Err(KernelError::BadEnv));
        assert_eq!(table.resolve(c, Some(0), false), Ok(2));
        assert_eq!(table.resolve(a, Some(1), true), Err(KernelError::BadEnv));
        assert_eq!(table.resolve(EnvId::CURRENT, None, false), Err(KernelError::BadEnv));
    }

    #[test]
    fn scheduler_is_round_robin_and_skips_idle() {
        let mut table = EnvTable::new(4);
        for i in 0..3 {
            table.occupy(i, EnvId::CURRENT, space(i as u32 + 1));
            table.get_mut(i).status = EnvStatus::Runnable;
        }
        assert_eq!(table.next_runnable(None), Some(1));
        assert_eq!(table.next_runnable(Some(1)), Some(2));
        assert_eq!(table.next_runnable(Some(2)), Some(1));

        table.get_mut(1).status = EnvStatus::NotRunnable;
        assert_eq!(table.next_runnable(Some(2)), Some(2));
        table.get_mut(2).status = EnvStatus::NotRunnable;
        assert_eq!(table.next_runnable(Some(2)), Some(0));
        table.get_mut(0).status = EnvStatus::NotRunnable;
        assert_eq!(table.next_runnable(Some(2)), None);
    }

    #[test]
    fn trap_frame_encoding_is_ten_words() {
        let tf = TrapFrame {
            eax: 7,
            eip: 0x0080_0020,
            esp: 0xEEBF_E000,
            eflags: FL_IF,
            ..TrapFrame::default()
        };
        let bytes = tf.to_bytes();
        assert_eq!(&bytes[24..28], &7u32.to_le_bytes());
        assert_eq!(TrapFrame::from_bytes(&bytes), tf);
    }
}
