use kernel_alloc::AllocError;
use kernel_vmem::{MemoryFault, VmError};

/// Errors returned to user environments.
///
/// At the system-call boundary each variant becomes a small negative
/// integer; see [`KernelError::code`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    /// The environment does not exist or the caller may not act on it.
    #[error("bad environment")]
    BadEnv,
    /// Malformed argument: misaligned address, address at or above `UTOP`,
    /// unknown system call or disallowed permission bits.
    #[error("invalid parameter")]
    Inval,
    /// No physical frame was available.
    #[error("out of memory")]
    NoMem,
    /// The environment table is full.
    #[error("out of environments")]
    NoFreeEnv,
    /// A user pointer failed validation.
    #[error("memory fault")]
    Fault,
    /// The IPC target is not blocked in `ipc_recv`.
    #[error("env is not receiving")]
    IpcNotRecv,
}

impl KernelError {
    /// The negative value placed in `eax`.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::BadEnv => -2,
            Self::Inval => -3,
            Self::NoMem => -4,
            Self::NoFreeEnv => -5,
            Self::Fault => -6,
            Self::IpcNotRecv => -7,
        }
    }
}

impl From<VmError> for KernelError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::OutOfMemory => Self::NoMem,
            VmError::ReservedRegion(_) => Self::Inval,
        }
    }
}

impl From<AllocError> for KernelError {
    fn from(e: AllocError) -> Self {
        match e {
            AllocError::OutOfMemory { .. } => Self::NoMem,
        }
    }
}

impl From<MemoryFault> for KernelError {
    fn from(_: MemoryFault) -> Self {
        Self::Fault
    }
}
