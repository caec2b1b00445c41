//! Kernel Error Types
//!
//! Recoverable failures are typed values; invariant violations (double free,
//! refcount underflow, frame out of range) panic at the point of detection
//! and never appear here.
//!
//! # Propagation
//! - [`MemoryError`] flows up from the frame allocator through page table
//!   and heap code
//! - [`Errno`] is what a syscall layer hands back to userspace

use core::fmt;

/// Error type for memory management operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// No physical frames left to satisfy the request.
    OutOfFrames,
    /// The virtual address is already mapped.
    AlreadyMapped,
    /// The virtual address is not mapped.
    NotMapped,
    /// An address or size is not page aligned.
    Misaligned,
    /// The address lies outside every range the caller may touch.
    InvalidAddress,
    /// The mapping does not grant the requested access.
    InvalidPermissions,
    /// The heap's reserved virtual range is used up.
    HeapExhausted,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfFrames => write!(f, "out of physical frames"),
            Self::AlreadyMapped => write!(f, "virtual address already mapped"),
            Self::NotMapped => write!(f, "virtual address not mapped"),
            Self::Misaligned => write!(f, "address not page aligned"),
            Self::InvalidAddress => write!(f, "address outside any accessible range"),
            Self::InvalidPermissions => write!(f, "mapping does not permit this access"),
            Self::HeapExhausted => write!(f, "kernel heap virtual range exhausted"),
        }
    }
}

/// Unix error codes returned across the syscall boundary.
#[repr(i64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Errno {
    /// No such process
    Esrch = -3,
    /// No child processes
    Echild = -10,
    /// Try again
    Eagain = -11,
    /// Out of memory
    Enomem = -12,
    /// Bad address (invalid pointer)
    Efault = -14,
    /// Resource busy
    Ebusy = -16,
    /// Invalid argument
    Einval = -22,
}

impl Errno {
    /// Raw value for a syscall return register.
    #[inline]
    pub const fn as_i64(self) -> i64 {
        self as i64
    }
}

impl From<MemoryError> for Errno {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::OutOfFrames | MemoryError::HeapExhausted => Errno::Enomem,
            MemoryError::NotMapped
            | MemoryError::InvalidAddress
            | MemoryError::InvalidPermissions => Errno::Efault,
            MemoryError::AlreadyMapped | MemoryError::Misaligned => Errno::Einval,
        }
    }
}

/// Error type for process and thread management.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// No live process with that pid.
    NoSuchProcess,
    /// No thread with that tid.
    NoSuchThread,
    /// The process is not a child of the caller.
    NotAChild,
    /// The child has not exited yet.
    WouldBlock,
    /// One of the child's threads is still on a CPU.
    Busy,
    /// The thread or process is in the wrong state for this call.
    InvalidState,
    /// A memory operation failed underneath.
    Memory(MemoryError),
}

impl SchedError {
    /// Code handed back to userspace.
    pub const fn errno(self) -> Errno {
        match self {
            Self::NoSuchProcess | Self::NoSuchThread => Errno::Esrch,
            Self::NotAChild => Errno::Echild,
            Self::WouldBlock => Errno::Eagain,
            Self::Busy => Errno::Ebusy,
            Self::InvalidState => Errno::Einval,
            Self::Memory(MemoryError::OutOfFrames | MemoryError::HeapExhausted) => Errno::Enomem,
            Self::Memory(
                MemoryError::NotMapped | MemoryError::InvalidAddress | MemoryError::InvalidPermissions,
            ) => Errno::Efault,
            Self::Memory(MemoryError::AlreadyMapped | MemoryError::Misaligned) => Errno::Einval,
        }
    }
}

impl From<MemoryError> for SchedError {
    fn from(err: MemoryError) -> Self {
        Self::Memory(err)
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuchProcess => write!(f, "no such process"),
            Self::NoSuchThread => write!(f, "no such thread"),
            Self::NotAChild => write!(f, "not a child of the caller"),
            Self::WouldBlock => write!(f, "child still running"),
            Self::Busy => write!(f, "thread still on a CPU"),
            Self::InvalidState => write!(f, "invalid state for this operation"),
            Self::Memory(err) => write!(f, "memory: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_failures_become_enomem() {
        assert_eq!(Errno::from(MemoryError::OutOfFrames), Errno::Enomem);
        assert_eq!(Errno::from(MemoryError::HeapExhausted).as_i64(), -12);
    }

    #[test]
    fn bad_pointers_become_efault() {
        assert_eq!(Errno::from(MemoryError::InvalidAddress), Errno::Efault);
        assert_eq!(Errno::from(MemoryError::InvalidPermissions), Errno::Efault);
    }

    #[test]
    fn sched_errors_map_to_errno() {
        assert_eq!(SchedError::NotAChild.errno(), Errno::Echild);
        assert_eq!(SchedError::from(MemoryError::OutOfFrames).errno(), Errno::Enomem);
        assert_eq!(
            SchedError::Memory(MemoryError::Misaligned).errno(),
            Errno::from(MemoryError::Misaligned)
        );
    }
}
