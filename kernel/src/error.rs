//! Kernel-wide error types
//!
//! Every fallible operation in the memory and process core returns its
//! outcome through [`KernelResult`]. Callers unwind their own allocations
//! before propagating with `?`; invariant violations panic instead of
//! returning an error.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical frame allocator has no frames left
    OutOfFrames,
    /// Kernel heap allocation failed
    OutOfKernelHeap,
    /// The kernel-stack virtual region is exhausted
    KernelStackExhausted,

    /// Address is not aligned as required
    BadAlignment { addr: usize },
    /// A zero-sized request was made where a size is required
    ZeroSize,
    /// A user mapping or span reaches into kernel space
    KernelSpaceViolation { addr: usize },
    /// Generic invalid argument
    InvalidArgument { name: &'static str, value: usize },

    /// ELF header or segment geometry failed validation
    InvalidExecutable { reason: &'static str },

    /// A VMA insert overlaps an existing area or is malformed
    VmaOverlap { start: usize, end: usize },

    /// Virtual-to-physical lookup hit an absent PDE/PTE
    NotMapped { addr: usize },

    /// Multiboot magic register did not match the Multiboot2 value
    BadMagic { magic: u32 },
    /// The Multiboot info block carries no memory-map tag
    NoMemoryMap,
    /// No usable RAM region of the required size was found
    NoUsableMemory,

    /// Filesystem collaborator reported a failure or is absent
    FileUnavailable,
    /// Subsystem used before its init phase completed
    NotInitialized { subsystem: &'static str },
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfFrames => write!(f, "out of physical frames"),
            Self::OutOfKernelHeap => write!(f, "out of kernel heap"),
            Self::KernelStackExhausted => {
                write!(f, "kernel-stack virtual region exhausted")
            }
            Self::BadAlignment { addr } => {
                write!(f, "address {:#010x} is not page-aligned", addr)
            }
            Self::ZeroSize => write!(f, "zero-sized request"),
            Self::KernelSpaceViolation { addr } => {
                write!(f, "address {:#010x} violates user-space bounds", addr)
            }
            Self::InvalidArgument { name, value } => {
                write!(f, "invalid argument '{}': {:#x}", name, value)
            }
            Self::InvalidExecutable { reason } => {
                write!(f, "invalid executable: {}", reason)
            }
            Self::VmaOverlap { start, end } => write!(
                f,
                "VMA [{:#010x}-{:#010x}) overlaps an existing area",
                start, end
            ),
            Self::NotMapped { addr } => write!(f, "{:#010x} is not mapped", addr),
            Self::BadMagic { magic } => {
                write!(f, "bad Multiboot2 magic {:#010x}", magic)
            }
            Self::NoMemoryMap => write!(f, "Multiboot info has no memory-map tag"),
            Self::NoUsableMemory => write!(f, "no usable RAM region found"),
            Self::FileUnavailable => write!(f, "file could not be read"),
            Self::NotInitialized { subsystem } => {
                write!(f, "subsystem not initialized: {}", subsystem)
            }
        }
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn display_carries_the_address() {
        extern crate std;
        use std::string::ToString;

        let err = KernelError::NotMapped { addr: 0x0804_8000 };
        assert!(err.to_string().contains("0x08048000"));

        let err = KernelError::BadMagic { magic: 0x2BAD_B002 };
        assert!(err.to_string().contains("0x2badb002"));
    }
}
