//! Kernel error types for cinder
//!
//! Kernel-internal code reports failures through [`KernelError`], which
//! carries enough payload to diagnose the failure at the point it is
//! logged. At the system-call boundary every error collapses to one of the
//! stable negative error numbers in [`errno`].

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    OutOfMemory {
        requested: usize,
    },
    InvalidAddress {
        addr: usize,
    },
    UnmappedMemory {
        addr: usize,
    },

    /// Process- and thread-related errors
    ProcessNotFound {
        pid: usize,
    },
    ThreadNotFound {
        tid: usize,
    },
    BadDescriptor {
        fd: usize,
    },
    DescriptorOutOfRange {
        fd: usize,
    },

    /// Stream and device errors
    DeviceError {
        device: &'static str,
        code: u32,
    },
    DeviceBusy {
        device: &'static str,
    },
    ReadOnlyDevice {
        device: &'static str,
    },
    StreamClosed,

    /// Filesystem errors
    FsError(FsError),

    /// ELF loader errors
    ElfError(ElfError),

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    OperationNotSupported {
        operation: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
    NotInitialized {
        subsystem: &'static str,
    },
}

/// Filesystem-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// File name not present in the directory
    NotFound,
    /// All open-file slots are in use
    TooManyOpenFiles,
    /// Filesystem already mounted
    AlreadyMounted,
    /// Boot block counts are unusable (zero inodes or data blocks)
    BadBootBlock,
    /// Block index outside the inode's data-block array
    BlockOutOfRange,
    /// Short transfer on the backing device
    IoError,
}

/// ELF loader errors. One variant per rejection so callers (and tests)
/// can tell exactly which validation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// Could not read the 64-byte ELF header
    HeaderRead,
    /// Magic bytes are not 0x7f 'E' 'L' 'F'
    BadMagic,
    /// Not a 64-bit image
    BadClass,
    /// Not little-endian
    BadEndian,
    /// Not ET_EXEC or not RV64
    BadTypeOrMachine,
    /// Seeking in the backing stream failed
    Seek,
    /// A PT_LOAD segment lies outside the user region
    SegmentBounds,
    /// A PT_LOAD segment reaches into the user stack page
    StackOverlap,
    /// Short read while loading a segment
    SegmentRead,
    /// Mapping the segment's pages failed
    MapFailure,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Stable error numbers of the system-call ABI. Returned to user space
/// negated; success is non-negative.
pub mod errno {
    /// Invalid argument, bad pointer, zero duration
    pub const EINVAL: i64 = 1;
    /// Device already opened
    pub const EBUSY: i64 = 2;
    /// Unknown control opcode
    pub const ENOTSUP: i64 = 3;
    /// No such device
    pub const ENODEV: i64 = 4;
    /// Device I/O failure
    pub const EIO: i64 = 5;
    /// Executable image rejected
    pub const EBADFMT: i64 = 6;
    /// Descriptor out of range or unused
    pub const EBADFD: i64 = 7;
    /// Descriptor slot out of range on open
    pub const EMFILE: i64 = 8;
}

impl KernelError {
    /// Collapse to the negative ABI error number.
    pub fn to_errno(self) -> i64 {
        let e = match self {
            Self::BadDescriptor { .. } | Self::StreamClosed => errno::EBADFD,
            Self::DescriptorOutOfRange { .. } => errno::EMFILE,
            Self::OperationNotSupported { .. } => errno::ENOTSUP,
            Self::DeviceBusy { .. } => errno::EBUSY,
            Self::DeviceError { .. } | Self::FsError(FsError::IoError) => errno::EIO,
            Self::ElfError(_) => errno::EBADFMT,
            Self::NotInitialized { .. } => errno::ENODEV,
            _ => errno::EINVAL,
        };
        -e
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory: requested {} bytes", requested)
            }
            Self::InvalidAddress { addr } => write!(f, "Invalid address: {:#x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "Unmapped memory at {:#x}", addr),
            Self::ProcessNotFound { pid } => write!(f, "Process {} not found", pid),
            Self::ThreadNotFound { tid } => write!(f, "Thread {} not found", tid),
            Self::BadDescriptor { fd } => write!(f, "Descriptor {} is not in use", fd),
            Self::DescriptorOutOfRange { fd } => write!(f, "Descriptor {} out of range", fd),
            Self::DeviceError { device, code } => {
                write!(f, "Device error on {}: status {}", device, code)
            }
            Self::DeviceBusy { device } => write!(f, "Device {} already opened", device),
            Self::ReadOnlyDevice { device } => write!(f, "Device {} is read-only", device),
            Self::StreamClosed => write!(f, "Stream is closed"),
            Self::FsError(e) => write!(f, "Filesystem error: {:?}", e),
            Self::ElfError(e) => write!(f, "ELF error: {:?}", e),
            Self::InvalidArgument { name, value } => {
                write!(f, "Invalid argument '{}': {}", name, value)
            }
            Self::OperationNotSupported { operation } => {
                write!(f, "Operation not supported: {}", operation)
            }
            Self::ResourceExhausted { resource } => write!(f, "Resource exhausted: {}", resource),
            Self::NotInitialized { subsystem } => {
                write!(f, "Subsystem not initialized: {}", subsystem)
            }
        }
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::FsError(err)
    }
}

impl From<ElfError> for KernelError {
    fn from(err: ElfError) -> Self {
        Self::ElfError(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn errno_mapping_is_stable() -> KernelResult<()> {
        assert_eq!(
            KernelError::BadDescriptor { fd: 3 }.to_errno(),
            -errno::EBADFD
        );
        assert_eq!(
            KernelError::DescriptorOutOfRange { fd: 99 }.to_errno(),
            -errno::EMFILE
        );
        assert_eq!(
            KernelError::OperationNotSupported { operation: "ioctl" }.to_errno(),
            -errno::ENOTSUP
        );
        assert_eq!(
            KernelError::DeviceBusy { device: "blk" }.to_errno(),
            -errno::EBUSY
        );
        assert_eq!(
            KernelError::InvalidAddress { addr: 0 }.to_errno(),
            -errno::EINVAL
        );
        assert_eq!(
            KernelError::ElfError(ElfError::BadEndian).to_errno(),
            -errno::EBADFMT
        );
        Ok(())
    }
}
