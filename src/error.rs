use core::fmt;

/// Broad classes of allocator failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller passed something that can never succeed, like a
    /// non-power-of-two alignment.
    InvalidArgument,
    /// The OS refused to hand out more memory.
    OutOfMemory,
    /// The caller released something that is not a live allocation, or the
    /// bookkeeping around a payload was overwritten.
    CorruptionDetected,
}

/// Everything that can go wrong inside the allocator.
///
/// Zero-sized requests are not errors; they succeed with no pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MallocError {
    InvalidAlignment { alignment: usize },
    InvalidConfig { reason: &'static str },
    SizeOverflow { size: usize },
    /// `count * size` for a zeroed array allocation does not fit in `usize`.
    CountOverflow { count: usize, size: usize },
    OutOfMemory { size: usize },
    DoubleFree { ptr: usize },
    UnknownPointer { ptr: usize },
    CorruptHeader { ptr: usize },
}

impl MallocError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MallocError::InvalidAlignment { .. } | MallocError::InvalidConfig { .. } => {
                ErrorKind::InvalidArgument
            }
            MallocError::SizeOverflow { .. }
            | MallocError::CountOverflow { .. }
            | MallocError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
            MallocError::DoubleFree { .. }
            | MallocError::UnknownPointer { .. }
            | MallocError::CorruptHeader { .. } => ErrorKind::CorruptionDetected,
        }
    }

    /// The C status code matching this error, as returned by `posix_memalign`.
    pub fn errno(&self) -> i32 {
        match self.kind() {
            ErrorKind::OutOfMemory => libc::ENOMEM,
            ErrorKind::InvalidArgument | ErrorKind::CorruptionDetected => libc::EINVAL,
        }
    }
}

impl fmt::Display for MallocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            MallocError::InvalidAlignment { alignment } => {
                write!(f, "alignment {} is not a power of two", alignment)
            }
            MallocError::InvalidConfig { reason } => write!(f, "invalid configuration: {}", reason),
            MallocError::SizeOverflow { size } => {
                write!(f, "request of {} bytes overflows when rounded", size)
            }
            MallocError::CountOverflow { count, size } => {
                write!(f, "{} objects of {} bytes overflow the address space", count, size)
            }
            MallocError::OutOfMemory { size } => {
                write!(f, "out of memory allocating {} bytes", size)
            }
            MallocError::DoubleFree { ptr } => write!(f, "double free of {:#x}", ptr),
            MallocError::UnknownPointer { ptr } => {
                write!(f, "{:#x} is not a payload owned by this allocator", ptr)
            }
            MallocError::CorruptHeader { ptr } => {
                write!(f, "header guard in front of {:#x} was overwritten", ptr)
            }
        }
    }
}

impl core::error::Error for MallocError {}
