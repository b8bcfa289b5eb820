//! Kernel error types.
//!
//! Recoverable failures travel as `KernelError`; syscall dispatch flattens
//! them to `-1` at the user boundary. Invariant violations panic instead
//! (double free, lock misuse, scheduler entered with locks held).

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Physical frame allocation failures.
    Alloc(AllocError),
    /// Virtual memory failures.
    Vm(VmError),
    /// Filesystem failures.
    Fs(FsError),
    /// System call argument failures.
    Syscall(SyscallError),
    /// Process table exhausted.
    NoProcess,
    /// Target process does not exist.
    ProcessNotFound { pid: u32 },
    /// The current process was killed while blocked.
    Killed,
    /// Write end or read end of a pipe has gone away.
    BrokenPipe,
}

/// Physical frame allocator errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No block of the requested order is free.
    OutOfMemory,
    /// Frame number outside the managed range.
    InvalidFrame,
    /// Order outside `[0, MAX_ORDER)`.
    InvalidOrder,
}

/// Virtual memory errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Address has a mixed [63:48] half.
    NonCanonical { va: usize },
    /// No user-accessible mapping for the address.
    BadUserAccess { va: usize },
    /// Page-table page allocation failed.
    OutOfMemory,
    /// Unterminated user string.
    StringTooLong,
}

/// Filesystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// Path component missing.
    NotFound,
    /// Path already exists.
    AlreadyExists,
    /// Component in the middle of a path is not a directory.
    NotADirectory,
    /// Directory operation applied to a non-directory, or vice versa.
    WrongType,
    /// On-disk inode table exhausted.
    NoInodes,
    /// Data-block bitmap exhausted.
    NoBlocks,
    /// Write past the maximum file size.
    FileTooLarge,
    /// Directory still has entries.
    DirectoryNotEmpty,
    /// System file table exhausted.
    NoFileSlots,
    /// Per-process descriptor table exhausted.
    NoFds,
    /// Descriptor is not open, or mode forbids the operation.
    BadFileDescriptor,
    /// Device major number has no registered handler.
    BadDevice,
    /// Offset arithmetic overflowed or exceeded the format limits.
    InvalidOffset,
    /// Linking directories, or unlinking `.`/`..`.
    InvalidLink,
}

/// System call argument errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallError {
    /// Argument index outside 0..=5.
    InvalidArgument { arg: usize },
    /// User pointer outside `[0, proc.sz)` (including overflow).
    InvalidPointer { addr: usize },
    /// Path or string argument longer than the kernel buffer.
    StringTooLong { max: usize },
}

/// Result type alias for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Alloc(e) => write!(f, "frame allocator: {:?}", e),
            Self::Vm(e) => write!(f, "vm: {:?}", e),
            Self::Fs(e) => write!(f, "fs: {:?}", e),
            Self::Syscall(e) => write!(f, "syscall: {:?}", e),
            Self::NoProcess => write!(f, "process table exhausted"),
            Self::ProcessNotFound { pid } => write!(f, "process {} not found", pid),
            Self::Killed => write!(f, "killed"),
            Self::BrokenPipe => write!(f, "broken pipe"),
        }
    }
}

impl From<AllocError> for KernelError {
    fn from(err: AllocError) -> Self {
        Self::Alloc(err)
    }
}

impl From<VmError> for KernelError {
    fn from(err: VmError) -> Self {
        Self::Vm(err)
    }
}

impl From<FsError> for KernelError {
    fn from(err: FsError) -> Self {
        Self::Fs(err)
    }
}

impl From<SyscallError> for KernelError {
    fn from(err: SyscallError) -> Self {
        Self::Syscall(err)
    }
}

impl From<AllocError> for VmError {
    fn from(_: AllocError) -> Self {
        VmError::OutOfMemory
    }
}
