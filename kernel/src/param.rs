//! Kernel-wide tunables.
//!
//! One home for the fixed sizes of every table in the kernel; changing a
//! value here resizes the corresponding subsystem.

/// Number of hardware cores.
pub const NCPU: usize = 4;
/// Maximum number of processes.
pub const NPROC: usize = 64;
/// Open files per process.
pub const NOFILE: usize = 16;
/// Open files in the whole system.
pub const NFILE: usize = 100;
/// Maximum number of in-memory inodes.
pub const NINODE: usize = 50;
/// Maximum major device number.
pub const NDEV: usize = 10;
/// Device number of the root filesystem disk.
pub const ROOTDEV: u32 = 1;
/// Max blocks any single transaction may touch.
pub const MAXOPBLOCKS: usize = 10;
/// Size of the on-disk log, in blocks.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;
/// Size of the block buffer cache.
pub const NBUF: usize = MAXOPBLOCKS * 3;
/// Max exec arguments.
pub const MAXARG: usize = 32;
/// Console input ring size.
pub const INPUT_BUF: usize = 128;
/// Maximum file path length.
pub const MAXPATH: usize = 128;
/// Size of the filesystem image, in blocks (mkfs only).
pub const FSSIZE: u32 = 1000;

/// Kernel stack size per process: two frames, trap frame at the top.
pub const KSTACK_PAGES: usize = 2;
