//! The on-disk filesystem and everything between it and a file descriptor.
//!
//! Disk layout, in 512-byte blocks:
//!
//! ```text
//! [ boot | super | log... | inode... | bitmap... | data... ]
//! ```
//!
//! Layering, bottom up: a registered block device ([`device`]), the LRU
//! buffer cache ([`buffer`]), the write-ahead log ([`log`]), inodes and the
//! block bitmap ([`inode`]), directories and path resolution ([`path`]),
//! and the open-file table with pipes on top ([`file`], [`pipe`]).
//! All block numbers above the device driver are filesystem-relative; the
//! driver alone translates to device LBAs.

pub mod buffer;
pub mod device;
pub mod file;
pub mod inode;
pub mod log;
#[cfg(not(target_os = "none"))]
pub mod mkfs;
pub mod path;
pub mod pipe;

use crate::error::VmError;
use crate::KernelResult;

/// Block size in bytes.
pub const BSIZE: usize = 512;
/// Superblock magic.
pub const FSMAGIC: u32 = 0x1020_3040;
/// Root inode number, on the root device.
pub const ROOTINO: u32 = 1;
/// Direct block addresses per inode.
pub const NDIRECT: usize = 12;
/// Entries in the single indirect block.
pub const NINDIRECT: usize = BSIZE / 4;
/// Largest file, in blocks.
pub const MAXFILE: usize = NDIRECT + NINDIRECT;
/// Directory entry name length.
pub const DIRSIZ: usize = 14;
/// On-disk inode size.
pub const DINODE_SIZE: usize = 64;
/// Inodes per block.
pub const IPB: usize = BSIZE / DINODE_SIZE;
/// Bitmap bits per block.
pub const BPB: usize = BSIZE * 8;
/// Directory entry size.
pub const DIRENT_SIZE: usize = 16;

/// File/inode types, as stored on disk. 0 marks a free inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum InodeType {
    Free = 0,
    Dir = 1,
    File = 2,
    Device = 3,
}

impl InodeType {
    pub fn from_u16(raw: u16) -> Self {
        match raw {
            1 => Self::Dir,
            2 => Self::File,
            3 => Self::Device,
            _ => Self::Free,
        }
    }
}

/// The superblock, little-endian u32 fields in disk order.
#[derive(Debug, Clone, Copy, Default)]
pub struct SuperBlock {
    pub magic: u32,
    /// Total image size in blocks.
    pub size: u32,
    /// Number of data blocks.
    pub nblocks: u32,
    /// Number of inodes.
    pub ninodes: u32,
    /// Number of log blocks (header included).
    pub nlog: u32,
    pub logstart: u32,
    pub inodestart: u32,
    pub bmapstart: u32,
}

impl SuperBlock {
    pub fn decode(block: &[u8]) -> Self {
        let word = |i: usize| u32::from_le_bytes(block[i * 4..i * 4 + 4].try_into().unwrap());
        Self {
            magic: word(0),
            size: word(1),
            nblocks: word(2),
            ninodes: word(3),
            nlog: word(4),
            logstart: word(5),
            inodestart: word(6),
            bmapstart: word(7),
        }
    }

    pub fn encode(&self, block: &mut [u8]) {
        for (i, v) in [
            self.magic,
            self.size,
            self.nblocks,
            self.ninodes,
            self.nlog,
            self.logstart,
            self.inodestart,
            self.bmapstart,
        ]
        .iter()
        .enumerate()
        {
            block[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    /// Block holding inode `inum`.
    pub fn iblock(&self, inum: u32) -> u32 {
        inum / IPB as u32 + self.inodestart
    }

    /// Bitmap block covering data block `b`.
    pub fn bblock(&self, b: u32) -> u32 {
        b / BPB as u32 + self.bmapstart
    }
}

static SUPER_BLOCK: crate::sync::SpinLock<SuperBlock> =
    crate::sync::SpinLock::new("superblock", SuperBlock {
        magic: 0,
        size: 0,
        nblocks: 0,
        ninodes: 0,
        nlog: 0,
        logstart: 0,
        inodestart: 0,
        bmapstart: 0,
    });

/// The mounted superblock, by copy.
pub fn sb() -> SuperBlock {
    *SUPER_BLOCK.lock()
}

/// Mount the filesystem on `dev`: read and check the superblock, then
/// replay anything the log left behind. Runs in process context (the first
/// `forkret`) because it sleeps on disk I/O.
pub fn fsinit(dev: u32) {
    let decoded = {
        let buf = buffer::bread(dev, 1);
        SuperBlock::decode(&buf[..])
    };
    if decoded.magic != FSMAGIC {
        panic!("fsinit: invalid file system magic {:#x}", decoded.magic);
    }
    *SUPER_BLOCK.lock() = decoded;
    log::init(dev, &decoded);
    ::log::info!(
        "fs: mounted dev {} ({} blocks, {} inodes, {} log)",
        dev,
        decoded.size,
        decoded.ninodes,
        decoded.nlog
    );
}

/// Metadata returned by fstat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub dev: i32,
    pub ino: u32,
    pub typ: i16,
    pub nlink: i16,
    pub size: u64,
}

impl Stat {
    /// User-ABI encoding: int dev; u32 ino; i16 type; i16 nlink; u64 size.
    pub fn encode(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[0..4].copy_from_slice(&self.dev.to_le_bytes());
        out[4..8].copy_from_slice(&self.ino.to_le_bytes());
        out[8..10].copy_from_slice(&self.typ.to_le_bytes());
        out[10..12].copy_from_slice(&self.nlink.to_le_bytes());
        out[16..24].copy_from_slice(&self.size.to_le_bytes());
        out
    }
}

/// Where file data lands: a kernel slice or a user virtual address in the
/// current process. Readers/writers address it at byte offsets so a copy
/// loop can straddle pages and blocks.
pub enum IoDst<'a> {
    Kernel(&'a mut [u8]),
    User(usize),
}

impl IoDst<'_> {
    pub fn write_at(&mut self, off: usize, bytes: &[u8]) -> KernelResult<()> {
        match self {
            IoDst::Kernel(slice) => {
                slice[off..off + bytes.len()].copy_from_slice(bytes);
                Ok(())
            }
            IoDst::User(base) => {
                let p = crate::process::myproc().ok_or(VmError::BadUserAccess { va: *base })?;
                // SAFETY: we are the running process.
                let data = unsafe { p.data() };
                data.pagetable
                    .as_ref()
                    .ok_or(VmError::BadUserAccess { va: *base })?
                    .copy_out(*base + off, bytes)?;
                Ok(())
            }
        }
    }
}

/// Where file data comes from; mirror of [`IoDst`].
pub enum IoSrc<'a> {
    Kernel(&'a [u8]),
    User(usize),
}

impl IoSrc<'_> {
    /// A view of the same source shifted forward by `delta` bytes; used to
    /// split one logical write across log transactions.
    pub fn slice_from(&self, delta: usize) -> IoSrc<'_> {
        match self {
            IoSrc::Kernel(slice) => IoSrc::Kernel(&slice[delta..]),
            IoSrc::User(base) => IoSrc::User(*base + delta),
        }
    }

    pub fn read_at(&self, off: usize, dst: &mut [u8]) -> KernelResult<()> {
        match self {
            IoSrc::Kernel(slice) => {
                dst.copy_from_slice(&slice[off..off + dst.len()]);
                Ok(())
            }
            IoSrc::User(base) => {
                let p = crate::process::myproc().ok_or(VmError::BadUserAccess { va: *base })?;
                // SAFETY: we are the running process.
                let data = unsafe { p.data() };
                data.pagetable
                    .as_ref()
                    .ok_or(VmError::BadUserAccess { va: *base })?
                    .copy_in(dst, *base + off)?;
                Ok(())
            }
        }
    }
}

/// Serialize host tests that touch the filesystem singletons (cache, log,
/// inode table, registered disk). Each scenario takes this, registers its
/// own RAM disk and reinitializes the stack.
#[cfg(not(target_os = "none"))]
pub fn test_serial() -> std::sync::MutexGuard<'static, ()> {
    static GATE: std::sync::Mutex<()> = std::sync::Mutex::new(());
    GATE.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn superblock_codec_round_trips() {
        let sb = SuperBlock {
            magic: FSMAGIC,
            size: 1000,
            nblocks: 941,
            ninodes: 200,
            nlog: 30,
            logstart: 2,
            inodestart: 32,
            bmapstart: 57,
        };
        let mut block = [0u8; BSIZE];
        sb.encode(&mut block);
        let back = SuperBlock::decode(&block);
        assert_eq!(back.magic, FSMAGIC);
        assert_eq!(back.bmapstart, 57);
        assert_eq!(back.iblock(9), 33);
        assert_eq!(back.bblock(5000), 58);
    }
}
