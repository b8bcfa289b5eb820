//! Block device contract and registration.
//!
//! One synchronous transfer call, direction chosen by the caller's dirty
//! flag (see `buffer::disk_rw`). All block numbers reaching a driver are
//! filesystem-relative; the driver applies its partition base, so the rest
//! of the kernel never sees device LBAs. A single root device is assumed.

use alloc::sync::Arc;

use spin::RwLock;

use super::BSIZE;

/// First LBA of the filesystem partition on the SD card.
pub const PART_BASE_LBA: u32 = 0x20800;

/// A synchronous block transport. One block per call, one call at a time
/// per block (the buffer sleep-lock guarantees that).
pub trait BlockIo: Send + Sync {
    /// Transfer `data` for filesystem block `blockno`; `write` selects the
    /// direction.
    fn rw(&self, blockno: u32, data: &mut [u8; BSIZE], write: bool);
}

static DISK: RwLock<Option<Arc<dyn BlockIo>>> = RwLock::new(None);

/// Install the root disk. Boot does this once; host tests swap in a fresh
/// RAM disk per scenario.
pub fn register(disk: Arc<dyn BlockIo>) {
    *DISK.write() = Some(disk);
}

/// Raw transfer through the registered driver.
pub fn rw(blockno: u32, data: &mut [u8; BSIZE], write: bool) {
    let guard = DISK.read();
    let disk = guard.as_ref().expect("device: no disk registered");
    disk.rw(blockno, data, write);
}

/// SD/MMC transport collaborator: the board driver moves one sector per
/// call; this wrapper only adds the partition base.
#[cfg(target_os = "none")]
pub struct SdCard {
    base_lba: u32,
}

#[cfg(target_os = "none")]
impl SdCard {
    pub const fn new() -> Self {
        Self {
            base_lba: PART_BASE_LBA,
        }
    }
}

#[cfg(target_os = "none")]
impl BlockIo for SdCard {
    fn rw(&self, blockno: u32, data: &mut [u8; BSIZE], write: bool) {
        // SAFETY: the driver owns the controller; `data` is exclusively
        // ours for the duration of the synchronous call.
        unsafe { sd_rw(self.base_lba + blockno, data.as_mut_ptr(), write) };
    }
}

#[cfg(target_os = "none")]
extern "C" {
    /// Board SD driver: synchronous single-sector transfer.
    fn sd_rw(lba: u32, buf: *mut u8, write: bool);
}

/// RAM-backed disk for host tests and image builds.
#[cfg(not(target_os = "none"))]
pub struct MemDisk {
    blocks: spin::Mutex<std::vec::Vec<[u8; BSIZE]>>,
}

#[cfg(not(target_os = "none"))]
impl MemDisk {
    pub fn new(nblocks: u32) -> Self {
        Self {
            blocks: spin::Mutex::new(std::vec![[0u8; BSIZE]; nblocks as usize]),
        }
    }

    /// Peek at raw block contents, bypassing the cache; crash-recovery
    /// tests use this to assert on-disk state.
    pub fn snapshot(&self, blockno: u32) -> [u8; BSIZE] {
        self.blocks.lock()[blockno as usize]
    }

    /// Poke raw block contents, bypassing the cache.
    pub fn patch(&self, blockno: u32, data: &[u8; BSIZE]) {
        self.blocks.lock()[blockno as usize] = *data;
    }
}

#[cfg(not(target_os = "none"))]
impl BlockIo for MemDisk {
    fn rw(&self, blockno: u32, data: &mut [u8; BSIZE], write: bool) {
        let mut blocks = self.blocks.lock();
        let slot = blocks
            .get_mut(blockno as usize)
            .expect("MemDisk: block out of range");
        if write {
            *slot = *data;
        } else {
            *data = *slot;
        }
    }
}
