//! Directories and path resolution.
//!
//! A directory's content is a flat array of 16-byte entries, inum 0 marking
//! a free slot. Resolution walks one component at a time, locking only the
//! directory currently being searched, so lookups through disjoint prefixes
//! proceed in parallel. The shared `create` (open/mkdir/mknod), hard-link
//! and unlink semantics live here too, so the syscall layer stays a thin
//! argument-fetching shell. Callers own the enclosing log transaction.

use super::inode::{ialloc, idup, iget, ilock, iput, iunlockput, InodeGuard, Iref};
use super::{InodeType, IoDst, IoSrc, DIRENT_SIZE, DIRSIZ, ROOTINO};
use crate::error::{FsError, KernelError};
use crate::param::ROOTDEV;
use crate::process::myproc;
use crate::KernelResult;

/// One directory entry: inum plus a NUL-padded name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dirent {
    pub inum: u16,
    pub name: [u8; DIRSIZ],
}

impl Dirent {
    pub const fn free() -> Self {
        Self {
            inum: 0,
            name: [0; DIRSIZ],
        }
    }

    pub fn new(inum: u16, name: &[u8]) -> Self {
        let mut entry = Self::free();
        entry.inum = inum;
        let n = name.len().min(DIRSIZ);
        entry.name[..n].copy_from_slice(&name[..n]);
        entry
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut name = [0u8; DIRSIZ];
        name.copy_from_slice(&raw[2..2 + DIRSIZ]);
        Self {
            inum: u16::from_le_bytes(raw[0..2].try_into().unwrap()),
            name,
        }
    }

    pub fn encode(&self) -> [u8; DIRENT_SIZE] {
        let mut raw = [0u8; DIRENT_SIZE];
        raw[0..2].copy_from_slice(&self.inum.to_le_bytes());
        raw[2..2 + DIRSIZ].copy_from_slice(&self.name);
        raw
    }
}

/// Does a stored, NUL-padded name equal `name` (truncated at DIRSIZ, like
/// every path component)?
fn name_eq(stored: &[u8; DIRSIZ], name: &[u8]) -> bool {
    let len = name.len().min(DIRSIZ);
    stored[..len] == name[..len] && (len == DIRSIZ || stored[len] == 0)
}

/// Look `name` up in directory `dp`. Returns a referenced inode and the
/// entry's byte offset.
pub fn dirlookup(dp: &mut InodeGuard, name: &[u8]) -> Option<(Iref, u32)> {
    if dp.typ != InodeType::Dir {
        panic!("dirlookup: not a directory");
    }
    let mut off = 0;
    while off < dp.size {
        let mut raw = [0u8; DIRENT_SIZE];
        let n = dp
            .read(&mut IoDst::Kernel(&mut raw), off, DIRENT_SIZE as u32)
            .expect("dirlookup: directory read");
        if n != DIRENT_SIZE {
            panic!("dirlookup: short entry at {}", off);
        }
        let entry = Dirent::decode(&raw);
        if entry.inum != 0 && name_eq(&entry.name, name) {
            return Some((iget(dp.ip.dev, entry.inum as u32), off));
        }
        off += DIRENT_SIZE as u32;
    }
    None
}

/// Write entry (name, inum) into directory `dp`, reusing the first free
/// slot or extending the directory. Refuses duplicates.
pub fn dirlink(dp: &mut InodeGuard, name: &[u8], inum: u32) -> KernelResult<()> {
    if let Some((ip, _)) = dirlookup(dp, name) {
        iput(ip);
        return Err(FsError::AlreadyExists.into());
    }

    let mut off = 0;
    while off < dp.size {
        let mut raw = [0u8; DIRENT_SIZE];
        if dp
            .read(&mut IoDst::Kernel(&mut raw), off, DIRENT_SIZE as u32)
            .expect("dirlink: directory read")
            != DIRENT_SIZE
        {
            panic!("dirlink: short entry at {}", off);
        }
        if Dirent::decode(&raw).inum == 0 {
            break;
        }
        off += DIRENT_SIZE as u32;
    }

    let raw = Dirent::new(inum as u16, name).encode();
    if dp.write(&IoSrc::Kernel(&raw), off, DIRENT_SIZE as u32)? != DIRENT_SIZE {
        panic!("dirlink: short write at {}", off);
    }
    Ok(())
}

/// Split the next path element off `path`.
///
/// ```text
/// skipelem("a/bb/c") = Some(("bb/c", "a"))
/// skipelem("///a//bb") = Some(("bb", "a"))
/// skipelem("a") = Some(("", "a"))
/// skipelem("") = skipelem("////") = None
/// ```
fn skipelem(path: &[u8]) -> Option<(&[u8], &[u8])> {
    let mut i = 0;
    while i < path.len() && path[i] == b'/' {
        i += 1;
    }
    if i == path.len() {
        return None;
    }
    let start = i;
    while i < path.len() && path[i] != b'/' {
        i += 1;
    }
    // Components longer than DIRSIZ are silently truncated, as in the
    // on-disk format.
    let name = &path[start..i.min(start + DIRSIZ)];
    let mut rest = i;
    while rest < path.len() && path[rest] == b'/' {
        rest += 1;
    }
    Some((&path[rest..], name))
}

fn namex(path: &[u8], want_parent: bool) -> KernelResult<(Iref, [u8; DIRSIZ])> {
    let mut ip = if path.first() == Some(&b'/') {
        iget(ROOTDEV, ROOTINO)
    } else {
        // SAFETY: cwd is in the private half of our own slot.
        let cwd = myproc()
            .and_then(|p| unsafe { p.data() }.cwd)
            .ok_or(FsError::NotFound)?;
        idup(cwd)
    };

    let mut rest = path;
    let mut name_out = [0u8; DIRSIZ];
    while let Some((next_rest, name)) = skipelem(rest) {
        name_out = [0; DIRSIZ];
        name_out[..name.len()].copy_from_slice(name);

        let mut guard = ilock(ip);
        if guard.typ != InodeType::Dir {
            iunlockput(guard);
            return Err(FsError::NotADirectory.into());
        }
        if want_parent && next_rest.is_empty() {
            // Stop one level early; the caller gets the parent unlocked
            // plus the final element.
            drop(guard);
            return Ok((ip, name_out));
        }
        match dirlookup(&mut guard, name) {
            Some((next, _)) => {
                iunlockput(guard);
                ip = next;
            }
            None => {
                iunlockput(guard);
                return Err(FsError::NotFound.into());
            }
        }
        rest = next_rest;
    }

    if want_parent {
        // Path had no final element to split off ("/", "////").
        iput(ip);
        return Err(FsError::NotFound.into());
    }
    Ok((ip, name_out))
}

/// Resolve a path to a referenced inode.
pub fn namei(path: &[u8]) -> KernelResult<Iref> {
    namex(path, false).map(|(ip, _)| ip)
}

/// Resolve to the parent directory of the last element; also yields that
/// element.
pub fn nameiparent(path: &[u8]) -> KernelResult<(Iref, [u8; DIRSIZ])> {
    namex(path, true)
}

/// Shared creation path for open(O_CREATE), mkdir and mknod. Returns the
/// new (or, for plain files, existing) inode, locked. Directories get their
/// `.` and `..` entries and bump the parent's link count.
pub fn create(
    path: &[u8],
    typ: InodeType,
    major: u16,
    minor: u16,
) -> KernelResult<InodeGuard> {
    let (dp, name) = nameiparent(path)?;
    let mut dpg = ilock(dp);

    let name_len = name.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
    let name = &name[..name_len];

    if let Some((ip, _)) = dirlookup(&mut dpg, name) {
        iunlockput(dpg);
        let ipg = ilock(ip);
        if typ == InodeType::File
            && (ipg.typ == InodeType::File || ipg.typ == InodeType::Device)
        {
            return Ok(ipg);
        }
        iunlockput(ipg);
        return Err(FsError::AlreadyExists.into());
    }

    let ip = match ialloc(dp.dev, typ) {
        Ok(ip) => ip,
        Err(e) => {
            iunlockput(dpg);
            return Err(e.into());
        }
    };
    let mut ipg = ilock(ip);
    ipg.major = major;
    ipg.minor = minor;
    ipg.nlink = 1;
    ipg.update();

    if typ == InodeType::Dir {
        // The ".." entry is a link to the parent.
        dpg.nlink += 1;
        dpg.update();
        if dirlink(&mut ipg, b".", ip.inum).is_err()
            || dirlink(&mut ipg, b"..", dp.inum).is_err()
        {
            panic!("create: dot entries for fresh directory");
        }
    }

    if dirlink(&mut dpg, name, ip.inum).is_err() {
        panic!("create: parent entry for fresh inode");
    }
    iunlockput(dpg);
    Ok(ipg)
}

/// Only `.` and `..` left?
fn is_dir_empty(dp: &mut InodeGuard) -> bool {
    let mut off = 2 * DIRENT_SIZE as u32;
    while off < dp.size {
        let mut raw = [0u8; DIRENT_SIZE];
        if dp
            .read(&mut IoDst::Kernel(&mut raw), off, DIRENT_SIZE as u32)
            .expect("is_dir_empty: directory read")
            != DIRENT_SIZE
        {
            panic!("is_dir_empty: short entry at {}", off);
        }
        if Dirent::decode(&raw).inum != 0 {
            return false;
        }
        off += DIRENT_SIZE as u32;
    }
    true
}

/// Remove a directory entry and drop the target's link count. Refuses
/// `.`/`..` and non-empty directories.
pub fn unlink(path: &[u8]) -> KernelResult<()> {
    let (dp, name) = nameiparent(path)?;
    let mut dpg = ilock(dp);

    let name_len = name.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
    let name = &name[..name_len];
    if name == b"." || name == b".." {
        iunlockput(dpg);
        return Err(FsError::InvalidLink.into());
    }

    let Some((ip, off)) = dirlookup(&mut dpg, name) else {
        iunlockput(dpg);
        return Err(FsError::NotFound.into());
    };
    let mut ipg = ilock(ip);
    if ipg.nlink < 1 {
        panic!("unlink: inode {} nlink {}", ip.inum, ipg.nlink);
    }
    if ipg.typ == InodeType::Dir && !is_dir_empty(&mut ipg) {
        iunlockput(ipg);
        iunlockput(dpg);
        return Err(FsError::DirectoryNotEmpty.into());
    }

    let raw = Dirent::free().encode();
    if dpg.write(&IoSrc::Kernel(&raw), off, DIRENT_SIZE as u32)? != DIRENT_SIZE {
        panic!("unlink: entry clear at {}", off);
    }
    if ipg.typ == InodeType::Dir {
        // The victim's ".." no longer references the parent.
        dpg.nlink -= 1;
        dpg.update();
    }
    iunlockput(dpg);

    ipg.nlink -= 1;
    ipg.update();
    iunlockput(ipg);
    Ok(())
}

/// Create `new` as a hard link to `old`. Directories cannot be linked, and
/// both names must live on the same device.
pub fn link(old: &[u8], new: &[u8]) -> KernelResult<()> {
    let ip = namei(old)?;
    let mut ipg = ilock(ip);
    if ipg.typ == InodeType::Dir {
        iunlockput(ipg);
        return Err(FsError::InvalidLink.into());
    }
    ipg.nlink += 1;
    ipg.update();
    drop(ipg);

    let undo = |ip: Iref| {
        let mut ipg = ilock(ip);
        ipg.nlink -= 1;
        ipg.update();
        iunlockput(ipg);
    };

    let (dp, name) = match nameiparent(new) {
        Ok(found) => found,
        Err(e) => {
            undo(ip);
            return Err(e);
        }
    };
    let mut dpg = ilock(dp);
    let name_len = name.iter().position(|&b| b == 0).unwrap_or(DIRSIZ);
    if dp.dev != ip.dev {
        iunlockput(dpg);
        undo(ip);
        return Err(KernelError::Fs(FsError::InvalidLink));
    }
    if let Err(e) = dirlink(&mut dpg, &name[..name_len], ip.inum) {
        iunlockput(dpg);
        undo(ip);
        return Err(e);
    }
    iunlockput(dpg);
    iput(ip);
    Ok(())
}

/// Read the directory entry at `off`; used by userspace ls via readi, and
/// by tests.
pub fn dirent_at(dp: &mut InodeGuard, off: u32) -> Option<Dirent> {
    if off >= dp.size {
        return None;
    }
    let mut raw = [0u8; DIRENT_SIZE];
    let n = dp
        .read(&mut IoDst::Kernel(&mut raw), off, DIRENT_SIZE as u32)
        .ok()?;
    if n != DIRENT_SIZE {
        return None;
    }
    Some(Dirent::decode(&raw))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn skipelem_examples_from_the_contract() {
        assert_eq!(
            skipelem(b"a/bb/c"),
            Some((&b"bb/c"[..], &b"a"[..]))
        );
        assert_eq!(skipelem(b"///a//bb"), Some((&b"bb"[..], &b"a"[..])));
        assert_eq!(skipelem(b"a"), Some((&b""[..], &b"a"[..])));
        assert_eq!(skipelem(b""), None);
        assert_eq!(skipelem(b"////"), None);
    }

    #[test]
    fn skipelem_truncates_long_components() {
        let (rest, name) = skipelem(b"averylongdirectoryname/x").unwrap();
        assert_eq!(name.len(), DIRSIZ);
        assert_eq!(rest, b"x");
    }

    #[test]
    fn dirent_codec_round_trips() {
        let entry = Dirent::new(7, b"init");
        let back = Dirent::decode(&entry.encode());
        assert_eq!(back, entry);
        assert!(name_eq(&back.name, b"init"));
        assert!(!name_eq(&back.name, b"ini"));
        assert!(!name_eq(&back.name, b"initx"));
    }

    #[test]
    fn name_eq_handles_full_width_names() {
        let entry = Dirent::new(1, b"fourteen-bytes");
        assert!(name_eq(&entry.name, b"fourteen-bytes"));
        assert!(!name_eq(&entry.name, b"fourteen-byte"));
    }
}
