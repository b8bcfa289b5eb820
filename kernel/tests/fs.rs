//! End-to-end filesystem scenarios on a RAM disk: mkfs, mount, files,
//! directories, links, and the format limits.

#![cfg(not(target_os = "none"))]

use std::sync::Arc;

use basalt_kernel::fs::device::{self, MemDisk};
use basalt_kernel::fs::file::{self, FileKind};
use basalt_kernel::fs::inode::{ilock, iunlockput};
use basalt_kernel::fs::mkfs::mkfs;
use basalt_kernel::fs::path::{create, dirent_at, link, namei, nameiparent, unlink};
use basalt_kernel::fs::{
    self, log, InodeType, IoDst, IoSrc, BSIZE, DIRENT_SIZE, MAXFILE, NDIRECT,
};
use basalt_kernel::error::FsError;
use basalt_kernel::param::{FSSIZE, ROOTDEV};
use basalt_kernel::KernelError;

/// Fresh image, cold caches, mounted filesystem. Returns the serialization
/// guard plus the backing disk.
fn mount_fresh(ninodes: u32) -> (std::sync::MutexGuard<'static, ()>, Arc<MemDisk>) {
    let gate = fs::test_serial();
    let disk = Arc::new(MemDisk::new(FSSIZE));
    mkfs(disk.as_ref(), FSSIZE, ninodes);
    device::register(disk.clone());
    fs::buffer::binit();
    fs::inode::iinit();
    file::file_init();
    fs::fsinit(ROOTDEV);
    (gate, disk)
}

/// create + write under one transaction; content through the file layer.
fn write_file(path: &[u8], content: &[u8]) {
    log::begin_op();
    let guard = create(path, InodeType::File, 0, 0).expect("create");
    let ip = guard.ip;
    drop(guard);
    log::end_op();

    let f = file::alloc(FileKind::Inode(ip), true, true).expect("file slot");
    assert_eq!(
        file::write(&f, &IoSrc::Kernel(content), content.len()).expect("write"),
        content.len()
    );
    file::close(f);
}

fn read_file(path: &[u8], len: usize) -> Vec<u8> {
    let ip = namei(path).expect("namei");
    let mut guard = ilock(ip);
    let mut out = vec![0u8; len];
    let n = guard
        .read(&mut IoDst::Kernel(&mut out), 0, len as u32)
        .expect("read");
    out.truncate(n);
    iunlockput(guard);
    out
}

#[test]
fn written_files_read_back_verbatim() {
    let (_gate, _disk) = mount_fresh(64);
    let message = b"a quick journaled filesystem".to_vec();
    write_file(b"/motd", &message);
    assert_eq!(read_file(b"/motd", 4 * BSIZE), message);
}

#[test]
fn files_grow_into_the_indirect_range() {
    let (_gate, _disk) = mount_fresh(64);
    // Well past the direct blocks.
    let big: Vec<u8> = (0..(NDIRECT + 9) * BSIZE).map(|i| (i % 251) as u8).collect();
    write_file(b"/big", &big);
    assert_eq!(read_file(b"/big", big.len() + BSIZE), big);

    // Size survives a cold cache (it went through the log).
    fs::buffer::binit();
    fs::inode::iinit();
    let ip = namei(b"/big").expect("namei after remount");
    let guard = ilock(ip);
    assert_eq!(guard.size as usize, big.len());
    iunlockput(guard);
}

#[test]
fn write_past_max_file_size_fails() {
    let (_gate, _disk) = mount_fresh(64);
    log::begin_op();
    let mut guard = create(b"/huge", InodeType::File, 0, 0).expect("create");
    let err = guard.write(&IoSrc::Kernel(&[0u8; 8]), 0, (MAXFILE * BSIZE) as u32 + 1);
    assert!(err.is_err(), "MAXFILE is a hard ceiling");
    iunlockput(guard);
    log::end_op();
}

#[test]
fn directory_tree_resolves_to_depth() {
    let (_gate, _disk) = mount_fresh(64);
    for path in [
        b"/a".as_slice(),
        b"/a/b".as_slice(),
        b"/a/b/c".as_slice(),
        b"/a/b/c/d".as_slice(),
        b"/a/b/c/d/e".as_slice(),
    ] {
        log::begin_op();
        let guard = create(path, InodeType::Dir, 0, 0).expect("mkdir");
        iunlockput(guard);
        log::end_op();
    }
    write_file(b"/a/b/c/d/e/leaf", b"bottom");
    assert_eq!(read_file(b"/a/b/c/d/e/leaf", 64), b"bottom");

    // Sibling prefixes resolve independently.
    assert!(namei(b"/a/b/x").is_err());
    let (parent, name) = nameiparent(b"/a/b/c/d/e/leaf").expect("parent");
    assert_eq!(&name[..4], b"leaf");
    fs::inode::iput(parent);
}

#[test]
fn unlink_semantics_match_the_contract() {
    let (_gate, _disk) = mount_fresh(64);
    log::begin_op();
    iunlockput(create(b"/dir", InodeType::Dir, 0, 0).expect("mkdir"));
    log::end_op();
    write_file(b"/dir/file", b"payload");

    // Non-empty directory refuses.
    log::begin_op();
    assert!(unlink(b"/dir").is_err());
    // Dot entries refuse.
    assert!(unlink(b"/dir/.").is_err());
    assert!(unlink(b"/dir/..").is_err());
    // Absent name refuses.
    assert!(unlink(b"/dir/ghost").is_err());
    // Empty it out, then it goes.
    unlink(b"/dir/file").expect("unlink file");
    unlink(b"/dir").expect("unlink empty dir");
    log::end_op();

    assert!(namei(b"/dir").is_err());
}

#[test]
fn hard_links_share_an_inode() {
    let (_gate, _disk) = mount_fresh(64);
    write_file(b"/orig", b"shared bytes");

    log::begin_op();
    link(b"/orig", b"/alias").expect("link");
    log::end_op();

    let a = namei(b"/orig").expect("orig");
    let b = namei(b"/alias").expect("alias");
    assert_eq!(a.inum, b.inum, "one inode, two names");
    fs::inode::iput(a);
    fs::inode::iput(b);

    // Dropping the first name leaves the content reachable.
    log::begin_op();
    unlink(b"/orig").expect("unlink orig");
    log::end_op();
    assert_eq!(read_file(b"/alias", 64), b"shared bytes");

    // Dropping the last name frees it for good.
    log::begin_op();
    unlink(b"/alias").expect("unlink alias");
    log::end_op();
    assert!(namei(b"/alias").is_err());

    // Directories cannot be linked.
    log::begin_op();
    assert!(link(b"/", b"/rootalias").is_err());
    log::end_op();
}

#[test]
fn inode_exhaustion_is_an_error_not_a_panic() {
    // Tiny inode table: 11 usable minus the root.
    let (_gate, _disk) = mount_fresh(12);
    let mut made = 0;
    let err = loop {
        let name = format!("/f{}", made).into_bytes();
        log::begin_op();
        let r = create(&name, InodeType::File, 0, 0);
        let r = match r {
            Ok(guard) => {
                iunlockput(guard);
                Ok(())
            }
            Err(e) => Err(e),
        };
        log::end_op();
        match r {
            Ok(()) => made += 1,
            Err(e) => break e,
        }
    };
    assert!(made >= 1, "some files fit");
    assert!(
        matches!(err, KernelError::Fs(FsError::NoInodes)),
        "got {:?}",
        err
    );
}

#[test]
fn stat_reflects_inode_fields() {
    let (_gate, _disk) = mount_fresh(64);
    write_file(b"/stats", b"123456789");

    let ip = namei(b"/stats").expect("namei");
    let f = file::alloc(FileKind::Inode(ip), true, false).expect("slot");
    let st = file::stat(&f).expect("stat");
    assert_eq!(st.size, 9);
    assert_eq!(st.nlink, 1);
    assert_eq!(st.typ, InodeType::File as u16 as i16);
    assert_eq!(st.ino, ip.inum);
    file::close(f);
}

#[test]
fn root_listing_shows_created_names() {
    let (_gate, _disk) = mount_fresh(64);
    write_file(b"/one", b"1");
    write_file(b"/two", b"2");

    let root = namei(b"/").expect("root");
    let mut guard = ilock(root);
    let mut names = Vec::new();
    let mut off = 0;
    while let Some(entry) = dirent_at(&mut guard, off) {
        if entry.inum != 0 {
            let len = entry.name.iter().position(|&b| b == 0).unwrap_or(14);
            names.push(entry.name[..len].to_vec());
        }
        off += DIRENT_SIZE as u32;
    }
    iunlockput(guard);

    assert!(names.contains(&b".".to_vec()));
    assert!(names.contains(&b"..".to_vec()));
    assert!(names.contains(&b"one".to_vec()));
    assert!(names.contains(&b"two".to_vec()));
}

#[test]
fn mount_rejects_a_bad_magic() {
    let gate = fs::test_serial();
    let disk = Arc::new(MemDisk::new(64));
    device::register(disk.clone());
    fs::buffer::binit();
    let result = std::panic::catch_unwind(|| fs::fsinit(ROOTDEV));
    assert!(result.is_err(), "zeroed superblock must not mount");
    drop(gate);
}
