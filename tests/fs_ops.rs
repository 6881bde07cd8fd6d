//! End-to-end file system operation tests over a memory-backed volume.

use ffsp::backend::MemBackend;
use ffsp::error::FsError;
use ffsp::fs::{Ffsp, OpenFlags};
use ffsp::mkfs::{mkfs, MkfsOptions};
use ffsp::mount::mount;

fn test_options() -> MkfsOptions {
    MkfsOptions {
        clustersize: 1024,
        erasesize: 16 * 1024,
        ninoopen: 8,
        neraseopen: 5,
        nerasereserve: 2,
        nerasewrites: 2,
    }
}

fn new_volume(size: usize, options: &MkfsOptions) -> Ffsp {
    let mut backend = MemBackend::new(size);
    mkfs(&mut backend, options).unwrap();
    mount(Box::new(backend)).unwrap()
}

fn names(fs: &mut Ffsp, path: &str) -> Vec<String> {
    let mut list: Vec<String> = fs
        .readdir(path)
        .unwrap()
        .into_iter()
        .map(|d| d.name)
        .collect();
    list.sort();
    list
}

#[test]
fn test_fresh_volume_has_only_dot_entries() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());
    assert_eq!(names(&mut fs, "/"), vec![".", ".."]);
    fs.unmount().unwrap();
}

#[test]
fn test_write_read_survives_remount() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    fs.mknod("/a", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    assert_eq!(fs.write("/a", b"hello", 0).unwrap(), 5);

    let mut buf = [0u8; 5];
    assert_eq!(fs.read("/a", &mut buf, 0).unwrap(), 5);
    assert_eq!(&buf, b"hello");

    let backend = fs.unmount().unwrap();
    let mut fs = mount(backend).unwrap();

    let mut buf = [0u8; 5];
    assert_eq!(fs.read("/a", &mut buf, 0).unwrap(), 5);
    assert_eq!(&buf, b"hello");

    let st = fs.getattr("/a").unwrap();
    assert_eq!(st.size, 5);
    assert_eq!(st.nlink, 1);
    assert_eq!(st.mode, libc::S_IFREG | 0o644);
    fs.unmount().unwrap();
}

#[test]
fn test_mkdir_mknod_unlink_rmdir() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    fs.mkdir("/d", 0o755, 0, 0).unwrap();
    fs.mknod("/d/f", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();

    assert_eq!(names(&mut fs, "/d"), vec![".", "..", "f"]);
    assert_eq!(fs.rmdir("/d"), Err(FsError::NotEmpty));

    fs.unlink("/d/f").unwrap();
    fs.rmdir("/d").unwrap();

    assert_eq!(names(&mut fs, "/"), vec![".", ".."]);
    assert_eq!(fs.getattr("/d"), Err(FsError::NotFound));
    fs.unmount().unwrap();
}

#[test]
fn test_directory_link_counts() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    assert_eq!(fs.getattr("/").unwrap().nlink, 2);
    fs.mkdir("/d", 0o755, 0, 0).unwrap();
    assert_eq!(fs.getattr("/").unwrap().nlink, 3);
    assert_eq!(fs.getattr("/d").unwrap().nlink, 2);

    fs.mkdir("/d/e", 0o755, 0, 0).unwrap();
    assert_eq!(fs.getattr("/d").unwrap().nlink, 3);

    fs.rmdir("/d/e").unwrap();
    assert_eq!(fs.getattr("/d").unwrap().nlink, 2);
    fs.rmdir("/d").unwrap();
    assert_eq!(fs.getattr("/").unwrap().nlink, 2);
    fs.unmount().unwrap();
}

#[test]
fn test_hard_links_share_content() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    fs.mknod("/f", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    fs.write("/f", b"shared", 0).unwrap();
    fs.link("/f", "/g").unwrap();

    assert_eq!(fs.getattr("/f").unwrap().nlink, 2);
    assert_eq!(fs.getattr("/g").unwrap().ino, fs.getattr("/f").unwrap().ino);

    fs.unlink("/f").unwrap();
    let mut buf = [0u8; 6];
    assert_eq!(fs.read("/g", &mut buf, 0).unwrap(), 6);
    assert_eq!(&buf, b"shared");
    assert_eq!(fs.getattr("/g").unwrap().nlink, 1);

    fs.unlink("/g").unwrap();
    assert_eq!(fs.getattr("/g"), Err(FsError::NotFound));
    fs.unmount().unwrap();
}

#[test]
fn test_symlink_roundtrip() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    fs.symlink("/some/target", "/s", 0, 0).unwrap();
    let st = fs.getattr("/s").unwrap();
    assert_eq!(st.mode & libc::S_IFMT, libc::S_IFLNK);
    assert_eq!(st.size, "/some/target".len() as u64);

    assert_eq!(fs.readlink("/s").unwrap(), "/some/target");

    let backend = fs.unmount().unwrap();
    let mut fs = mount(backend).unwrap();
    assert_eq!(fs.readlink("/s").unwrap(), "/some/target");
    fs.unmount().unwrap();
}

#[test]
fn test_rename_plain_file() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    fs.mknod("/a", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    fs.write("/a", b"payload", 0).unwrap();
    fs.rename("/a", "/b").unwrap();

    assert_eq!(fs.getattr("/a"), Err(FsError::NotFound));
    let mut buf = [0u8; 7];
    assert_eq!(fs.read("/b", &mut buf, 0).unwrap(), 7);
    assert_eq!(&buf, b"payload");
    fs.unmount().unwrap();
}

#[test]
fn test_rename_overwrites_existing_file() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    fs.mknod("/a", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    fs.write("/a", b"new", 0).unwrap();
    fs.mknod("/b", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    fs.write("/b", b"old", 0).unwrap();

    fs.rename("/a", "/b").unwrap();

    assert_eq!(fs.getattr("/a"), Err(FsError::NotFound));
    let mut buf = [0u8; 3];
    fs.read("/b", &mut buf, 0).unwrap();
    assert_eq!(&buf, b"new");
    assert_eq!(names(&mut fs, "/"), vec![".", "..", "b"]);
    fs.unmount().unwrap();
}

#[test]
fn test_rename_directory_semantics() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    fs.mkdir("/src", 0o755, 0, 0).unwrap();
    fs.mkdir("/dst", 0o755, 0, 0).unwrap();
    fs.mkdir("/src/child", 0o755, 0, 0).unwrap();

    // A directory cannot move into its own subtree.
    assert_eq!(
        fs.rename("/src", "/src/child/x"),
        Err(FsError::InvalidArgument)
    );

    // Replacing a non-empty directory is refused.
    fs.mknod("/dst/keep", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    assert_eq!(fs.rename("/src/child", "/dst"), Err(FsError::NotEmpty));
    fs.unlink("/dst/keep").unwrap();

    // Moving across parents updates link counts and "..".
    let root_nlink = fs.getattr("/").unwrap().nlink;
    fs.rename("/src/child", "/dst/child").unwrap();

    assert_eq!(fs.getattr("/src/child"), Err(FsError::NotFound));
    assert!(fs.getattr("/dst/child").unwrap().mode & libc::S_IFMT == libc::S_IFDIR);
    assert_eq!(fs.getattr("/src").unwrap().nlink, 2);
    assert_eq!(fs.getattr("/dst").unwrap().nlink, 3);
    assert_eq!(fs.getattr("/").unwrap().nlink, root_nlink);

    // ".." of the moved directory points at the new parent.
    let dst_ino = fs.getattr("/dst").unwrap().ino;
    let dotdot = fs
        .readdir("/dst/child")
        .unwrap()
        .into_iter()
        .find(|d| d.name == "..")
        .unwrap();
    assert_eq!(dotdot.ino, dst_ino);
    fs.unmount().unwrap();
}

#[test]
fn test_open_trunc_cuts_file() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    fs.mknod("/t", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    fs.write("/t", b"0123456789", 0).unwrap();

    let no = fs.open("/t", OpenFlags::WRONLY | OpenFlags::TRUNC).unwrap();
    fs.release(no).unwrap();

    assert_eq!(fs.getattr("/t").unwrap().size, 0);
    let mut buf = [0u8; 4];
    assert_eq!(fs.read("/t", &mut buf, 0).unwrap(), 0);
    fs.unmount().unwrap();
}

#[test]
fn test_chmod_chown_utimens() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    fs.mknod("/f", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    fs.chmod("/f", libc::S_IFREG | 0o600).unwrap();
    fs.chown("/f", 1000, 1001).unwrap();

    let atime = ffsp::Timespec { sec: 11, nsec: 22 };
    let mtime = ffsp::Timespec { sec: 33, nsec: 44 };
    fs.utimens("/f", atime, mtime).unwrap();

    let st = fs.getattr("/f").unwrap();
    assert_eq!(st.mode, libc::S_IFREG | 0o600);
    assert_eq!(st.uid, 1000);
    assert_eq!(st.gid, 1001);
    assert_eq!(st.atime, atime);
    assert_eq!(st.mtime, mtime);

    // Attribute changes survive a remount.
    let backend = fs.unmount().unwrap();
    let mut fs = mount(backend).unwrap();
    let st = fs.getattr("/f").unwrap();
    assert_eq!(st.mode, libc::S_IFREG | 0o600);
    assert_eq!(st.uid, 1000);
    assert_eq!(st.mtime, mtime);
    fs.unmount().unwrap();
}

#[test]
fn test_statfs_accounting() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    let before = fs.statfs();
    assert_eq!(before.bsize, 1024);
    assert_eq!(before.files, 1); // the root directory
    assert!(before.bfree > 0);
    assert_eq!(before.namemax, 248);

    fs.mknod("/f", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    let data = vec![0x5au8; 8 * 1024];
    fs.write("/f", &data, 0).unwrap();
    fs.fsync().unwrap();

    let after = fs.statfs();
    assert_eq!(after.files, 2);
    assert!(after.bfree < before.bfree);
    fs.unmount().unwrap();
}

#[test]
fn test_remount_preserves_tree_and_data() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    fs.mkdir("/dir", 0o755, 0, 0).unwrap();
    fs.mknod("/dir/small", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    fs.write("/dir/small", b"tiny", 0).unwrap();

    // A file large enough to go cluster indirect.
    fs.mknod("/dir/large", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    let pattern: Vec<u8> = (0..8192u32).map(|i| (i & 0xff) as u8).collect();
    fs.write("/dir/large", &pattern, 0).unwrap();

    let backend = fs.unmount().unwrap();
    let mut fs = mount(backend).unwrap();

    assert_eq!(names(&mut fs, "/"), vec![".", "..", "dir"]);
    assert_eq!(names(&mut fs, "/dir"), vec![".", "..", "large", "small"]);

    let mut buf = [0u8; 4];
    fs.read("/dir/small", &mut buf, 0).unwrap();
    assert_eq!(&buf, b"tiny");

    let mut large = vec![0u8; pattern.len()];
    assert_eq!(fs.read("/dir/large", &mut large, 0).unwrap(), pattern.len());
    assert_eq!(large, pattern);
    fs.unmount().unwrap();
}

#[test]
fn test_churn_reclaims_space() {
    // Many small files, delete every other one, then write one big file;
    // the collector has to reclaim the stale inode clusters for this to
    // fit comfortably.
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    let data = vec![0xabu8; 4096];
    for i in 0..128 {
        let path = format!("/f{}", i);
        fs.mknod(&path, libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
        fs.write(&path, &data, 0).unwrap();
    }
    for i in (1..128).step_by(2) {
        fs.unlink(&format!("/f{}", i)).unwrap();
    }

    fs.mknod("/g", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    let big: Vec<u8> = (0..200 * 1024u32).map(|i| (i % 251) as u8).collect();
    fs.write("/g", &big, 0).unwrap();

    // The reserve pool survives the churn.
    assert!(fs.empty_eraseblocks() >= 2);

    let mut out = vec![0u8; big.len()];
    assert_eq!(fs.read("/g", &mut out, 0).unwrap(), big.len());
    assert_eq!(out, big);

    // Even-numbered files are still intact.
    let mut buf = vec![0u8; 4096];
    fs.read("/f0", &mut buf, 0).unwrap();
    assert_eq!(buf, data);
    fs.read("/f126", &mut buf, 0).unwrap();
    assert_eq!(buf, data);
    assert_eq!(fs.getattr("/f1"), Err(FsError::NotFound));

    let st = fs.statfs();
    assert_eq!(st.files, 1 + 64 + 1);

    // The churn left the bookkeeping intact.
    let report = fs.check_consistency().unwrap();
    assert!(report.is_empty(), "inconsistencies: {:?}", report);

    // Everything is still there after a remount.
    let backend = fs.unmount().unwrap();
    let mut fs = mount(backend).unwrap();
    let mut out = vec![0u8; big.len()];
    fs.read("/g", &mut out, 0).unwrap();
    assert_eq!(out, big);

    let report = fs.check_consistency().unwrap();
    assert!(report.is_empty(), "inconsistencies: {:?}", report);
    fs.unmount().unwrap();
}

#[test]
fn test_consistency_after_mixed_operations() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    fs.mkdir("/a", 0o755, 0, 0).unwrap();
    fs.mkdir("/a/b", 0o755, 0, 0).unwrap();
    fs.mknod("/a/b/f", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    fs.write("/a/b/f", &vec![7u8; 3000], 0).unwrap();
    fs.truncate("/a/b/f", 100).unwrap();
    fs.symlink("/a/b/f", "/l", 0, 0).unwrap();
    fs.rename("/a/b/f", "/f").unwrap();
    fs.unlink("/l").unwrap();
    fs.fsync().unwrap();

    let report = fs.check_consistency().unwrap();
    assert!(report.is_empty(), "inconsistencies: {:?}", report);

    let backend = fs.unmount().unwrap();
    let mut fs = mount(backend).unwrap();
    let report = fs.check_consistency().unwrap();
    assert!(report.is_empty(), "inconsistencies: {:?}", report);
    fs.unmount().unwrap();
}

#[test]
fn test_metrics_track_io() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    fs.mknod("/f", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    let data = vec![0x33u8; 4096];
    fs.write("/f", &data, 0).unwrap();

    let mut out = vec![0u8; 4096];
    fs.read("/f", &mut out, 0).unwrap();

    let snap = fs.metrics();
    assert_eq!(snap.host_write, 4096);
    assert_eq!(snap.host_read, 4096);
    // Out-of-place cluster writes cost at least the payload itself.
    assert!(snap.write_raw >= 4096);
    assert!(snap.read_raw >= 4096);

    fs.fsync().unwrap();
    let after = fs.metrics();
    // The metadata write-back shows up in the raw counters.
    assert!(after.write_raw > snap.write_raw);
    assert!(after.write_amplification() >= 1.0);
    fs.unmount().unwrap();
}

#[test]
fn test_flush_inodes_idempotent() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    fs.mknod("/f", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    fs.write("/f", b"data", 0).unwrap();

    fs.flush_inodes(true).unwrap();
    assert_eq!(fs.dirty_inodes(), 0);
    let snapshot = fs.statfs();

    // The second forced flush has nothing to do.
    fs.flush_inodes(true).unwrap();
    assert_eq!(fs.dirty_inodes(), 0);
    assert_eq!(fs.statfs().bfree, snapshot.bfree);
    fs.unmount().unwrap();
}

#[test]
fn test_host_errno_protocol() {
    use ffsp::host::FfspHost;
    use ffsp::fs::{StatBuf, StatVfs};

    let fs = new_volume(4 * 1024 * 1024, &test_options());
    let host = FfspHost::new(fs);

    let mut st = StatBuf::default();
    assert_eq!(host.getattr("/missing", &mut st), -libc::ENOENT);
    assert_eq!(host.getattr("/", &mut st), 0);
    assert_eq!(st.nlink, 2);

    // The debug namespace is rejected outright.
    assert_eq!(host.getattr("/.FFSP.d", &mut st), -libc::EPERM);
    assert_eq!(host.mknod("/.FFSP.d/x", libc::S_IFREG, 0, 0, 0), -libc::EPERM);
    assert_eq!(host.unlink("/.FFSP.d/super"), -libc::EPERM);

    assert_eq!(host.mknod("/f", libc::S_IFREG | 0o644, 0, 0, 0), 0);
    let fh = host.open("/f", OpenFlags::RDWR);
    assert!(fh > 0);
    assert_eq!(host.write("/f", Some(fh as u64), b"abc", 0), 3);

    let mut buf = [0u8; 3];
    assert_eq!(host.read("/f", Some(fh as u64), &mut buf, 0), 3);
    assert_eq!(&buf, b"abc");
    assert_eq!(host.read("/f", None, &mut buf, -1), -libc::EINVAL as i64);
    assert_eq!(host.release(fh as u64), 0);

    // readlink copies at most size - 1 bytes and NUL-terminates.
    assert_eq!(host.symlink("/quite/long/target", "/s", 0, 0), 0);
    let mut small = [0xffu8; 8];
    assert_eq!(host.readlink("/s", &mut small), 0);
    assert_eq!(&small[..7], b"/quite/");
    assert_eq!(small[7], 0);

    let mut sfs = StatVfs::default();
    assert_eq!(host.statfs(&mut sfs), 0);
    assert!(sfs.bfree > 0);
    assert_eq!(host.fsync("/f", false), 0);
    assert_eq!(host.flush("/f"), 0);

    host.unmount().unwrap();
}

#[test]
fn test_reference_geometry_promotion() {
    // The reference front-end formats with 32 KiB clusters and 4 MiB
    // erase blocks; a 64 KiB write promotes a fresh file from embedded
    // to cluster indirect.
    let options = MkfsOptions::default();
    let mut backend = MemBackend::new(32 * 1024 * 1024);
    mkfs(&mut backend, &options).unwrap();
    let mut fs = mount(Box::new(backend)).unwrap();

    fs.mknod("/big", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    let pattern: Vec<u8> = (0..64 * 1024u32).map(|i| (i & 0xff) as u8).collect();
    fs.write("/big", &pattern, 0).unwrap();
    assert_eq!(
        fs.data_tier_of("/big").unwrap(),
        ffsp::layout::DataTier::Clin
    );

    let mut out = vec![0u8; pattern.len()];
    assert_eq!(fs.read("/big", &mut out, 0).unwrap(), pattern.len());
    assert_eq!(out, pattern);

    let backend = fs.unmount().unwrap();
    let mut fs = mount(backend).unwrap();
    let mut out = vec![0u8; pattern.len()];
    fs.read("/big", &mut out, 0).unwrap();
    assert_eq!(out, pattern);
    fs.unmount().unwrap();
}

#[test]
fn test_lookup_errors() {
    let mut fs = new_volume(4 * 1024 * 1024, &test_options());

    assert_eq!(fs.getattr("/missing"), Err(FsError::NotFound));
    fs.mknod("/file", libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
    // A path component that is a file cannot be descended into.
    assert_eq!(fs.getattr("/file/below"), Err(FsError::NotFound));
    assert_eq!(fs.readdir("/file"), Err(FsError::NotADirectory));
    assert_eq!(fs.rmdir("/file"), Err(FsError::NotADirectory));
    fs.unmount().unwrap();
}
