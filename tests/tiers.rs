//! Data tier boundaries, transitions, holes and space exhaustion.

use ffsp::backend::MemBackend;
use ffsp::error::FsError;
use ffsp::fs::Ffsp;
use ffsp::layout::DataTier;
use ffsp::mkfs::{mkfs, MkfsOptions};
use ffsp::mount::mount;

const CLUSTER: u32 = 1024;
const ERASE: u32 = 16 * 1024;

// Derived from the geometry above: 896 embedded bytes, 224 indirect
// cluster pointers.
const MAX_EMB: u64 = (CLUSTER - 128) as u64;
const MAX_CLIN: u64 = MAX_EMB / 4 * CLUSTER as u64;
const MAX_EBIN: u64 = MAX_EMB / 4 * ERASE as u64;

fn options() -> MkfsOptions {
    MkfsOptions {
        clustersize: CLUSTER,
        erasesize: ERASE,
        ninoopen: 8,
        neraseopen: 5,
        nerasereserve: 2,
        nerasewrites: 2,
    }
}

fn new_volume(size: usize) -> Ffsp {
    let mut backend = MemBackend::new(size);
    mkfs(&mut backend, &options()).unwrap();
    mount(Box::new(backend)).unwrap()
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i & 0xff) as u8).collect()
}

fn mkfile(fs: &mut Ffsp, path: &str) {
    fs.mknod(path, libc::S_IFREG | 0o644, 0, 0, 0).unwrap();
}

fn read_all(fs: &mut Ffsp, path: &str) -> Vec<u8> {
    let size = fs.getattr(path).unwrap().size as usize;
    let mut buf = vec![0u8; size];
    assert_eq!(fs.read(path, &mut buf, 0).unwrap(), size);
    buf
}

#[test]
fn test_embedded_boundary() {
    let mut fs = new_volume(4 * 1024 * 1024);
    mkfile(&mut fs, "/f");

    let data = pattern(MAX_EMB as usize);
    fs.write("/f", &data, 0).unwrap();
    assert_eq!(fs.data_tier_of("/f").unwrap(), DataTier::Emb);
    assert_eq!(read_all(&mut fs, "/f"), data);

    // One more byte promotes to cluster indirect.
    fs.write("/f", &[0xff], MAX_EMB).unwrap();
    assert_eq!(fs.data_tier_of("/f").unwrap(), DataTier::Clin);

    let mut expected = data;
    expected.push(0xff);
    assert_eq!(read_all(&mut fs, "/f"), expected);
    fs.unmount().unwrap();
}

#[test]
fn test_cluster_indirect_boundary() {
    let mut fs = new_volume(4 * 1024 * 1024);
    mkfile(&mut fs, "/f");

    let data = pattern(MAX_CLIN as usize);
    fs.write("/f", &data, 0).unwrap();
    assert_eq!(fs.data_tier_of("/f").unwrap(), DataTier::Clin);

    // One more byte promotes to erase block indirect.
    fs.write("/f", &[0x77], MAX_CLIN).unwrap();
    assert_eq!(fs.data_tier_of("/f").unwrap(), DataTier::Ebin);

    let out = read_all(&mut fs, "/f");
    assert_eq!(out.len(), MAX_CLIN as usize + 1);
    assert_eq!(&out[..MAX_CLIN as usize], &data[..]);
    assert_eq!(out[MAX_CLIN as usize], 0x77);
    fs.unmount().unwrap();
}

#[test]
fn test_too_large_rejected() {
    let mut fs = new_volume(4 * 1024 * 1024);
    mkfile(&mut fs, "/f");

    assert_eq!(fs.write("/f", &[0u8], MAX_EBIN), Err(FsError::TooLarge));
    assert_eq!(fs.truncate("/f", MAX_EBIN + 1), Err(FsError::TooLarge));
    // The limit itself is fine for truncation.
    fs.truncate("/f", MAX_EBIN).unwrap();
    fs.unmount().unwrap();
}

#[test]
fn test_shrink_across_tiers_preserves_prefix() {
    let mut fs = new_volume(4 * 1024 * 1024);
    mkfile(&mut fs, "/f");

    let data = pattern(MAX_CLIN as usize + ERASE as usize);
    fs.write("/f", &data, 0).unwrap();
    assert_eq!(fs.data_tier_of("/f").unwrap(), DataTier::Ebin);

    // Down to cluster indirect.
    fs.truncate("/f", 3 * CLUSTER as u64).unwrap();
    assert_eq!(fs.data_tier_of("/f").unwrap(), DataTier::Clin);
    assert_eq!(read_all(&mut fs, "/f"), &data[..3 * CLUSTER as usize]);

    // Down into the embedded region.
    fs.truncate("/f", MAX_EMB).unwrap();
    assert_eq!(fs.data_tier_of("/f").unwrap(), DataTier::Emb);
    assert_eq!(read_all(&mut fs, "/f"), &data[..MAX_EMB as usize]);
    fs.unmount().unwrap();
}

#[test]
fn test_ebin_direct_to_embedded_shrink() {
    let mut fs = new_volume(4 * 1024 * 1024);
    mkfile(&mut fs, "/f");

    let data = pattern(MAX_CLIN as usize + 1);
    fs.write("/f", &data, 0).unwrap();
    assert_eq!(fs.data_tier_of("/f").unwrap(), DataTier::Ebin);

    fs.truncate("/f", MAX_EMB).unwrap();
    assert_eq!(fs.data_tier_of("/f").unwrap(), DataTier::Emb);
    assert_eq!(read_all(&mut fs, "/f"), &data[..MAX_EMB as usize]);
    fs.unmount().unwrap();
}

#[test]
fn test_truncate_extension_creates_hole() {
    let mut fs = new_volume(4 * 1024 * 1024);
    mkfile(&mut fs, "/f");

    fs.write("/f", b"head", 0).unwrap();
    fs.truncate("/f", 5 * CLUSTER as u64).unwrap();

    let out = read_all(&mut fs, "/f");
    assert_eq!(out.len(), 5 * CLUSTER as usize);
    assert_eq!(&out[..4], b"head");
    assert!(out[4..].iter().all(|&b| b == 0));
    fs.unmount().unwrap();
}

#[test]
fn test_sparse_write_reads_zero_gap() {
    let mut fs = new_volume(4 * 1024 * 1024);
    mkfile(&mut fs, "/f");

    let offset = 7 * CLUSTER as u64 + 100;
    fs.write("/f", b"tail", offset).unwrap();

    let out = read_all(&mut fs, "/f");
    assert_eq!(out.len(), offset as usize + 4);
    assert!(out[..offset as usize].iter().all(|&b| b == 0));
    assert_eq!(&out[offset as usize..], b"tail");
    fs.unmount().unwrap();
}

#[test]
fn test_all_zero_write_consumes_no_clusters() {
    let mut fs = new_volume(4 * 1024 * 1024);
    mkfile(&mut fs, "/zeros");
    // Flush the creation before taking the baseline.
    fs.fsync().unwrap();

    let before = fs.statfs().bfree;
    let zeros = vec![0u8; 8 * CLUSTER as usize];
    fs.write("/zeros", &zeros, 0).unwrap();
    fs.fsync().unwrap();

    assert_eq!(fs.data_tier_of("/zeros").unwrap(), DataTier::Clin);
    // Hole units occupy no storage; only inode rewrites move clusters,
    // and those free their old copy again.
    let after = fs.statfs().bfree;
    let consumed = before as i64 - after as i64;
    assert!(consumed <= 2, "zero write consumed {} clusters", consumed);

    assert_eq!(read_all(&mut fs, "/zeros"), zeros);
    fs.unmount().unwrap();
}

#[test]
fn test_partial_cluster_overwrite() {
    let mut fs = new_volume(4 * 1024 * 1024);
    mkfile(&mut fs, "/f");

    let mut data = pattern(4 * CLUSTER as usize);
    fs.write("/f", &data, 0).unwrap();
    assert_eq!(fs.data_tier_of("/f").unwrap(), DataTier::Clin);

    // Rewrite a region straddling two clusters.
    let patch = vec![0xeeu8; CLUSTER as usize];
    let patch_off = CLUSTER as usize + 512;
    fs.write("/f", &patch, patch_off as u64).unwrap();
    data[patch_off..patch_off + patch.len()].copy_from_slice(&patch);

    assert_eq!(read_all(&mut fs, "/f"), data);
    fs.unmount().unwrap();
}

#[test]
fn test_ebin_partial_overwrite_in_place() {
    let mut fs = new_volume(8 * 1024 * 1024);
    mkfile(&mut fs, "/f");

    let mut data = pattern(MAX_CLIN as usize + 2 * ERASE as usize);
    fs.write("/f", &data, 0).unwrap();
    assert_eq!(fs.data_tier_of("/f").unwrap(), DataTier::Ebin);

    // A write inside one indirect erase block, not erase block aligned.
    let patch = vec![0x11u8; ERASE as usize / 2];
    let patch_off = ERASE as usize + 700;
    fs.write("/f", &patch, patch_off as u64).unwrap();
    data[patch_off..patch_off + patch.len()].copy_from_slice(&patch);

    assert_eq!(read_all(&mut fs, "/f"), data);
    fs.unmount().unwrap();
}

#[test]
fn test_ebin_full_overwrite_releases_old_block() {
    let mut fs = new_volume(8 * 1024 * 1024);
    mkfile(&mut fs, "/f");

    let data = pattern(MAX_CLIN as usize + 2 * ERASE as usize);
    fs.write("/f", &data, 0).unwrap();
    assert_eq!(fs.data_tier_of("/f").unwrap(), DataTier::Ebin);
    fs.fsync().unwrap();

    let empties = fs.empty_eraseblocks();

    // Overwrite one whole indirect erase block: a fresh block is taken,
    // the replaced one is released again.
    let unit = vec![0x42u8; ERASE as usize];
    fs.write("/f", &unit, 0).unwrap();
    fs.fsync().unwrap();
    assert_eq!(fs.empty_eraseblocks(), empties);

    let out = read_all(&mut fs, "/f");
    assert_eq!(&out[..ERASE as usize], &unit[..]);
    assert_eq!(&out[ERASE as usize..], &data[ERASE as usize..]);
    fs.unmount().unwrap();
}

#[test]
fn test_inode_exhaustion() {
    // A device whose first erase block leaves room for very few inodes.
    let eb_cnt = 1900u32;
    let mut backend = MemBackend::new(eb_cnt as usize * ERASE as usize);
    mkfs(&mut backend, &options()).unwrap();
    let mut fs = mount(Box::new(backend)).unwrap();

    let nino = fs.nino();
    assert_eq!(nino, (ERASE - CLUSTER - eb_cnt * 8) / 4);

    // Inode 0 is invalid and inode 1 is the root.
    let mut created = 0u32;
    let err = loop {
        match fs.mknod(&format!("/f{}", created), libc::S_IFREG | 0o644, 0, 0, 0) {
            Ok(()) => created += 1,
            Err(e) => break e,
        }
    };
    assert_eq!(err, FsError::NoSpace);
    assert_eq!(created, nino - 2);
    fs.unmount().unwrap();
}

#[test]
fn test_erase_block_reserve_is_respected() {
    // 16 erase blocks: one for metadata, one for the root inode, three
    // reserved, leaving few for data.
    let mut backend = MemBackend::new(16 * ERASE as usize);
    let opts = MkfsOptions {
        nerasereserve: 3,
        ..options()
    };
    mkfs(&mut backend, &opts).unwrap();
    let mut fs = mount(Box::new(backend)).unwrap();

    let data = vec![0x99u8; 4 * CLUSTER as usize];
    let mut i = 0;
    let err = loop {
        let path = format!("/f{}", i);
        if let Err(e) = fs.mknod(&path, libc::S_IFREG | 0o644, 0, 0, 0) {
            break e;
        }
        if let Err(e) = fs.write(&path, &data, 0) {
            break e;
        }
        i += 1;
        if i > 1000 {
            panic!("medium never filled up");
        }
    };
    assert_eq!(err, FsError::NoSpace);
    // The reserved pool is never handed out.
    assert_eq!(fs.empty_eraseblocks(), 3);
}
