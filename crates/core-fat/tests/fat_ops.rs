//! End-to-end filesystem scenarios over freshly formatted volumes.

mod common;

use common::{fat12_volume, fat16_volume, fat32_volume};
use core_fat::dir_iter::DirectoryIterator;
use core_fat::{table, FatFilesystem, FatVolume};
use core_vfs::{Filesystem, FsError, OpenFlags, StatUpdate, VolumeFlags};
use std::sync::Arc;

fn create_file_with_content(
    fs: &FatFilesystem,
    vol: &Arc<FatVolume>,
    parent: &Arc<std::sync::Mutex<core_fat::FatInode>>,
    name: &str,
    content: &[u8],
) {
    let mut file = fs
        .create_file(vol, parent, name, OpenFlags::WRITE | OpenFlags::CREATE)
        .expect("create");
    let written = fs.write(vol, &mut file, content, 0).expect("write");
    assert_eq!(written, content.len());
    fs.close_file(vol, &mut file).unwrap();
}

fn read_all(
    fs: &FatFilesystem,
    vol: &Arc<FatVolume>,
    parent: &Arc<std::sync::Mutex<core_fat::FatInode>>,
    name: &str,
) -> Vec<u8> {
    let inode = fs.locate_inode(vol, parent, name).expect("locate");
    let stat = fs.read_stat(vol, &inode).unwrap();
    let mut file = fs.open_file(vol, &inode, OpenFlags::empty()).unwrap();
    let mut data = vec![0u8; stat.size as usize];
    let read = fs.read(vol, &mut file, &mut data, 0).unwrap();
    assert_eq!(read, data.len());
    data
}

fn list_names(fs: &FatFilesystem, vol: &Arc<FatVolume>) -> Vec<String> {
    let root = vol.root_inode();
    let mut dir = fs.open_directory(vol, &root).unwrap();
    let mut names = Vec::new();
    while let Some(entry) = fs.read_directory(vol, &mut dir).unwrap() {
        names.push(entry.name);
    }
    names
}

#[test]
fn write_then_read_back_across_clusters() {
    let (fs, vol, _dev) = fat16_volume();
    let root = vol.root_inode();
    // 3.5 clusters of patterned data (cluster = 2 KiB on the default
    // geometry).
    let content: Vec<u8> = (0..7 * 1024).map(|i| (i % 251) as u8).collect();
    create_file_with_content(&fs, &vol, &root, "data.bin", &content);
    assert_eq!(read_all(&fs, &vol, &root, "data.bin"), content);

    // Partial reads at unaligned offsets.
    let inode = fs.locate_inode(&vol, &root, "data.bin").unwrap();
    let mut file = fs.open_file(&vol, &inode, OpenFlags::empty()).unwrap();
    let mut chunk = vec![0u8; 777];
    let read = fs.read(&vol, &mut file, &mut chunk, 1234).unwrap();
    assert_eq!(read, 777);
    assert_eq!(chunk, &content[1234..1234 + 777]);
}

#[test]
fn sequential_reads_reuse_the_chain_cursor() {
    let (fs, vol, _dev) = fat16_volume();
    let root = vol.root_inode();
    let content: Vec<u8> = (0..10 * 1024).map(|i| (i / 3 % 256) as u8).collect();
    create_file_with_content(&fs, &vol, &root, "seq.bin", &content);

    let inode = fs.locate_inode(&vol, &root, "seq.bin").unwrap();
    let mut file = fs.open_file(&vol, &inode, OpenFlags::empty()).unwrap();
    let mut out = Vec::new();
    let mut position = 0u64;
    let mut buffer = [0u8; 700];
    loop {
        let read = fs.read(&vol, &mut file, &mut buffer, position).unwrap();
        if read == 0 {
            break;
        }
        out.extend_from_slice(&buffer[..read]);
        position += read as u64;
    }
    assert_eq!(out, content);
}

#[test]
fn long_name_munges_to_tilde_short_names() {
    let (fs, vol, _dev) = fat16_volume();
    let root = vol.root_inode();
    create_file_with_content(&fs, &vol, &root, "Report Final.TXT", b"one");
    create_file_with_content(&fs, &vol, &root, "Report Final v2.TXT", b"two");

    // The long names read back intact.
    let names = list_names(&fs, &vol);
    assert!(names.iter().any(|n| n == "Report Final.TXT"));
    assert!(names.iter().any(|n| n == "Report Final v2.TXT"));

    // And the raw short entries got the ~1 / ~2 suffixes.
    let root_cluster = vol.root_inode().lock().unwrap().start_cluster;
    let mut shorts = Vec::new();
    let mut iter = DirectoryIterator::new(&vol, root_cluster, 0).unwrap();
    while let Some(entry) = iter.current_raw().unwrap() {
        if entry[0] == 0 {
            break;
        }
        if entry[0] != 0xe5 && entry[11] != 0x0f {
            shorts.push(entry[0..11].to_vec());
        }
        if iter.next_raw().unwrap().is_none() {
            break;
        }
    }
    assert!(shorts.iter().any(|s| s == b"REPORT~1TXT"));
    assert!(shorts.iter().any(|s| s == b"REPORT~2TXT"));
}

#[test]
fn filenames_round_trip_byte_identical() {
    let (fs, vol, _dev) = fat16_volume();
    let root = vol.root_inode();
    let names = [
        "README.TXT",                    // pure short-name alphabet
        "lowercase.txt",                 // forces a long name
        "exactly13char",                 // fills an LFN fragment exactly
        "exactly-26-characters-name",    // two full fragments
        "with spaces and (parens).log",  // spaces survive in long names
        "Smörgåsbord.töt",               // CP437-representable accents
        "trailing.",                     // trailing period needs LFN
        "MiXeD.CaSe",                    // case is preserved
    ];
    for name in &names {
        create_file_with_content(&fs, &vol, &root, name, name.as_bytes());
    }
    let listed = list_names(&fs, &vol);
    for name in &names {
        assert!(
            listed.iter().any(|n| n == name),
            "{name:?} did not round-trip (got {listed:?})"
        );
        assert_eq!(read_all(&fs, &vol, &root, name), name.as_bytes());
    }
}

#[test]
fn rename_keeps_inode_and_open_handle() {
    let (fs, vol, _dev) = fat16_volume();
    let root = vol.root_inode();
    fs.create_directory(&vol, &root, "a").unwrap();
    fs.create_directory(&vol, &root, "b").unwrap();
    let dir_a = fs.locate_inode(&vol, &root, "a").unwrap();
    let dir_b = fs.locate_inode(&vol, &root, "b").unwrap();

    let content: Vec<u8> = (0..4096u32).map(|i| (i % 253) as u8).collect();
    create_file_with_content(&fs, &vol, &dir_a, "foo", &content);

    let inode = fs.locate_inode(&vol, &dir_a, "foo").unwrap();
    let stat_before = fs.read_stat(&vol, &inode).unwrap();
    let mut handle = fs.open_file(&vol, &inode, OpenFlags::empty()).unwrap();
    let mut first = vec![0u8; 10];
    fs.read(&vol, &mut handle, &mut first, 0).unwrap();
    assert_eq!(first, &content[..10]);

    fs.rename(&vol, &dir_a, "foo", &dir_b, "bar").unwrap();

    // Same handle keeps reading the same bytes at the same offsets.
    let mut rest = vec![0u8; content.len() - 10];
    let read = fs.read(&vol, &mut handle, &mut rest, 10).unwrap();
    assert_eq!(read, rest.len());
    assert_eq!(rest, &content[10..]);

    // The inode ID is stable across the rename.
    let moved = fs.locate_inode(&vol, &dir_b, "bar").unwrap();
    let stat_after = fs.read_stat(&vol, &moved).unwrap();
    assert_eq!(stat_before.inode_id, stat_after.inode_id);
    assert!(fs.locate_inode(&vol, &dir_a, "foo").is_err());
}

#[test]
fn renaming_directory_updates_dotdot() {
    let (fs, vol, _dev) = fat32_volume();
    let root = vol.root_inode();
    fs.create_directory(&vol, &root, "outer").unwrap();
    let outer = fs.locate_inode(&vol, &root, "outer").unwrap();
    fs.create_directory(&vol, &outer, "inner").unwrap();

    // Move /outer/inner to /inner.
    fs.rename(&vol, &outer, "inner", &root, "inner").unwrap();

    let inner = fs.locate_inode(&vol, &root, "inner").unwrap();
    let cluster = inner.lock().unwrap().start_cluster;
    let iter = DirectoryIterator::new(&vol, cluster, 1).unwrap();
    let dotdot = iter.current_raw().unwrap().expect("dot-dot entry");
    assert_eq!(&dotdot[0..11], b"..         ");
    // The root is recorded as cluster zero, even on FAT32.
    assert_eq!(u16::from_le_bytes([dotdot[26], dotdot[27]]), 0);
    assert_eq!(u16::from_le_bytes([dotdot[20], dotdot[21]]), 0);
}

#[test]
fn free_cluster_accounting_matches_the_fat() {
    let (fs, vol, _dev) = fat16_volume();
    let root = vol.root_inode();

    let free_at_mount = fs.read_fs_stat(&vol).unwrap().free_blocks;
    assert_eq!(
        free_at_mount,
        table::count_free_clusters(&vol).unwrap() as u64
    );

    // A 3.5-cluster file consumes four clusters.
    let content = vec![0x5au8; 7 * 1024];
    create_file_with_content(&fs, &vol, &root, "big.bin", &content);
    let free_after_write = fs.read_fs_stat(&vol).unwrap().free_blocks;
    assert_eq!(free_after_write, free_at_mount - 4);
    assert_eq!(
        free_after_write,
        table::count_free_clusters(&vol).unwrap() as u64
    );

    // Truncating to zero returns them all.
    let inode = fs.locate_inode(&vol, &root, "big.bin").unwrap();
    fs.write_stat(
        &vol,
        &inode,
        &StatUpdate {
            size: Some(0),
            ..StatUpdate::default()
        },
    )
    .unwrap();
    let free_after_truncate = fs.read_fs_stat(&vol).unwrap().free_blocks;
    assert_eq!(free_after_truncate, free_at_mount);
    assert_eq!(
        free_after_truncate,
        table::count_free_clusters(&vol).unwrap() as u64
    );
}

#[test]
fn unlinked_file_keeps_its_chain_until_release() {
    let (fs, vol, _dev) = fat16_volume();
    let root = vol.root_inode();
    let content = vec![0x17u8; 5000];
    create_file_with_content(&fs, &vol, &root, "victim", &content);
    let free_before_unlink = fs.read_fs_stat(&vol).unwrap().free_blocks;

    let inode = fs.locate_inode(&vol, &root, "victim").unwrap();
    let mut handle = fs.open_file(&vol, &inode, OpenFlags::empty()).unwrap();
    fs.unlink(&vol, &root, "victim").unwrap();

    // Gone from the namespace, still readable through the handle.
    assert!(matches!(
        fs.locate_inode(&vol, &root, "victim"),
        Err(FsError::NoEntry)
    ));
    let mut data = vec![0u8; content.len()];
    assert_eq!(fs.read(&vol, &mut handle, &mut data, 0).unwrap(), data.len());
    assert_eq!(data, content);
    // Clusters not reclaimed yet.
    assert_eq!(fs.read_fs_stat(&vol).unwrap().free_blocks, free_before_unlink);

    fs.close_file(&vol, &mut handle).unwrap();
    drop(handle);
    fs.release_inode(&vol, &inode).unwrap();
    assert!(fs.read_fs_stat(&vol).unwrap().free_blocks > free_before_unlink);
}

#[test]
fn rmdir_requires_empty_directory() {
    let (fs, vol, _dev) = fat16_volume();
    let root = vol.root_inode();
    fs.create_directory(&vol, &root, "nest").unwrap();
    let nest = fs.locate_inode(&vol, &root, "nest").unwrap();
    create_file_with_content(&fs, &vol, &nest, "occupant", b"x");

    assert!(matches!(
        fs.remove_directory(&vol, &root, "nest"),
        Err(FsError::NotEmpty)
    ));
    fs.unlink(&vol, &nest, "occupant").unwrap();
    fs.remove_directory(&vol, &root, "nest").unwrap();
    assert!(matches!(
        fs.locate_inode(&vol, &root, "nest"),
        Err(FsError::NoEntry)
    ));
}

#[test]
fn directory_listing_includes_dot_entries() {
    let (fs, vol, _dev) = fat16_volume();
    let root = vol.root_inode();
    fs.create_directory(&vol, &root, "sub").unwrap();

    // The root synthesizes its dot entries.
    let names = list_names(&fs, &vol);
    assert_eq!(&names[..2], &[".".to_owned(), "..".to_owned()]);
    assert!(names.iter().any(|n| n == "sub"));

    // A subdirectory carries real ones.
    let sub = fs.locate_inode(&vol, &root, "sub").unwrap();
    let mut dir = fs.open_directory(&vol, &sub).unwrap();
    let mut sub_names = Vec::new();
    while let Some(entry) = fs.read_directory(&vol, &mut dir).unwrap() {
        sub_names.push(entry.name);
    }
    assert_eq!(&sub_names[..2], &[".".to_owned(), "..".to_owned()]);

    fs.rewind_directory(&vol, &mut dir).unwrap();
    let again = fs.read_directory(&vol, &mut dir).unwrap().unwrap();
    assert_eq!(again.name, ".");
}

#[test]
fn dos_device_names_are_refused() {
    let (fs, vol, _dev) = fat16_volume();
    let root = vol.root_inode();
    assert!(matches!(
        fs.create_file(&vol, &root, "CON", OpenFlags::WRITE | OpenFlags::CREATE),
        Err(FsError::NoPermission)
    ));
}

#[test]
fn exclusive_create_fails_on_existing_file() {
    let (fs, vol, _dev) = fat16_volume();
    let root = vol.root_inode();
    create_file_with_content(&fs, &vol, &root, "once", b"data");
    assert!(matches!(
        fs.create_file(
            &vol,
            &root,
            "once",
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::EXCL
        ),
        Err(FsError::Exist)
    ));
}

#[test]
fn truncate_on_open_discards_content() {
    let (fs, vol, _dev) = fat16_volume();
    let root = vol.root_inode();
    create_file_with_content(&fs, &vol, &root, "trunc", b"old content");
    let inode = fs.locate_inode(&vol, &root, "trunc").unwrap();
    let mut file = fs
        .open_file(&vol, &inode, OpenFlags::WRITE | OpenFlags::TRUNC)
        .unwrap();
    assert_eq!(fs.read_stat(&vol, &inode).unwrap().size, 0);
    fs.write(&vol, &mut file, b"new", 0).unwrap();
    assert_eq!(read_all(&fs, &vol, &root, "trunc"), b"new");
}

#[test]
fn append_writes_at_end_of_file() {
    let (fs, vol, _dev) = fat16_volume();
    let root = vol.root_inode();
    create_file_with_content(&fs, &vol, &root, "log", b"first;");
    let inode = fs.locate_inode(&vol, &root, "log").unwrap();
    let mut file = fs
        .open_file(&vol, &inode, OpenFlags::WRITE | OpenFlags::APPEND)
        .unwrap();
    fs.write(&vol, &mut file, b"second;", 0).unwrap();
    assert_eq!(read_all(&fs, &vol, &root, "log"), b"first;second;");
}

#[test]
fn volume_label_can_be_set_and_read() {
    let (fs, vol, _dev) = fat16_volume();
    fs.write_fs_stat(&vol, Some("WorkDisk")).unwrap();
    let stat = fs.read_fs_stat(&vol).unwrap();
    assert_eq!(stat.volume_name, "workdisk");
}

#[test]
fn read_only_mount_refuses_writes() {
    let (fs, vol, dev) = fat16_volume();
    let root = vol.root_inode();
    create_file_with_content(&fs, &vol, &root, "frozen", b"ice");
    fs.unmount(&vol).unwrap();
    drop(vol);

    let fs = FatFilesystem::new();
    let vol = fs.mount(dev, "mem0", VolumeFlags::READ_ONLY).unwrap();
    let root = vol.root_inode();
    assert_eq!(read_all(&fs, &vol, &root, "frozen"), b"ice");
    assert!(matches!(
        fs.create_file(&vol, &root, "new", OpenFlags::WRITE | OpenFlags::CREATE),
        Err(FsError::ReadOnlyFilesystem)
    ));
    assert!(matches!(
        fs.unlink(&vol, &root, "frozen"),
        Err(FsError::ReadOnlyFilesystem)
    ));
}

#[test]
fn contents_survive_remount() {
    let (fs, vol, dev) = fat32_volume();
    let root = vol.root_inode();
    fs.create_directory(&vol, &root, "docs").unwrap();
    let docs = fs.locate_inode(&vol, &root, "docs").unwrap();
    let content: Vec<u8> = (0..3000u32).map(|i| (i % 250) as u8).collect();
    create_file_with_content(&fs, &vol, &docs, "Persisted Notes.txt", &content);
    fs.unmount(&vol).unwrap();
    drop((docs, root, vol));

    let fs = FatFilesystem::new();
    let vol = fs.mount(dev, "mem0", VolumeFlags::empty()).unwrap();
    let root = vol.root_inode();
    let docs = fs.locate_inode(&vol, &root, "docs").unwrap();
    assert_eq!(read_all(&fs, &vol, &docs, "Persisted Notes.txt"), content);
    // The FS-info free count survives the remount consistently.
    assert_eq!(
        fs.read_fs_stat(&vol).unwrap().free_blocks,
        table::count_free_clusters(&vol).unwrap() as u64
    );
}

#[test]
fn fat12_volume_supports_basic_operations() {
    let (fs, vol, _dev) = fat12_volume();
    assert_eq!(vol.info().fat_bits, 12);
    let root = vol.root_inode();
    let content: Vec<u8> = (0..1500u32).map(|i| (i % 240) as u8).collect();
    create_file_with_content(&fs, &vol, &root, "floppy.dat", &content);
    assert_eq!(read_all(&fs, &vol, &root, "floppy.dat"), content);
    assert_eq!(
        fs.read_fs_stat(&vol).unwrap().free_blocks,
        table::count_free_clusters(&vol).unwrap() as u64
    );
}

#[test]
fn fat12_fixed_root_cannot_grow_without_space() {
    let (fs, vol, _dev) = fat12_volume();
    let root = vol.root_inode();
    // 224 root entries; every long-named file burns 3+ slots. Creation must
    // eventually fail with NoSpace instead of corrupting the root.
    let mut failures = 0;
    for i in 0..120 {
        let name = format!("long file name number {i}.txt");
        match fs.create_file(&vol, &root, &name, OpenFlags::WRITE | OpenFlags::CREATE) {
            Ok(mut file) => fs.close_file(&vol, &mut file).unwrap(),
            Err(FsError::NoSpace) => {
                failures += 1;
                break;
            }
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(failures, 1, "fixed root must report NoSpace when full");
}

#[test]
fn write_stat_toggles_read_only_attribute() {
    let (fs, vol, _dev) = fat16_volume();
    let root = vol.root_inode();
    create_file_with_content(&fs, &vol, &root, "attr", b"x");
    let inode = fs.locate_inode(&vol, &root, "attr").unwrap();
    fs.write_stat(
        &vol,
        &inode,
        &StatUpdate {
            read_only: Some(true),
            ..StatUpdate::default()
        },
    )
    .unwrap();
    assert!(!fs.read_stat(&vol, &inode).unwrap().writable);
    assert!(matches!(
        fs.check_access(&vol, &inode, true),
        Err(FsError::NoPermission)
    ));
    assert!(fs.check_access(&vol, &inode, false).is_ok());
}

#[test]
fn compaction_shrinks_grown_directories() {
    let (fs, vol, _dev) = fat32_volume();
    let root = vol.root_inode();
    fs.create_directory(&vol, &root, "bulk").unwrap();
    let bulk = fs.locate_inode(&vol, &root, "bulk").unwrap();

    for i in 0..64 {
        let name = format!("a rather long file name {i:03}.dat");
        create_file_with_content(&fs, &vol, &bulk, &name, b"d");
    }
    let grown = fs.read_stat(&vol, &bulk).unwrap().size;
    assert!(grown > vol.bytes_per_cluster() as u64);

    for i in 0..64 {
        let name = format!("a rather long file name {i:03}.dat");
        let inode = fs.locate_inode(&vol, &bulk, &name).unwrap();
        fs.unlink(&vol, &bulk, &name).unwrap();
        fs.release_inode(&vol, &inode).unwrap();
    }
    let shrunk = fs.read_stat(&vol, &bulk).unwrap().size;
    assert!(shrunk < grown, "directory should shrink after unlinks");
    // The directory still works.
    create_file_with_content(&fs, &vol, &bulk, "after.txt", b"ok");
    assert_eq!(read_all(&fs, &vol, &bulk, "after.txt"), b"ok");
}

#[test]
fn probe_reports_mountable_volume() {
    let (_fs, vol, dev) = fat16_volume();
    drop(vol);
    let fs = FatFilesystem::new();
    let stat = fs.probe(dev, "mem0").unwrap();
    assert!(stat.flags.contains(VolumeFlags::CAN_MOUNT));
    assert!(stat.total_blocks > 0);
}

#[test]
fn artificial_ids_resolve_zero_size_collisions() {
    let (fs, vol, _dev) = fat16_volume();
    let root = vol.root_inode();
    // Two zero-size files; delete the first, create a third that lands on
    // the freed entry index. The second file's ID must stay unique through
    // all of it.
    let mut a = fs
        .create_file(&vol, &root, "aa", OpenFlags::WRITE | OpenFlags::CREATE)
        .unwrap();
    fs.close_file(&vol, &mut a).unwrap();
    let mut b = fs
        .create_file(&vol, &root, "bb", OpenFlags::WRITE | OpenFlags::CREATE)
        .unwrap();
    fs.close_file(&vol, &mut b).unwrap();

    let id_a = fs
        .read_stat(&vol, &fs.locate_inode(&vol, &root, "aa").unwrap())
        .unwrap()
        .inode_id;
    let id_b = fs
        .read_stat(&vol, &fs.locate_inode(&vol, &root, "bb").unwrap())
        .unwrap()
        .inode_id;
    assert_ne!(id_a, id_b);

    let inode_a = fs.locate_inode(&vol, &root, "aa").unwrap();
    fs.unlink(&vol, &root, "aa").unwrap();
    fs.release_inode(&vol, &inode_a).unwrap();

    let mut c = fs
        .create_file(&vol, &root, "cc", OpenFlags::WRITE | OpenFlags::CREATE)
        .unwrap();
    fs.close_file(&vol, &mut c).unwrap();
    let id_c = fs
        .read_stat(&vol, &fs.locate_inode(&vol, &root, "cc").unwrap())
        .unwrap()
        .inode_id;
    assert_ne!(id_b, id_c);
}
