//! End-to-end tests driving the public API on in-memory images.
//!
//! Every image is produced by `mkfsvfat` and written through a `SectorSet`,
//! so no fixtures are needed.
//!
//! Run with: cargo test --test fat_e2e

use rusty_fat::disk::{mount, MountOptions};
use rusty_fat::fs::FatVariant;
use rusty_fat::partition::{self, PartitionRecord};
use rusty_fat::{mkfsvfat, Cp437, FatError, FileSystem, MemoryStorage, MkfsOptions};

const MIB: u64 = 1024 * 1024;

fn format(capacity: u64, options: &MkfsOptions) -> FileSystem<MemoryStorage> {
    let result = mkfsvfat(capacity, options).expect("layout");
    let mut storage = MemoryStorage::new(capacity as usize);
    result.sectors.write_to(&mut storage, 0, false).unwrap();
    FileSystem::mount(storage, &Cp437).unwrap()
}

// ============================================================================
// Formatting
// ============================================================================

#[test]
fn test_720k_default_layout() {
    let result = mkfsvfat(737_280, &MkfsOptions::default()).unwrap();
    assert_eq!(result.fat_type, FatVariant::Fat12);
    assert_eq!(result.num_fats, 2);
    assert_eq!(result.root_dir_sectors, 7);
    assert_eq!(result.sec_per_clus, 2);
    assert_eq!(result.count_of_clusters, 713);
    assert_eq!(result.tot_sec, 1440);
}

#[test]
fn test_layout_fits_capacity() {
    for capacity in [
        400 * 1024,
        3 * MIB + 777,
        20 * MIB,
        300 * MIB + 4096,
        600 * MIB,
        2 * 1024 * MIB,
    ] {
        let result = mkfsvfat(capacity, &MkfsOptions::default())
            .unwrap_or_else(|| panic!("no layout for {capacity}"));
        let used = result.tot_sec as u64 * result.byts_per_sec as u64;
        let cluster = result.sec_per_clus as u64 * result.byts_per_sec as u64;
        assert!(used <= capacity, "{capacity}: {used} bytes used");
        assert!(capacity - used < cluster, "{capacity}: slack {}", capacity - used);
    }
}

#[test]
fn test_format_is_deterministic() {
    let options = MkfsOptions {
        label: Some("SAME".into()),
        ..Default::default()
    };
    assert_eq!(mkfsvfat(48 * MIB, &options), mkfsvfat(48 * MIB, &options));
}

#[test]
fn test_options_round_trip_through_json() {
    let options = MkfsOptions {
        fat_type: Some(FatVariant::Fat32),
        label: Some("BACKUP".into()),
        sectors_per_cluster: Some(8),
        compat: 4,
        ..Default::default()
    };
    let json = serde_json::to_string_pretty(&options).unwrap();
    assert!(json.contains("\"FAT32\""));
    let parsed: MkfsOptions = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, options);

    let result = mkfsvfat(512 * MIB, &parsed).unwrap();
    let summary = serde_json::to_value(&result).unwrap();
    assert_eq!(summary["fat_type"], "FAT32");
    assert_eq!(summary["sec_per_clus"], 8);
}

// ============================================================================
// File tree
// ============================================================================

#[test]
fn test_fat12_write_and_read_back() {
    let mut fs = format(737_280, &MkfsOptions::default());
    let node = fs.create_file("/a/b.txt").unwrap();
    fs.open(&node).unwrap().write_all(b"0123456789").unwrap();

    let node = fs.resolve("/A/B.TXT").unwrap().unwrap();
    let mut file = fs.open(&node).unwrap();
    assert_eq!(file.length(), 10);
    assert_eq!(file.read_all().unwrap(), b"0123456789");

    let dir = fs.resolve("/a").unwrap().unwrap();
    let names: Vec<String> = fs
        .list(&dir)
        .unwrap()
        .into_iter()
        .map(|n| n.long_name)
        .collect();
    assert_eq!(names, vec!["b.txt".to_string()]);
}

#[test]
fn test_long_names_survive_remount() {
    let mut fs = format(1_474_560, &MkfsOptions::default());
    fs.create_file("/Quarterly Report 2024.xlsx").unwrap();
    fs.create_dir("/Program Files/Very Long Directory Name").unwrap();

    let storage = fs.into_storage();
    let mut fs = FileSystem::mount(storage, &Cp437).unwrap();
    let file = fs.resolve("/quarterly report 2024.XLSX").unwrap().unwrap();
    assert_eq!(file.long_name, "Quarterly Report 2024.xlsx");
    assert!(fs
        .resolve("/Program Files/Very Long Directory Name")
        .unwrap()
        .unwrap()
        .is_dir());
}

#[test]
fn test_colliding_names_get_distinct_short_names() {
    let mut fs = format(1_474_560, &MkfsOptions::default());
    for i in 0..9 {
        fs.create_file(&format!("/Collision test file {i}.txt")).unwrap();
    }
    let root = fs.root();
    let nodes = fs.list(&root).unwrap();
    assert_eq!(nodes.len(), 9);
    let mut short: Vec<String> = nodes.iter().map(|n| n.short_name.clone()).collect();
    short.sort();
    short.dedup();
    assert_eq!(short.len(), 9);
    assert!(short.iter().any(|s| s == "COLLIS~1.TXT"));
}

#[test]
fn test_delete_everything_frees_all_clusters() {
    let mut fs = format(16 * MIB, &MkfsOptions::default());
    let total = fs.cluster_count();
    assert_eq!(fs.free_clusters().unwrap(), total);

    for dir in ["/x", "/x/y", "/z"] {
        fs.create_dir(dir).unwrap();
    }
    for (i, path) in ["/x/one.bin", "/x/y/two.bin", "/z/three.bin", "/four.bin"]
        .iter()
        .enumerate()
    {
        let node = fs.create_file(path).unwrap();
        let data = vec![i as u8; 3000 * (i + 1)];
        fs.open(&node).unwrap().write_all(&data).unwrap();
    }
    assert!(fs.free_clusters().unwrap() < total);

    let root = fs.root();
    for node in fs.list(&root).unwrap() {
        fs.delete(&node).unwrap();
    }
    assert_eq!(fs.free_clusters().unwrap(), total);
    assert!(fs.list(&root).unwrap().is_empty());
}

#[test]
fn test_move_between_directories() {
    let mut fs = format(1_474_560, &MkfsOptions::default());
    let node = fs.create_file("/inbox/note.txt").unwrap();
    fs.open(&node).unwrap().write_all(b"remember").unwrap();
    fs.create_dir("/archive").unwrap();

    let node = fs.resolve("/inbox/note.txt").unwrap().unwrap();
    let moved = fs.move_to(&node, "/archive/Old Note.txt").unwrap();
    assert_eq!(moved.long_name, "Old Note.txt");
    assert!(fs.resolve("/inbox/note.txt").unwrap().is_none());

    let mut file = fs.open(&moved).unwrap();
    assert_eq!(file.read_all().unwrap(), b"remember");

    let archive = fs.resolve("/archive").unwrap().unwrap();
    let err = fs.move_to(&archive, "/archive/inner").unwrap_err();
    assert!(matches!(err, FatError::MoveIntoSelf(_)));
}

#[test]
fn test_full_volume_reports_exhaustion() {
    let mut fs = format(
        1_474_560,
        &MkfsOptions {
            root_entry_count: Some(16),
            ..Default::default()
        },
    );
    let node = fs.create_file("/FILL.BIN").unwrap();
    let free = fs.free_clusters().unwrap() as usize;
    let err = fs
        .open(&node)
        .unwrap()
        .write_all(&vec![0xAA; (free + 1) * 512])
        .unwrap_err();
    assert!(err.is_exhaustion());

    // 16 root slots, one used by FILL.BIN
    for i in 0..15 {
        fs.create_file(&format!("/F{i}")).unwrap();
    }
    let err = fs.create_file("/LAST").unwrap_err();
    assert!(matches!(err, FatError::DirectoryFull(_)));
}

// ============================================================================
// Partitions
// ============================================================================

#[test]
fn test_mbr_entry_parses_back() {
    let record = PartitionRecord::new(true, 0x0E, 2048, 195_369_519);
    let sector = partition::serialize(std::slice::from_ref(&record));
    let parsed = partition::parse(&sector);
    assert_eq!(parsed, vec![record]);
    assert!(parsed[0].active());
}

#[test]
fn test_partitioned_disk_end_to_end() {
    let capacity = 48 * MIB;
    let mut disk = mount(MemoryStorage::new(capacity as usize), MountOptions::default());
    let first = mkfsvfat(16 * MIB, &MkfsOptions::default()).unwrap();
    let second = mkfsvfat(
        24 * MIB,
        &MkfsOptions {
            label: Some("SECOND".into()),
            ..Default::default()
        },
    )
    .unwrap();
    let records = [
        PartitionRecord::new(true, 0x06, 2048, first.tot_sec),
        PartitionRecord::new(false, 0x06, 2048 + first.tot_sec, second.tot_sec),
    ];
    disk.write(&partition::fdisk(&records)).unwrap();
    disk.write_at(records[0].start_bytes(), &first.sectors).unwrap();
    disk.write_at(records[1].start_bytes(), &second.sectors).unwrap();
    assert_eq!(disk.partitions(), records.to_vec());

    let mut disk = mount(
        disk.into_storage(),
        MountOptions {
            partition: Some(1),
            ..Default::default()
        },
    );
    let mut fs = disk.file_system().unwrap();
    assert_eq!(fs.label().unwrap().as_deref(), Some("SECOND"));
    let node = fs.create_file("/hello.txt").unwrap();
    fs.open(&node).unwrap().write_all(b"hi").unwrap();
    drop(fs);

    let mut disk = mount(
        disk.into_storage(),
        MountOptions {
            partition: Some(0),
            ..Default::default()
        },
    );
    let mut fs = disk.file_system().unwrap();
    assert!(fs.resolve("/hello.txt").unwrap().is_none());
}
