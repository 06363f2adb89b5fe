//! Host-file helpers for producing formatted disk images.

use std::path::Path;

use anyhow::{bail, Context, Result};
use log::debug;

use crate::mkfs::{mkfsvfat, MkfsOptions, MkfsResult};
use crate::partition::{fat_system_id, fdisk, PartitionRecord};
use crate::storage::ImageFile;

/// First partition starts on a 1 MiB boundary.
const PARTITION_START_LBA: u32 = 2048;

/// Create `path` as a bare (unpartitioned) FAT volume of `capacity` bytes.
pub fn format_image_file(path: &Path, capacity: u64, options: &MkfsOptions) -> Result<MkfsResult> {
    let Some(result) = mkfsvfat(capacity, options) else {
        bail!("no FAT layout fits {capacity} bytes with the given options");
    };
    let mut image = ImageFile::create(path, capacity)
        .with_context(|| format!("failed to create {}", path.display()))?;
    // A freshly created file reads back as zeros
    result
        .sectors
        .write_to(&mut image, 0, true)
        .with_context(|| format!("failed to write {}", path.display()))?;
    image
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    debug!(
        "formatted {} as {} with {} clusters",
        path.display(),
        result.fat_type.name(),
        result.count_of_clusters
    );
    Ok(result)
}

/// Create `path` as a `capacity`-byte disk with an MBR and one active FAT
/// partition filling the space after the first MiB.
pub fn write_partitioned_image(
    path: &Path,
    capacity: u64,
    options: &MkfsOptions,
) -> Result<(PartitionRecord, MkfsResult)> {
    let start_bytes = PARTITION_START_LBA as u64 * 512;
    if capacity <= start_bytes {
        bail!("{capacity} bytes leave no room for a partition");
    }
    let options = MkfsOptions {
        hidden_sectors: PARTITION_START_LBA,
        ..options.clone()
    };
    let Some(result) = mkfsvfat(capacity - start_bytes, &options) else {
        bail!(
            "no FAT layout fits a {} byte partition",
            capacity - start_bytes
        );
    };
    let volume_bytes = result.tot_sec as u64 * result.byts_per_sec as u64;
    let total_sectors = u32::try_from(volume_bytes / 512).context("partition too large for MBR")?;
    let end_lba = PARTITION_START_LBA as u64 + total_sectors as u64;
    let record = PartitionRecord::new(
        true,
        fat_system_id(result.fat_type, total_sectors, end_lba),
        PARTITION_START_LBA,
        total_sectors,
    );

    let mut image = ImageFile::create(path, capacity)
        .with_context(|| format!("failed to create {}", path.display()))?;
    fdisk(std::slice::from_ref(&record))
        .write_to(&mut image, 0, true)
        .context("failed to write partition table")?;
    result
        .sectors
        .write_to(&mut image, start_bytes, true)
        .context("failed to write FAT volume")?;
    image
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok((record, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codepage::Cp437;
    use crate::disk::{mount, MountOptions};
    use crate::fs::{FatVariant, FileSystem};

    #[test]
    fn test_format_image_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("floppy.img");
        let result = format_image_file(&path, 1_474_560, &MkfsOptions::default()).unwrap();
        assert_eq!(result.fat_type, FatVariant::Fat12);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 1_474_560);

        let mut fs = FileSystem::mount(ImageFile::open(&path).unwrap(), &Cp437).unwrap();
        fs.create_dir("/games").unwrap();
        assert_eq!(fs.list(&fs.root()).unwrap().len(), 1);
    }

    #[test]
    fn test_format_image_file_too_small() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.img");
        let err = format_image_file(&path, 1024, &MkfsOptions::default()).unwrap_err();
        assert!(err.to_string().contains("no FAT layout"));
        assert!(!path.exists());
    }

    #[test]
    fn test_write_partitioned_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let options = MkfsOptions {
            label: Some("DISK".into()),
            ..Default::default()
        };
        let (record, result) = write_partitioned_image(&path, 64 * 1024 * 1024, &options).unwrap();
        assert_eq!(record.relative_sectors, 2048);
        assert_eq!(record.system_id, 0x06);
        assert_eq!(result.fat_type, FatVariant::Fat16);

        let mut disk = mount(
            ImageFile::open_read_only(&path).unwrap(),
            MountOptions {
                partition: Some(0),
                ..Default::default()
            },
        );
        assert_eq!(disk.partitions(), vec![record]);
        let mut fs = disk.file_system().unwrap();
        assert_eq!(fs.label().unwrap().as_deref(), Some("DISK"));
        assert_eq!(fs.boot_sector().bpb.hidden_sectors, 2048);
    }
}
