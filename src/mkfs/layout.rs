//! Volume geometry selection for new FAT file systems.

use log::debug;
use serde::Serialize;

use super::MkfsOptions;
use crate::fs::fat_table::{FatVariant, FAT12_MAX_CLUSTERS, FAT16_MAX_CLUSTERS};

/// Largest cluster size picked automatically.
const MAX_AUTO_CLUSTER_BYTES: u64 = 32 * 1024;
const MAX_COMPAT: u8 = 16;
const DEFAULT_ROOT_ENTRIES: u16 = 512;
const FAT32_RESERVED_SECTORS: u16 = 32;
const FIXED_DISK_MEDIA: u8 = 0xF8;

/// Complete geometry of a volume about to be formatted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiskLayout {
    pub variant: FatVariant,
    pub bytes_per_sector_bits: u8,
    pub sectors_per_cluster_bits: u8,
    pub reserved_sector_count: u16,
    pub num_fats: u8,
    pub root_entry_count: u16,
    pub root_dir_sectors: u32,
    pub fat_size: u32,
    pub total_sectors: u32,
    pub count_of_clusters: u32,
    pub media: u8,
    pub sectors_per_track: u16,
    pub num_heads: u16,
}

impl DiskLayout {
    pub fn bytes_per_sector(&self) -> u32 {
        1 << self.bytes_per_sector_bits
    }

    pub fn sectors_per_cluster(&self) -> u32 {
        1 << self.sectors_per_cluster_bits
    }

    /// First sector of the fixed root directory (FAT12/16) or of the data
    /// region (FAT32).
    pub fn root_dir_sector(&self) -> u32 {
        self.reserved_sector_count as u32 + self.num_fats as u32 * self.fat_size
    }

    pub fn first_data_sector(&self) -> u32 {
        self.root_dir_sector() + self.root_dir_sectors
    }
}

/// One row of the legacy floppy table.
struct FloppyFormat {
    total_sectors: u32,
    sectors_per_track: u16,
    num_heads: u16,
    sectors_per_cluster_bits: u8,
    root_entry_count: u16,
    fat_size: u32,
    media: u8,
}

#[rustfmt::skip]
const FLOPPY_FORMATS: [FloppyFormat; 8] = [
    // 160K, 180K, 320K, 360K (5.25")
    FloppyFormat { total_sectors: 320,  sectors_per_track: 8,  num_heads: 1, sectors_per_cluster_bits: 0, root_entry_count: 64,  fat_size: 1, media: 0xFE },
    FloppyFormat { total_sectors: 360,  sectors_per_track: 9,  num_heads: 1, sectors_per_cluster_bits: 0, root_entry_count: 64,  fat_size: 2, media: 0xFC },
    FloppyFormat { total_sectors: 640,  sectors_per_track: 8,  num_heads: 2, sectors_per_cluster_bits: 1, root_entry_count: 112, fat_size: 1, media: 0xFF },
    FloppyFormat { total_sectors: 720,  sectors_per_track: 9,  num_heads: 2, sectors_per_cluster_bits: 1, root_entry_count: 112, fat_size: 2, media: 0xFD },
    // 720K (3.5"), 1200K (5.25" HD), 1440K, 2880K (3.5")
    FloppyFormat { total_sectors: 1440, sectors_per_track: 9,  num_heads: 2, sectors_per_cluster_bits: 1, root_entry_count: 112, fat_size: 3, media: 0xF9 },
    FloppyFormat { total_sectors: 2400, sectors_per_track: 15, num_heads: 2, sectors_per_cluster_bits: 0, root_entry_count: 224, fat_size: 7, media: 0xF9 },
    FloppyFormat { total_sectors: 2880, sectors_per_track: 18, num_heads: 2, sectors_per_cluster_bits: 0, root_entry_count: 224, fat_size: 9, media: 0xF0 },
    FloppyFormat { total_sectors: 5760, sectors_per_track: 36, num_heads: 2, sectors_per_cluster_bits: 1, root_entry_count: 240, fat_size: 9, media: 0xF0 },
];

/// Inclusive cluster-count range a variant may use, narrowed by `compat`
/// clusters on each side of the ambiguous FAT12/16 and FAT16/32 boundaries.
pub fn cluster_window(variant: FatVariant, compat: u8) -> (u32, u32) {
    let compat = compat as u32;
    match variant {
        // 4085 and 4086 are read differently by different drivers
        FatVariant::Fat12 => (1, FAT12_MAX_CLUSTERS - 3 - compat),
        FatVariant::Fat16 => (FAT12_MAX_CLUSTERS + compat, FAT16_MAX_CLUSTERS - 1 - compat),
        FatVariant::Fat32 => (FAT16_MAX_CLUSTERS + compat, 0x0FFF_FFF5 - compat),
    }
}

/// Sectors for one FAT covering `count_of_clusters` clusters.
pub fn fat_sectors(variant: FatVariant, count_of_clusters: u32, bytes_per_sector: u32) -> u32 {
    let bits = (count_of_clusters as u64 + 2) * variant.bits() as u64;
    bits.div_ceil(8 * bytes_per_sector as u64) as u32
}

/// Windows' default FAT32 cluster size for a volume of `bytes`.
fn fat32_default_cluster_bytes(bytes: u64) -> u64 {
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * MIB;
    match bytes {
        b if b <= 64 * MIB => 512,
        b if b <= 128 * MIB => 1024,
        b if b <= 256 * MIB => 2048,
        b if b <= 8 * GIB => 4096,
        b if b <= 16 * GIB => 8192,
        b if b <= 32 * GIB => 16384,
        _ => 32768,
    }
}

fn floppy_layout(total_sectors: u32, options: &MkfsOptions) -> Option<DiskLayout> {
    let overridden = options.fat_type.is_some()
        || options.sectors_per_cluster.is_some()
        || options.root_entry_count.is_some()
        || options.num_fats.is_some()
        || options.bytes_per_sector != 512;
    if overridden {
        return None;
    }
    let format = FLOPPY_FORMATS
        .iter()
        .find(|f| f.total_sectors == total_sectors)?;
    let num_fats = 2u8;
    let root_dir_sectors = (format.root_entry_count as u32 * 32).div_ceil(512);
    let first_data = 1 + num_fats as u32 * format.fat_size + root_dir_sectors;
    let count_of_clusters = (total_sectors - first_data) >> format.sectors_per_cluster_bits;
    Some(DiskLayout {
        variant: FatVariant::Fat12,
        bytes_per_sector_bits: 9,
        sectors_per_cluster_bits: format.sectors_per_cluster_bits,
        reserved_sector_count: 1,
        num_fats,
        root_entry_count: format.root_entry_count,
        root_dir_sectors,
        fat_size: format.fat_size,
        total_sectors,
        count_of_clusters,
        media: options.media.unwrap_or(format.media),
        sectors_per_track: options.sectors_per_track.unwrap_or(format.sectors_per_track),
        num_heads: options.num_heads.unwrap_or(format.num_heads),
    })
}

/// Variants to try, in order, for a volume of `bytes`.
fn candidate_variants(bytes: u64, explicit: Option<FatVariant>) -> Vec<FatVariant> {
    const MIB: u64 = 1024 * 1024;
    match explicit {
        Some(variant) => vec![variant],
        None if bytes <= 16 * MIB => vec![FatVariant::Fat12, FatVariant::Fat16, FatVariant::Fat32],
        None if bytes <= 512 * MIB => vec![FatVariant::Fat16, FatVariant::Fat32],
        None => vec![FatVariant::Fat32],
    }
}

/// Cluster-size exponents to try for `variant`, in order.
fn candidate_cluster_bits(
    variant: FatVariant,
    bytes: u64,
    bytes_per_sector_bits: u8,
    explicit: Option<u8>,
) -> Vec<u8> {
    if let Some(spc) = explicit {
        return vec![spc.trailing_zeros() as u8];
    }
    let max_bits = (0..=7u8)
        .take_while(|&b| (1u64 << (b + bytes_per_sector_bits)) <= MAX_AUTO_CLUSTER_BYTES)
        .last()
        .unwrap_or(0);
    if variant != FatVariant::Fat32 {
        return (0..=max_bits).collect();
    }
    let preferred = fat32_default_cluster_bytes(bytes);
    let start = (0..=max_bits)
        .find(|&b| (1u64 << (b + bytes_per_sector_bits)) >= preferred)
        .unwrap_or(max_bits);
    (start..=max_bits).chain((0..start).rev()).collect()
}

struct Attempt {
    variant: FatVariant,
    bytes_per_sector_bits: u8,
    sectors_per_cluster_bits: u8,
    reserved: u32,
    num_fats: u32,
    root_entry_count: u16,
    root_dir_sectors: u32,
    total_sectors: u32,
}

/// Fit a layout for one (variant, cluster size) pair, or `None` when the
/// resulting cluster count falls outside the variant's window.
fn try_fit(attempt: &Attempt, compat: u8) -> Option<(u32, u32, u32)> {
    let bytes_per_sector = 1u32 << attempt.bytes_per_sector_bits;
    let spc_bits = attempt.sectors_per_cluster_bits as u32;
    let fixed = attempt.reserved + attempt.root_dir_sectors;
    let (min, max) = cluster_window(attempt.variant, compat);

    let clusters_for = |fat_size: u32| -> Option<u32> {
        let metadata = fixed as u64 + attempt.num_fats as u64 * fat_size as u64;
        let data = (attempt.total_sectors as u64).checked_sub(metadata)?;
        Some((data >> spc_bits) as u32)
    };

    // Grow the FAT until it covers the clusters left beside it.
    let mut fat_size = 1u32;
    let mut count = loop {
        let count = clusters_for(fat_size)?;
        let needed = fat_sectors(attempt.variant, count, bytes_per_sector);
        if needed <= fat_size {
            break count;
        }
        fat_size = needed;
    };
    if count < min || count > max {
        return None;
    }

    // Align the data region to a cluster boundary.
    let mut reserved = attempt.reserved;
    let spc = 1u32 << spc_bits;
    let first_data = reserved + attempt.num_fats * fat_size + attempt.root_dir_sectors;
    let pad = (spc - first_data % spc) % spc;
    if pad > 0 {
        let slack = attempt.total_sectors - first_data - (count << spc_bits);
        if pad > slack {
            // The FAT still covers one cluster fewer; its size is kept so
            // the padding stays valid.
            count -= 1;
            if count < min {
                return None;
            }
        }
        reserved += pad;
    }
    Some((reserved, fat_size, count))
}

/// Choose the geometry for formatting `capacity` bytes. `None` when no
/// variant and cluster size can cover the capacity.
pub fn compute_layout(capacity: u64, options: &MkfsOptions) -> Option<DiskLayout> {
    if options.compat > MAX_COMPAT {
        return None;
    }
    let bytes_per_sector = options.bytes_per_sector;
    if !matches!(bytes_per_sector, 512 | 1024 | 2048 | 4096) {
        return None;
    }
    let bytes_per_sector_bits = bytes_per_sector.trailing_zeros() as u8;
    let total_sectors = u32::try_from(capacity / bytes_per_sector as u64).ok()?;
    if let Some(spc) = options.sectors_per_cluster {
        if !spc.is_power_of_two() {
            return None;
        }
    }
    let num_fats = options.num_fats.unwrap_or(2);
    if num_fats == 0 {
        return None;
    }

    if let Some(layout) = floppy_layout(total_sectors, options) {
        debug!("using floppy geometry for {total_sectors} sectors");
        return Some(layout);
    }

    let entries_per_sector = bytes_per_sector / 32;
    for variant in candidate_variants(capacity, options.fat_type) {
        let (reserved, root_entry_count) = if variant == FatVariant::Fat32 {
            (FAT32_RESERVED_SECTORS, 0)
        } else {
            let requested = options.root_entry_count.unwrap_or(DEFAULT_ROOT_ENTRIES).max(1);
            let rounded = requested.div_ceil(entries_per_sector) as u32 * entries_per_sector as u32;
            (1, u16::try_from(rounded).ok()?)
        };
        let root_dir_sectors = (root_entry_count as u32 * 32).div_ceil(bytes_per_sector as u32);

        for spc_bits in candidate_cluster_bits(
            variant,
            capacity,
            bytes_per_sector_bits,
            options.sectors_per_cluster,
        ) {
            let attempt = Attempt {
                variant,
                bytes_per_sector_bits,
                sectors_per_cluster_bits: spc_bits,
                reserved: reserved as u32,
                num_fats: num_fats as u32,
                root_entry_count,
                root_dir_sectors,
                total_sectors,
            };
            let Some((reserved, fat_size, count)) = try_fit(&attempt, options.compat) else {
                continue;
            };
            let Ok(reserved_sector_count) = u16::try_from(reserved) else {
                continue;
            };
            if variant != FatVariant::Fat32 && fat_size > u16::MAX as u32 {
                continue;
            }
            debug!(
                "{} layout: {count} clusters of {} sectors, FAT {fat_size} sectors",
                variant.name(),
                1u32 << spc_bits
            );
            return Some(DiskLayout {
                variant,
                bytes_per_sector_bits,
                sectors_per_cluster_bits: spc_bits,
                reserved_sector_count,
                num_fats,
                root_entry_count,
                root_dir_sectors,
                fat_size,
                total_sectors,
                count_of_clusters: count,
                media: options.media.unwrap_or(FIXED_DISK_MEDIA),
                sectors_per_track: options.sectors_per_track.unwrap_or(63),
                num_heads: options.num_heads.unwrap_or(255),
            });
        }
    }
    debug!("no FAT layout fits {capacity} bytes");
    None
}
