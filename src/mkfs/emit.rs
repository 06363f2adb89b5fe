//! Sector images for a freshly formatted volume.

use log::debug;

use super::layout::DiskLayout;
use super::{encode_label, volume_id, MkfsOptions};
use crate::codepage::{Codepage, Cp437};
use crate::fs::boot_sector::{
    BiosParameterBlock, BootSector, ExtendedBootRecord, Fat32Extension, FsInfo,
    EXTENDED_BOOT_SIGNATURE, FAT16_BOOT_CODE_LEN, FAT32_BOOT_CODE_LEN,
};
use crate::fs::dir_entry::{Attributes, DirectoryRecord};
use crate::fs::FatVariant;
use crate::sector_set::SectorSet;

const FS_INFO_SECTOR: u16 = 1;
const BACKUP_BOOT_SECTOR: u16 = 6;
const ROOT_CLUSTER: u32 = 2;

fn boot_code(variant: FatVariant, options: &MkfsOptions) -> Vec<u8> {
    let len = match variant {
        FatVariant::Fat32 => FAT32_BOOT_CODE_LEN,
        _ => FAT16_BOOT_CODE_LEN,
    };
    let mut code = options.boot_code.clone().unwrap_or_default();
    code.truncate(len);
    let message_at = code.len();
    code.resize(len, 0);

    if let Some(message) = options.message.as_deref() {
        let text: Vec<u8> = message
            .chars()
            .map(|c| Cp437.encode_char(c).unwrap_or(b'?'))
            .collect();
        let room = len - message_at;
        if text.len() > room {
            debug!("boot message truncated to {room} bytes");
        }
        let n = text.len().min(room);
        code[message_at..message_at + n].copy_from_slice(&text[..n]);
    }
    code
}

fn boot_sector(layout: &DiskLayout, options: &MkfsOptions) -> BootSector {
    let is_fat32 = layout.variant == FatVariant::Fat32;
    let mut oem_name = [b' '; 8];
    let oem = options.oem_name.as_bytes();
    let n = oem.len().min(8);
    oem_name[..n].copy_from_slice(&oem[..n]);

    let small = !is_fat32 && layout.total_sectors < 0x10000;
    let bpb = BiosParameterBlock {
        bytes_per_sector: layout.bytes_per_sector() as u16,
        sectors_per_cluster: layout.sectors_per_cluster() as u8,
        reserved_sector_count: layout.reserved_sector_count,
        num_fats: layout.num_fats,
        root_entry_count: layout.root_entry_count,
        total_sectors_16: if small { layout.total_sectors as u16 } else { 0 },
        media: layout.media,
        fat_size_16: if is_fat32 { 0 } else { layout.fat_size as u16 },
        sectors_per_track: layout.sectors_per_track,
        num_heads: layout.num_heads,
        hidden_sectors: options.hidden_sectors,
        total_sectors_32: if small { 0 } else { layout.total_sectors },
    };
    let fat32 = is_fat32.then_some(Fat32Extension {
        fat_size_32: layout.fat_size,
        ext_flags: 0,
        fs_version: 0,
        root_cluster: ROOT_CLUSTER,
        fs_info_sector: FS_INFO_SECTOR,
        backup_boot_sector: BACKUP_BOOT_SECTOR,
        reserved: [0; 12],
    });
    let ext = ExtendedBootRecord {
        drive_number: if layout.media == 0xF8 { 0x80 } else { 0x00 },
        reserved1: 0,
        boot_signature: EXTENDED_BOOT_SIGNATURE,
        volume_id: volume_id(layout, options),
        volume_label: encode_label(options).ok().flatten().unwrap_or(*b"NO NAME    "),
        fs_type: layout.variant.fs_type_label(),
    };

    BootSector {
        jump: if is_fat32 {
            [0xEB, 0x58, 0x90]
        } else {
            [0xEB, 0x3C, 0x90]
        },
        oem_name,
        bpb,
        fat32,
        ext,
        boot_code: boot_code(layout.variant, options),
    }
}

/// Reserved entries at the head of every FAT copy.
fn fat_seed(variant: FatVariant, media: u8) -> Vec<u8> {
    match variant {
        FatVariant::Fat12 => vec![media, 0xFF, 0xFF],
        FatVariant::Fat16 => vec![media, 0xFF, 0xFF, 0xFF],
        FatVariant::Fat32 => {
            let mut seed = Vec::with_capacity(12);
            seed.extend_from_slice(&variant.media_entry(media).to_le_bytes());
            seed.extend_from_slice(&variant.end_of_chain().to_le_bytes());
            // Root directory cluster
            seed.extend_from_slice(&variant.end_of_chain().to_le_bytes());
            seed
        }
    }
}

/// Pad a 512-byte structure out to a full sector.
fn sector_bytes(bytes: &[u8], sector_size: u32) -> Vec<u8> {
    let mut sector = bytes.to_vec();
    sector.resize(sector_size as usize, 0);
    sector
}

/// Describe every sector of an empty volume with `layout`: the zeroed
/// metadata region plus the boot sector, FAT heads, FAT32 FSInfo and
/// backups, and the volume label record.
pub fn emit_sectors(layout: &DiskLayout, options: &MkfsOptions) -> SectorSet {
    let sector_size = layout.bytes_per_sector();
    let mut set = SectorSet::new(sector_size);
    let is_fat32 = layout.variant == FatVariant::Fat32;

    let mut zero_end = layout.first_data_sector() as u64;
    if is_fat32 {
        zero_end += layout.sectors_per_cluster() as u64;
    }
    set.zero(0..zero_end);

    let boot = sector_bytes(&boot_sector(layout, options).to_bytes(), sector_size);
    set.put_sector(0, boot.clone());

    if is_fat32 {
        let info = FsInfo {
            free_count: layout.count_of_clusters - 1,
            next_free: ROOT_CLUSTER + 1,
        };
        let info = sector_bytes(&info.to_bytes(), sector_size);
        set.put_sector(FS_INFO_SECTOR as u64, info.clone());
        set.put_sector(BACKUP_BOOT_SECTOR as u64, boot);
        set.put_sector(BACKUP_BOOT_SECTOR as u64 + 1, info);
    }

    let seed = fat_seed(layout.variant, layout.media);
    for copy in 0..layout.num_fats as u64 {
        let sector = layout.reserved_sector_count as u64 + copy * layout.fat_size as u64;
        set.put(sector, 0, seed.clone());
    }

    if let Ok(Some(label)) = encode_label(options) {
        let record = DirectoryRecord {
            name: label,
            attributes: Attributes(Attributes::VOLUME_ID),
            ..Default::default()
        };
        set.put(layout.root_dir_sector() as u64, 0, record.to_bytes().to_vec());
    }
    set
}
