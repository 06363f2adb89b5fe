//! Boot sector, BIOS Parameter Block and FSInfo codec.

use std::io::{Cursor, Read};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use log::debug;

use super::fat_table::{FatVariant, FAT16_MAX_CLUSTERS};
use crate::codepage::Codepage;
use crate::error::FatError;
use crate::storage::Storage;

pub const BOOT_SECTOR_SIZE: usize = 512;
pub const BOOT_SIGNATURE: u16 = 0xAA55;
pub const EXTENDED_BOOT_SIGNATURE: u8 = 0x29;
pub const FAT16_BOOT_CODE_LEN: usize = 448;
pub const FAT32_BOOT_CODE_LEN: usize = 420;

const FSINFO_LEAD_SIGNATURE: u32 = 0x4161_5252;
const FSINFO_STRUCT_SIGNATURE: u32 = 0x6141_7272;
const FSINFO_TRAIL_SIGNATURE: u32 = 0xAA55_0000;
/// FSInfo "unknown" marker for both hints.
pub const FSINFO_UNKNOWN: u32 = 0xFFFF_FFFF;

/// Fields common to every FAT variant (offsets 11..36).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiosParameterBlock {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub reserved_sector_count: u16,
    pub num_fats: u8,
    pub root_entry_count: u16,
    pub total_sectors_16: u16,
    pub media: u8,
    pub fat_size_16: u16,
    pub sectors_per_track: u16,
    pub num_heads: u16,
    pub hidden_sectors: u32,
    pub total_sectors_32: u32,
}

impl BiosParameterBlock {
    pub fn total_sectors(&self) -> u32 {
        if self.total_sectors_16 != 0 {
            self.total_sectors_16 as u32
        } else {
            self.total_sectors_32
        }
    }
}

/// FAT32-only fields (offsets 36..64), present iff `fat_size_16 == 0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fat32Extension {
    pub fat_size_32: u32,
    pub ext_flags: u16,
    pub fs_version: u16,
    pub root_cluster: u32,
    pub fs_info_sector: u16,
    pub backup_boot_sector: u16,
    pub reserved: [u8; 12],
}

/// Drive number, serial and labels; offset 36 (FAT12/16) or 64 (FAT32).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedBootRecord {
    pub drive_number: u8,
    pub reserved1: u8,
    pub boot_signature: u8,
    pub volume_id: u32,
    pub volume_label: [u8; 11],
    pub fs_type: [u8; 8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSector {
    pub jump: [u8; 3],
    pub oem_name: [u8; 8],
    pub bpb: BiosParameterBlock,
    pub fat32: Option<Fat32Extension>,
    pub ext: ExtendedBootRecord,
    /// 448 bytes for FAT12/16, 420 for FAT32.
    pub boot_code: Vec<u8>,
}

impl BootSector {
    /// Read and validate the boot sector at offset 0 of `storage`.
    pub fn read<S: Storage + ?Sized>(storage: &mut S) -> Result<Self, FatError> {
        if storage.capacity() < BOOT_SECTOR_SIZE as u64 {
            return Err(FatError::InvalidBootSector(format!(
                "storage too small: {} bytes",
                storage.capacity()
            )));
        }
        let mut data = [0u8; BOOT_SECTOR_SIZE];
        storage.read_at(0, &mut data)?;
        Self::parse(&data)
    }

    /// Parse and validate a 512-byte boot sector.
    pub fn parse(data: &[u8; BOOT_SECTOR_SIZE]) -> Result<Self, FatError> {
        // Jump instruction (EB xx 90 or E9 xx xx)
        if data[0] != 0xEB && data[0] != 0xE9 {
            return Err(FatError::InvalidBootSector(format!(
                "bad jump instruction {:#04X}",
                data[0]
            )));
        }
        let signature = u16::from_le_bytes([data[510], data[511]]);
        if signature != BOOT_SIGNATURE {
            debug!("boot sector lacks the 0xAA55 signature ({signature:#06X}), continuing");
        }

        let mut cursor = Cursor::new(&data[..]);
        let mut jump = [0u8; 3];
        cursor.read_exact(&mut jump)?;
        let mut oem_name = [0u8; 8];
        cursor.read_exact(&mut oem_name)?;

        let bpb = BiosParameterBlock {
            bytes_per_sector: cursor.read_u16::<LittleEndian>()?,
            sectors_per_cluster: cursor.read_u8()?,
            reserved_sector_count: cursor.read_u16::<LittleEndian>()?,
            num_fats: cursor.read_u8()?,
            root_entry_count: cursor.read_u16::<LittleEndian>()?,
            total_sectors_16: cursor.read_u16::<LittleEndian>()?,
            media: cursor.read_u8()?,
            fat_size_16: cursor.read_u16::<LittleEndian>()?,
            sectors_per_track: cursor.read_u16::<LittleEndian>()?,
            num_heads: cursor.read_u16::<LittleEndian>()?,
            hidden_sectors: cursor.read_u32::<LittleEndian>()?,
            total_sectors_32: cursor.read_u32::<LittleEndian>()?,
        };

        let fat32 = if bpb.fat_size_16 == 0 {
            let mut ext = Fat32Extension {
                fat_size_32: cursor.read_u32::<LittleEndian>()?,
                ext_flags: cursor.read_u16::<LittleEndian>()?,
                fs_version: cursor.read_u16::<LittleEndian>()?,
                root_cluster: cursor.read_u32::<LittleEndian>()?,
                fs_info_sector: cursor.read_u16::<LittleEndian>()?,
                backup_boot_sector: cursor.read_u16::<LittleEndian>()?,
                reserved: [0u8; 12],
            };
            cursor.read_exact(&mut ext.reserved)?;
            Some(ext)
        } else {
            None
        };

        let mut ext = ExtendedBootRecord {
            drive_number: cursor.read_u8()?,
            reserved1: cursor.read_u8()?,
            boot_signature: cursor.read_u8()?,
            volume_id: cursor.read_u32::<LittleEndian>()?,
            volume_label: [0u8; 11],
            fs_type: [0u8; 8],
        };
        cursor.read_exact(&mut ext.volume_label)?;
        cursor.read_exact(&mut ext.fs_type)?;

        let code_len = boot_code_len(fat32.is_some());
        let mut boot_code = vec![0u8; code_len];
        cursor.read_exact(&mut boot_code)?;

        let boot = Self {
            jump,
            oem_name,
            bpb,
            fat32,
            ext,
            boot_code,
        };
        boot.validate()?;
        Ok(boot)
    }

    fn validate(&self) -> Result<(), FatError> {
        let bpb = &self.bpb;
        let invalid = |msg: String| Err(FatError::InvalidBootSector(msg));

        if !matches!(bpb.bytes_per_sector, 512 | 1024 | 2048 | 4096) {
            return invalid(format!("invalid bytes per sector: {}", bpb.bytes_per_sector));
        }
        if !bpb.sectors_per_cluster.is_power_of_two() {
            return invalid(format!(
                "invalid sectors per cluster: {}",
                bpb.sectors_per_cluster
            ));
        }
        if bpb.reserved_sector_count == 0 {
            return invalid("reserved sector count is 0".into());
        }
        if bpb.num_fats == 0 {
            return invalid("number of FATs is 0".into());
        }
        if (bpb.total_sectors_16 == 0) == (bpb.total_sectors_32 == 0) {
            return invalid(format!(
                "exactly one of TotSec16 ({}) and TotSec32 ({}) must be set",
                bpb.total_sectors_16, bpb.total_sectors_32
            ));
        }
        match &self.fat32 {
            Some(ext) => {
                if bpb.root_entry_count != 0 {
                    return invalid(format!(
                        "FAT32 root entry count must be 0, got {}",
                        bpb.root_entry_count
                    ));
                }
                if ext.fat_size_32 == 0 {
                    return invalid("FAT32 FAT size is 0".into());
                }
                if ext.root_cluster < 2 {
                    return invalid(format!("invalid FAT32 root cluster: {}", ext.root_cluster));
                }
                if ext.fs_info_sector == 0 {
                    return invalid("FAT32 FSInfo sector is 0".into());
                }
            }
            None => {
                if bpb.root_entry_count == 0 {
                    return invalid("FAT12/16 root entry count is 0".into());
                }
            }
        }

        let geometry = self.geometry();
        if geometry.first_data_sector >= geometry.total_sectors || geometry.count_of_clusters == 0 {
            return invalid(format!(
                "no data region: first data sector {} of {} total",
                geometry.first_data_sector, geometry.total_sectors
            ));
        }
        if self.fat32.is_none() && geometry.count_of_clusters >= FAT16_MAX_CLUSTERS {
            return invalid(format!(
                "{} clusters need FAT32 but the boot sector has no FAT32 extension",
                geometry.count_of_clusters
            ));
        }
        if let Some(ext) = &self.fat32 {
            if ext.root_cluster > geometry.max_cluster() {
                return invalid(format!(
                    "FAT32 root cluster {} beyond last cluster {}",
                    ext.root_cluster,
                    geometry.max_cluster()
                ));
            }
        }
        let fat_bytes = geometry.fat_size as u64 * geometry.bytes_per_sector as u64;
        let needed = geometry.variant.table_bytes(geometry.count_of_clusters);
        if fat_bytes < needed {
            return invalid(format!(
                "FAT too small: {fat_bytes} bytes for {} clusters",
                geometry.count_of_clusters
            ));
        }
        Ok(())
    }

    /// Serialize to 512 bytes, the inverse of [`BootSector::parse`].
    pub fn to_bytes(&self) -> [u8; BOOT_SECTOR_SIZE] {
        assert_eq!(
            self.boot_code.len(),
            boot_code_len(self.fat32.is_some()),
            "boot code length does not match the FAT variant"
        );
        assert_eq!(
            self.fat32.is_some(),
            self.bpb.fat_size_16 == 0,
            "FAT32 extension must be present exactly when FatSize16 is 0"
        );

        let bpb = &self.bpb;
        let mut data = [0u8; BOOT_SECTOR_SIZE];
        data[0..3].copy_from_slice(&self.jump);
        data[3..11].copy_from_slice(&self.oem_name);
        LittleEndian::write_u16(&mut data[11..13], bpb.bytes_per_sector);
        data[13] = bpb.sectors_per_cluster;
        LittleEndian::write_u16(&mut data[14..16], bpb.reserved_sector_count);
        data[16] = bpb.num_fats;
        LittleEndian::write_u16(&mut data[17..19], bpb.root_entry_count);
        LittleEndian::write_u16(&mut data[19..21], bpb.total_sectors_16);
        data[21] = bpb.media;
        LittleEndian::write_u16(&mut data[22..24], bpb.fat_size_16);
        LittleEndian::write_u16(&mut data[24..26], bpb.sectors_per_track);
        LittleEndian::write_u16(&mut data[26..28], bpb.num_heads);
        LittleEndian::write_u32(&mut data[28..32], bpb.hidden_sectors);
        LittleEndian::write_u32(&mut data[32..36], bpb.total_sectors_32);

        // The extended boot record follows the FAT32 extension when present
        let at = match &self.fat32 {
            Some(ext) => {
                LittleEndian::write_u32(&mut data[36..40], ext.fat_size_32);
                LittleEndian::write_u16(&mut data[40..42], ext.ext_flags);
                LittleEndian::write_u16(&mut data[42..44], ext.fs_version);
                LittleEndian::write_u32(&mut data[44..48], ext.root_cluster);
                LittleEndian::write_u16(&mut data[48..50], ext.fs_info_sector);
                LittleEndian::write_u16(&mut data[50..52], ext.backup_boot_sector);
                data[52..64].copy_from_slice(&ext.reserved);
                64
            }
            None => 36,
        };
        let ext = &self.ext;
        data[at] = ext.drive_number;
        data[at + 1] = ext.reserved1;
        data[at + 2] = ext.boot_signature;
        LittleEndian::write_u32(&mut data[at + 3..at + 7], ext.volume_id);
        data[at + 7..at + 18].copy_from_slice(&ext.volume_label);
        data[at + 18..at + 26].copy_from_slice(&ext.fs_type);
        data[at + 26..510].copy_from_slice(&self.boot_code);
        LittleEndian::write_u16(&mut data[510..512], BOOT_SIGNATURE);
        data
    }

    pub fn fat_size(&self) -> u32 {
        match &self.fat32 {
            Some(ext) => ext.fat_size_32,
            None => self.bpb.fat_size_16 as u32,
        }
    }

    /// Derived layout of the volume.
    pub fn geometry(&self) -> Geometry {
        let bpb = &self.bpb;
        let bytes_per_sector = bpb.bytes_per_sector as u32;
        let root_entry_count = bpb.root_entry_count as u32;
        let root_dir_sectors = (root_entry_count * 32).div_ceil(bytes_per_sector.max(1));
        let fat_size = self.fat_size();
        let reserved_sectors = bpb.reserved_sector_count as u32;
        let num_fats = bpb.num_fats as u32;
        let first_data_sector = (reserved_sectors as u64
            + num_fats as u64 * fat_size as u64
            + root_dir_sectors as u64)
            .min(u32::MAX as u64) as u32;
        let total_sectors = bpb.total_sectors();
        let sectors_per_cluster = (bpb.sectors_per_cluster as u32).max(1);
        let count_of_clusters = total_sectors.saturating_sub(first_data_sector) / sectors_per_cluster;

        Geometry {
            variant: FatVariant::detect(bpb.fat_size_16, count_of_clusters),
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            fat_size,
            root_entry_count,
            root_dir_sectors,
            total_sectors,
            first_data_sector,
            count_of_clusters,
            root_cluster: self.fat32.as_ref().map_or(0, |ext| ext.root_cluster),
        }
    }

    /// Label stored in the boot sector, `None` when blank or "NO NAME".
    pub fn volume_label(&self, codepage: &dyn Codepage) -> Option<String> {
        let label = codepage.decode(&self.ext.volume_label);
        let label = label.trim_end();
        if label.is_empty() || label == "NO NAME" {
            None
        } else {
            Some(label.to_string())
        }
    }
}

fn boot_code_len(is_fat32: bool) -> usize {
    if is_fat32 {
        FAT32_BOOT_CODE_LEN
    } else {
        FAT16_BOOT_CODE_LEN
    }
}

/// Byte and sector layout derived from a validated BPB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub variant: FatVariant,
    pub bytes_per_sector: u32,
    pub sectors_per_cluster: u32,
    pub reserved_sectors: u32,
    pub num_fats: u32,
    pub fat_size: u32,
    pub root_entry_count: u32,
    pub root_dir_sectors: u32,
    pub total_sectors: u32,
    pub first_data_sector: u32,
    pub count_of_clusters: u32,
    /// FAT32 only; 0 otherwise.
    pub root_cluster: u32,
}

impl Geometry {
    pub fn sector_offset(&self, sector: u32) -> u64 {
        sector as u64 * self.bytes_per_sector as u64
    }

    /// Byte offset of the first FAT copy.
    pub fn fat_offset(&self) -> u64 {
        self.sector_offset(self.reserved_sectors)
    }

    /// Bytes in one FAT copy.
    pub fn fat_bytes(&self) -> u64 {
        self.fat_size as u64 * self.bytes_per_sector as u64
    }

    /// Start of the fixed FAT12/16 root directory region.
    pub fn root_dir_offset(&self) -> u64 {
        self.fat_offset() + self.num_fats as u64 * self.fat_bytes()
    }

    /// End of the fixed root region (equal to the start for FAT32).
    pub fn root_dir_end(&self) -> u64 {
        self.root_dir_offset() + self.root_entry_count as u64 * 32
    }

    pub fn data_offset(&self) -> u64 {
        self.sector_offset(self.first_data_sector)
    }

    pub fn cluster_bytes(&self) -> u64 {
        self.bytes_per_sector as u64 * self.sectors_per_cluster as u64
    }

    pub fn max_cluster(&self) -> u32 {
        self.count_of_clusters + 1
    }

    pub fn is_valid_cluster(&self, cluster: u32) -> bool {
        (2..=self.max_cluster()).contains(&cluster)
    }

    pub fn cluster_offset(&self, cluster: u32) -> u64 {
        self.data_offset() + (cluster as u64 - 2) * self.cluster_bytes()
    }

    /// Whether `offset` lies inside the fixed root directory region.
    pub fn in_fixed_root(&self, offset: u64) -> bool {
        self.variant != FatVariant::Fat32
            && offset >= self.root_dir_offset()
            && offset < self.root_dir_end()
    }

    /// Cluster containing data-region byte `offset`.
    pub fn cluster_of(&self, offset: u64) -> u32 {
        ((offset - self.data_offset()) / self.cluster_bytes()) as u32 + 2
    }

    /// Bytes of the volume covered by the filesystem.
    pub fn volume_bytes(&self) -> u64 {
        self.sector_offset(self.total_sectors)
    }
}

/// FAT32 FSInfo sector hints. Advisory only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsInfo {
    pub free_count: u32,
    pub next_free: u32,
}

impl FsInfo {
    /// Parse after checking all three signatures.
    pub fn parse(data: &[u8]) -> Result<Self, FatError> {
        if data.len() < BOOT_SECTOR_SIZE {
            return Err(FatError::InvalidFsInfo(format!(
                "sector too short: {} bytes",
                data.len()
            )));
        }
        let read_u32 = |off: usize| {
            u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
        };
        let lead = read_u32(0);
        let strukt = read_u32(484);
        let trail = read_u32(508);
        if lead != FSINFO_LEAD_SIGNATURE
            || strukt != FSINFO_STRUCT_SIGNATURE
            || trail != FSINFO_TRAIL_SIGNATURE
        {
            return Err(FatError::InvalidFsInfo(format!(
                "bad signatures: lead {lead:#010X}, struct {strukt:#010X}, trail {trail:#010X}"
            )));
        }
        Ok(Self {
            free_count: read_u32(488),
            next_free: read_u32(492),
        })
    }

    pub fn to_bytes(&self) -> [u8; BOOT_SECTOR_SIZE] {
        let mut data = [0u8; BOOT_SECTOR_SIZE];
        data[0..4].copy_from_slice(&FSINFO_LEAD_SIGNATURE.to_le_bytes());
        data[484..488].copy_from_slice(&FSINFO_STRUCT_SIGNATURE.to_le_bytes());
        data[488..492].copy_from_slice(&self.free_count.to_le_bytes());
        data[492..496].copy_from_slice(&self.next_free.to_le_bytes());
        data[508..512].copy_from_slice(&FSINFO_TRAIL_SIGNATURE.to_le_bytes());
        data
    }

    /// Free count if plausible for a volume with `count_of_clusters` clusters.
    pub fn free_count_hint(&self, count_of_clusters: u32) -> Option<u32> {
        (self.free_count <= count_of_clusters).then_some(self.free_count)
    }

    /// Next-free hint if it names a real cluster.
    pub fn next_free_hint(&self, max_cluster: u32) -> Option<u32> {
        (2..=max_cluster).contains(&self.next_free).then_some(self.next_free)
    }
}
