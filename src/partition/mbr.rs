use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use std::collections::HashSet;

use crate::error::FatError;
use crate::sector_set::SectorSet;
use crate::storage::Storage;

pub const MBR_SIGNATURE: u16 = 0xAA55;
pub const PARTITION_TABLE_OFFSET: usize = 446;
const PARTITION_ENTRY_SIZE: usize = 16;
const MAX_PRIMARY_PARTITIONS: usize = 4;
const SECTOR_SIZE: u64 = 512;

/// CHS (Cylinder-Head-Sector) address of a partition table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChsAddress {
    pub head: u8,
    pub sector: u8,    // bits 0-5 only (6 bits)
    pub cylinder: u16, // 10 bits: 2 high bits from sector byte + 8 bits from cylinder byte
}

impl ChsAddress {
    /// `None` for the all-zero "no CHS" encoding.
    fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes[..3] == [0, 0, 0] {
            return None;
        }
        Some(Self {
            head: bytes[0],
            sector: bytes[1] & 0x3F,
            cylinder: ((bytes[1] as u16 & 0xC0) << 2) | bytes[2] as u16,
        })
    }

    fn to_bytes(self) -> [u8; 3] {
        [
            self.head,
            (self.sector & 0x3F) | ((self.cylinder >> 2) as u8 & 0xC0),
            self.cylinder as u8,
        ]
    }
}

/// One primary (or EBR) partition table entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartitionRecord {
    pub boot_indicator: u8,
    pub starting_chs: Option<ChsAddress>,
    pub system_id: u8,
    pub ending_chs: Option<ChsAddress>,
    /// First sector, counted from the start of the disk (or the EBR for
    /// logical partitions as stored on disk).
    pub relative_sectors: u32,
    pub total_sectors: u32,
}

impl PartitionRecord {
    /// A record without CHS addresses.
    pub fn new(active: bool, system_id: u8, relative_sectors: u32, total_sectors: u32) -> Self {
        Self {
            boot_indicator: if active { 0x80 } else { 0x00 },
            starting_chs: None,
            system_id,
            ending_chs: None,
            relative_sectors,
            total_sectors,
        }
    }

    fn parse(data: &[u8]) -> Self {
        Self {
            boot_indicator: data[0],
            starting_chs: ChsAddress::parse(&data[1..4]),
            system_id: data[4],
            ending_chs: ChsAddress::parse(&data[5..8]),
            relative_sectors: LittleEndian::read_u32(&data[8..12]),
            total_sectors: LittleEndian::read_u32(&data[12..16]),
        }
    }

    fn to_bytes(&self) -> [u8; PARTITION_ENTRY_SIZE] {
        let mut data = [0u8; PARTITION_ENTRY_SIZE];
        data[0] = self.boot_indicator;
        data[1..4].copy_from_slice(&self.starting_chs.map_or([0; 3], ChsAddress::to_bytes));
        data[4] = self.system_id;
        data[5..8].copy_from_slice(&self.ending_chs.map_or([0; 3], ChsAddress::to_bytes));
        LittleEndian::write_u32(&mut data[8..12], self.relative_sectors);
        LittleEndian::write_u32(&mut data[12..16], self.total_sectors);
        data
    }

    /// Entries with an unknown boot flag, no type or no sectors are unused.
    fn is_valid(&self) -> bool {
        matches!(self.boot_indicator, 0x00 | 0x80) && self.system_id != 0 && self.total_sectors != 0
    }

    pub fn active(&self) -> bool {
        self.boot_indicator == 0x80
    }

    /// Check if this entry is an extended partition container (CHS, LBA, or Linux).
    pub fn is_extended(&self) -> bool {
        matches!(self.system_id, 0x05 | 0x0F | 0x85)
    }

    pub fn is_fat(&self) -> bool {
        matches!(
            self.system_id,
            0x01 | 0x04 | 0x06 | 0x0B | 0x0C | 0x0E | 0x11 | 0x14 | 0x16 | 0x1B | 0x1C | 0x1E
        )
    }

    /// Byte offset of the partition on its disk.
    pub fn start_bytes(&self) -> u64 {
        self.relative_sectors as u64 * SECTOR_SIZE
    }

    pub fn size_bytes(&self) -> u64 {
        self.total_sectors as u64 * SECTOR_SIZE
    }

    pub fn type_name(&self) -> &'static str {
        match self.system_id {
            0x00 => "Empty",
            0x01 => "FAT12",
            0x04 => "FAT16 (<32MB)",
            0x05 => "Extended",
            0x06 => "FAT16 (>32MB)",
            0x07 => "NTFS/HPFS/exFAT",
            0x0B => "FAT32 (CHS)",
            0x0C => "FAT32 (LBA)",
            0x0E => "FAT16 (LBA)",
            0x0F => "Extended (LBA)",
            0x11 => "Hidden FAT12",
            0x14 => "Hidden FAT16 (<32MB)",
            0x16 => "Hidden FAT16 (>32MB)",
            0x1B => "Hidden FAT32 (CHS)",
            0x1C => "Hidden FAT32 (LBA)",
            0x1E => "Hidden FAT16 (LBA)",
            0x82 => "Linux swap",
            0x83 => "Linux",
            0x85 => "Linux Extended",
            0xEE => "GPT Protective",
            0xEF => "EFI System",
            _ => "Unknown",
        }
    }
}

/// Check the 0xAA55 trailer of a boot record.
pub fn check_signature(sector: &[u8; 512]) -> Result<(), FatError> {
    let signature = u16::from_le_bytes([sector[510], sector[511]]);
    if signature != MBR_SIGNATURE {
        return Err(FatError::InvalidMbr(format!(
            "invalid boot signature: expected 0xAA55, got {signature:#06X}"
        )));
    }
    Ok(())
}

fn table_entries(sector: &[u8; 512]) -> impl Iterator<Item = PartitionRecord> + '_ {
    sector[PARTITION_TABLE_OFFSET..510]
        .chunks_exact(PARTITION_ENTRY_SIZE)
        .map(PartitionRecord::parse)
}

/// The used entries of a partition table, in table order. Empty when the
/// sector carries no boot signature.
pub fn parse(sector: &[u8; 512]) -> Vec<PartitionRecord> {
    if check_signature(sector).is_err() {
        return Vec::new();
    }
    table_entries(sector).filter(PartitionRecord::is_valid).collect()
}

/// Read and parse the partition table in sector 0 of `storage`.
pub fn read_table<S: Storage + ?Sized>(storage: &mut S) -> Result<Vec<PartitionRecord>, FatError> {
    let mut sector = [0u8; 512];
    storage.read_at(0, &mut sector)?;
    check_signature(&sector)?;
    Ok(parse(&sector))
}

/// A 512-byte sector holding `records` as its partition table. Everything
/// outside the table and signature is zero.
pub fn serialize(records: &[PartitionRecord]) -> [u8; 512] {
    assert!(
        records.len() <= MAX_PRIMARY_PARTITIONS,
        "an MBR holds at most four partition records"
    );
    let mut sector = [0u8; 512];
    for (i, record) in records.iter().enumerate() {
        let offset = PARTITION_TABLE_OFFSET + i * PARTITION_ENTRY_SIZE;
        sector[offset..offset + PARTITION_ENTRY_SIZE].copy_from_slice(&record.to_bytes());
    }
    sector[510..512].copy_from_slice(&MBR_SIGNATURE.to_le_bytes());
    sector
}

/// Sectors that install `records` as the partition table, leaving the boot
/// code and disk signature in front of it untouched.
pub fn fdisk(records: &[PartitionRecord]) -> SectorSet {
    let sector = serialize(records);
    let mut set = SectorSet::new(SECTOR_SIZE as u32);
    set.put(
        0,
        PARTITION_TABLE_OFFSET as u32,
        sector[PARTITION_TABLE_OFFSET..].to_vec(),
    );
    set
}

/// Maximum number of logical partitions to prevent infinite loops on corrupted data.
const MAX_LOGICAL_PARTITIONS: usize = 64;

/// Logical partitions of the extended container at `extended_start_lba`,
/// with absolute sector numbers.
///
/// Every EBR holds the logical partition in its first entry (relative to the
/// EBR) and the link to the next EBR in its second (relative to the
/// container). The walk stops at an empty link, a missing signature or an
/// EBR it has already seen.
pub fn parse_ebr_chain<S: Storage + ?Sized>(
    storage: &mut S,
    extended_start_lba: u32,
) -> Result<Vec<PartitionRecord>, FatError> {
    let mut logical_partitions = Vec::new();
    let mut visited = HashSet::new();
    let mut current_ebr_lba = extended_start_lba;

    while logical_partitions.len() < MAX_LOGICAL_PARTITIONS && visited.insert(current_ebr_lba) {
        let offset = current_ebr_lba as u64 * SECTOR_SIZE;
        if offset + SECTOR_SIZE > storage.capacity() {
            break;
        }
        let mut ebr_data = [0u8; 512];
        storage.read_at(offset, &mut ebr_data)?;

        // Some disks omit the signature on the last EBR
        if check_signature(&ebr_data).is_err() {
            break;
        }

        let mut entries = table_entries(&ebr_data);
        let (Some(entry0), Some(entry1)) = (entries.next(), entries.next()) else {
            break;
        };

        if entry0.is_valid() {
            let mut logical = entry0;
            logical.relative_sectors += current_ebr_lba;
            logical_partitions.push(logical);
        }

        if entry1.system_id == 0 || entry1.relative_sectors == 0 {
            break;
        }
        current_ebr_lba = extended_start_lba + entry1.relative_sectors;
    }

    Ok(logical_partitions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn record_with_chs(active: bool, system_id: u8, start: u32, sectors: u32) -> PartitionRecord {
        PartitionRecord {
            starting_chs: Some(ChsAddress {
                head: 1,
                sector: 1,
                cylinder: 0,
            }),
            ending_chs: Some(ChsAddress {
                head: 254,
                sector: 63,
                cylinder: 1023,
            }),
            ..PartitionRecord::new(active, system_id, start, sectors)
        }
    }

    #[test]
    fn test_valid_mbr_single_fat16() {
        let sector = serialize(&[record_with_chs(true, 0x0E, 2048, 195_369_519)]);
        let records = parse(&sector);

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.active());
        assert_eq!(record.system_id, 0x0E);
        assert_eq!(record.type_name(), "FAT16 (LBA)");
        assert_eq!(record.relative_sectors, 2048);
        assert_eq!(record.total_sectors, 195_369_519);
        assert_eq!(record.start_bytes(), 2048 * 512);
        assert!(record.is_fat());
        assert_eq!(
            record.starting_chs,
            Some(ChsAddress {
                head: 1,
                sector: 1,
                cylinder: 0
            })
        );
        assert_eq!(&sector[446..450], &[0x80, 1, 1, 0]);
    }

    #[test]
    fn test_invalid_signature() {
        let mut sector = serialize(&[PartitionRecord::new(true, 0x0C, 2048, 1_048_576)]);
        sector[510..512].fill(0);
        assert!(parse(&sector).is_empty());
        let err = check_signature(&sector).unwrap_err();
        assert!(err.to_string().contains("invalid boot signature"));
        assert!(err.is_validation());

        let mut storage = MemoryStorage::from_vec(sector.to_vec());
        assert!(read_table(&mut storage).unwrap_err().is_validation());
    }

    #[test]
    fn test_unused_entries_are_dropped() {
        let bad_flag = PartitionRecord {
            boot_indicator: 0x7F,
            ..PartitionRecord::new(false, 0x0B, 1_024_063, 2_048_000)
        };
        let sector = serialize(&[
            PartitionRecord::new(true, 0x06, 63, 1_024_000),
            PartitionRecord::new(false, 0x00, 1_024_063, 2_048_000),
            bad_flag,
            PartitionRecord::new(false, 0x0B, 3_072_063, 0),
        ]);
        let records = parse(&sector);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].type_name(), "FAT16 (>32MB)");
    }

    #[test]
    fn test_serialize_parses_back() {
        let records = vec![
            PartitionRecord::new(true, 0x0E, 2048, 195_369_519),
            PartitionRecord {
                starting_chs: Some(ChsAddress {
                    head: 254,
                    sector: 63,
                    cylinder: 1023,
                }),
                ..PartitionRecord::new(false, 0x0C, 195_371_567, 4096)
            },
        ];
        let sector = serialize(&records);
        assert_eq!(&sector[510..512], &[0x55, 0xAA]);
        assert_eq!(&sector[478..510], &[0u8; 32]);
        assert_eq!(parse(&sector), records);
    }

    #[test]
    #[should_panic(expected = "at most four")]
    fn test_serialize_rejects_five_records() {
        let record = PartitionRecord::new(false, 0x0C, 1, 1);
        serialize(&vec![record; 5]);
    }

    #[test]
    fn test_fdisk_keeps_boot_code() {
        let set = fdisk(&[PartitionRecord::new(true, 0x01, 63, 2817)]);
        assert_eq!(set.patches().len(), 1);
        assert_eq!(set.patches()[0].offset, 446);
        assert_eq!(set.patches()[0].bytes.len(), 66);

        let mut storage = MemoryStorage::from_vec(vec![0xCC; 1024]);
        set.write_to(&mut storage, 0, false).unwrap();
        let bytes = storage.as_bytes();
        assert!(bytes[..446].iter().all(|&b| b == 0xCC));
        assert!(bytes[512..].iter().all(|&b| b == 0xCC));
        let records = read_table(&mut storage).unwrap();
        assert_eq!(records, vec![PartitionRecord::new(true, 0x01, 63, 2817)]);
    }

    /// A disk whose extended container at `extended_lba` holds one EBR per
    /// logical partition, 2048 sectors apart. Logical starts are relative
    /// to their EBR.
    fn disk_with_logicals(
        primaries: &[PartitionRecord],
        extended_lba: u32,
        logicals: &[PartitionRecord],
    ) -> MemoryStorage {
        let span = logicals.len().max(1) as u32 * 2048;
        let mut disk = MemoryStorage::new((extended_lba + span) as usize * 512);
        fdisk(primaries).write_to(&mut disk, 0, false).unwrap();

        for (i, logical) in logicals.iter().enumerate() {
            let ebr = i as u32 * 2048;
            let mut table = vec![logical.clone()];
            if i + 1 < logicals.len() {
                table.push(PartitionRecord::new(false, 0x05, ebr + 2048, 2048));
            }
            let base = (extended_lba + ebr) as u64 * 512;
            fdisk(&table).write_to(&mut disk, base, false).unwrap();
        }
        disk
    }

    #[test]
    fn test_ebr_three_logicals() {
        let mut disk = disk_with_logicals(
            &[
                PartitionRecord::new(true, 0x06, 63, 4000),
                PartitionRecord::new(false, 0x05, 4063, 8192),
            ],
            4063,
            &[
                PartitionRecord::new(false, 0x06, 1, 1000),
                PartitionRecord::new(false, 0x0B, 1, 2000),
                PartitionRecord::new(false, 0x83, 1, 2047),
            ],
        );
        let primaries = read_table(&mut disk).unwrap();
        assert!(primaries[1].is_extended());

        let result = parse_ebr_chain(&mut disk, 4063).unwrap();
        assert_eq!(result.len(), 3);
        assert_eq!(result[0].type_name(), "FAT16 (>32MB)");
        assert_eq!(result[0].relative_sectors, 4063 + 1);
        assert_eq!(result[1].type_name(), "FAT32 (CHS)");
        assert_eq!(result[1].relative_sectors, 4063 + 2048 + 1);
        assert_eq!(result[2].type_name(), "Linux");
        assert_eq!(result[2].relative_sectors, 4063 + 4096 + 1);
    }

    #[test]
    fn test_ebr_empty_extended() {
        let mut disk = disk_with_logicals(&[PartitionRecord::new(false, 0x05, 4063, 4096)], 4063, &[]);
        assert!(parse_ebr_chain(&mut disk, 4063).unwrap().is_empty());
    }

    #[test]
    fn test_ebr_link_loop_terminates() {
        // The second EBR links to itself
        let mut disk = disk_with_logicals(
            &[PartitionRecord::new(false, 0x05, 100, 4096)],
            100,
            &[
                PartitionRecord::new(false, 0x06, 1, 50),
                PartitionRecord::new(false, 0x00, 0, 0),
            ],
        );
        let self_link = PartitionRecord::new(false, 0x05, 2048, 1);
        fdisk(&[PartitionRecord::new(false, 0x00, 0, 0), self_link])
            .write_to(&mut disk, 2148 * 512, false)
            .unwrap();

        let result = parse_ebr_chain(&mut disk, 100).unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].relative_sectors, 101);
    }

    #[test]
    fn test_chs_round_trip() {
        let chs = ChsAddress {
            head: 254,
            sector: 63,
            cylinder: 1023,
        };
        assert_eq!(chs.to_bytes(), [254, 0xFF, 0xFF]);
        assert_eq!(ChsAddress::parse(&chs.to_bytes()), Some(chs));
        assert_eq!(ChsAddress::parse(&[0, 0, 0]), None);
    }
}
