pub mod mbr;

use log::debug;
use serde::Serialize;

use crate::error::FatError;
use crate::fs::FatVariant;
use crate::storage::Storage;

pub use mbr::{fdisk, parse, parse_ebr_chain, serialize, ChsAddress, PartitionRecord};

/// Primary entries of an MBR plus the logical partitions of its extended
/// container, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PartitionTable {
    pub primary: Vec<PartitionRecord>,
    /// Absolute LBA values (already adjusted from EBR-relative offsets).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub logical: Vec<PartitionRecord>,
}

impl PartitionTable {
    /// Read the MBR in sector 0 and follow the EBR chain of the first
    /// extended entry.
    pub fn detect<S: Storage + ?Sized>(storage: &mut S) -> Result<Self, FatError> {
        let primary = mbr::read_table(storage)?;
        let mut logical = Vec::new();
        // Only one extended partition is valid per MBR
        if let Some(extended) = primary.iter().find(|p| p.is_extended()) {
            match parse_ebr_chain(storage, extended.relative_sectors) {
                Ok(found) => logical = found,
                Err(e) => debug!("skipping logical partitions: {e}"),
            }
        }
        Ok(Self { primary, logical })
    }

    /// Primary entries followed by logical ones, extended containers left out.
    pub fn volumes(&self) -> impl Iterator<Item = &PartitionRecord> {
        self.primary
            .iter()
            .filter(|p| !p.is_extended())
            .chain(self.logical.iter())
    }
}

/// The conventional MBR type byte for a FAT volume of `total_sectors`
/// sectors ending before sector `end_lba`.
pub fn fat_system_id(variant: FatVariant, total_sectors: u32, end_lba: u64) -> u8 {
    // Beyond cylinder 1024 of a 255x63 disk only LBA types are addressable
    let needs_lba = end_lba > 1024 * 255 * 63;
    match variant {
        FatVariant::Fat12 => 0x01,
        FatVariant::Fat16 if needs_lba => 0x0E,
        FatVariant::Fat16 if total_sectors < 65536 => 0x04,
        FatVariant::Fat16 => 0x06,
        FatVariant::Fat32 if needs_lba => 0x0C,
        FatVariant::Fat32 => 0x0B,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_fat_system_ids() {
        assert_eq!(fat_system_id(FatVariant::Fat12, 2880, 2943), 0x01);
        assert_eq!(fat_system_id(FatVariant::Fat16, 40_000, 40_063), 0x04);
        assert_eq!(fat_system_id(FatVariant::Fat16, 400_000, 402_048), 0x06);
        assert_eq!(fat_system_id(FatVariant::Fat16, 400_000, 20_000_000), 0x0E);
        assert_eq!(fat_system_id(FatVariant::Fat32, 4_000_000, 4_002_048), 0x0B);
        assert_eq!(fat_system_id(FatVariant::Fat32, 40_000_000, 40_002_048), 0x0C);
    }

    #[test]
    fn test_detect_without_extended() {
        let mut storage = MemoryStorage::new(4096);
        let records = vec![
            PartitionRecord::new(true, 0x06, 63, 1000),
            PartitionRecord::new(false, 0x0B, 1063, 2000),
        ];
        fdisk(&records).write_to(&mut storage, 0, false).unwrap();

        let table = PartitionTable::detect(&mut storage).unwrap();
        assert_eq!(table.primary, records);
        assert!(table.logical.is_empty());
        assert_eq!(table.volumes().count(), 2);
    }

    #[test]
    fn test_detect_requires_signature() {
        let mut storage = MemoryStorage::new(4096);
        let err = PartitionTable::detect(&mut storage).unwrap_err();
        assert!(matches!(err, FatError::InvalidMbr(_)));
    }

    #[test]
    fn test_volumes_skip_extended_container() {
        let table = PartitionTable {
            primary: vec![
                PartitionRecord::new(true, 0x06, 63, 1000),
                PartitionRecord::new(false, 0x0F, 2048, 8192),
            ],
            logical: vec![PartitionRecord::new(false, 0x0B, 2049, 4000)],
        };
        let ids: Vec<u8> = table.volumes().map(|p| p.system_id).collect();
        assert_eq!(ids, vec![0x06, 0x0B]);
    }
}
