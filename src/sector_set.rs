//! Sparse description of sectors to write.
//!
//! mkfs and fdisk produce a [`SectorSet`] instead of touching storage
//! directly: zero-fill ranges plus explicit data patches, so a caller that
//! knows its media is already zeroed can write only the patches.

use std::io;
use std::ops::Range;

use serde::Serialize;

use crate::storage::Storage;

/// Bytes to place at `offset` within `sector`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectorPatch {
    pub sector: u64,
    pub offset: u32,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SectorSet {
    sector_size: u32,
    zero_fill: Vec<Range<u64>>,
    patches: Vec<SectorPatch>,
}

impl SectorSet {
    pub fn new(sector_size: u32) -> Self {
        Self {
            sector_size,
            zero_fill: Vec::new(),
            patches: Vec::new(),
        }
    }

    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Mark `sectors` as zero-filled.
    pub fn zero(&mut self, sectors: Range<u64>) {
        if !sectors.is_empty() {
            self.zero_fill.push(sectors);
        }
    }

    /// Add a whole-sector (or shorter, sector-aligned) data patch.
    pub fn put_sector(&mut self, sector: u64, bytes: Vec<u8>) {
        self.put(sector, 0, bytes);
    }

    /// Add a patch starting `offset` bytes into `sector`.
    pub fn put(&mut self, sector: u64, offset: u32, bytes: Vec<u8>) {
        assert!(
            offset as usize + bytes.len() <= self.sector_size as usize,
            "sector patch overflows its sector"
        );
        self.patches.push(SectorPatch {
            sector,
            offset,
            bytes,
        });
    }

    pub fn zero_ranges(&self) -> &[Range<u64>] {
        &self.zero_fill
    }

    pub fn patches(&self) -> &[SectorPatch] {
        &self.patches
    }

    /// Contents of the patch for `sector` at offset 0, if one was added.
    pub fn sector(&self, sector: u64) -> Option<&[u8]> {
        self.patches
            .iter()
            .rev()
            .find(|p| p.sector == sector && p.offset == 0)
            .map(|p| p.bytes.as_slice())
    }

    /// Highest sector touched plus one.
    pub fn extent(&self) -> u64 {
        let zero_end = self.zero_fill.iter().map(|r| r.end).max().unwrap_or(0);
        let patch_end = self.patches.iter().map(|p| p.sector + 1).max().unwrap_or(0);
        zero_end.max(patch_end)
    }

    /// Write the set to `storage` at `base` bytes. Zero ranges are written
    /// first, then patches, unless `skip_zero_fill` is set.
    pub fn write_to<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        base: u64,
        skip_zero_fill: bool,
    ) -> io::Result<()> {
        let sector_size = self.sector_size as u64;
        if !skip_zero_fill {
            const ZERO_CHUNK_SECTORS: u64 = 128;
            let zeros = vec![0u8; (ZERO_CHUNK_SECTORS * sector_size) as usize];
            for range in &self.zero_fill {
                let mut sector = range.start;
                while sector < range.end {
                    let count = (range.end - sector).min(ZERO_CHUNK_SECTORS);
                    storage.write_at(
                        base + sector * sector_size,
                        &zeros[..(count * sector_size) as usize],
                    )?;
                    sector += count;
                }
            }
        }
        for patch in &self.patches {
            storage.write_at(
                base + patch.sector * sector_size + patch.offset as u64,
                &patch.bytes,
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_write_zero_then_patch() {
        let mut storage = MemoryStorage::from_vec(vec![0xFF; 2048]);
        let mut set = SectorSet::new(512);
        set.zero(0..3);
        set.put_sector(1, vec![0xAA; 512]);
        set.put(2, 510, vec![0x55, 0xAA]);
        set.write_to(&mut storage, 0, false).unwrap();

        let bytes = storage.as_bytes();
        assert!(bytes[..512].iter().all(|&b| b == 0));
        assert!(bytes[512..1024].iter().all(|&b| b == 0xAA));
        assert_eq!(&bytes[1534..1536], &[0x55, 0xAA]);
        assert!(bytes[1536..].iter().all(|&b| b == 0xFF));
        assert_eq!(set.extent(), 3);
    }

    #[test]
    fn test_skip_zero_fill() {
        let mut storage = MemoryStorage::from_vec(vec![0x11; 1024]);
        let mut set = SectorSet::new(512);
        set.zero(0..2);
        set.put(0, 0, vec![1, 2]);
        set.write_to(&mut storage, 0, true).unwrap();
        assert_eq!(&storage.as_bytes()[..3], &[1, 2, 0x11]);
    }
}
