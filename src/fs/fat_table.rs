//! The file allocation table: one logical chain contract over the three
//! on-disk entry widths.

use std::io;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::boot_sector::Geometry;
use crate::error::FatError;
use crate::storage::Storage;

/// Clusters below this count are FAT12. The official boundary is 4085;
/// 4087 matches what older formatters actually produced.
pub const FAT12_MAX_CLUSTERS: u32 = 4087;
/// Clusters at or above this count require FAT32.
pub const FAT16_MAX_CLUSTERS: u32 = 65525;

/// Entries decoded per storage read when scanning the table.
const SCAN_CHUNK: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FatVariant {
    Fat12,
    Fat16,
    Fat32,
}

impl FatVariant {
    /// FAT32 iff the 16-bit FAT size is zero; otherwise by cluster count.
    pub fn detect(fat_size_16: u16, count_of_clusters: u32) -> Self {
        if fat_size_16 == 0 {
            FatVariant::Fat32
        } else if count_of_clusters < FAT12_MAX_CLUSTERS {
            FatVariant::Fat12
        } else {
            FatVariant::Fat16
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FatVariant::Fat12 => "FAT12",
            FatVariant::Fat16 => "FAT16",
            FatVariant::Fat32 => "FAT32",
        }
    }

    pub fn bits(&self) -> u32 {
        match self {
            FatVariant::Fat12 => 12,
            FatVariant::Fat16 => 16,
            FatVariant::Fat32 => 32,
        }
    }

    /// Boot-sector file system type label, space padded.
    pub fn fs_type_label(&self) -> [u8; 8] {
        match self {
            FatVariant::Fat12 => *b"FAT12   ",
            FatVariant::Fat16 => *b"FAT16   ",
            FatVariant::Fat32 => *b"FAT32   ",
        }
    }

    /// Mask of the meaningful entry bits.
    pub fn entry_mask(&self) -> u32 {
        match self {
            FatVariant::Fat12 => 0x0FFF,
            FatVariant::Fat16 => 0xFFFF,
            FatVariant::Fat32 => 0x0FFF_FFFF,
        }
    }

    pub fn end_of_chain(&self) -> u32 {
        self.entry_mask()
    }

    pub fn is_end_of_chain(&self, entry: u32) -> bool {
        entry >= self.entry_mask() - 7
    }

    pub fn bad_cluster(&self) -> u32 {
        self.entry_mask() - 8
    }

    /// Value of FAT entry 0 for a given media byte.
    pub fn media_entry(&self, media: u8) -> u32 {
        (self.entry_mask() & !0xFF) | media as u32
    }

    /// Bytes needed to hold entries 0 through `count_of_clusters + 1`.
    pub fn table_bytes(&self, count_of_clusters: u32) -> u64 {
        let entries = count_of_clusters as u64 + 2;
        (entries * self.bits() as u64).div_ceil(8)
    }

    fn entry_byte(&self, cluster: u32) -> u64 {
        let n = cluster as u64;
        match self {
            FatVariant::Fat12 => n + n / 2,
            FatVariant::Fat16 => n * 2,
            FatVariant::Fat32 => n * 4,
        }
    }

    fn entry_width(&self) -> usize {
        match self {
            FatVariant::Fat12 | FatVariant::Fat16 => 2,
            FatVariant::Fat32 => 4,
        }
    }
}

/// Decode the entry for `cluster` whose first byte is at `at` in `buf`.
fn decode_entry(buf: &[u8], at: usize, cluster: u32, variant: FatVariant) -> u32 {
    match variant {
        FatVariant::Fat12 => {
            let val = u16::from_le_bytes([buf[at], buf[at + 1]]);
            if cluster & 1 == 1 {
                (val >> 4) as u32
            } else {
                (val & 0x0FFF) as u32
            }
        }
        FatVariant::Fat16 => u16::from_le_bytes([buf[at], buf[at + 1]]) as u32,
        FatVariant::Fat32 => {
            u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]) & 0x0FFF_FFFF
        }
    }
}

/// Merge `value` into the raw entry bytes in `buf`, keeping the bits that
/// belong to the neighbouring entry (FAT12) or the reserved nibble (FAT32).
fn encode_entry(buf: &mut [u8], cluster: u32, value: u32, variant: FatVariant) {
    match variant {
        FatVariant::Fat12 => {
            let existing = u16::from_le_bytes([buf[0], buf[1]]);
            let new_val = if cluster & 1 == 1 {
                (existing & 0x000F) | ((value as u16) << 4)
            } else {
                (existing & 0xF000) | (value as u16 & 0x0FFF)
            };
            buf[..2].copy_from_slice(&new_val.to_le_bytes());
        }
        FatVariant::Fat16 => {
            buf[..2].copy_from_slice(&(value as u16).to_le_bytes());
        }
        FatVariant::Fat32 => {
            // Preserve upper 4 bits of original entry
            let existing = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
            let new_val = (existing & 0xF000_0000) | (value & 0x0FFF_FFFF);
            buf[..4].copy_from_slice(&new_val.to_le_bytes());
        }
    }
}

/// Chain operations over every FAT copy of a mounted volume.
///
/// The table holds no cached entries; every call goes to storage.
#[derive(Debug, Clone)]
pub struct FatTable {
    variant: FatVariant,
    fat_offset: u64,
    fat_bytes: u64,
    num_fats: u32,
    max_cluster: u32,
    next_free_hint: u32,
    free_delta: i64,
}

impl FatTable {
    pub fn new(geometry: &Geometry) -> Self {
        Self {
            variant: geometry.variant,
            fat_offset: geometry.fat_offset(),
            fat_bytes: geometry.fat_bytes(),
            num_fats: geometry.num_fats,
            max_cluster: geometry.max_cluster(),
            next_free_hint: 2,
            free_delta: 0,
        }
    }

    /// Start allocation scans at `hint` (the FSInfo next-free value).
    pub fn with_hint(mut self, hint: u32) -> Self {
        if self.is_data_cluster(hint) {
            self.next_free_hint = hint;
        }
        self
    }

    pub fn variant(&self) -> FatVariant {
        self.variant
    }

    pub fn max_cluster(&self) -> u32 {
        self.max_cluster
    }

    /// Where the next allocation scan starts.
    pub fn next_free_hint(&self) -> u32 {
        self.next_free_hint
    }

    /// Net change in free clusters since the last call, then reset.
    pub fn take_free_delta(&mut self) -> i64 {
        std::mem::take(&mut self.free_delta)
    }

    fn is_data_cluster(&self, cluster: u32) -> bool {
        (2..=self.max_cluster).contains(&cluster)
    }

    fn entry_range(&self, cluster: u32) -> Result<u64, FatError> {
        let byte = self.variant.entry_byte(cluster);
        if cluster > self.max_cluster || byte + self.variant.entry_width() as u64 > self.fat_bytes {
            return Err(FatError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cluster {cluster} outside the FAT (max {})", self.max_cluster),
            )));
        }
        Ok(byte)
    }

    /// Raw entry value for `cluster`, read from the first copy.
    pub fn next<S: Storage + ?Sized>(&self, storage: &mut S, cluster: u32) -> Result<u32, FatError> {
        let byte = self.entry_range(cluster)?;
        let mut buf = [0u8; 4];
        let width = self.variant.entry_width();
        storage.read_at(self.fat_offset + byte, &mut buf[..width])?;
        Ok(decode_entry(&buf, 0, cluster, self.variant))
    }

    /// Next cluster of the chain, or `None` at end of chain. Free, bad and
    /// out-of-range values also end the walk.
    pub fn successor<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        cluster: u32,
    ) -> Result<Option<u32>, FatError> {
        let value = self.next(storage, cluster)?;
        if self.is_data_cluster(value) {
            Ok(Some(value))
        } else {
            if !self.variant.is_end_of_chain(value) {
                debug!("cluster {cluster} links to {value:#X}, treating as end of chain");
            }
            Ok(None)
        }
    }

    /// Write `value` as the entry for `cluster` in every FAT copy.
    pub fn set_next<S: Storage + ?Sized>(
        &mut self,
        storage: &mut S,
        cluster: u32,
        value: u32,
    ) -> Result<(), FatError> {
        let byte = self.entry_range(cluster)?;
        let width = self.variant.entry_width();
        let mut old = None;
        for copy in 0..self.num_fats as u64 {
            let at = self.fat_offset + copy * self.fat_bytes + byte;
            let mut buf = [0u8; 4];
            storage.read_at(at, &mut buf[..width])?;
            if old.is_none() {
                old = Some(decode_entry(&buf, 0, cluster, self.variant));
            }
            encode_entry(&mut buf, cluster, value, self.variant);
            storage.write_at(at, &buf[..width])?;
        }
        if self.is_data_cluster(cluster) {
            let was_free = old == Some(0);
            let is_free = value & self.variant.entry_mask() == 0;
            match (was_free, is_free) {
                (true, false) => self.free_delta -= 1,
                (false, true) => self.free_delta += 1,
                _ => {}
            }
        }
        Ok(())
    }

    /// Decode `count` consecutive entries starting at `first`.
    fn read_entries<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        first: u32,
        count: u32,
    ) -> Result<Vec<u32>, FatError> {
        let last = first + count - 1;
        let start = self.entry_range(first)?;
        let end = self.entry_range(last)? + self.variant.entry_width() as u64;
        let buf = storage.read_vec(self.fat_offset + start, (end - start) as usize)?;
        Ok((first..=last)
            .map(|c| {
                let at = (self.variant.entry_byte(c) - start) as usize;
                decode_entry(&buf, at, c, self.variant)
            })
            .collect())
    }

    /// First free cluster in `from..=to`.
    fn find_free<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        from: u32,
        to: u32,
    ) -> Result<Option<u32>, FatError> {
        let mut cluster = from;
        while cluster <= to {
            let count = (to - cluster + 1).min(SCAN_CHUNK);
            let entries = self.read_entries(storage, cluster, count)?;
            if let Some(i) = entries.iter().position(|&e| e == 0) {
                return Ok(Some(cluster + i as u32));
            }
            cluster += count;
        }
        Ok(None)
    }

    /// Allocate one free cluster, marking it end-of-chain. The scan starts at
    /// `hint` (or the table's own hint when `hint` is not a data cluster) and
    /// wraps once. Returns 0 when the volume is full.
    pub fn allocate_one<S: Storage + ?Sized>(
        &mut self,
        storage: &mut S,
        hint: u32,
    ) -> Result<u32, FatError> {
        let start = if self.is_data_cluster(hint) {
            hint
        } else {
            self.next_free_hint
        };
        let found = match self.find_free(storage, start, self.max_cluster)? {
            Some(c) => Some(c),
            None if start > 2 => self.find_free(storage, 2, start - 1)?,
            None => None,
        };
        let Some(cluster) = found else {
            debug!("no free cluster among {} data clusters", self.max_cluster - 1);
            return Ok(0);
        };
        self.set_next(storage, cluster, self.variant.end_of_chain())?;
        self.next_free_hint = if cluster >= self.max_cluster {
            2
        } else {
            cluster + 1
        };
        Ok(cluster)
    }

    /// Allocate a cluster and link it after `last`. With `last == 0` this is
    /// a plain allocation. Returns 0 when the volume is full.
    pub fn extend_chain<S: Storage + ?Sized>(
        &mut self,
        storage: &mut S,
        last: u32,
    ) -> Result<u32, FatError> {
        let hint = if last == 0 { 0 } else { last + 1 };
        let cluster = self.allocate_one(storage, hint)?;
        if cluster != 0 && last != 0 {
            self.set_next(storage, last, cluster)?;
        }
        Ok(cluster)
    }

    /// Every cluster of the chain starting at `start`, in order. A loop or
    /// runaway chain is cut at the volume's cluster count.
    pub fn chain<S: Storage + ?Sized>(
        &self,
        storage: &mut S,
        start: u32,
    ) -> Result<Vec<u32>, FatError> {
        let mut clusters = Vec::new();
        if !self.is_data_cluster(start) {
            return Ok(clusters);
        }
        let limit = (self.max_cluster - 1) as usize;
        let mut current = Some(start);
        while let Some(cluster) = current {
            if clusters.len() >= limit {
                warn!("cluster chain from {start} exceeds {limit} clusters, assuming a loop");
                break;
            }
            clusters.push(cluster);
            current = self.successor(storage, cluster)?;
        }
        Ok(clusters)
    }

    /// Mark every cluster of the chain starting at `start` free.
    pub fn free_chain<S: Storage + ?Sized>(
        &mut self,
        storage: &mut S,
        start: u32,
    ) -> Result<(), FatError> {
        for cluster in self.chain(storage, start)? {
            self.set_next(storage, cluster, 0)?;
        }
        Ok(())
    }

    /// Count free entries over all data clusters.
    pub fn count_free<S: Storage + ?Sized>(&self, storage: &mut S) -> Result<u32, FatError> {
        let mut free = 0u32;
        let mut cluster = 2u32;
        while cluster <= self.max_cluster {
            let count = (self.max_cluster - cluster + 1).min(SCAN_CHUNK);
            let entries = self.read_entries(storage, cluster, count)?;
            free += entries.iter().filter(|&&e| e == 0).count() as u32;
            cluster += count;
        }
        Ok(free)
    }
}
