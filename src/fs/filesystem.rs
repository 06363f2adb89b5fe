//! A mounted volume and its metadata.

use log::{debug, warn};

use super::boot_sector::{BootSector, FsInfo, Geometry, FSINFO_UNKNOWN};
use super::crawler::{DirectoryCrawler, FatNode, NodeKind};
use super::dir_entry::{DirectoryRecord, DIR_ENTRY_SIZE};
use super::fat_table::{FatTable, FatVariant};
use super::file::FatFile;
use crate::codepage::Codepage;
use crate::error::FatError;
use crate::storage::Storage;

/// A mounted FAT12/16/32 volume.
pub struct FileSystem<S: Storage> {
    pub(crate) storage: S,
    boot: BootSector,
    pub(crate) geometry: Geometry,
    pub(crate) fat: FatTable,
    fs_info: Option<FsInfo>,
    pub(crate) codepage: &'static dyn Codepage,
}

impl<S: Storage> FileSystem<S> {
    /// Parse the boot sector at offset 0 of `storage` and mount the volume.
    pub fn mount(mut storage: S, codepage: &'static dyn Codepage) -> Result<Self, FatError> {
        let boot = BootSector::read(&mut storage)?;
        let geometry = boot.geometry();

        if geometry.data_offset() > storage.capacity() {
            return Err(FatError::InvalidBootSector(format!(
                "metadata ends at byte {} but storage holds {}",
                geometry.data_offset(),
                storage.capacity()
            )));
        }
        if geometry.volume_bytes() > storage.capacity() {
            warn!(
                "volume claims {} bytes but storage holds {}",
                geometry.volume_bytes(),
                storage.capacity()
            );
        }

        let fs_info = match &boot.fat32 {
            Some(ext) => {
                let offset = geometry.sector_offset(ext.fs_info_sector as u32);
                let sector = storage.read_vec(offset, geometry.bytes_per_sector as usize)?;
                match FsInfo::parse(&sector) {
                    Ok(info) => Some(info),
                    Err(e) => {
                        warn!("ignoring FSInfo sector {}: {e}", ext.fs_info_sector);
                        None
                    }
                }
            }
            None => None,
        };

        let mut fat = FatTable::new(&geometry);
        if let Some(hint) = fs_info.and_then(|i| i.next_free_hint(geometry.max_cluster())) {
            fat = fat.with_hint(hint);
        }

        debug!(
            "mounted {} volume: {} clusters of {} bytes, first data sector {}",
            geometry.variant.name(),
            geometry.count_of_clusters,
            geometry.cluster_bytes(),
            geometry.first_data_sector
        );

        Ok(Self {
            storage,
            boot,
            geometry,
            fat,
            fs_info,
            codepage,
        })
    }

    /// "FAT12", "FAT16" or "FAT32".
    pub fn name(&self) -> &'static str {
        self.geometry.variant.name()
    }

    pub fn variant(&self) -> FatVariant {
        self.geometry.variant
    }

    pub fn boot_sector(&self) -> &BootSector {
        &self.boot
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Volume label from the root directory label record, falling back to
    /// the boot sector.
    pub fn label(&mut self) -> Result<Option<String>, FatError> {
        let root = self.root();
        let label = self
            .crawler()
            .entries(&root)?
            .into_iter()
            .find(|n| n.kind == NodeKind::VolumeLabel)
            .map(|n| n.long_name)
            .filter(|l| !l.is_empty());
        Ok(label.or_else(|| self.boot.volume_label(self.codepage)))
    }

    pub fn serial(&self) -> u32 {
        self.boot.ext.volume_id
    }

    /// Bytes per cluster.
    pub fn cluster_size(&self) -> u64 {
        self.geometry.cluster_bytes()
    }

    pub fn cluster_count(&self) -> u32 {
        self.geometry.count_of_clusters
    }

    /// Free clusters, counted from the FAT itself.
    pub fn free_clusters(&mut self) -> Result<u32, FatError> {
        self.fat.count_free(&mut self.storage)
    }

    pub fn root(&self) -> FatNode {
        FatNode::root(&self.geometry)
    }

    /// Files and subdirectories of `dir`.
    pub fn list(&mut self, dir: &FatNode) -> Result<Vec<FatNode>, FatError> {
        if !dir.is_dir() {
            return Err(FatError::NotADirectory(dir.long_name.clone()));
        }
        self.crawler().children(dir)
    }

    /// Open a file handle on `node`.
    pub fn open(&mut self, node: &FatNode) -> Result<FatFile<'_, S>, FatError> {
        if !node.is_file() {
            return Err(FatError::NotAFile(node.long_name.clone()));
        }
        Ok(FatFile::new(self, node.clone()))
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }

    pub(crate) fn crawler(&mut self) -> DirectoryCrawler<'_, S> {
        DirectoryCrawler::new(&mut self.storage, &self.geometry, &self.fat, self.codepage)
    }

    pub(crate) fn ensure_writable(&self) -> Result<(), FatError> {
        if self.storage.is_writable() {
            Ok(())
        } else {
            Err(FatError::ReadOnly)
        }
    }

    pub(crate) fn write_record(
        &mut self,
        offset: u64,
        record: &DirectoryRecord,
    ) -> Result<(), FatError> {
        self.storage.write_at(offset, &record.to_bytes())?;
        Ok(())
    }

    pub(crate) fn read_record(&mut self, offset: u64) -> Result<DirectoryRecord, FatError> {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        self.storage.read_at(offset, &mut raw)?;
        Ok(DirectoryRecord::parse(&raw))
    }

    pub(crate) fn zero_cluster(&mut self, cluster: u32) -> Result<(), FatError> {
        let zeros = vec![0u8; self.geometry.cluster_bytes() as usize];
        self.storage
            .write_at(self.geometry.cluster_offset(cluster), &zeros)?;
        Ok(())
    }

    /// Refresh the FAT32 FSInfo hints after allocation changes. Nothing is
    /// written when neither hint moved since the last flush.
    pub(crate) fn flush_fs_info(&mut self) -> Result<(), FatError> {
        let delta = self.fat.take_free_delta();
        let next_free = self.fat.next_free_hint();
        let (Some(info), Some(ext)) = (self.fs_info.as_mut(), self.boot.fat32.as_ref()) else {
            return Ok(());
        };
        if delta == 0 && info.next_free == next_free {
            return Ok(());
        }
        if let Some(free) = info.free_count_hint(self.geometry.count_of_clusters) {
            let updated = (free as i64 + delta).clamp(0, self.geometry.count_of_clusters as i64);
            info.free_count = updated as u32;
        } else {
            info.free_count = FSINFO_UNKNOWN;
        }
        info.next_free = next_free;
        let offset = self.geometry.sector_offset(ext.fs_info_sector as u32);
        let bytes = info.to_bytes();
        self.storage.write_at(offset, &bytes)?;
        Ok(())
    }
}
