//! Entry point over a whole disk or image: partitions plus the FAT volume
//! they (or the bare image) hold.

use log::debug;

use crate::codepage::{Codepage, Cp437};
use crate::error::FatError;
use crate::fs::FileSystem;
use crate::partition::{PartitionRecord, PartitionTable};
use crate::sector_set::SectorSet;
use crate::storage::{Storage, Window};

/// How [`mount`] finds and decodes the volume.
#[derive(Debug, Clone, Copy)]
pub struct MountOptions {
    /// OEM codepage for short names.
    pub codepage: &'static dyn Codepage,
    /// Index into [`Disk::volumes`]; `None` mounts the storage as a bare
    /// volume.
    pub partition: Option<usize>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            codepage: &Cp437,
            partition: None,
        }
    }
}

/// A disk or image opened by [`mount`].
pub struct Disk<S: Storage> {
    storage: S,
    options: MountOptions,
}

/// Open `storage`. Nothing is read until a method asks for it.
pub fn mount<S: Storage>(storage: S, options: MountOptions) -> Disk<S> {
    Disk { storage, options }
}

impl<S: Storage> Disk<S> {
    pub fn capacity(&self) -> u64 {
        self.storage.capacity()
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    /// Primary partitions, empty when sector 0 holds no partition table.
    pub fn partitions(&mut self) -> Vec<PartitionRecord> {
        match crate::partition::mbr::read_table(&mut self.storage) {
            Ok(records) => records,
            Err(e) => {
                debug!("no partition table: {e}");
                Vec::new()
            }
        }
    }

    /// Logical partitions inside the extended container, with absolute
    /// sector numbers.
    pub fn logical_partitions(&mut self) -> Vec<PartitionRecord> {
        match PartitionTable::detect(&mut self.storage) {
            Ok(table) => table.logical,
            Err(e) => {
                debug!("no partition table: {e}");
                Vec::new()
            }
        }
    }

    /// Mountable partitions: primaries other than extended containers,
    /// then logicals. This is what [`MountOptions::partition`] indexes.
    pub fn volumes(&mut self) -> Vec<PartitionRecord> {
        match PartitionTable::detect(&mut self.storage) {
            Ok(table) => table.volumes().cloned().collect(),
            Err(e) => {
                debug!("no partition table: {e}");
                Vec::new()
            }
        }
    }

    /// The FAT volume selected by the mount options, or `None` when it is
    /// missing or fails validation.
    pub fn file_system(&mut self) -> Option<FileSystem<Window<&mut S>>> {
        let (offset, len) = match self.options.partition {
            Some(index) => {
                let Some(record) = self.volumes().into_iter().nth(index) else {
                    debug!("partition {index} does not exist");
                    return None;
                };
                (record.start_bytes(), record.size_bytes())
            }
            None => (0, self.storage.capacity()),
        };
        let window = Window::new(&mut self.storage, offset, len);
        match FileSystem::mount(window, self.options.codepage) {
            Ok(fs) => Some(fs),
            Err(e) => {
                debug!("no FAT volume at byte {offset}: {e}");
                None
            }
        }
    }

    /// Apply a sector set (from mkfs or fdisk) at the start of the disk.
    pub fn write(&mut self, sectors: &SectorSet) -> Result<(), FatError> {
        self.write_at(0, sectors)
    }

    /// Apply a sector set starting `base` bytes into the disk.
    pub fn write_at(&mut self, base: u64, sectors: &SectorSet) -> Result<(), FatError> {
        if !self.storage.is_writable() {
            return Err(FatError::ReadOnly);
        }
        sectors.write_to(&mut self.storage, base, false)?;
        Ok(())
    }

    pub fn storage(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }
}
