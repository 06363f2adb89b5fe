//! FAT12/FAT16/FAT32 engine over any random-access byte store.
//!
//! Mount a volume with [`disk::mount`] or [`fs::FileSystem::mount`], format
//! one with [`mkfs::mkfsvfat`], and partition a disk with
//! [`partition::fdisk`]. All I/O goes through [`storage::Storage`].

pub mod codepage;
pub mod disk;
pub mod error;
pub mod fs;
pub mod image;
pub mod mkfs;
pub mod partition;
pub mod sector_set;
pub mod storage;

pub use codepage::{Codepage, Cp437};
pub use disk::{mount, Disk, MountOptions};
pub use error::FatError;
pub use fs::{FatFile, FatNode, FatVariant, FileSystem};
pub use mkfs::{mkfsvfat, MkfsOptions, MkfsResult};
pub use partition::{fdisk, PartitionRecord};
pub use sector_set::SectorSet;
pub use storage::{ImageFile, MemoryStorage, Storage, Window};
