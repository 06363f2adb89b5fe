//! FAT12/16/32 volume access: boot sector decoding, the allocation table,
//! directory walking and the file tree built on top of them.

pub mod boot_sector;
pub mod crawler;
pub mod dir_entry;
pub mod fat_table;
pub mod file;
pub mod filesystem;
pub mod short_name;
pub mod tree;

pub use boot_sector::{BootSector, FsInfo, Geometry};
pub use crawler::{DirectoryCrawler, FatNode, NodeKind};
pub use dir_entry::{Attributes, DirectoryRecord};
pub use fat_table::{FatTable, FatVariant};
pub use file::FatFile;
pub use filesystem::FileSystem;
