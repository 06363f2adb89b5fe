//! Directory record walking and VFAT long-name reconstruction.

use log::{debug, warn};
use serde::Serialize;

use super::boot_sector::Geometry;
use super::dir_entry::{
    assemble_long_name, Attributes, DirectoryRecord, LfnFragment, DELETED_MARKER, DIR_ENTRY_SIZE,
    END_OF_DIRECTORY,
};
use super::fat_table::FatTable;
use super::short_name::{build_short_name, is_valid_short_name, lfn_checksum};
use crate::codepage::Codepage;
use crate::error::FatError;
use crate::storage::Storage;

const DOT_NAME: [u8; 11] = *b".          ";
const DOTDOT_NAME: [u8; 11] = *b"..         ";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeKind {
    Root,
    RegularFile,
    RegularDir,
    VolumeLabel,
    Dot,
    DotDot,
    Deleted,
    EndMarker,
    /// Orphaned LFN fragments or a short record with illegal bytes.
    Invalid,
}

/// One classified directory entry. A snapshot: any mutation of the
/// directory may invalidate its offsets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FatNode {
    pub kind: NodeKind,
    pub short_name: String,
    /// Reconstructed long name, or the short name when there is none.
    pub long_name: String,
    /// Offset of the first record (first LFN fragment, if any).
    pub first_dir_offset: u64,
    /// LFN fragments plus the short record.
    pub record_count: u32,
    /// Offset of the short record.
    pub entry_offset: u64,
    pub record: DirectoryRecord,
}

impl FatNode {
    pub(crate) fn root(geometry: &Geometry) -> Self {
        let mut record = DirectoryRecord {
            attributes: Attributes(Attributes::DIRECTORY),
            ..Default::default()
        };
        record.set_first_cluster(geometry.root_cluster);
        let offset = if geometry.root_cluster != 0 {
            geometry.cluster_offset(geometry.root_cluster)
        } else {
            geometry.root_dir_offset()
        };
        Self {
            kind: NodeKind::Root,
            short_name: String::new(),
            long_name: String::new(),
            first_dir_offset: offset,
            record_count: 0,
            entry_offset: offset,
            record,
        }
    }

    fn bare(kind: NodeKind, offset: u64, record: DirectoryRecord) -> Self {
        Self {
            kind,
            short_name: String::new(),
            long_name: String::new(),
            first_dir_offset: offset,
            record_count: 1,
            entry_offset: offset,
            record,
        }
    }

    pub fn name(&self) -> &str {
        &self.long_name
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, NodeKind::Root | NodeKind::RegularDir)
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::RegularFile
    }

    pub fn is_root(&self) -> bool {
        self.kind == NodeKind::Root
    }

    pub fn first_cluster(&self) -> u32 {
        self.record.first_cluster()
    }

    pub fn size(&self) -> u32 {
        self.record.file_size
    }

    /// Case-insensitive match against the short or the long name.
    pub fn matches(&self, name: &str) -> bool {
        self.long_name.to_lowercase() == name.to_lowercase()
            || self.short_name.to_lowercase() == name.to_lowercase()
    }

    /// Identity of the on-disk entry, stable while the tree is unchanged.
    pub fn same_entry(&self, other: &FatNode) -> bool {
        self.kind == other.kind && self.entry_offset == other.entry_offset
    }
}

/// Walks directory records through the FAT, borrowing the mounted volume.
pub struct DirectoryCrawler<'a, S: Storage + ?Sized> {
    storage: &'a mut S,
    geometry: &'a Geometry,
    fat: &'a FatTable,
    codepage: &'a dyn Codepage,
}

impl<'a, S: Storage + ?Sized> DirectoryCrawler<'a, S> {
    pub fn new(
        storage: &'a mut S,
        geometry: &'a Geometry,
        fat: &'a FatTable,
        codepage: &'a dyn Codepage,
    ) -> Self {
        Self {
            storage,
            geometry,
            fat,
            codepage,
        }
    }

    fn read_slot(&mut self, offset: u64) -> Result<[u8; DIR_ENTRY_SIZE], FatError> {
        let mut raw = [0u8; DIR_ENTRY_SIZE];
        self.storage.read_at(offset, &mut raw)?;
        Ok(raw)
    }

    /// Offset of the slot after `offset`, following the cluster chain.
    /// `None` once the fixed root region or the chain is exhausted.
    pub fn next_offset(&mut self, offset: u64) -> Result<Option<u64>, FatError> {
        let next = offset + DIR_ENTRY_SIZE as u64;
        if self.geometry.in_fixed_root(offset) {
            return Ok((next < self.geometry.root_dir_end()).then_some(next));
        }
        let cluster_bytes = self.geometry.cluster_bytes();
        if (next - self.geometry.data_offset()) % cluster_bytes != 0 {
            return Ok(Some(next));
        }
        let cluster = self.geometry.cluster_of(offset);
        Ok(self
            .fat
            .successor(&mut *self.storage, cluster)?
            .map(|c| self.geometry.cluster_offset(c)))
    }

    /// Step `count` slots forward from `offset`.
    pub fn advance(&mut self, offset: u64, count: u32) -> Result<Option<u64>, FatError> {
        let mut current = offset;
        for _ in 0..count {
            match self.next_offset(current)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }

    /// Offset of the first slot of directory `dir`, `None` for an empty or
    /// unallocated directory.
    pub fn dir_start(&self, dir: &FatNode) -> Option<u64> {
        match dir.kind {
            NodeKind::Root => Some(dir.first_dir_offset),
            NodeKind::RegularDir | NodeKind::Dot | NodeKind::DotDot => {
                let cluster = dir.first_cluster();
                if cluster == 0 && self.geometry.root_cluster == 0 {
                    Some(self.geometry.root_dir_offset())
                } else if cluster == 0 {
                    Some(self.geometry.cluster_offset(self.geometry.root_cluster))
                } else if self.geometry.is_valid_cluster(cluster) {
                    Some(self.geometry.cluster_offset(cluster))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Every slot offset of directory `dir`, in order.
    pub fn slots(&mut self, dir: &FatNode) -> Result<Vec<u64>, FatError> {
        let Some(start) = self.dir_start(dir) else {
            return Ok(Vec::new());
        };
        if self.geometry.in_fixed_root(start) {
            let end = self.geometry.root_dir_end();
            return Ok((start..end).step_by(DIR_ENTRY_SIZE).collect());
        }
        let per_cluster = self.geometry.cluster_bytes() / DIR_ENTRY_SIZE as u64;
        let cluster = self.geometry.cluster_of(start);
        let mut slots = Vec::new();
        for c in self.fat.chain(&mut *self.storage, cluster)? {
            let base = self.geometry.cluster_offset(c);
            slots.extend((0..per_cluster).map(|i| base + i * DIR_ENTRY_SIZE as u64));
        }
        Ok(slots)
    }

    /// Classify the entry beginning at `offset`, collecting any LFN
    /// fragments in front of its short record.
    pub fn load_record_at(&mut self, offset: u64) -> Result<FatNode, FatError> {
        let mut fragments: Vec<LfnFragment> = Vec::new();
        let mut last_offset = offset;
        let mut current = offset;

        loop {
            let raw = self.read_slot(current)?;
            let attributes = Attributes(raw[11]);

            if raw[0] == END_OF_DIRECTORY || raw[0] == DELETED_MARKER {
                if !fragments.is_empty() {
                    return Ok(self.orphans(offset, last_offset, &fragments));
                }
                return Ok(if raw[0] == END_OF_DIRECTORY {
                    FatNode::bare(NodeKind::EndMarker, current, DirectoryRecord::default())
                } else {
                    FatNode::bare(NodeKind::Deleted, current, DirectoryRecord::parse(&raw))
                });
            }

            if attributes.is_long_name() {
                let fragment = LfnFragment::parse(&raw);
                match fragments.last() {
                    None if !fragment.is_last() => {
                        return Ok(self.orphans(offset, current, &[fragment]));
                    }
                    Some(prev)
                        if fragment.is_last()
                            || fragment.sequence() + 1 != prev.sequence()
                            || fragment.checksum != prev.checksum =>
                    {
                        return Ok(self.orphans(offset, last_offset, &fragments));
                    }
                    _ => {}
                }
                fragments.push(fragment);
                last_offset = current;
                match self.next_offset(current)? {
                    Some(next) => current = next,
                    None => return Ok(self.orphans(offset, last_offset, &fragments)),
                }
                continue;
            }

            let record = DirectoryRecord::parse(&raw);
            if !fragments.is_empty()
                && (attributes.is_volume_id()
                    || (attributes.is_directory()
                        && (record.name == DOT_NAME || record.name == DOTDOT_NAME)))
            {
                return Ok(self.orphans(offset, last_offset, &fragments));
            }

            let record_count = fragments.len() as u32 + 1;
            let mut node = FatNode {
                kind: NodeKind::Invalid,
                short_name: String::new(),
                long_name: String::new(),
                first_dir_offset: offset,
                record_count,
                entry_offset: current,
                record,
            };

            if attributes.is_volume_id() {
                node.kind = NodeKind::VolumeLabel;
                let label = self.codepage.decode(&node.record.name);
                node.short_name = label.trim_end().to_string();
                node.long_name = node.short_name.clone();
                return Ok(node);
            }
            if attributes.is_directory() && node.record.name == DOT_NAME {
                node.kind = NodeKind::Dot;
                node.short_name = ".".into();
                node.long_name = ".".into();
                return Ok(node);
            }
            if attributes.is_directory() && node.record.name == DOTDOT_NAME {
                node.kind = NodeKind::DotDot;
                node.short_name = "..".into();
                node.long_name = "..".into();
                return Ok(node);
            }
            if !is_valid_short_name(&node.record.name, true) {
                debug!("invalid short name bytes at offset {current}");
                return Ok(node);
            }

            node.kind = if attributes.is_directory() {
                NodeKind::RegularDir
            } else {
                NodeKind::RegularFile
            };
            node.short_name = build_short_name(
                &node.record.name,
                node.record.nt_reserved,
                self.codepage,
            );
            let checksum = lfn_checksum(&node.record.name);
            let long_ok = fragments.last().is_some_and(|f| f.sequence() == 1)
                && fragments.iter().all(|f| f.checksum == checksum);
            node.long_name = if long_ok {
                assemble_long_name(&fragments)
            } else {
                if !fragments.is_empty() {
                    warn!(
                        "LFN chain for {} does not match its short record, ignoring it",
                        node.short_name
                    );
                }
                node.short_name.clone()
            };
            return Ok(node);
        }
    }

    fn orphans(&self, first: u64, last: u64, fragments: &[LfnFragment]) -> FatNode {
        warn!(
            "{} orphaned LFN fragment(s) at offset {first}",
            fragments.len()
        );
        FatNode {
            kind: NodeKind::Invalid,
            short_name: String::new(),
            long_name: String::new(),
            first_dir_offset: first,
            record_count: fragments.len() as u32,
            entry_offset: last,
            record: DirectoryRecord::default(),
        }
    }

    /// Every entry of `dir` up to the end marker, including deleted,
    /// invalid and dot entries.
    pub fn entries(&mut self, dir: &FatNode) -> Result<Vec<FatNode>, FatError> {
        let mut nodes = Vec::new();
        let Some(mut offset) = self.dir_start(dir) else {
            return Ok(nodes);
        };
        let limit = self.slots(dir)?.len();
        while nodes.len() < limit {
            let node = self.load_record_at(offset)?;
            if node.kind == NodeKind::EndMarker {
                break;
            }
            let entry_offset = node.entry_offset;
            nodes.push(node);
            match self.next_offset(entry_offset)? {
                Some(next) => offset = next,
                None => break,
            }
        }
        Ok(nodes)
    }

    /// Files and subdirectories of `dir`, without dot, label, deleted or
    /// invalid entries.
    pub fn children(&mut self, dir: &FatNode) -> Result<Vec<FatNode>, FatError> {
        Ok(self
            .entries(dir)?
            .into_iter()
            .filter(|n| matches!(n.kind, NodeKind::RegularFile | NodeKind::RegularDir))
            .collect())
    }
}
