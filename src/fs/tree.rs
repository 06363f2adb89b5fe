//! Path resolution and directory tree mutation.

use std::collections::HashSet;

use chrono::Local;
use log::debug;

use super::crawler::{FatNode, NodeKind};
use super::dir_entry::{
    build_lfn_fragments, Attributes, DirectoryRecord, DELETED_MARKER, DIR_ENTRY_SIZE,
    END_OF_DIRECTORY,
};
use super::filesystem::FileSystem;
use super::short_name::{build_short_name, generate_short_name, lfn_checksum, validate_long_name};
use crate::error::FatError;
use crate::storage::Storage;

/// Split a path on `/` or `\` and collapse `.` and `..` lexically.
pub fn normalize_path(path: &str) -> Vec<&str> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            name => segments.push(name),
        }
    }
    segments
}

impl<S: Storage> FileSystem<S> {
    fn find_child(&mut self, dir: &FatNode, name: &str) -> Result<Option<FatNode>, FatError> {
        Ok(self
            .crawler()
            .children(dir)?
            .into_iter()
            .find(|n| n.matches(name)))
    }

    /// Nodes from the root down to the deepest existing prefix of `segments`.
    fn resolve_prefix(&mut self, segments: &[&str]) -> Result<Vec<FatNode>, FatError> {
        let mut chain = vec![self.root()];
        for segment in segments {
            let Some(dir) = chain.last().filter(|n| n.is_dir()).cloned() else {
                break;
            };
            match self.find_child(&dir, segment)? {
                Some(node) => chain.push(node),
                None => break,
            }
        }
        Ok(chain)
    }

    /// Look up `path`. Matching is case-insensitive on short and long names.
    pub fn resolve(&mut self, path: &str) -> Result<Option<FatNode>, FatError> {
        let segments = normalize_path(path);
        let chain = self.resolve_prefix(&segments)?;
        if chain.len() == segments.len() + 1 {
            Ok(chain.last().cloned())
        } else {
            Ok(None)
        }
    }

    /// Open or create the file at `path`, creating missing parent directories.
    pub fn create_file(&mut self, path: &str) -> Result<FatNode, FatError> {
        self.create(path, true)
    }

    /// Open or create the directory at `path`, creating missing parents.
    pub fn create_dir(&mut self, path: &str) -> Result<FatNode, FatError> {
        self.create(path, false)
    }

    fn create(&mut self, path: &str, is_file: bool) -> Result<FatNode, FatError> {
        self.ensure_writable()?;
        let segments = normalize_path(path);
        let Some((name, parents)) = segments.split_last() else {
            return if is_file {
                Err(FatError::AlreadyExists("/".into()))
            } else {
                Ok(self.root())
            };
        };

        let mut dir = self.root();
        for segment in parents {
            dir = match self.find_child(&dir, segment)? {
                Some(node) if node.is_dir() => node,
                Some(node) => return Err(FatError::NotADirectory(node.long_name)),
                None => self.create_entry(&dir, segment, false)?,
            };
        }

        match self.find_child(&dir, name)? {
            Some(node) if node.is_file() == is_file => Ok(node),
            Some(node) => Err(FatError::AlreadyExists(node.long_name)),
            None => self.create_entry(&dir, name, is_file),
        }
    }

    /// Cluster number a child's `..` record stores for `parent`.
    fn dotdot_cluster(parent: &FatNode) -> u32 {
        if parent.is_root() {
            0
        } else {
            parent.first_cluster()
        }
    }

    fn create_entry(
        &mut self,
        parent: &FatNode,
        name: &str,
        is_file: bool,
    ) -> Result<FatNode, FatError> {
        validate_long_name(name)?;
        let now = Local::now().naive_local();

        if is_file {
            let record = DirectoryRecord::new([b' '; 11], Attributes::ARCHIVE, now);
            let node = self.insert_entry(parent, name, record)?;
            self.flush_fs_info()?;
            return Ok(node);
        }

        let cluster = self.fat.allocate_one(&mut self.storage, 0)?;
        if cluster == 0 {
            return Err(FatError::DiskFull(format!("no cluster for directory {name}")));
        }
        let result = self
            .init_directory_cluster(cluster, Self::dotdot_cluster(parent), now)
            .and_then(|_| {
                let mut record = DirectoryRecord::new([b' '; 11], Attributes::DIRECTORY, now);
                record.set_first_cluster(cluster);
                self.insert_entry(parent, name, record)
            });
        if result.is_err() {
            self.fat.free_chain(&mut self.storage, cluster)?;
        }
        self.flush_fs_info()?;
        result
    }

    fn init_directory_cluster(
        &mut self,
        cluster: u32,
        parent_cluster: u32,
        now: chrono::NaiveDateTime,
    ) -> Result<(), FatError> {
        self.zero_cluster(cluster)?;
        let offset = self.geometry.cluster_offset(cluster);
        let mut dot = DirectoryRecord::new(*b".          ", Attributes::DIRECTORY, now);
        dot.set_first_cluster(cluster);
        let mut dotdot = DirectoryRecord::new(*b"..         ", Attributes::DIRECTORY, now);
        dotdot.set_first_cluster(parent_cluster);
        self.write_record(offset, &dot)?;
        self.write_record(offset + DIR_ENTRY_SIZE as u64, &dotdot)
    }

    /// Write a new entry named `name` into `parent`. The record's name field
    /// is replaced by a synthesized short name; the rest is kept.
    fn insert_entry(
        &mut self,
        parent: &FatNode,
        name: &str,
        mut record: DirectoryRecord,
    ) -> Result<FatNode, FatError> {
        let taken: HashSet<[u8; 11]> = self
            .crawler()
            .entries(parent)?
            .into_iter()
            .filter(|n| !matches!(n.kind, NodeKind::Deleted | NodeKind::Invalid))
            .map(|n| n.record.name)
            .collect();
        let short = generate_short_name(name, self.codepage, &taken)?;
        record.name = short;

        let fragments = if build_short_name(&short, 0, self.codepage) == name {
            Vec::new()
        } else {
            build_lfn_fragments(name, lfn_checksum(&short))?
        };
        let slots = self.find_free_run(parent, fragments.len() + 1)?;
        for (fragment, &offset) in fragments.iter().zip(slots.iter()) {
            self.storage.write_at(offset, &fragment.to_bytes())?;
        }
        self.write_record(slots[fragments.len()], &record)?;
        self.crawler().load_record_at(slots[0])
    }

    /// Find `needed` consecutive free slots in `dir`, growing the directory
    /// one cluster at a time when none are left. A zero terminator is kept
    /// after a run placed past the old end of the directory.
    fn find_free_run(&mut self, dir: &FatNode, needed: usize) -> Result<Vec<u64>, FatError> {
        loop {
            let slots = self.crawler().slots(dir)?;
            let mut run_start = 0;
            let mut run_len = 0;
            let mut past_end = false;
            let mut found = None;
            for (i, &offset) in slots.iter().enumerate() {
                let free = past_end || {
                    let mut first = [0u8; 1];
                    self.storage.read_at(offset, &mut first)?;
                    if first[0] == END_OF_DIRECTORY {
                        past_end = true;
                    }
                    first[0] == END_OF_DIRECTORY || first[0] == DELETED_MARKER
                };
                if !free {
                    run_len = 0;
                    continue;
                }
                if run_len == 0 {
                    run_start = i;
                }
                run_len += 1;
                if run_len == needed {
                    found = Some((run_start, past_end));
                    break;
                }
            }

            if let Some((start, in_end_region)) = found {
                let run = slots[start..start + needed].to_vec();
                if in_end_region {
                    if let Some(&after) = slots.get(start + needed) {
                        self.storage.write_at(after, &[0u8; DIR_ENTRY_SIZE])?;
                    }
                }
                return Ok(run);
            }

            if dir.is_root() && self.geometry.root_cluster == 0 {
                return Err(FatError::DirectoryFull(format!(
                    "root directory has no run of {needed} free entries"
                )));
            }
            let last = match slots.last() {
                Some(&offset) => self.geometry.cluster_of(offset),
                None => return Err(FatError::NotADirectory(dir.long_name.clone())),
            };
            let cluster = self.fat.extend_chain(&mut self.storage, last)?;
            if cluster == 0 {
                return Err(FatError::DiskFull(format!(
                    "cannot grow directory {}",
                    dir.long_name
                )));
            }
            debug!("grew directory {:?} with cluster {cluster}", dir.long_name);
            self.zero_cluster(cluster)?;
        }
    }

    /// Mark every record of `node` (LFN fragments and short record) deleted.
    fn erase_records(&mut self, node: &FatNode) -> Result<(), FatError> {
        let mut offset = Some(node.first_dir_offset);
        for _ in 0..node.record_count {
            let Some(at) = offset else { break };
            self.storage.write_at(at, &[DELETED_MARKER])?;
            offset = self.crawler().next_offset(at)?;
        }
        Ok(())
    }

    fn delete_recursive(&mut self, node: &FatNode) -> Result<(), FatError> {
        if node.kind == NodeKind::RegularDir {
            for child in self.crawler().children(node)? {
                self.delete_recursive(&child)?;
            }
        }
        self.fat.free_chain(&mut self.storage, node.first_cluster())?;
        self.erase_records(node)
    }

    /// Cut an emptied FAT32 root back to its first cluster. A label record
    /// stored in a later cluster moves to the first slot.
    fn shrink_root(&mut self) -> Result<(), FatError> {
        let first = self.geometry.root_cluster;
        if first == 0 {
            return Ok(());
        }
        let Some(second) = self.fat.successor(&mut self.storage, first)? else {
            return Ok(());
        };
        let root = self.root();
        let label = self
            .crawler()
            .entries(&root)?
            .into_iter()
            .find(|n| n.kind == NodeKind::VolumeLabel);

        let end_of_chain = self.fat.variant().end_of_chain();
        self.fat.set_next(&mut self.storage, first, end_of_chain)?;
        self.fat.free_chain(&mut self.storage, second)?;
        debug!("root directory cut back to cluster {first}");

        if let Some(label) = label {
            if self.geometry.cluster_of(label.entry_offset) != first {
                self.zero_cluster(first)?;
                self.write_record(self.geometry.cluster_offset(first), &label.record)?;
            }
        }
        Ok(())
    }

    /// Delete `node` and everything beneath it. Deleting the root empties it
    /// but keeps the directory itself and its volume label.
    pub fn delete(&mut self, node: &FatNode) -> Result<(), FatError> {
        self.ensure_writable()?;
        match node.kind {
            NodeKind::Root => {
                let root = self.root();
                for child in self.crawler().children(&root)? {
                    self.delete_recursive(&child)?;
                }
                self.shrink_root()?;
            }
            NodeKind::RegularFile | NodeKind::RegularDir => self.delete_recursive(node)?,
            _ => {
                return Err(FatError::InvalidName(format!(
                    "cannot delete a {:?} entry",
                    node.kind
                )))
            }
        }
        self.flush_fs_info()
    }

    /// Move `node` to `dest_path`, replacing an existing file or empty
    /// directory there. Returns the node at its new location.
    pub fn move_to(&mut self, node: &FatNode, dest_path: &str) -> Result<FatNode, FatError> {
        self.ensure_writable()?;
        if node.is_root() {
            return Err(FatError::RootDirectory);
        }
        if !matches!(node.kind, NodeKind::RegularFile | NodeKind::RegularDir) {
            return Err(FatError::NotFound(node.long_name.clone()));
        }
        let segments = normalize_path(dest_path);
        let Some((name, parents)) = segments.split_last() else {
            return Err(FatError::RootDirectory);
        };

        if node.is_dir() {
            let prefix = self.resolve_prefix(parents)?;
            if prefix.iter().any(|p| p.same_entry(node)) {
                return Err(FatError::MoveIntoSelf(node.long_name.clone()));
            }
        }

        let parent_path = parents.join("/");
        let parent = self.create_dir(&parent_path)?;
        let existing = self.find_child(&parent, name)?;
        if let Some(dest) = &existing {
            if dest.same_entry(node) {
                return Ok(dest.clone());
            }
            if dest.is_file() != node.is_file() {
                return Err(FatError::AlreadyExists(dest.long_name.clone()));
            }
            if dest.is_dir() && !self.crawler().children(dest)?.is_empty() {
                return Err(FatError::DirectoryNotEmpty(dest.long_name.clone()));
            }
        }

        // Re-read the source: creating parent directories may not move it,
        // but its record must be current.
        let source = self.read_record(node.entry_offset)?;
        let dest = match existing {
            Some(dest) => {
                self.fat.free_chain(&mut self.storage, dest.first_cluster())?;
                let mut record = source.clone();
                record.name = dest.record.name;
                record.nt_reserved = dest.record.nt_reserved;
                self.write_record(dest.entry_offset, &record)?;
                FatNode { record, ..dest }
            }
            None => {
                let mut record = source.clone();
                record.nt_reserved = 0;
                self.insert_entry(&parent, name, record)?
            }
        };
        self.erase_records(node)?;

        if node.is_dir() && self.geometry.is_valid_cluster(source.first_cluster()) {
            let dotdot_offset = self.geometry.cluster_offset(source.first_cluster())
                + DIR_ENTRY_SIZE as u64;
            let mut dotdot = self.read_record(dotdot_offset)?;
            if dotdot.name == *b"..         " {
                dotdot.set_first_cluster(Self::dotdot_cluster(&parent));
                self.write_record(dotdot_offset, &dotdot)?;
            }
        }
        self.flush_fs_info()?;
        self.crawler().load_record_at(dest.first_dir_offset)
    }
}
