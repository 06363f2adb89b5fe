//! Cluster-granular file handle.

use chrono::Local;

use super::crawler::FatNode;
use super::dir_entry::Attributes;
use super::filesystem::FileSystem;
use crate::error::FatError;
use crate::storage::Storage;

/// An open file. Keeps its own cluster position; the directory record is
/// rewritten whenever the size or first cluster changes.
pub struct FatFile<'a, S: Storage> {
    fs: &'a mut FileSystem<S>,
    node: FatNode,
    /// Cluster under the cursor, 0 when past the end or the file is empty.
    cluster: u32,
    /// Last cluster visited, used to link newly written clusters.
    previous: u32,
    /// Index of `cluster` within the chain.
    index: u32,
}

impl<'a, S: Storage> FatFile<'a, S> {
    pub(crate) fn new(fs: &'a mut FileSystem<S>, node: FatNode) -> Self {
        let cluster = node.first_cluster();
        Self {
            fs,
            node,
            cluster,
            previous: 0,
            index: 0,
        }
    }

    pub fn node(&self) -> &FatNode {
        &self.node
    }

    /// File size in bytes.
    pub fn length(&self) -> u32 {
        self.node.record.file_size
    }

    /// Move the cursor back to the first cluster.
    pub fn rewind(&mut self) {
        self.cluster = self.node.first_cluster();
        self.previous = 0;
        self.index = 0;
    }

    fn step(&mut self) -> Result<(), FatError> {
        let next = self
            .fs
            .fat
            .successor(&mut self.fs.storage, self.cluster)?
            .unwrap_or(0);
        self.previous = self.cluster;
        self.cluster = next;
        self.index += 1;
        Ok(())
    }

    /// Advance one cluster without reading. Returns false at the end.
    pub fn skip_cluster(&mut self) -> Result<bool, FatError> {
        if self.cluster == 0 {
            return Ok(false);
        }
        self.step()?;
        Ok(true)
    }

    /// Read the cluster under the cursor, truncated to the file length, and
    /// advance. `None` at the end of the file.
    pub fn read_cluster(&mut self) -> Result<Option<Vec<u8>>, FatError> {
        let cluster_bytes = self.fs.cluster_size();
        let consumed = self.index as u64 * cluster_bytes;
        let length = self.length() as u64;
        if self.cluster == 0 || consumed >= length {
            return Ok(None);
        }
        let len = (length - consumed).min(cluster_bytes) as usize;
        let offset = self.fs.geometry.cluster_offset(self.cluster);
        let data = self.fs.storage.read_vec(offset, len)?;
        self.step()?;
        Ok(Some(data))
    }

    /// Write `data` (at most one cluster) at the cursor, allocating a
    /// cluster when the chain ends here, and advance. The file grows to
    /// cover the written bytes.
    pub fn write_cluster(&mut self, data: &[u8]) -> Result<(), FatError> {
        self.fs.ensure_writable()?;
        let cluster_bytes = self.fs.cluster_size();
        assert!(
            data.len() as u64 <= cluster_bytes,
            "write_cluster takes at most one cluster"
        );

        let end = self.index as u64 * cluster_bytes + data.len() as u64;
        if end > u32::MAX as u64 {
            return Err(FatError::DiskFull(format!(
                "{} would exceed the FAT file size limit",
                self.node.long_name
            )));
        }

        let allocated = self.cluster == 0;
        if allocated {
            let cluster = self.fs.fat.extend_chain(&mut self.fs.storage, self.previous)?;
            if cluster == 0 {
                self.fs.flush_fs_info()?;
                return Err(FatError::DiskFull(format!(
                    "no cluster for {}",
                    self.node.long_name
                )));
            }
            if self.previous == 0 {
                self.node.record.set_first_cluster(cluster);
            }
            self.cluster = cluster;
        }

        let mut buf = data.to_vec();
        buf.resize(cluster_bytes as usize, 0);
        let offset = self.fs.geometry.cluster_offset(self.cluster);
        self.fs.storage.write_at(offset, &buf)?;

        if end > self.length() as u64 {
            self.node.record.file_size = end as u32;
        }
        self.touch()?;
        if allocated {
            self.fs.flush_fs_info()?;
        }
        self.step()
    }

    /// Whole file contents.
    pub fn read_all(&mut self) -> Result<Vec<u8>, FatError> {
        self.rewind();
        let mut data = Vec::with_capacity(self.length() as usize);
        while let Some(chunk) = self.read_cluster()? {
            data.extend_from_slice(&chunk);
        }
        self.rewind();
        Ok(data)
    }

    /// Replace the file contents, growing or shrinking its chain.
    pub fn write_all(&mut self, data: &[u8]) -> Result<(), FatError> {
        self.fs.ensure_writable()?;
        if data.len() as u64 > u32::MAX as u64 {
            return Err(FatError::DiskFull(format!(
                "{} bytes exceed the FAT file size limit",
                data.len()
            )));
        }
        let cluster_bytes = self.fs.cluster_size() as usize;
        let needed = data.len().div_ceil(cluster_bytes);
        let first = self.node.first_cluster();
        let mut chain = self.fs.fat.chain(&mut self.fs.storage, first)?;

        if chain.len() > needed {
            if needed == 0 {
                self.fs.fat.free_chain(&mut self.fs.storage, chain[0])?;
            } else {
                let end_of_chain = self.fs.fat.variant().end_of_chain();
                self.fs
                    .fat
                    .set_next(&mut self.fs.storage, chain[needed - 1], end_of_chain)?;
                self.fs.fat.free_chain(&mut self.fs.storage, chain[needed])?;
            }
            chain.truncate(needed);
        }
        let kept = chain.len();
        while chain.len() < needed {
            let last = chain.last().copied().unwrap_or(0);
            let cluster = self.fs.fat.extend_chain(&mut self.fs.storage, last)?;
            if cluster == 0 {
                self.release_grown(&chain, kept)?;
                return Err(FatError::DiskFull(format!(
                    "{} needs {needed} clusters",
                    self.node.long_name
                )));
            }
            chain.push(cluster);
        }

        for (chunk, &cluster) in data.chunks(cluster_bytes).zip(chain.iter()) {
            let mut buf = chunk.to_vec();
            buf.resize(cluster_bytes, 0);
            let offset = self.fs.geometry.cluster_offset(cluster);
            self.fs.storage.write_at(offset, &buf)?;
        }

        self.node
            .record
            .set_first_cluster(chain.first().copied().unwrap_or(0));
        self.node.record.file_size = data.len() as u32;
        self.touch()?;
        self.fs.flush_fs_info()?;
        self.rewind();
        Ok(())
    }

    /// Undo a partial grow: cut the chain back to its first `kept` clusters.
    fn release_grown(&mut self, chain: &[u32], kept: usize) -> Result<(), FatError> {
        if chain.len() > kept {
            if kept > 0 {
                let end_of_chain = self.fs.fat.variant().end_of_chain();
                self.fs
                    .fat
                    .set_next(&mut self.fs.storage, chain[kept - 1], end_of_chain)?;
            }
            self.fs.fat.free_chain(&mut self.fs.storage, chain[kept])?;
        }
        self.fs.flush_fs_info()
    }

    /// Persist the in-memory record with a fresh modification time.
    fn touch(&mut self) -> Result<(), FatError> {
        let now = Local::now().naive_local();
        let record = &mut self.node.record;
        record.touch_modified(now);
        record.attributes.0 |= Attributes::ARCHIVE;
        let record = record.clone();
        self.fs.write_record(self.node.entry_offset, &record)
    }
}
