//! Byte-addressable storage backends.
//!
//! Everything in the crate reads and writes through [`Storage`] with explicit
//! offsets; there is no shared seek position between calls.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Random-access byte store holding a disk image, partition or device.
pub trait Storage {
    /// Total size in bytes.
    fn capacity(&self) -> u64;

    /// Fill `buf` with the bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Write `data` at `offset`. The default implementation refuses, which is
    /// how read-only backends are expressed.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let _ = (offset, data);
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "storage is read-only",
        ))
    }

    /// Whether `write_at` is supported.
    fn is_writable(&self) -> bool {
        false
    }

    /// Convenience wrapper returning a freshly allocated buffer.
    fn read_vec(&mut self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}

impl<S: Storage + ?Sized> Storage for &mut S {
    fn capacity(&self) -> u64 {
        (**self).capacity()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        (**self).write_at(offset, data)
    }

    fn is_writable(&self) -> bool {
        (**self).is_writable()
    }
}

fn out_of_range(offset: u64, len: usize, capacity: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("access of {len} bytes at offset {offset} exceeds capacity {capacity}"),
    )
}

fn check_range(offset: u64, len: usize, capacity: u64) -> io::Result<()> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= capacity => Ok(()),
        _ => Err(out_of_range(offset, len, capacity)),
    }
}

/// An image held entirely in memory.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    data: Vec<u8>,
    writable: bool,
}

impl MemoryStorage {
    /// A zero-filled writable image of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0u8; len],
            writable: true,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data,
            writable: true,
        }
    }

    /// Same image, but every write is refused.
    pub fn read_only(data: Vec<u8>) -> Self {
        Self {
            data,
            writable: false,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl Storage for MemoryStorage {
    fn capacity(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(offset, buf.len(), self.capacity())?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "storage is read-only",
            ));
        }
        check_range(offset, data.len(), self.capacity())?;
        let start = offset as usize;
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

/// A disk image stored in a host file.
pub struct ImageFile {
    file: File,
    len: u64,
    writable: bool,
}

impl ImageFile {
    /// Open an existing image for reading and writing.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            len,
            writable: true,
        })
    }

    pub fn open_read_only(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            len,
            writable: false,
        })
    }

    /// Create (or truncate) an image of exactly `len` bytes. The file is
    /// sparse on filesystems that support it.
    pub fn create(path: &Path, len: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self {
            file,
            len,
            writable: true,
        })
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Storage for ImageFile {
    fn capacity(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        if !self.writable {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "storage is read-only",
            ));
        }
        check_range(offset, data.len(), self.len)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

/// A byte range of another storage, e.g. one partition of a disk.
pub struct Window<S> {
    inner: S,
    offset: u64,
    len: u64,
}

impl<S: Storage> Window<S> {
    /// The range is clamped to the inner storage's capacity.
    pub fn new(inner: S, offset: u64, len: u64) -> Self {
        let available = inner.capacity().saturating_sub(offset);
        Self {
            inner,
            offset,
            len: len.min(available),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Storage> Storage for Window<S> {
    fn capacity(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        check_range(offset, buf.len(), self.len)?;
        self.inner.read_at(self.offset + offset, buf)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        check_range(offset, data.len(), self.len)?;
        self.inner.write_at(self.offset + offset, data)
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }
}
