use thiserror::Error;

#[derive(Error, Debug)]
pub enum FatError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid boot sector: {0}")]
    InvalidBootSector(String),

    #[error("Invalid FSInfo sector: {0}")]
    InvalidFsInfo(String),

    #[error("Invalid MBR: {0}")]
    InvalidMbr(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("cannot move {0} into itself")]
    MoveIntoSelf(String),

    #[error("operation not permitted on the root directory")]
    RootDirectory,

    #[error("disk full: {0}")]
    DiskFull(String),

    #[error("directory full: {0}")]
    DirectoryFull(String),

    #[error("storage is read-only")]
    ReadOnly,
}

impl FatError {
    /// True when the examined bytes are not a structurally valid FAT/MBR region.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            FatError::InvalidBootSector(_) | FatError::InvalidFsInfo(_) | FatError::InvalidMbr(_)
        )
    }

    /// True when the volume ran out of clusters or directory slots.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, FatError::DiskFull(_) | FatError::DirectoryFull(_))
    }
}
