use crate::BlockNumber;
use thiserror::Error;

/// Every failure the engine reports. The first group are ordinary outcomes a
/// caller is expected to handle; the second group means the volume (or the
/// process driving it) can no longer be trusted.
#[derive(Error, Debug)]
pub enum XcfsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("an entry with that name already exists")]
    AlreadyExists,
    #[error("no free blocks remain on the volume")]
    DiskFull,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory is not empty")]
    DirectoryNotEmpty,
    #[error("invalid file name: {0:?}")]
    InvalidName(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("volume is mounted read-only")]
    ReadOnly,

    #[error("corrupt metadata at block {block:#x}: {detail}")]
    Corruption { block: BlockNumber, detail: String },
    #[error("content hash mismatch at block {block:#x}")]
    HashMismatch { block: BlockNumber },
    #[error("every cache element is referenced")]
    CacheOvercommitted,
    #[error("block {0:#x} is outside the volume")]
    BlockOutOfRange(BlockNumber),
    #[error("device i/o failed")]
    Io(#[from] std::io::Error),
}

impl XcfsError {
    pub(crate) fn corruption<S: Into<String>>(block: BlockNumber, detail: S) -> Self {
        XcfsError::Corruption {
            block,
            detail: detail.into(),
        }
    }

    /// True for errors after which the in-memory volume state may disagree with
    /// the medium. Nothing is retried by the engine.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            XcfsError::Corruption { .. }
                | XcfsError::HashMismatch { .. }
                | XcfsError::CacheOvercommitted
                | XcfsError::BlockOutOfRange(_)
                | XcfsError::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, XcfsError>;
