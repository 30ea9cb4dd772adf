use std::io;

/// Errors surfaced by the volume engine and the VFS adapter.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("Not a valid RedSea volume: boot record signature mismatch.")]
    InvalidVolume,
    #[error("No entry with the given name.")]
    NotFound,
    #[error("The volume was mounted read-only.")]
    ReadOnly,
    #[error("No contiguous run of free sectors or directory slots is large enough.")]
    NoSpace,
    #[error("The directory still has live entries.")]
    DirectoryNotEmpty,
    #[error("Operation not permitted by the open mode.")]
    NotPermitted,
    #[error("Target buffer is too small for the entry name.")]
    BufferOverflow,
    #[error("The entry is not a directory.")]
    NotADirectory,
    #[error("The entry is a directory.")]
    IsADirectory,
    #[error("Offset lies past the end of the entry.")]
    OffsetPastEnd,
    #[error("I/O error: {0}.")]
    Io(#[from] io::Error),
}
