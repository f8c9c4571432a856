use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid magic: 0x{0:08X}")]
    InvalidMagic(u32),

    #[error("invalid checksum")]
    InvalidChecksum,

    #[error("invalid B-tree: {0}")]
    InvalidBTree(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("corrupted data: {0}")]
    CorruptedData(String),

    /// A structural B-tree failure tied to a specific on-disk block: a
    /// non-leaf record of the wrong length, a depth overrun, and the like.
    /// Kept distinct from `CorruptedData` so the offending block number is
    /// always available to the caller, not just folded into free text.
    #[error("corrupted b-tree at block {block_nr}: {message}")]
    CorruptedBTree { block_nr: u64, message: String },

    #[error("no volume found in container")]
    NoVolume,

    #[error("not found")]
    NotFound,

    #[error("node has no space for a {key_len}+{val_len} byte record")]
    NoSpace { key_len: usize, val_len: usize },

    #[error("query allocation failed")]
    OutOfMemory,
}

impl ApfsError {
    /// Build a `corrupted` error tied to a block number, logging a loud
    /// diagnostic as required of every structural B-tree failure.
    pub fn corrupted(block_nr: u64, message: impl Into<String>) -> Self {
        let message = message.into();
        log::error!("corrupted b-tree at block {block_nr}: {message}");
        ApfsError::CorruptedBTree { block_nr, message }
    }
}

pub type Result<T> = std::result::Result<T, ApfsError>;
