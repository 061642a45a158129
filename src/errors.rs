use thiserror::Error;

use crate::registry::Slot;

pub type Result<T> = std::result::Result<T, TransferError>;

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Unexpected chunk index {actual}, expected {expected}")]
    UnexpectedSequence { expected: u8, actual: u8 },
    #[error("Chunk checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChunkChecksumMismatch { expected: u32, actual: u32 },
    #[error("File checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    FileChecksumMismatch { expected: u32, actual: u32 },
    #[error("Unaligned offset {actual}, expected {expected}")]
    UnalignedOffset { expected: u64, actual: u64 },
    #[error("Slot {0} is busy")]
    SlotBusy(Slot),
    #[error("Peer rejected the transfer with status {status}")]
    PeerRejected { status: u8 },
    #[error("Transfer timed out")]
    Timeout,
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    #[error("Link lost")]
    LinkLost,
    #[error("Transfer cancelled")]
    Cancelled,
    #[error("No transfer for session {0}")]
    UnknownSession(u8),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransferError {
    /// Only a lost link fails every active record at once.
    pub fn is_link_fatal(&self) -> bool {
        matches!(self, Self::LinkLost)
    }

    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedFrame(reason.into())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        Self::Config(e.to_string())
    }
}
