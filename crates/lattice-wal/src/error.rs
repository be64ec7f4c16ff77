//! WAL error types

use std::io;
use thiserror::Error;

use lattice_common::{Offset, QueueId};

pub type Result<T> = std::result::Result<T, WalError>;

#[derive(Error, Debug)]
pub enum WalError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Corrupt record at offset {offset}: {reason}")]
    CorruptRecord { offset: Offset, reason: String },

    #[error("Checksum mismatch at offset {offset}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        offset: Offset,
        expected: u32,
        actual: u32,
    },

    #[error("Invalid WAL format: {0}")]
    InvalidFormat(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("A writer is already open for queue {0}")]
    WriterAlreadyOpen(QueueId),

    #[error("Log handle is closed")]
    Closed,
}
