//! Write-Ahead Log (WAL) subsystem for lattice ingestion.
//!
//! Every queue owns an append-only, offset-addressed log of
//! `(snapshot_id, OperationBatch)` records. Offsets are assigned by the log
//! at append time, start at 1 and are contiguous.

pub mod config;
pub mod error;
pub mod file;
pub mod memory;
pub mod record;
pub mod service;

pub use config::WalConfig;
pub use error::{Result, WalError};
pub use file::FileLogService;
pub use memory::MemoryLogService;
pub use record::LogRecord;
pub use service::{LogReader, LogService, LogWriter};
