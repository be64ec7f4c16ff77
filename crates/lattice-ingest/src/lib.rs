//! Ingestion side of the lattice write path.
//!
//! An [`IngestProcessor`] owns the WAL of one queue: it replays records
//! that were never acknowledged, then appends new batches under the current
//! ingest snapshot id and hands them to the [`BatchSender`]. The
//! [`IngestService`] runs one processor per assigned queue and starts or
//! stops them as storage nodes come and go.

pub mod backoff;
pub mod config;
pub mod error;
pub mod processor;
pub mod sender;
pub mod service;

pub use config::IngestConfig;
pub use error::{IngestError, Result};
pub use processor::{IngestProcessor, ProcessorState};
pub use sender::{BatchSender, DataBatchSender};
pub use service::{IngestCollaborators, IngestService, QueueState};
