//! WAL record format with CRC32 checksums
//!
//! Layout (little endian):
//!
//! ```text
//! magic:u16 | version:u8 | flags:u8 | length:u32 | crc32:u32 | offset:u64 | snapshot_id:u64 | payload
//! ```
//!
//! `length` is the payload length; the checksum covers offset, snapshot id
//! and payload. The payload is the bincode-encoded `OperationBatch`.

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use lattice_common::{OperationBatch, Offset, ReadLogEntry, SnapshotId};

use crate::error::{Result, WalError};

/// Magic number for WAL records
const WAL_MAGIC: u16 = 0x1A77;

const WAL_VERSION: u8 = 1;

/// Size of the fixed record header in bytes.
pub const HEADER_SIZE: usize = 2 + 1 + 1 + 4 + 4 + 8 + 8;

/// One durable WAL record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub offset: Offset,
    pub snapshot_id: SnapshotId,
    pub batch: OperationBatch,
}

/// Outcome of decoding the next record from a buffer.
#[derive(Debug)]
pub enum Decoded {
    Record(LogRecord, usize),
    /// Clean end of data at a record boundary.
    End,
    /// Trailing bytes that do not form a full record (torn write).
    Torn,
}

impl LogRecord {
    pub fn new(offset: Offset, snapshot_id: SnapshotId, batch: OperationBatch) -> Self {
        Self {
            offset,
            snapshot_id,
            batch,
        }
    }

    /// Serialize a record without taking ownership of the batch.
    pub fn encode(offset: Offset, snapshot_id: SnapshotId, batch: &OperationBatch) -> Result<Vec<u8>> {
        let payload = bincode::serialize(batch)?;
        let crc32 = checksum(offset, snapshot_id, &payload);

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.write_u16::<LittleEndian>(WAL_MAGIC)?;
        buf.write_u8(WAL_VERSION)?;
        buf.write_u8(0)?;
        buf.write_u32::<LittleEndian>(payload.len() as u32)?;
        buf.write_u32::<LittleEndian>(crc32)?;
        buf.write_u64::<LittleEndian>(offset)?;
        buf.write_u64::<LittleEndian>(snapshot_id)?;
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode the record starting at the beginning of `data`.
    pub fn decode(data: &[u8]) -> Result<Decoded> {
        if data.is_empty() {
            return Ok(Decoded::End);
        }
        if data.len() < HEADER_SIZE {
            return Ok(Decoded::Torn);
        }

        let mut cursor = Cursor::new(data);
        let magic = cursor.read_u16::<LittleEndian>()?;
        if magic != WAL_MAGIC {
            return Err(WalError::InvalidFormat(format!(
                "Invalid magic number: 0x{:04X}",
                magic
            )));
        }
        let version = cursor.read_u8()?;
        if version != WAL_VERSION {
            return Err(WalError::InvalidFormat(format!(
                "Unsupported version: {}",
                version
            )));
        }
        let _flags = cursor.read_u8()?;
        let length = cursor.read_u32::<LittleEndian>()? as usize;
        let crc32 = cursor.read_u32::<LittleEndian>()?;
        let offset = cursor.read_u64::<LittleEndian>()?;
        let snapshot_id = cursor.read_u64::<LittleEndian>()?;

        if data.len() < HEADER_SIZE + length {
            return Ok(Decoded::Torn);
        }

        let mut payload = vec![0u8; length];
        cursor.read_exact(&mut payload)?;

        let actual = checksum(offset, snapshot_id, &payload);
        if actual != crc32 {
            return Err(WalError::ChecksumMismatch {
                offset,
                expected: crc32,
                actual,
            });
        }

        let batch: OperationBatch =
            bincode::deserialize(&payload).map_err(|e| WalError::CorruptRecord {
                offset,
                reason: e.to_string(),
            })?;

        Ok(Decoded::Record(
            LogRecord::new(offset, snapshot_id, batch),
            HEADER_SIZE + length,
        ))
    }
}

impl From<LogRecord> for ReadLogEntry {
    fn from(record: LogRecord) -> Self {
        ReadLogEntry {
            offset: record.offset,
            snapshot_id: record.snapshot_id,
            batch: record.batch,
        }
    }
}

fn checksum(offset: Offset, snapshot_id: SnapshotId, payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(&offset.to_le_bytes());
    hasher.update(&snapshot_id.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}
