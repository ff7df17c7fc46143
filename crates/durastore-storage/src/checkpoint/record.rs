//! Checkpoint record codec.

use std::io::{self, Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, TimeZone, Utc};

use crate::error::LogError;
use crate::types::{KernelVersion, LogPosition, TransactionId, UNKNOWN_CONSENSUS_INDEX};

/// Frame kind of a checkpoint record.
pub const CHECKPOINT_ENTRY: u8 = 0x20;

/// One checkpoint as stored in the checkpoint log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    /// Record format.
    pub kernel_version: KernelVersion,
    /// Wall clock time the record was written.
    pub timestamp: DateTime<Utc>,
    /// Transaction log position covered by the checkpoint.
    pub transaction_log_position: LogPosition,
    /// Oldest position recovery must still read.
    pub checkpointed_position: LogPosition,
    /// Checkpointed transaction.
    pub transaction_id: TransactionId,
    /// Append index of the last batch covered.
    pub append_index: i64,
    /// What triggered the checkpoint.
    pub reason: String,
}

impl CheckpointRecord {
    /// Encode the frame body.
    ///
    /// The consensus index is only written for formats that keep it in the
    /// record. Reasons longer than `u16::MAX` bytes are cut at a character
    /// boundary.
    ///
    /// # Errors
    ///
    /// Never fails for in-memory buffers; the signature mirrors the writer.
    pub fn encode_body(&self) -> io::Result<Vec<u8>> {
        let mut body = Vec::with_capacity(96 + self.reason.len());
        body.write_u8(self.kernel_version.as_byte())?;
        body.write_i64::<LittleEndian>(self.timestamp.timestamp_millis())?;
        write_position(&mut body, self.transaction_log_position)?;
        write_position(&mut body, self.checkpointed_position)?;
        body.write_i64::<LittleEndian>(self.transaction_id.id)?;
        body.write_i64::<LittleEndian>(self.transaction_id.append_index)?;
        body.write_i32::<LittleEndian>(self.transaction_id.checksum)?;
        body.write_i64::<LittleEndian>(self.transaction_id.commit_timestamp)?;
        body.write_i64::<LittleEndian>(self.append_index)?;
        if self.kernel_version >= KernelVersion::V2 {
            body.write_i64::<LittleEndian>(self.transaction_id.consensus_index)?;
        }

        let reason = truncate_utf8(&self.reason, u16::MAX as usize);
        body.write_u16::<LittleEndian>(u16::try_from(reason.len()).unwrap_or(u16::MAX))?;
        body.extend_from_slice(reason.as_bytes());
        Ok(body)
    }

    /// Decode a frame body.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnsupportedKernelVersion`] for an unknown format
    /// byte and an `InvalidData` I/O error for a short or non UTF-8 body.
    pub fn decode(body: &[u8]) -> Result<Self, LogError> {
        let mut cursor = Cursor::new(body);
        let kernel_version = KernelVersion::try_from(cursor.read_u8()?)
            .map_err(LogError::UnsupportedKernelVersion)?;
        let millis = cursor.read_i64::<LittleEndian>()?;
        let timestamp = Utc
            .timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| invalid(format!("timestamp {millis} out of range")))?;
        let transaction_log_position = read_position(&mut cursor)?;
        let checkpointed_position = read_position(&mut cursor)?;
        let id = cursor.read_i64::<LittleEndian>()?;
        let tx_append_index = cursor.read_i64::<LittleEndian>()?;
        let checksum = cursor.read_i32::<LittleEndian>()?;
        let commit_timestamp = cursor.read_i64::<LittleEndian>()?;
        let append_index = cursor.read_i64::<LittleEndian>()?;
        let consensus_index = if kernel_version >= KernelVersion::V2 {
            cursor.read_i64::<LittleEndian>()?
        } else {
            UNKNOWN_CONSENSUS_INDEX
        };

        let reason_len = cursor.read_u16::<LittleEndian>()? as usize;
        let mut reason = vec![0u8; reason_len];
        cursor.read_exact(&mut reason)?;
        let reason = String::from_utf8(reason).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            kernel_version,
            timestamp,
            transaction_log_position,
            checkpointed_position,
            transaction_id: TransactionId::new(
                id,
                tx_append_index,
                kernel_version,
                checksum,
                commit_timestamp,
                consensus_index,
            ),
            append_index,
            reason,
        })
    }
}

fn write_position(out: &mut Vec<u8>, position: LogPosition) -> io::Result<()> {
    out.write_u64::<LittleEndian>(position.log_version)?;
    out.write_u64::<LittleEndian>(position.byte_offset)
}

fn read_position(cursor: &mut Cursor<&[u8]>) -> io::Result<LogPosition> {
    Ok(LogPosition::new(
        cursor.read_u64::<LittleEndian>()?,
        cursor.read_u64::<LittleEndian>()?,
    ))
}

fn invalid(reason: String) -> LogError {
    LogError::Io(io::Error::new(io::ErrorKind::InvalidData, reason))
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
