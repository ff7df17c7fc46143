//! Transaction log entries.
//!
//! A transaction is written as one [`LogEntry::Start`], any number of
//! [`LogEntry::Command`] entries and a closing [`LogEntry::Commit`]. Large
//! transactions may instead be closed chunk by chunk with
//! [`LogEntry::ChunkEnd`].

use std::io::{self, Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::LogError;
use crate::types::{KernelVersion, UNKNOWN_CONSENSUS_INDEX};

/// Entry kind: transaction start.
pub const START_ENTRY: u8 = 0x01;
/// Entry kind: opaque command.
pub const COMMAND_ENTRY: u8 = 0x02;
/// Entry kind: transaction commit.
pub const COMMIT_ENTRY: u8 = 0x03;
/// Entry kind: end of a transaction chunk.
pub const CHUNK_END_ENTRY: u8 = 0x04;

/// Opens a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartEntry {
    /// Format the transaction is written with.
    pub kernel_version: KernelVersion,
    /// Wall clock millis when the entry was written.
    pub time_written: i64,
    /// Append index of the batch.
    pub append_index: i64,
    /// Checksum of the previous transaction.
    pub previous_checksum: i32,
    /// Opaque header bytes supplied by the caller.
    pub additional_header: Vec<u8>,
}

impl StartEntry {
    /// Consensus index carried in the additional header, if the header holds
    /// one.
    #[must_use]
    pub fn consensus_index(&self) -> i64 {
        decode_consensus_index(&self.additional_header)
    }
}

/// Closes a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitEntry {
    /// Committed transaction id.
    pub tx_id: i64,
    /// Wall clock millis of the commit.
    pub time_committed: i64,
    /// Chained checksum of the transaction.
    pub checksum: i32,
}

/// Closes one chunk of a chunked transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkEndEntry {
    /// Transaction the chunk belongs to.
    pub tx_id: i64,
    /// Sequence number of the chunk.
    pub chunk_id: i64,
}

/// One entry in a transaction log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    /// Transaction start.
    Start(StartEntry),
    /// Opaque command payload.
    Command(Vec<u8>),
    /// Transaction commit.
    Commit(CommitEntry),
    /// Chunk end.
    ChunkEnd(ChunkEndEntry),
}

impl LogEntry {
    /// Kind byte used in the frame.
    #[must_use]
    pub fn kind(&self) -> u8 {
        match self {
            Self::Start(_) => START_ENTRY,
            Self::Command(_) => COMMAND_ENTRY,
            Self::Commit(_) => COMMIT_ENTRY,
            Self::ChunkEnd(_) => CHUNK_END_ENTRY,
        }
    }

    /// Encode the frame body.
    ///
    /// # Errors
    ///
    /// Returns an error if the additional header does not fit the u32 length
    /// prefix.
    pub fn encode_body(&self) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        match self {
            Self::Start(start) => {
                let header_len = u32::try_from(start.additional_header.len()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "additional header too large")
                })?;
                body.write_u8(start.kernel_version.as_byte())?;
                body.write_i64::<LittleEndian>(start.time_written)?;
                body.write_i64::<LittleEndian>(start.append_index)?;
                body.write_i32::<LittleEndian>(start.previous_checksum)?;
                body.write_u32::<LittleEndian>(header_len)?;
                body.extend_from_slice(&start.additional_header);
            }
            Self::Command(payload) => body.extend_from_slice(payload),
            Self::Commit(commit) => {
                body.write_i64::<LittleEndian>(commit.tx_id)?;
                body.write_i64::<LittleEndian>(commit.time_committed)?;
                body.write_i32::<LittleEndian>(commit.checksum)?;
            }
            Self::ChunkEnd(chunk) => {
                body.write_i64::<LittleEndian>(chunk.tx_id)?;
                body.write_i64::<LittleEndian>(chunk.chunk_id)?;
            }
        }
        Ok(body)
    }

    /// Decode a frame body of the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnsupportedKernelVersion`] for start entries
    /// written by a newer format, and an `InvalidData` I/O error for an
    /// unknown kind or a short body.
    pub fn decode(kind: u8, body: Vec<u8>) -> Result<Self, LogError> {
        if kind == COMMAND_ENTRY {
            return Ok(Self::Command(body));
        }

        let mut cursor = Cursor::new(body.as_slice());
        let entry = match kind {
            START_ENTRY => {
                let kernel_version = KernelVersion::try_from(cursor.read_u8()?)
                    .map_err(LogError::UnsupportedKernelVersion)?;
                let time_written = cursor.read_i64::<LittleEndian>()?;
                let append_index = cursor.read_i64::<LittleEndian>()?;
                let previous_checksum = cursor.read_i32::<LittleEndian>()?;
                let header_len = cursor.read_u32::<LittleEndian>()? as usize;
                let consumed = usize::try_from(cursor.position()).unwrap_or(usize::MAX);
                let remaining = body.len().saturating_sub(consumed);
                if header_len > remaining {
                    return Err(LogError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("start entry header of {header_len} bytes, {remaining} left"),
                    )));
                }
                let mut additional_header = vec![0u8; header_len];
                cursor.read_exact(&mut additional_header)?;
                Self::Start(StartEntry {
                    kernel_version,
                    time_written,
                    append_index,
                    previous_checksum,
                    additional_header,
                })
            }
            COMMIT_ENTRY => Self::Commit(CommitEntry {
                tx_id: cursor.read_i64::<LittleEndian>()?,
                time_committed: cursor.read_i64::<LittleEndian>()?,
                checksum: cursor.read_i32::<LittleEndian>()?,
            }),
            CHUNK_END_ENTRY => Self::ChunkEnd(ChunkEndEntry {
                tx_id: cursor.read_i64::<LittleEndian>()?,
                chunk_id: cursor.read_i64::<LittleEndian>()?,
            }),
            other => {
                return Err(LogError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown entry kind {other:#x}"),
                )))
            }
        };
        Ok(entry)
    }
}

/// Encode a consensus index as a start entry additional header.
#[must_use]
pub fn encode_consensus_index(consensus_index: i64) -> Vec<u8> {
    consensus_index.to_le_bytes().to_vec()
}

/// Decode a consensus index from a start entry additional header.
///
/// Headers shorter than eight bytes carry no consensus index.
#[must_use]
pub fn decode_consensus_index(header: &[u8]) -> i64 {
    header
        .get(..8)
        .and_then(|bytes| <[u8; 8]>::try_from(bytes).ok())
        .map_or(UNKNOWN_CONSENSUS_INDEX, i64::from_le_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(append_index: i64) -> LogEntry {
        LogEntry::Start(StartEntry {
            kernel_version: KernelVersion::V1,
            time_written: 1_700_000_000_000,
            append_index,
            previous_checksum: 11,
            additional_header: encode_consensus_index(42),
        })
    }

    #[test]
    fn test_start_entry_body() {
        let entry = start(9);
        let body = entry.encode_body().unwrap();
        let decoded = LogEntry::decode(entry.kind(), body).unwrap();
        assert_eq!(decoded, entry);
        match decoded {
            LogEntry::Start(s) => assert_eq!(s.consensus_index(), 42),
            other => panic!("unexpected entry: {other:?}"),
        }
    }

    #[test]
    fn test_short_body_is_error() {
        let err = LogEntry::decode(COMMIT_ENTRY, vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, LogError::Io(_)));
    }

    #[test]
    fn test_oversized_start_header_is_error() {
        let mut body = start(2).encode_body().unwrap();
        // kernel(1) + time(8) + append index(8) + previous checksum(4)
        body[21..25].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = LogEntry::decode(START_ENTRY, body).unwrap_err();
        match err {
            LogError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_kernel_version() {
        let mut body = start(2).encode_body().unwrap();
        body[0] = 99;
        let err = LogEntry::decode(START_ENTRY, body).unwrap_err();
        assert!(matches!(err, LogError::UnsupportedKernelVersion(99)));
    }

    #[test]
    fn test_missing_consensus_header() {
        assert_eq!(decode_consensus_index(&[]), UNKNOWN_CONSENSUS_INDEX);
        assert_eq!(decode_consensus_index(&encode_consensus_index(-7)), -7);
    }
}
