//! Fixed-size header at the start of every transaction log and checkpoint
//! log file.

use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::error::LogError;
use crate::types::{KernelVersion, StoreId};

/// Size of a file header in bytes. The first entry starts right after it.
pub const LOG_HEADER_SIZE: u64 = 64;

/// Current header layout.
pub const CURRENT_HEADER_FORMAT: u8 = 1;

/// Magic of transaction log files.
pub const TX_LOG_MAGIC: [u8; 8] = *b"DSTXLOG\0";

/// Magic of checkpoint log files.
pub const CHECKPOINT_LOG_MAGIC: [u8; 8] = *b"DSCKPLOG";

const FORMAT_OFFSET: usize = 8;
const KERNEL_OFFSET: usize = 9;
const VERSION_OFFSET: usize = 10;
const PREV_APPEND_INDEX_OFFSET: usize = 18;
const STORE_ID_OFFSET: usize = 26;
const CRC_OFFSET: usize = STORE_ID_OFFSET + StoreId::ENCODED_SIZE;

/// Decoded file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    /// Header layout version.
    pub format: u8,
    /// Format of entries written to the file.
    pub kernel_version: KernelVersion,
    /// Version (sequence number) of the file.
    pub log_version: u64,
    /// Last append index written to the previous file.
    pub previous_last_append_index: i64,
    /// Store the file belongs to.
    pub store_id: StoreId,
}

impl LogHeader {
    /// Header for a new file.
    #[must_use]
    pub fn new(
        log_version: u64,
        kernel_version: KernelVersion,
        previous_last_append_index: i64,
        store_id: StoreId,
    ) -> Self {
        Self {
            format: CURRENT_HEADER_FORMAT,
            kernel_version,
            log_version,
            previous_last_append_index,
            store_id,
        }
    }

    /// Encode with the given magic.
    #[must_use]
    pub fn encode(&self, magic: &[u8; 8]) -> [u8; LOG_HEADER_SIZE as usize] {
        let mut buf = [0u8; LOG_HEADER_SIZE as usize];
        buf[..8].copy_from_slice(magic);
        buf[FORMAT_OFFSET] = self.format;
        buf[KERNEL_OFFSET] = self.kernel_version.as_byte();
        LittleEndian::write_u64(&mut buf[VERSION_OFFSET..], self.log_version);
        LittleEndian::write_i64(
            &mut buf[PREV_APPEND_INDEX_OFFSET..],
            self.previous_last_append_index,
        );
        LittleEndian::write_i64(&mut buf[STORE_ID_OFFSET..], self.store_id.creation_time);
        LittleEndian::write_i64(&mut buf[STORE_ID_OFFSET + 8..], self.store_id.random);
        LittleEndian::write_u32(&mut buf[STORE_ID_OFFSET + 16..], self.store_id.store_version);
        let crc = crc32fast::hash(&buf[..CRC_OFFSET]);
        LittleEndian::write_u32(&mut buf[CRC_OFFSET..], crc);
        buf
    }

    /// Decode a header read from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::InvalidHeader`] if the bytes are short, carry the
    /// wrong magic or fail the checksum, and
    /// [`LogError::UnsupportedKernelVersion`] for an unknown format byte.
    pub fn decode(bytes: &[u8], magic: &[u8; 8], path: &Path) -> Result<Self, LogError> {
        let invalid = |reason: String| LogError::InvalidHeader {
            path: path.to_path_buf(),
            reason,
        };

        if bytes.len() < LOG_HEADER_SIZE as usize {
            return Err(invalid(format!(
                "header is {} bytes, expected {LOG_HEADER_SIZE}",
                bytes.len()
            )));
        }
        if &bytes[..8] != magic {
            return Err(invalid("bad magic".into()));
        }
        let stored_crc = LittleEndian::read_u32(&bytes[CRC_OFFSET..]);
        let computed_crc = crc32fast::hash(&bytes[..CRC_OFFSET]);
        if stored_crc != computed_crc {
            return Err(invalid(format!(
                "crc mismatch: expected {stored_crc:#x}, computed {computed_crc:#x}"
            )));
        }
        let format = bytes[FORMAT_OFFSET];
        if format != CURRENT_HEADER_FORMAT {
            return Err(invalid(format!("unknown header format {format}")));
        }
        let kernel_version = KernelVersion::try_from(bytes[KERNEL_OFFSET])
            .map_err(LogError::UnsupportedKernelVersion)?;

        Ok(Self {
            format,
            kernel_version,
            log_version: LittleEndian::read_u64(&bytes[VERSION_OFFSET..]),
            previous_last_append_index: LittleEndian::read_i64(&bytes[PREV_APPEND_INDEX_OFFSET..]),
            store_id: StoreId::new(
                LittleEndian::read_i64(&bytes[STORE_ID_OFFSET..]),
                LittleEndian::read_i64(&bytes[STORE_ID_OFFSET + 8..]),
                LittleEndian::read_u32(&bytes[STORE_ID_OFFSET + 16..]),
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> LogHeader {
        LogHeader::new(4, KernelVersion::V2, 17, StoreId::new(1000, -5, 3))
    }

    #[test]
    fn test_header_decodes_what_was_encoded() {
        let bytes = header().encode(&TX_LOG_MAGIC);
        let decoded = LogHeader::decode(&bytes, &TX_LOG_MAGIC, Path::new("txlog.4")).unwrap();
        assert_eq!(decoded, header());
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let bytes = header().encode(&TX_LOG_MAGIC);
        let err = LogHeader::decode(&bytes, &CHECKPOINT_LOG_MAGIC, Path::new("checkpoint.4"))
            .unwrap_err();
        assert!(matches!(err, LogError::InvalidHeader { .. }));
    }

    #[test]
    fn test_corrupted_header_rejected() {
        let mut bytes = header().encode(&TX_LOG_MAGIC);
        bytes[VERSION_OFFSET] ^= 0xff;
        let err = LogHeader::decode(&bytes, &TX_LOG_MAGIC, Path::new("txlog.4")).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_short_header_rejected() {
        let err = LogHeader::decode(&[0u8; 10], &TX_LOG_MAGIC, Path::new("txlog.0")).unwrap_err();
        assert!(matches!(err, LogError::InvalidHeader { .. }));
    }
}
