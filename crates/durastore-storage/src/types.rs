//! Value types shared by the log, the checkpoint log and the tail scanner.
//!
//! Everything here is immutable once constructed. Ordering of
//! [`LogPosition`] is lexicographic on `(log_version, byte_offset)`, which
//! is the order bytes were appended across the rotated log sequence.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transaction id of the virtual transaction every store starts with.
pub const BASE_TX_ID: i64 = 1;
/// Append index of the virtual transaction every store starts with.
pub const BASE_APPEND_INDEX: i64 = 1;
/// Transaction id used when no transaction is known.
pub const UNKNOWN_TX_ID: i64 = -1;
/// Append index used when no batch is known.
pub const UNKNOWN_APPEND_INDEX: i64 = -1;
/// Consensus index used when none was recorded.
pub const UNKNOWN_CONSENSUS_INDEX: i64 = -1;
/// Checksum of the virtual base transaction.
pub const BASE_TX_CHECKSUM: i32 = 0;
/// Commit timestamp of the virtual base transaction.
pub const BASE_TX_COMMIT_TIMESTAMP: i64 = 0;

/// An exact byte in the rotated log sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LogPosition {
    /// Version of the log file.
    pub log_version: u64,
    /// Offset inside that file.
    pub byte_offset: u64,
}

impl LogPosition {
    /// Placeholder for "no position". Sorts after every real position.
    pub const UNSPECIFIED: Self = Self {
        log_version: u64::MAX,
        byte_offset: u64::MAX,
    };

    /// Create a new position.
    #[must_use]
    pub const fn new(log_version: u64, byte_offset: u64) -> Self {
        Self {
            log_version,
            byte_offset,
        }
    }

    /// Returns `true` unless this is [`LogPosition::UNSPECIFIED`].
    #[must_use]
    pub fn is_specified(&self) -> bool {
        *self != Self::UNSPECIFIED
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_specified() {
            write!(
                f,
                "LogPosition{{logVersion={}, byteOffset={}}}",
                self.log_version, self.byte_offset
            )
        } else {
            write!(f, "LogPosition{{unspecified}}")
        }
    }
}

/// On-disk format version of log entries and checkpoint records.
///
/// Versions are ordered: every later version understands the layout of the
/// earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum KernelVersion {
    /// Initial format. Consensus index lives in the start entry header.
    V1 = 1,
    /// Checkpoint records carry the consensus index themselves.
    V2 = 2,
    /// Adds chunked transactions (chunk-end entries).
    V3 = 3,
}

impl KernelVersion {
    /// Format written by this build.
    pub const LATEST: Self = Self::V3;

    /// Encoded byte of this version.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Where the consensus index of a checkpointed transaction is found for
    /// this format.
    #[must_use]
    pub const fn consensus_index_source(self) -> ConsensusIndexSource {
        match self {
            Self::V1 => ConsensusIndexSource::TransactionStartEntry,
            Self::V2 | Self::V3 => ConsensusIndexSource::CheckpointRecord,
        }
    }
}

impl TryFrom<u8> for KernelVersion {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            3 => Ok(Self::V3),
            other => Err(other),
        }
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "V{}", self.as_byte())
    }
}

/// Representation that carries the consensus index of the transaction a
/// checkpoint refers to. Resolved once per scan from the checkpoint's
/// [`KernelVersion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsensusIndexSource {
    /// Stored inside the checkpoint record.
    CheckpointRecord,
    /// Stored in the additional header of the start entry preceding the
    /// transaction's commit.
    TransactionStartEntry,
}

/// Identity of a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId {
    /// Transaction id, strictly increasing per store.
    pub id: i64,
    /// Append index of the batch that committed it.
    pub append_index: i64,
    /// Format the transaction was written with.
    pub kernel_version: KernelVersion,
    /// Chained checksum of the transaction.
    pub checksum: i32,
    /// Commit timestamp (millis since Unix epoch).
    pub commit_timestamp: i64,
    /// Opaque consensus index, [`UNKNOWN_CONSENSUS_INDEX`] when absent.
    pub consensus_index: i64,
}

impl TransactionId {
    /// The virtual transaction every store starts with.
    pub const BASE: Self = Self {
        id: BASE_TX_ID,
        append_index: BASE_APPEND_INDEX,
        kernel_version: KernelVersion::LATEST,
        checksum: BASE_TX_CHECKSUM,
        commit_timestamp: BASE_TX_COMMIT_TIMESTAMP,
        consensus_index: UNKNOWN_CONSENSUS_INDEX,
    };

    /// Placeholder for "no transaction".
    pub const UNKNOWN: Self = Self {
        id: UNKNOWN_TX_ID,
        append_index: UNKNOWN_APPEND_INDEX,
        kernel_version: KernelVersion::LATEST,
        checksum: BASE_TX_CHECKSUM,
        commit_timestamp: BASE_TX_COMMIT_TIMESTAMP,
        consensus_index: UNKNOWN_CONSENSUS_INDEX,
    };

    /// Create a transaction id.
    #[must_use]
    pub const fn new(
        id: i64,
        append_index: i64,
        kernel_version: KernelVersion,
        checksum: i32,
        commit_timestamp: i64,
        consensus_index: i64,
    ) -> Self {
        Self {
            id,
            append_index,
            kernel_version,
            checksum,
            commit_timestamp,
            consensus_index,
        }
    }

    /// Returns `true` for [`TransactionId::UNKNOWN`] or any id below the base.
    #[must_use]
    pub const fn is_unknown(&self) -> bool {
        self.id < BASE_TX_ID
    }

    /// Copy of this id with another consensus index.
    #[must_use]
    pub const fn with_consensus_index(mut self, consensus_index: i64) -> Self {
        self.consensus_index = consensus_index;
        self
    }
}

/// Identity of the store a log file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId {
    /// Creation time of the store (millis since Unix epoch).
    pub creation_time: i64,
    /// Random discriminator chosen at creation.
    pub random: i64,
    /// Store format version.
    pub store_version: u32,
}

impl StoreId {
    /// Encoded size in bytes.
    pub const ENCODED_SIZE: usize = 8 + 8 + 4;

    /// Create a store id from its parts.
    #[must_use]
    pub const fn new(creation_time: i64, random: i64, store_version: u32) -> Self {
        Self {
            creation_time,
            random,
            store_version,
        }
    }

    /// Generate a fresh store id for a newly created store.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn generate(store_version: u32) -> Self {
        let (random, _) = uuid::Uuid::new_v4().as_u64_pair();
        Self {
            creation_time: Utc::now().timestamp_millis(),
            random: random as i64,
            store_version,
        }
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StoreId{{creationTime={}, random={}, storeVersion={}}}",
            self.creation_time, self.random, self.store_version
        )
    }
}

/// One checkpoint as read back from the checkpoint log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    /// Last transaction closed when the checkpoint was taken.
    pub transaction_id: TransactionId,
    /// Append index of the last batch covered by the checkpoint.
    pub append_index: i64,
    /// Transaction log position everything before which is persisted.
    pub transaction_log_position: LogPosition,
    /// Oldest transaction log position recovery must still be able to read.
    pub checkpointed_position: LogPosition,
    /// Where the record starts in the checkpoint log.
    pub checkpoint_entry_position: LogPosition,
    /// Position in the checkpoint log right after the record.
    pub channel_position_after_checkpoint: LogPosition,
    /// File position right after the record (same as above unless the file
    /// was rotated right after the write).
    pub checkpoint_file_position_after_entry: LogPosition,
    /// Human readable description of what triggered the checkpoint.
    pub reason: String,
    /// Format the record was written with.
    pub kernel_version: KernelVersion,
    /// Wall clock time the checkpoint was written.
    pub timestamp: DateTime<Utc>,
}

impl CheckpointInfo {
    /// Append index of the last batch covered by the checkpoint.
    #[must_use]
    pub fn append_index(&self) -> i64 {
        self.append_index
    }
}

/// Append index and end position of the last fully written batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendBatchInfo {
    /// Append index of the batch.
    pub append_index: i64,
    /// Position right after the entry closing the batch.
    pub log_position_after: LogPosition,
}

impl AppendBatchInfo {
    /// No batch known.
    pub const EMPTY: Self = Self {
        append_index: UNKNOWN_APPEND_INDEX,
        log_position_after: LogPosition::UNSPECIFIED,
    };

    /// Create a batch description.
    #[must_use]
    pub const fn new(append_index: i64, log_position_after: LogPosition) -> Self {
        Self {
            append_index,
            log_position_after,
        }
    }
}

/// Result of a log tail scan, consumed once by recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTailState {
    /// Latest reachable checkpoint.
    pub last_checkpoint: Option<CheckpointInfo>,
    /// Whether any transaction entry follows the last checkpoint.
    pub logs_after_last_checkpoint: bool,
    /// Append index of the first transaction after the checkpoint, or
    /// [`UNKNOWN_APPEND_INDEX`].
    pub first_append_index_after_last_checkpoint: i64,
    /// Last fully written batch.
    pub last_batch: AppendBatchInfo,
    /// No transaction log file exists.
    pub files_not_found: bool,
    /// The scan stopped before the end of the written data.
    pub has_unreadable_bytes: bool,
    /// Store id of the newest log file.
    pub store_id: Option<StoreId>,
    /// Format of the newest entry seen.
    pub kernel_version: Option<KernelVersion>,
}

impl LogTailState {
    /// State reported when no log file exists at all.
    #[must_use]
    pub fn missing_logs() -> Self {
        Self {
            last_checkpoint: None,
            logs_after_last_checkpoint: false,
            first_append_index_after_last_checkpoint: UNKNOWN_APPEND_INDEX,
            last_batch: AppendBatchInfo::EMPTY,
            files_not_found: true,
            has_unreadable_bytes: false,
            store_id: None,
            kernel_version: None,
        }
    }

    /// Recovery has to run before the store can be used.
    #[must_use]
    pub fn is_recovery_required(&self) -> bool {
        self.logs_after_last_checkpoint || self.files_not_found || self.has_unreadable_bytes
    }

    /// Transaction logs are missing.
    #[must_use]
    pub fn logs_missing(&self) -> bool {
        self.files_not_found
    }

    /// The latest checkpoint, if any.
    #[must_use]
    pub fn last_checkpoint(&self) -> Option<&CheckpointInfo> {
        self.last_checkpoint.as_ref()
    }
}
