//! Rotating, durable checkpoint log.
//!
//! Checkpoints live in their own set of files, `<dir>/checkpoint.<version>`,
//! separate from the transaction log. Every record is synced before
//! [`CheckpointAppender::check_point`] returns, so a checkpoint that was
//! acknowledged survives a crash. Torn trailing records are cut off the
//! next time the log is opened for writing.

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::record::{CheckpointRecord, CHECKPOINT_ENTRY};
use crate::error::LogError;
use crate::health::HealthCheck;
use crate::log::frame::{encode_frame, read_frame, Frame};
use crate::log::header::{LogHeader, CHECKPOINT_LOG_MAGIC, LOG_HEADER_SIZE};
use crate::log::SegmentFiles;
use crate::types::{
    CheckpointInfo, KernelVersion, LogPosition, StoreId, TransactionId, BASE_APPEND_INDEX,
};

/// File name prefix of checkpoint log files.
pub const CHECKPOINT_LOG_PREFIX: &str = "checkpoint";

/// Default size after which the checkpoint log rotates (1 MiB).
pub const DEFAULT_ROTATION_SIZE: u64 = 1024 * 1024;
/// Smallest accepted rotation size (1 KiB).
pub const MIN_ROTATION_SIZE: u64 = 1024;
/// Default number of checkpoint files kept.
pub const DEFAULT_KEEP_FILES: usize = 3;
/// Smallest accepted number of kept checkpoint files.
pub const MIN_KEEP_FILES: usize = 2;
/// Largest accepted number of kept checkpoint files.
pub const MAX_KEEP_FILES: usize = 100;

/// Writes checkpoint records.
pub trait CheckpointAppender: Send + Sync {
    /// Durably append one checkpoint.
    ///
    /// `transaction_id` may only be [`TransactionId::UNKNOWN`] when the
    /// store holds no transactions, i.e. `append_index` is at most
    /// [`BASE_APPEND_INDEX`].
    ///
    /// # Errors
    ///
    /// Returns [`LogError::UnknownTransactionId`] for an unknown transaction
    /// on a non-empty store, and [`LogError::Io`] if the database is not
    /// healthy or the record cannot be written and synced.
    #[allow(clippy::too_many_arguments)]
    fn check_point(
        &self,
        transaction_id: TransactionId,
        append_index: i64,
        kernel_version: KernelVersion,
        transaction_log_position: LogPosition,
        checkpointed_position: LogPosition,
        timestamp: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), LogError>;

    /// Stop accepting checkpoints. Later calls to `check_point` are no-ops.
    ///
    /// # Errors
    ///
    /// Returns an error if the open segment cannot be synced.
    fn shutdown(&self) -> Result<(), LogError>;
}

/// Size limits of the checkpoint log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointLogConfig {
    /// Rotate before a record would grow the current file past this size.
    pub rotation_size: u64,
    /// Number of checkpoint files kept after a rotation.
    pub keep_files: usize,
}

impl Default for CheckpointLogConfig {
    fn default() -> Self {
        Self {
            rotation_size: DEFAULT_ROTATION_SIZE,
            keep_files: DEFAULT_KEEP_FILES,
        }
    }
}

impl CheckpointLogConfig {
    /// Copy with both limits clamped to their accepted ranges.
    #[must_use]
    pub fn clamped(self) -> Self {
        Self {
            rotation_size: self.rotation_size.max(MIN_ROTATION_SIZE),
            keep_files: self.keep_files.clamp(MIN_KEEP_FILES, MAX_KEEP_FILES),
        }
    }
}

struct Segment {
    file: File,
    version: u64,
    offset: u64,
}

#[derive(Default)]
struct AppenderState {
    segment: Option<Segment>,
    shut_down: bool,
}

/// File-backed checkpoint log.
pub struct CheckpointLog {
    segments: SegmentFiles,
    store_id: StoreId,
    config: CheckpointLogConfig,
    health: Option<Arc<dyn HealthCheck>>,
    state: Mutex<AppenderState>,
}

impl CheckpointLog {
    /// Checkpoint log under `dir`. No file is touched until the first
    /// checkpoint is written.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, store_id: StoreId, config: CheckpointLogConfig) -> Self {
        Self {
            segments: SegmentFiles::new(dir, CHECKPOINT_LOG_PREFIX, CHECKPOINT_LOG_MAGIC),
            store_id,
            config: config.clamped(),
            health: None,
            state: Mutex::new(AppenderState::default()),
        }
    }

    /// Refuse writes once `health` reports a panic.
    #[must_use]
    pub fn with_health(mut self, health: Arc<dyn HealthCheck>) -> Self {
        self.health = Some(health);
        self
    }

    /// Effective size limits.
    #[must_use]
    pub fn config(&self) -> CheckpointLogConfig {
        self.config
    }

    /// Existing checkpoint file versions, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn versions(&self) -> Result<Vec<u64>, LogError> {
        self.segments.versions()
    }

    /// Every readable checkpoint, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or carries an invalid
    /// header.
    pub fn reachable_checkpoints(&self) -> Result<Vec<CheckpointInfo>, LogError> {
        let mut all = Vec::new();
        for version in self.segments.versions()? {
            all.extend(self.read_segment(version)?.0);
        }
        Ok(all)
    }

    /// The newest readable checkpoint.
    ///
    /// Files are searched newest first; a file holding no complete record is
    /// skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be read or carries an invalid
    /// header.
    pub fn find_latest_checkpoint(&self) -> Result<Option<CheckpointInfo>, LogError> {
        for version in self.segments.versions()?.into_iter().rev() {
            let (mut checkpoints, _) = self.read_segment(version)?;
            if let Some(latest) = checkpoints.pop() {
                return Ok(Some(latest));
            }
        }
        Ok(None)
    }

    /// Read all complete records of one file and the offset right after the
    /// last of them. A file too short to hold a header has no records and no
    /// usable end.
    fn read_segment(&self, version: u64) -> Result<(Vec<CheckpointInfo>, Option<u64>), LogError> {
        let path = self.segments.path(version);
        let mut file = File::open(&path)?;
        if file.metadata()?.len() < LOG_HEADER_SIZE {
            return Ok((Vec::new(), None));
        }
        self.segments.read_header(version)?;

        file.seek(SeekFrom::Start(LOG_HEADER_SIZE))?;
        let mut reader = BufReader::new(file);
        let mut offset = LOG_HEADER_SIZE;
        let mut checkpoints = Vec::new();
        loop {
            let (kind, body, len) = match read_frame(&mut reader)? {
                Frame::Record { kind, body, len } => (kind, body, len),
                Frame::End => break,
                Frame::Truncated(reason) | Frame::Malformed(reason) => {
                    warn!(version, offset, reason = %reason, "unreadable checkpoint record");
                    break;
                }
            };
            if kind != CHECKPOINT_ENTRY {
                warn!(version, offset, kind, "unexpected record kind in checkpoint log");
                break;
            }
            let record = match CheckpointRecord::decode(&body) {
                Ok(record) => record,
                Err(LogError::Io(e)) => {
                    warn!(version, offset, error = %e, "undecodable checkpoint record");
                    break;
                }
                Err(e) => return Err(e),
            };

            let entry_position = LogPosition::new(version, offset);
            offset += len;
            let after = LogPosition::new(version, offset);
            checkpoints.push(CheckpointInfo {
                transaction_id: record.transaction_id,
                append_index: record.append_index,
                transaction_log_position: record.transaction_log_position,
                checkpointed_position: record.checkpointed_position,
                checkpoint_entry_position: entry_position,
                channel_position_after_checkpoint: after,
                checkpoint_file_position_after_entry: after,
                reason: record.reason,
                kernel_version: record.kernel_version,
                timestamp: record.timestamp,
            });
        }
        Ok((checkpoints, Some(offset)))
    }

    /// Open the newest file for appending, cutting off any torn tail, or
    /// create version 0.
    fn open_segment(&self, append_index: i64) -> Result<Segment, LogError> {
        if let Some(version) = self.segments.versions()?.last().copied() {
            if let (_, Some(end)) = self.read_segment(version)? {
                let mut file = OpenOptions::new()
                    .write(true)
                    .open(self.segments.path(version))?;
                file.set_len(end)?;
                file.seek(SeekFrom::Start(end))?;
                debug!(version, offset = end, "opened checkpoint log for append");
                return Ok(Segment {
                    file,
                    version,
                    offset: end,
                });
            }
            // Header never made it to disk.
            self.segments.delete(version)?;
            return self.create_segment(version, append_index);
        }
        self.create_segment(0, append_index)
    }

    fn create_segment(&self, version: u64, append_index: i64) -> Result<Segment, LogError> {
        let header = LogHeader::new(version, KernelVersion::LATEST, append_index, self.store_id);
        let mut file = self.segments.create(&header)?;
        file.seek(SeekFrom::Start(LOG_HEADER_SIZE))?;
        Ok(Segment {
            file,
            version,
            offset: LOG_HEADER_SIZE,
        })
    }

    fn rotate(&self, current: &Segment, append_index: i64) -> Result<Segment, LogError> {
        current.file.sync_all()?;
        let next = self.create_segment(current.version + 1, append_index)?;
        debug!(
            from = current.version,
            to = next.version,
            "rotated checkpoint log"
        );
        self.prune()?;
        Ok(next)
    }

    fn prune(&self) -> Result<(), LogError> {
        let versions = self.segments.versions()?;
        if versions.len() <= self.config.keep_files {
            return Ok(());
        }
        let excess = versions.len() - self.config.keep_files;
        for version in &versions[..excess] {
            self.segments.delete(*version)?;
            debug!(version, "deleted checkpoint log file");
        }
        Ok(())
    }
}

impl CheckpointAppender for CheckpointLog {
    fn check_point(
        &self,
        transaction_id: TransactionId,
        append_index: i64,
        kernel_version: KernelVersion,
        transaction_log_position: LogPosition,
        checkpointed_position: LogPosition,
        timestamp: DateTime<Utc>,
        reason: &str,
    ) -> Result<(), LogError> {
        let mut state = self.state.lock();
        if state.shut_down {
            return Ok(());
        }
        if let Some(health) = &self.health {
            if !health.is_healthy() {
                return Err(LogError::Io(io::Error::other("database is not healthy")));
            }
        }
        if transaction_id.is_unknown() && append_index > BASE_APPEND_INDEX {
            return Err(LogError::UnknownTransactionId { append_index });
        }

        let record = CheckpointRecord {
            kernel_version,
            timestamp,
            transaction_log_position,
            checkpointed_position,
            transaction_id,
            append_index,
            reason: reason.to_owned(),
        };
        let frame = encode_frame(CHECKPOINT_ENTRY, &record.encode_body()?);

        let segment = match state.segment.take() {
            Some(segment) => segment,
            None => self.open_segment(append_index)?,
        };
        let mut segment = if segment.offset > LOG_HEADER_SIZE
            && segment.offset + frame.len() as u64 > self.config.rotation_size
        {
            self.rotate(&segment, append_index)?
        } else {
            segment
        };

        // On failure the segment is dropped and reopened, which trims any
        // partially written record.
        segment.file.write_all(&frame)?;
        segment.file.sync_all()?;
        segment.offset += frame.len() as u64;
        debug!(
            version = segment.version,
            offset = segment.offset,
            append_index,
            "checkpoint record appended"
        );
        state.segment = Some(segment);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), LogError> {
        let mut state = self.state.lock();
        state.shut_down = true;
        if let Some(segment) = state.segment.take() {
            segment.file.sync_all()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for CheckpointLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointLog")
            .field("dir", &self.segments.dir())
            .field("store_id", &self.store_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn store() -> StoreId {
        StoreId::new(100, 200, 1)
    }

    fn tx(id: i64) -> TransactionId {
        TransactionId::new(id, id, KernelVersion::V3, 0, 0, id * 10)
    }

    fn append(log: &CheckpointLog, id: i64, reason: &str) -> Result<(), LogError> {
        log.check_point(
            tx(id),
            id,
            KernelVersion::V3,
            LogPosition::new(0, 64 + id as u64),
            LogPosition::new(0, 64 + id as u64),
            Utc::now(),
            reason,
        )
    }

    struct Flag(AtomicBool);

    impl HealthCheck for Flag {
        fn is_healthy(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_latest_checkpoint_is_last_written() {
        let dir = tempfile::tempdir().unwrap();
        let log = CheckpointLog::new(dir.path(), store(), CheckpointLogConfig::default());
        assert!(log.find_latest_checkpoint().unwrap().is_none());

        append(&log, 2, "first").unwrap();
        append(&log, 3, "second").unwrap();

        let latest = log.find_latest_checkpoint().unwrap().unwrap();
        assert_eq!(latest.reason, "second");
        assert_eq!(latest.transaction_id, tx(3));
        assert_eq!(latest.append_index(), 3);
        assert_eq!(log.reachable_checkpoints().unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_transaction_only_on_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let log = CheckpointLog::new(dir.path(), store(), CheckpointLogConfig::default());
        let pos = LogPosition::new(0, LOG_HEADER_SIZE);

        log.check_point(
            TransactionId::UNKNOWN,
            BASE_APPEND_INDEX,
            KernelVersion::V3,
            pos,
            pos,
            Utc::now(),
            "empty store",
        )
        .unwrap();

        let err = log
            .check_point(
                TransactionId::UNKNOWN,
                5,
                KernelVersion::V3,
                pos,
                pos,
                Utc::now(),
                "bad",
            )
            .unwrap_err();
        assert!(matches!(err, LogError::UnknownTransactionId { append_index: 5 }));
        assert_eq!(log.reachable_checkpoints().unwrap().len(), 1);
    }

    #[test]
    fn test_writes_after_shutdown_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let log = CheckpointLog::new(dir.path(), store(), CheckpointLogConfig::default());
        append(&log, 2, "before").unwrap();
        log.shutdown().unwrap();
        append(&log, 3, "after").unwrap();

        let all = log.reachable_checkpoints().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].reason, "before");
    }

    #[test]
    fn test_unhealthy_database_rejects_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let health = Arc::new(Flag(AtomicBool::new(true)));
        let log = CheckpointLog::new(dir.path(), store(), CheckpointLogConfig::default())
            .with_health(health.clone());
        append(&log, 2, "ok").unwrap();

        health.0.store(false, Ordering::SeqCst);
        match append(&log, 3, "panicked").unwrap_err() {
            LogError::Io(e) => assert_eq!(e.kind(), io::ErrorKind::Other),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_rotation_keeps_configured_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = CheckpointLogConfig {
            rotation_size: MIN_ROTATION_SIZE,
            keep_files: 2,
        };
        let log = CheckpointLog::new(dir.path(), store(), config);
        let reason = "x".repeat(300);
        for id in 2..20 {
            append(&log, id, &reason).unwrap();
        }

        let versions = log.versions().unwrap();
        assert_eq!(versions.len(), 2);
        assert!(versions[0] > 0);
        let all = log.reachable_checkpoints().unwrap();
        let ids: Vec<i64> = all.iter().map(|c| c.transaction_id.id).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
        assert_eq!(*ids.last().unwrap(), 19);
        assert_eq!(
            log.find_latest_checkpoint().unwrap().unwrap().transaction_id.id,
            19
        );
    }

    #[test]
    fn test_torn_record_trimmed_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let log = CheckpointLog::new(dir.path(), store(), CheckpointLogConfig::default());
            append(&log, 2, "complete").unwrap();
        }
        let path = dir.path().join("checkpoint.0");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[40, 0, 0, 0, 1, 2, 3]).unwrap();
        drop(file);

        let log = CheckpointLog::new(dir.path(), store(), CheckpointLogConfig::default());
        assert_eq!(
            log.find_latest_checkpoint().unwrap().unwrap().reason,
            "complete"
        );
        append(&log, 3, "next").unwrap();
        let reasons: Vec<String> = log
            .reachable_checkpoints()
            .unwrap()
            .into_iter()
            .map(|c| c.reason)
            .collect();
        assert_eq!(reasons, vec!["complete".to_string(), "next".to_string()]);
    }

    #[test]
    fn test_config_clamped() {
        let config = CheckpointLogConfig {
            rotation_size: 10,
            keep_files: 1000,
        }
        .clamped();
        assert_eq!(config.rotation_size, MIN_ROTATION_SIZE);
        assert_eq!(config.keep_files, MAX_KEEP_FILES);
    }
}
