//! Startup scan of the transaction log tail.
//!
//! [`LogTailScanner::tail_metadata`] locates the latest checkpoint and reads
//! forward from it to tell recovery whether anything was committed after
//! the checkpoint, where the last complete batch ends, and whether the log
//! ends in bytes that cannot be read.
//!
//! ## Scan order
//!
//! 1. List transaction log files; none at all means the logs are missing.
//! 2. Check every file header against the expected store id.
//! 3. Find the latest checkpoint and make sure it points into the logs.
//! 4. Read entries from the checkpoint position (or the start of the oldest
//!    file) through the newest file.
//! 5. Resolve the consensus index of the checkpointed transaction from the
//!    place its format stores it.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::appender::CheckpointLog;
use crate::error::LogError;
use crate::log::{LogEntry, LogFiles, ReadOutcome, LOG_HEADER_SIZE};
use crate::types::{
    AppendBatchInfo, CheckpointInfo, ConsensusIndexSource, KernelVersion, LogPosition,
    LogTailState, StoreId, UNKNOWN_APPEND_INDEX, UNKNOWN_CONSENSUS_INDEX,
};

/// Progress notifications of a tail scan.
pub trait LogTailScanMonitor: Send + Sync {
    /// A transaction log file is about to be scanned.
    fn scanning_log_file(&self, _version: u64) {}

    /// The scan stopped at bytes that cannot be read.
    fn unreadable_bytes(&self, _position: LogPosition) {}
}

/// Monitor that ignores every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopScanMonitor;

impl LogTailScanMonitor for NoopScanMonitor {}

/// Reconstructs [`LogTailState`] from the transaction and checkpoint logs.
pub struct LogTailScanner {
    log_files: Arc<dyn LogFiles>,
    checkpoint_log: Arc<CheckpointLog>,
    expected_store_id: Option<StoreId>,
    fail_on_corruption: bool,
    monitor: Arc<dyn LogTailScanMonitor>,
}

/// Facts gathered by the forward scan.
struct ForwardScan {
    logs_after_checkpoint: bool,
    first_append_index: i64,
    last_batch: Option<AppendBatchInfo>,
    unreadable: bool,
    kernel_version: Option<KernelVersion>,
}

impl LogTailScanner {
    /// Create a scanner.
    ///
    /// With `fail_on_corruption` set, unreadable log bytes and checkpoints
    /// pointing outside the logs are errors. Otherwise they are logged and
    /// reported through the returned state.
    #[must_use]
    pub fn new(
        log_files: Arc<dyn LogFiles>,
        checkpoint_log: Arc<CheckpointLog>,
        expected_store_id: Option<StoreId>,
        fail_on_corruption: bool,
        monitor: Arc<dyn LogTailScanMonitor>,
    ) -> Self {
        Self {
            log_files,
            checkpoint_log,
            expected_store_id,
            fail_on_corruption,
            monitor,
        }
    }

    /// Scan the log tail.
    ///
    /// # Errors
    ///
    /// Returns [`LogError::StoreIdMismatch`] if a log file belongs to another
    /// store, [`LogError::CheckpointOutsideLogs`] and
    /// [`LogError::CorruptedLog`] in strict mode, and any I/O error hit while
    /// reading.
    pub fn tail_metadata(&self) -> Result<LogTailState, LogError> {
        let mut versions = self.log_files.versions()?;
        let torn_header = self.drop_torn_newest_file(&mut versions)?;
        let (Some(&lowest), Some(&highest)) = (versions.first(), versions.last()) else {
            info!("no transaction log files found");
            return Ok(LogTailState {
                has_unreadable_bytes: torn_header,
                ..LogTailState::missing_logs()
            });
        };

        let mut store_id = None;
        let mut header_kernel_version = None;
        for &version in &versions {
            let header = self.log_files.read_header(version)?;
            if let Some(expected) = self.expected_store_id {
                if header.store_id != expected {
                    return Err(LogError::StoreIdMismatch {
                        expected,
                        found: header.store_id,
                    });
                }
            }
            store_id = Some(header.store_id);
            header_kernel_version = Some(header.kernel_version);
        }

        let checkpoint = self.latest_valid_checkpoint(&versions)?;
        let start = checkpoint.as_ref().map_or(
            LogPosition::new(lowest, LOG_HEADER_SIZE),
            |cp| cp.transaction_log_position,
        );

        let scan = self.scan_forward(&versions, start)?;

        let last_batch = match (scan.last_batch, &checkpoint) {
            (Some(batch), _) => batch,
            (None, Some(cp)) => AppendBatchInfo::new(cp.append_index, cp.transaction_log_position),
            (None, None) => AppendBatchInfo::new(
                UNKNOWN_APPEND_INDEX,
                LogPosition::new(highest, LOG_HEADER_SIZE),
            ),
        };

        let kernel_version = scan
            .kernel_version
            .or_else(|| checkpoint.as_ref().map(|cp| cp.kernel_version))
            .or(header_kernel_version);

        let last_checkpoint = match checkpoint {
            Some(cp) => Some(self.resolve_consensus_index(&versions, cp)?),
            None => None,
        };

        let state = LogTailState {
            last_checkpoint,
            logs_after_last_checkpoint: scan.logs_after_checkpoint,
            first_append_index_after_last_checkpoint: scan.first_append_index,
            last_batch,
            files_not_found: false,
            has_unreadable_bytes: scan.unreadable || torn_header,
            store_id,
            kernel_version,
        };
        debug!(
            logs_after_checkpoint = state.logs_after_last_checkpoint,
            last_append_index = state.last_batch.append_index,
            recovery_required = state.is_recovery_required(),
            "log tail scanned"
        );
        Ok(state)
    }

    /// A crash during rotation can leave the newest file shorter than its
    /// header. Such a file holds no entries; in lenient mode it is left out
    /// of the scan and reported as unreadable bytes. Returns whether a file
    /// was dropped.
    fn drop_torn_newest_file(&self, versions: &mut Vec<u64>) -> Result<bool, LogError> {
        let Some(&highest) = versions.last() else {
            return Ok(false);
        };
        let size = self.log_files.file_size(highest)?;
        if size >= LOG_HEADER_SIZE {
            return Ok(false);
        }

        let position = LogPosition::new(highest, 0);
        let reason = format!("header is {size} bytes, expected {LOG_HEADER_SIZE}");
        self.monitor.unreadable_bytes(position);
        if self.fail_on_corruption {
            return Err(LogError::CorruptedLog { position, reason });
        }
        warn!(%position, reason = %reason, "incomplete header in newest transaction log file");
        versions.pop();
        Ok(true)
    }

    /// Latest checkpoint, provided it points at an existing byte of the
    /// transaction log.
    fn latest_valid_checkpoint(&self, versions: &[u64]) -> Result<Option<CheckpointInfo>, LogError> {
        let Some(cp) = self.checkpoint_log.find_latest_checkpoint()? else {
            return Ok(None);
        };

        let position = cp.transaction_log_position;
        let inside = versions.contains(&position.log_version)
            && position.byte_offset >= LOG_HEADER_SIZE
            && position.byte_offset <= self.log_files.file_size(position.log_version)?;
        if inside {
            return Ok(Some(cp));
        }

        if self.fail_on_corruption {
            return Err(LogError::CheckpointOutsideLogs { position });
        }
        warn!(
            %position,
            "last checkpoint does not point to a valid location in transaction logs, ignoring it"
        );
        Ok(None)
    }

    fn scan_forward(&self, versions: &[u64], start: LogPosition) -> Result<ForwardScan, LogError> {
        let mut scan = ForwardScan {
            logs_after_checkpoint: false,
            first_append_index: UNKNOWN_APPEND_INDEX,
            last_batch: None,
            unreadable: false,
            kernel_version: None,
        };
        let mut open_batch: Option<i64> = None;

        for &version in versions.iter().filter(|&&v| v >= start.log_version) {
            info!(version, "Scanning log file with version {version} for checkpoint entries");
            self.monitor.scanning_log_file(version);

            let from = if version == start.log_version {
                start
            } else {
                LogPosition::new(version, LOG_HEADER_SIZE)
            };
            let mut reader = self.log_files.open_reader(from)?;
            loop {
                match reader.next_entry()? {
                    ReadOutcome::Entry {
                        entry,
                        position_after,
                        ..
                    } => match entry {
                        LogEntry::Start(start_entry) => {
                            scan.logs_after_checkpoint = true;
                            if scan.first_append_index == UNKNOWN_APPEND_INDEX {
                                scan.first_append_index = start_entry.append_index;
                            }
                            scan.kernel_version = Some(start_entry.kernel_version);
                            open_batch = Some(start_entry.append_index);
                        }
                        LogEntry::Commit(_) | LogEntry::ChunkEnd(_) => {
                            scan.logs_after_checkpoint = true;
                            if let Some(append_index) = open_batch.take() {
                                scan.last_batch =
                                    Some(AppendBatchInfo::new(append_index, position_after));
                            }
                        }
                        LogEntry::Command(_) => {}
                    },
                    ReadOutcome::End { .. } => break,
                    ReadOutcome::Unreadable { position, reason } => {
                        self.monitor.unreadable_bytes(position);
                        if self.fail_on_corruption {
                            return Err(LogError::CorruptedLog { position, reason });
                        }
                        warn!(%position, reason = %reason, "unreadable bytes at end of transaction log");
                        scan.unreadable = true;
                        return Ok(scan);
                    }
                }
            }
        }
        Ok(scan)
    }

    /// Fill in the consensus index of the checkpointed transaction for
    /// formats that keep it in the transaction's start entry.
    fn resolve_consensus_index(
        &self,
        versions: &[u64],
        mut cp: CheckpointInfo,
    ) -> Result<CheckpointInfo, LogError> {
        match cp.kernel_version.consensus_index_source() {
            ConsensusIndexSource::CheckpointRecord => Ok(cp),
            ConsensusIndexSource::TransactionStartEntry => {
                if cp.transaction_id.is_unknown() {
                    return Ok(cp);
                }
                let consensus_index = self.find_start_entry_consensus_index(
                    versions,
                    cp.transaction_id.id,
                    cp.transaction_log_position,
                )?;
                cp.transaction_id = cp.transaction_id.with_consensus_index(consensus_index);
                Ok(cp)
            }
        }
    }

    /// Find the start entry preceding the commit of `tx_id`, which may live
    /// in an earlier file than the checkpoint position.
    fn find_start_entry_consensus_index(
        &self,
        versions: &[u64],
        tx_id: i64,
        limit: LogPosition,
    ) -> Result<i64, LogError> {
        let mut last_start = None;
        for &version in versions.iter().filter(|&&v| v <= limit.log_version) {
            let mut reader = self
                .log_files
                .open_reader(LogPosition::new(version, LOG_HEADER_SIZE))?;
            loop {
                match reader.next_entry()? {
                    ReadOutcome::Entry {
                        position, entry, ..
                    } => {
                        if position >= limit {
                            break;
                        }
                        match entry {
                            LogEntry::Start(start) => last_start = Some(start),
                            LogEntry::Commit(commit) if commit.tx_id == tx_id => {
                                return Ok(last_start
                                    .map_or(UNKNOWN_CONSENSUS_INDEX, |s| s.consensus_index()));
                            }
                            _ => {}
                        }
                    }
                    ReadOutcome::End { .. } | ReadOutcome::Unreadable { .. } => break,
                }
            }
        }
        debug!(tx_id, "start entry of checkpointed transaction not found");
        Ok(UNKNOWN_CONSENSUS_INDEX)
    }
}

impl std::fmt::Debug for LogTailScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogTailScanner")
            .field("checkpoint_log", &self.checkpoint_log)
            .field("expected_store_id", &self.expected_store_id)
            .field("fail_on_corruption", &self.fail_on_corruption)
            .finish_non_exhaustive()
    }
}
