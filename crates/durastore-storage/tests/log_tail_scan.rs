//! Integration tests: log tail scanning over real transaction and checkpoint
//! log files.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use durastore_storage::checkpoint::appender::MIN_ROTATION_SIZE;
use durastore_storage::log::{AppendedTransaction, LogFiles, LOG_HEADER_SIZE};
use durastore_storage::types::{UNKNOWN_APPEND_INDEX, UNKNOWN_CONSENSUS_INDEX};
use durastore_storage::{
    AppendBatchInfo, CheckpointAppender, CheckpointLog, CheckpointLogConfig, KernelVersion,
    LogError, LogPosition, LogTailScanMonitor, LogTailScanner, NoopScanMonitor, StoreId,
    TransactionLogFiles, TransactionLogWriter,
};
use parking_lot::Mutex;

fn store() -> StoreId {
    StoreId::new(1_700_000_000_000, 42, 1)
}

fn writer(dir: &Path, kernel_version: KernelVersion) -> TransactionLogWriter {
    TransactionLogWriter::open(dir, store(), kernel_version).unwrap()
}

fn checkpoint_log(dir: &Path) -> CheckpointLog {
    CheckpointLog::new(dir, store(), CheckpointLogConfig::default())
}

fn checkpoint(log: &CheckpointLog, tx: &AppendedTransaction, kernel_version: KernelVersion) {
    log.check_point(
        tx.transaction_id,
        tx.transaction_id.append_index,
        kernel_version,
        tx.position_after,
        tx.position_after,
        Utc::now(),
        "test checkpoint",
    )
    .unwrap();
}

fn scanner_with(dir: &Path, strict: bool, monitor: Arc<dyn LogTailScanMonitor>) -> LogTailScanner {
    LogTailScanner::new(
        Arc::new(TransactionLogFiles::new(dir)),
        Arc::new(checkpoint_log(dir)),
        Some(store()),
        strict,
        monitor,
    )
}

fn scanner(dir: &Path, strict: bool) -> LogTailScanner {
    scanner_with(dir, strict, Arc::new(NoopScanMonitor))
}

#[derive(Default)]
struct RecordingMonitor {
    scanned: Mutex<Vec<u64>>,
    unreadable: AtomicUsize,
}

impl LogTailScanMonitor for RecordingMonitor {
    fn scanning_log_file(&self, version: u64) {
        self.scanned.lock().push(version);
    }

    fn unreadable_bytes(&self, _position: LogPosition) {
        self.unreadable.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_no_log_files_requires_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let state = scanner(dir.path(), true).tail_metadata().unwrap();

    assert!(state.is_recovery_required());
    assert!(state.logs_missing());
    assert!(state.last_checkpoint().is_none());
    assert_eq!(state.last_batch, AppendBatchInfo::EMPTY);
}

#[test]
fn test_empty_logs_report_unknown_batch_at_highest_version() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = writer(dir.path(), KernelVersion::V3);
    w.rotate().unwrap();
    w.rotate().unwrap();

    let state = scanner(dir.path(), true).tail_metadata().unwrap();
    assert!(!state.is_recovery_required());
    assert_eq!(
        state.last_batch,
        AppendBatchInfo::new(UNKNOWN_APPEND_INDEX, LogPosition::new(2, LOG_HEADER_SIZE))
    );
}

#[test]
fn test_transactions_without_checkpoint_require_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = writer(dir.path(), KernelVersion::V3);
    w.append_transaction(2, 2, UNKNOWN_CONSENSUS_INDEX, &[b"x".as_slice()])
        .unwrap();
    let last = w
        .append_transaction(3, 3, UNKNOWN_CONSENSUS_INDEX, &[b"y".as_slice()])
        .unwrap();
    w.force().unwrap();

    let state = scanner(dir.path(), true).tail_metadata().unwrap();
    assert!(state.is_recovery_required());
    assert!(state.logs_after_last_checkpoint);
    assert!(state.last_checkpoint().is_none());
    assert_eq!(state.first_append_index_after_last_checkpoint, 2);
    assert_eq!(state.last_batch, AppendBatchInfo::new(3, last.position_after));
}

#[test]
fn test_latest_of_many_checkpoints_across_rotated_segments() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = writer(dir.path(), KernelVersion::V3);
    let cp_log = CheckpointLog::new(
        dir.path(),
        store(),
        CheckpointLogConfig {
            rotation_size: MIN_ROTATION_SIZE,
            keep_files: 100,
        },
    );

    let mut positions = Vec::new();
    for id in 2..40 {
        let tx = w
            .append_transaction(id, id, UNKNOWN_CONSENSUS_INDEX, &[])
            .unwrap();
        w.force().unwrap();
        checkpoint(&cp_log, &tx, KernelVersion::V3);
        positions.push(tx.position_after);
    }
    assert!(cp_log.versions().unwrap().len() > 1);

    let reachable: Vec<LogPosition> = cp_log
        .reachable_checkpoints()
        .unwrap()
        .iter()
        .map(|cp| cp.transaction_log_position)
        .collect();
    assert_eq!(reachable, positions);

    let state = scanner(dir.path(), true).tail_metadata().unwrap();
    let latest = state.last_checkpoint().unwrap();
    assert_eq!(latest.transaction_log_position, *positions.last().unwrap());
    assert_eq!(latest.transaction_id.id, 39);
    assert!(!state.is_recovery_required());
}

#[test]
fn test_start_without_commit_counts_as_logs_after_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = writer(dir.path(), KernelVersion::V3);
    let tx = w
        .append_transaction(2, 2, UNKNOWN_CONSENSUS_INDEX, &[])
        .unwrap();
    w.force().unwrap();
    checkpoint(&checkpoint_log(dir.path()), &tx, KernelVersion::V3);

    w.append(&durastore_storage::log::LogEntry::Start(
        durastore_storage::log::StartEntry {
            kernel_version: KernelVersion::V3,
            time_written: 0,
            append_index: 3,
            previous_checksum: tx.transaction_id.checksum,
            additional_header: Vec::new(),
        },
    ))
    .unwrap();
    w.force().unwrap();

    let state = scanner(dir.path(), true).tail_metadata().unwrap();
    assert!(state.is_recovery_required());
    assert!(state.logs_after_last_checkpoint);
    assert_eq!(state.first_append_index_after_last_checkpoint, 3);
    // The open batch is not complete, so the last batch is the checkpoint's.
    assert_eq!(state.last_batch, AppendBatchInfo::new(2, tx.position_after));
}

#[test]
fn test_checkpoint_in_previous_file_scans_following_files() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = writer(dir.path(), KernelVersion::V3);
    let tx = w
        .append_transaction(2, 2, UNKNOWN_CONSENSUS_INDEX, &[])
        .unwrap();
    w.force().unwrap();
    checkpoint(&checkpoint_log(dir.path()), &tx, KernelVersion::V3);

    w.rotate().unwrap();
    let after = w
        .append_transaction(3, 3, UNKNOWN_CONSENSUS_INDEX, &[])
        .unwrap();
    w.force().unwrap();

    let monitor = Arc::new(RecordingMonitor::default());
    let state = scanner_with(dir.path(), true, monitor.clone())
        .tail_metadata()
        .unwrap();

    assert!(state.logs_after_last_checkpoint);
    assert_eq!(state.first_append_index_after_last_checkpoint, 3);
    assert_eq!(state.last_batch, AppendBatchInfo::new(3, after.position_after));
    assert_eq!(*monitor.scanned.lock(), vec![0, 1]);
}

#[test]
fn test_torn_tail_is_reported_in_lenient_mode() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = writer(dir.path(), KernelVersion::V3);
    let tx = w
        .append_transaction(2, 2, UNKNOWN_CONSENSUS_INDEX, &[])
        .unwrap();
    w.force().unwrap();
    drop(w);

    let files = TransactionLogFiles::new(dir.path());
    OpenOptions::new()
        .append(true)
        .open(files.file_for(0))
        .unwrap()
        .write_all(&[60, 0, 0, 0, 9, 9, 9, 9, 1])
        .unwrap();

    let monitor = Arc::new(RecordingMonitor::default());
    let state = scanner_with(dir.path(), false, monitor.clone())
        .tail_metadata()
        .unwrap();
    assert!(state.has_unreadable_bytes);
    assert!(state.is_recovery_required());
    assert_eq!(state.last_batch, AppendBatchInfo::new(2, tx.position_after));
    assert_eq!(monitor.unreadable.load(Ordering::SeqCst), 1);
}

#[test]
fn test_torn_tail_fails_in_strict_mode_with_position() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = writer(dir.path(), KernelVersion::V3);
    let tx = w
        .append_transaction(2, 2, UNKNOWN_CONSENSUS_INDEX, &[])
        .unwrap();
    w.force().unwrap();
    drop(w);

    let files = TransactionLogFiles::new(dir.path());
    OpenOptions::new()
        .append(true)
        .open(files.file_for(0))
        .unwrap()
        .write_all(&[60, 0, 0, 0, 9, 9])
        .unwrap();

    match scanner(dir.path(), true).tail_metadata().unwrap_err() {
        LogError::CorruptedLog { position, .. } => assert_eq!(position, tx.position_after),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_incomplete_header_of_newest_file_is_unreadable_tail() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = writer(dir.path(), KernelVersion::V3);
    let tx = w
        .append_transaction(2, 2, UNKNOWN_CONSENSUS_INDEX, &[])
        .unwrap();
    w.force().unwrap();
    drop(w);

    // Rotation crashed after writing only part of the next header.
    let files = TransactionLogFiles::new(dir.path());
    std::fs::write(files.file_for(1), b"DSTX").unwrap();

    let monitor = Arc::new(RecordingMonitor::default());
    let state = scanner_with(dir.path(), false, monitor.clone())
        .tail_metadata()
        .unwrap();
    assert!(state.has_unreadable_bytes);
    assert!(state.is_recovery_required());
    assert!(!state.files_not_found);
    assert_eq!(state.last_batch, AppendBatchInfo::new(2, tx.position_after));
    assert_eq!(state.store_id, Some(store()));
    assert_eq!(monitor.unreadable.load(Ordering::SeqCst), 1);
    assert_eq!(*monitor.scanned.lock(), vec![0]);

    match scanner(dir.path(), true).tail_metadata().unwrap_err() {
        LogError::CorruptedLog { position, reason } => {
            assert_eq!(position, LogPosition::new(1, 0));
            assert!(reason.contains("4 bytes"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_only_file_with_incomplete_header() {
    let dir = tempfile::tempdir().unwrap();
    let files = TransactionLogFiles::new(dir.path());
    std::fs::write(files.file_for(0), b"DS").unwrap();

    let state = scanner(dir.path(), false).tail_metadata().unwrap();
    assert!(state.files_not_found);
    assert!(state.has_unreadable_bytes);
    assert_eq!(state.last_batch, AppendBatchInfo::EMPTY);
}

#[test]
fn test_checkpoint_pointing_to_missing_log_version() {
    let dir = tempfile::tempdir().unwrap();
    writer(dir.path(), KernelVersion::V3);
    let cp_log = checkpoint_log(dir.path());
    let missing = LogPosition::new(8, 120);
    cp_log
        .check_point(
            durastore_storage::TransactionId::new(5, 5, KernelVersion::V3, 0, 0, -1),
            5,
            KernelVersion::V3,
            missing,
            missing,
            Utc::now(),
            "bogus",
        )
        .unwrap();

    let err = scanner(dir.path(), true).tail_metadata().unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("LogPosition{logVersion=8,"), "{msg}");
    assert!(
        msg.contains("checkpoint does not point to a valid location in transaction logs."),
        "{msg}"
    );

    let state = scanner(dir.path(), false).tail_metadata().unwrap();
    assert!(state.last_checkpoint().is_none());
}

#[test]
fn test_store_id_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    writer(dir.path(), KernelVersion::V3);
    let scanner = LogTailScanner::new(
        Arc::new(TransactionLogFiles::new(dir.path())),
        Arc::new(checkpoint_log(dir.path())),
        Some(StoreId::new(1, 1, 1)),
        false,
        Arc::new(NoopScanMonitor),
    );
    assert!(matches!(
        scanner.tail_metadata().unwrap_err(),
        LogError::StoreIdMismatch { found, .. } if found == store()
    ));
}

#[test]
fn test_consensus_index_from_checkpoint_record_for_v2() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = writer(dir.path(), KernelVersion::V2);
    // Start entry says 11, the checkpoint record says UNKNOWN; the record wins.
    let tx = w.append_transaction(2, 2, 11, &[]).unwrap();
    w.force().unwrap();
    let cp_log = checkpoint_log(dir.path());
    cp_log
        .check_point(
            tx.transaction_id.with_consensus_index(UNKNOWN_CONSENSUS_INDEX),
            2,
            KernelVersion::V2,
            tx.position_after,
            tx.position_after,
            Utc::now(),
            "v2",
        )
        .unwrap();

    let state = scanner(dir.path(), true).tail_metadata().unwrap();
    assert_eq!(
        state.last_checkpoint().unwrap().transaction_id.consensus_index,
        UNKNOWN_CONSENSUS_INDEX
    );
}

#[test]
fn test_consensus_index_from_start_entry_in_previous_file_for_v1() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = writer(dir.path(), KernelVersion::V1);
    w.append_transaction(2, 2, 10, &[]).unwrap();
    let tx = w.append_transaction(3, 3, 33, &[]).unwrap();
    let pos = w.rotate().unwrap();

    let cp_log = checkpoint_log(dir.path());
    cp_log
        .check_point(
            tx.transaction_id.with_consensus_index(UNKNOWN_CONSENSUS_INDEX),
            3,
            KernelVersion::V1,
            pos,
            pos,
            Utc::now(),
            "v1",
        )
        .unwrap();

    let state = scanner(dir.path(), true).tail_metadata().unwrap();
    let cp = state.last_checkpoint().unwrap();
    assert_eq!(cp.kernel_version, KernelVersion::V1);
    assert_eq!(cp.transaction_id.consensus_index, 33);
    assert!(!state.is_recovery_required());
}
