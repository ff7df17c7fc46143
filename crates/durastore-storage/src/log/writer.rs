//! Appends entries to the transaction log and rotates its files.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;

use chrono::Utc;
use tracing::debug;

use super::entry::{encode_consensus_index, CommitEntry, LogEntry, StartEntry};
use super::frame::encode_frame;
use super::header::{LogHeader, LOG_HEADER_SIZE};
use super::reader::ReadOutcome;
use super::{LogFiles, TransactionLogFiles};
use crate::error::LogError;
use crate::types::{
    KernelVersion, LogPosition, StoreId, TransactionId, BASE_APPEND_INDEX, BASE_TX_CHECKSUM,
    UNKNOWN_CONSENSUS_INDEX,
};

/// A transaction written by [`TransactionLogWriter::append_transaction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendedTransaction {
    /// Identity of the written transaction.
    pub transaction_id: TransactionId,
    /// Position of its start entry.
    pub start_position: LogPosition,
    /// Position right after its commit entry.
    pub position_after: LogPosition,
}

/// Single writer of the transaction log.
pub struct TransactionLogWriter {
    files: TransactionLogFiles,
    store_id: StoreId,
    kernel_version: KernelVersion,
    out: BufWriter<File>,
    version: u64,
    offset: u64,
    last_append_index: i64,
    last_checksum: i32,
}

impl TransactionLogWriter {
    /// Open the log under `dir` for appending.
    ///
    /// Creates version 0 if the directory holds no log file, otherwise
    /// continues after the last readable entry of the newest file.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be created, opened or read.
    pub fn open(
        dir: impl Into<PathBuf>,
        store_id: StoreId,
        kernel_version: KernelVersion,
    ) -> Result<Self, LogError> {
        let files = TransactionLogFiles::new(dir);
        let Some(version) = files.highest_version()? else {
            let header = LogHeader::new(0, kernel_version, BASE_APPEND_INDEX, store_id);
            let file = files.segments().create(&header)?;
            return Ok(Self {
                files,
                store_id,
                kernel_version,
                out: BufWriter::new(file),
                version: 0,
                offset: LOG_HEADER_SIZE,
                last_append_index: BASE_APPEND_INDEX,
                last_checksum: BASE_TX_CHECKSUM,
            });
        };

        let header = files.read_header(version)?;
        let mut last_append_index = header.previous_last_append_index;
        let mut last_checksum = BASE_TX_CHECKSUM;
        let mut reader = files.open_reader(LogPosition::new(version, LOG_HEADER_SIZE))?;
        let end = loop {
            match reader.next_entry()? {
                ReadOutcome::Entry { entry, .. } => match entry {
                    LogEntry::Start(start) => last_append_index = start.append_index,
                    LogEntry::Commit(commit) => last_checksum = commit.checksum,
                    LogEntry::Command(_) | LogEntry::ChunkEnd(_) => {}
                },
                ReadOutcome::End { position } | ReadOutcome::Unreadable { position, .. } => {
                    break position.byte_offset;
                }
            }
        };

        let mut file = OpenOptions::new()
            .write(true)
            .open(files.file_for(version))?;
        file.seek(SeekFrom::Start(end))?;
        debug!(version, offset = end, "opened transaction log for append");

        Ok(Self {
            files,
            store_id,
            kernel_version,
            out: BufWriter::new(file),
            version,
            offset: end,
            last_append_index,
            last_checksum,
        })
    }

    /// Files written by this writer.
    #[must_use]
    pub fn files(&self) -> &TransactionLogFiles {
        &self.files
    }

    /// Format used for new start entries.
    pub fn set_kernel_version(&mut self, kernel_version: KernelVersion) {
        self.kernel_version = kernel_version;
    }

    /// Position the next entry will be written at.
    #[must_use]
    pub fn current_position(&self) -> LogPosition {
        LogPosition::new(self.version, self.offset)
    }

    /// Append index of the last start entry written.
    #[must_use]
    pub fn last_append_index(&self) -> i64 {
        self.last_append_index
    }

    /// Append one entry, returning its position and the position after it.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be encoded or written.
    pub fn append(&mut self, entry: &LogEntry) -> Result<(LogPosition, LogPosition), LogError> {
        let frame = encode_frame(entry.kind(), &entry.encode_body()?);
        let position = self.current_position();
        self.out.write_all(&frame)?;
        self.offset += frame.len() as u64;
        match entry {
            LogEntry::Start(start) => self.last_append_index = start.append_index,
            LogEntry::Commit(commit) => self.last_checksum = commit.checksum,
            LogEntry::Command(_) | LogEntry::ChunkEnd(_) => {}
        }
        Ok((position, self.current_position()))
    }

    /// Write a complete transaction: start, commands and commit.
    ///
    /// The consensus index is stored in the start entry header; pass
    /// [`UNKNOWN_CONSENSUS_INDEX`] to leave the header empty.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry cannot be written.
    #[allow(clippy::cast_possible_wrap)]
    pub fn append_transaction(
        &mut self,
        tx_id: i64,
        append_index: i64,
        consensus_index: i64,
        commands: &[&[u8]],
    ) -> Result<AppendedTransaction, LogError> {
        let now = Utc::now().timestamp_millis();
        let additional_header = if consensus_index == UNKNOWN_CONSENSUS_INDEX {
            Vec::new()
        } else {
            encode_consensus_index(consensus_index)
        };

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.last_checksum.to_le_bytes());
        hasher.update(&tx_id.to_le_bytes());
        for command in commands {
            hasher.update(command);
        }
        let checksum = hasher.finalize() as i32;

        let (start_position, _) = self.append(&LogEntry::Start(StartEntry {
            kernel_version: self.kernel_version,
            time_written: now,
            append_index,
            previous_checksum: self.last_checksum,
            additional_header,
        }))?;
        for command in commands {
            self.append(&LogEntry::Command(command.to_vec()))?;
        }
        let (_, position_after) = self.append(&LogEntry::Commit(CommitEntry {
            tx_id,
            time_committed: now,
            checksum,
        }))?;
        self.out.flush()?;

        Ok(AppendedTransaction {
            transaction_id: TransactionId::new(
                tx_id,
                append_index,
                self.kernel_version,
                checksum,
                now,
                consensus_index,
            ),
            start_position,
            position_after,
        })
    }

    /// Close the current file and continue in a new one.
    ///
    /// # Errors
    ///
    /// Returns an error if the current file cannot be synced or the next one
    /// cannot be created.
    pub fn rotate(&mut self) -> Result<LogPosition, LogError> {
        self.force()?;
        let next = self.version + 1;
        let header = LogHeader::new(next, self.kernel_version, self.last_append_index, self.store_id);
        let file = self.files.segments().create(&header)?;
        debug!(from = self.version, to = next, "rotated transaction log");
        self.out = BufWriter::new(file);
        self.version = next;
        self.offset = LOG_HEADER_SIZE;
        Ok(self.current_position())
    }

    /// Flush buffered entries and sync them to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or the sync fails.
    pub fn force(&mut self) -> Result<(), LogError> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        Ok(())
    }
}

impl std::fmt::Debug for TransactionLogWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLogWriter")
            .field("dir", &self.files.dir())
            .field("version", &self.version)
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> StoreId {
        StoreId::new(10, 20, 1)
    }

    #[test]
    fn test_new_log_starts_after_header() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TransactionLogWriter::open(dir.path(), store(), KernelVersion::V3).unwrap();
        assert_eq!(writer.current_position(), LogPosition::new(0, LOG_HEADER_SIZE));
        assert_eq!(writer.files().read_header(0).unwrap().store_id, store());
    }

    #[test]
    fn test_rotation_records_previous_append_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = TransactionLogWriter::open(dir.path(), store(), KernelVersion::V3).unwrap();
        writer.append_transaction(2, 2, UNKNOWN_CONSENSUS_INDEX, &[]).unwrap();
        writer.append_transaction(3, 3, UNKNOWN_CONSENSUS_INDEX, &[]).unwrap();
        let pos = writer.rotate().unwrap();

        assert_eq!(pos, LogPosition::new(1, LOG_HEADER_SIZE));
        let header = writer.files().read_header(1).unwrap();
        assert_eq!(header.previous_last_append_index, 3);
        assert_eq!(writer.files().versions().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_reopen_continues_at_end() {
        let dir = tempfile::tempdir().unwrap();
        let end = {
            let mut writer =
                TransactionLogWriter::open(dir.path(), store(), KernelVersion::V3).unwrap();
            let tx = writer
                .append_transaction(2, 2, UNKNOWN_CONSENSUS_INDEX, &[b"cmd".as_slice()])
                .unwrap();
            writer.force().unwrap();
            tx.position_after
        };

        let mut writer = TransactionLogWriter::open(dir.path(), store(), KernelVersion::V3).unwrap();
        assert_eq!(writer.current_position(), end);
        assert_eq!(writer.last_append_index(), 2);
        let tx = writer
            .append_transaction(3, 3, UNKNOWN_CONSENSUS_INDEX, &[])
            .unwrap();
        assert_eq!(tx.start_position, end);
    }
}
