//! Sequential cursor over the entries of one transaction log file.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::Path;

use super::entry::LogEntry;
use super::frame::{read_frame, Frame};
use crate::error::LogError;
use crate::types::LogPosition;

/// Result of advancing a [`LogEntryReader`].
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete entry.
    Entry {
        /// Where the entry starts.
        position: LogPosition,
        /// The decoded entry.
        entry: LogEntry,
        /// Position right after the entry.
        position_after: LogPosition,
    },
    /// No more written data in this file.
    End {
        /// Position where written data ends.
        position: LogPosition,
    },
    /// Bytes at `position` cannot be read as an entry.
    Unreadable {
        /// Position of the first unreadable byte.
        position: LogPosition,
        /// What was wrong.
        reason: String,
    },
}

/// Reads entries from one log file, starting at a given position.
///
/// Once [`ReadOutcome::End`] or [`ReadOutcome::Unreadable`] has been
/// returned the cursor keeps returning it.
#[derive(Debug)]
pub struct LogEntryReader {
    reader: BufReader<File>,
    version: u64,
    offset: u64,
    finished: Option<ReadOutcomeKind>,
}

#[derive(Debug, Clone)]
enum ReadOutcomeKind {
    End,
    Unreadable(String),
}

impl LogEntryReader {
    /// Open `path` and position the cursor at `position.byte_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or seeked.
    pub fn open(path: &Path, position: LogPosition) -> Result<Self, LogError> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(position.byte_offset))?;
        Ok(Self {
            reader: BufReader::new(file),
            version: position.log_version,
            offset: position.byte_offset,
            finished: None,
        })
    }

    /// Position of the next entry.
    #[must_use]
    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.version, self.offset)
    }

    /// Advance to the next entry.
    ///
    /// # Errors
    ///
    /// Returns an error for I/O failures and for entries written in a kernel
    /// version this build does not understand. Torn or corrupt entries are
    /// reported as [`ReadOutcome::Unreadable`], not as errors.
    pub fn next_entry(&mut self) -> Result<ReadOutcome, LogError> {
        if let Some(done) = &self.finished {
            return Ok(self.outcome_for(done.clone()));
        }

        let position = self.position();
        let (kind, body, len) = match read_frame(&mut self.reader)? {
            Frame::Record { kind, body, len } => (kind, body, len),
            Frame::End => return Ok(self.finish(ReadOutcomeKind::End)),
            Frame::Truncated(reason) | Frame::Malformed(reason) => {
                return Ok(self.finish(ReadOutcomeKind::Unreadable(reason)))
            }
        };

        let entry = match LogEntry::decode(kind, body) {
            Ok(entry) => entry,
            Err(LogError::Io(e)) => {
                return Ok(self.finish(ReadOutcomeKind::Unreadable(e.to_string())));
            }
            Err(e) => return Err(e),
        };

        self.offset += len;
        Ok(ReadOutcome::Entry {
            position,
            entry,
            position_after: self.position(),
        })
    }

    fn finish(&mut self, kind: ReadOutcomeKind) -> ReadOutcome {
        self.finished = Some(kind.clone());
        self.outcome_for(kind)
    }

    fn outcome_for(&self, kind: ReadOutcomeKind) -> ReadOutcome {
        let position = self.position();
        match kind {
            ReadOutcomeKind::End => ReadOutcome::End { position },
            ReadOutcomeKind::Unreadable(reason) => ReadOutcome::Unreadable { position, reason },
        }
    }
}
