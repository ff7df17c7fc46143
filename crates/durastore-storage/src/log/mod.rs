//! Rotating transaction log files.
//!
//! Each file is `<dir>/txlog.<version>`: a [`LogHeader`] followed by framed
//! [`LogEntry`] values. Versions start at 0 and grow by one per rotation.
//! The same segment naming and header scheme backs the checkpoint log.

pub mod entry;
pub mod frame;
pub mod header;
pub mod reader;
pub mod writer;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

pub use entry::{ChunkEndEntry, CommitEntry, LogEntry, StartEntry};
pub use header::{LogHeader, LOG_HEADER_SIZE};
pub use reader::{LogEntryReader, ReadOutcome};
pub use writer::{AppendedTransaction, TransactionLogWriter};

use crate::error::LogError;
use crate::types::LogPosition;

/// File name prefix of transaction log files.
pub const TX_LOG_PREFIX: &str = "txlog";

/// Read access to the rotated transaction log.
pub trait LogFiles: Send + Sync {
    /// All existing versions, ascending.
    ///
    /// # Errors
    ///
    /// Returns an error if the log directory cannot be listed.
    fn versions(&self) -> Result<Vec<u64>, LogError>;

    /// Newest existing version.
    ///
    /// # Errors
    ///
    /// Returns an error if the log directory cannot be listed.
    fn highest_version(&self) -> Result<Option<u64>, LogError> {
        Ok(self.versions()?.last().copied())
    }

    /// Oldest existing version.
    ///
    /// # Errors
    ///
    /// Returns an error if the log directory cannot be listed.
    fn lowest_version(&self) -> Result<Option<u64>, LogError> {
        Ok(self.versions()?.first().copied())
    }

    /// Path of the file holding `version`, whether or not it exists.
    fn file_for(&self, version: u64) -> PathBuf;

    /// Whether the file holding `version` exists.
    fn version_exists(&self, version: u64) -> bool {
        self.file_for(version).is_file()
    }

    /// Size in bytes of the file holding `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be inspected.
    fn file_size(&self, version: u64) -> Result<u64, LogError> {
        Ok(fs::metadata(self.file_for(version))?.len())
    }

    /// Delete the file holding `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    fn delete_version(&self, version: u64) -> Result<(), LogError>;

    /// Read and validate the header of `version`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or its header is invalid.
    fn read_header(&self, version: u64) -> Result<LogHeader, LogError>;

    /// Open an entry cursor at `position`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or seeked.
    fn open_reader(&self, position: LogPosition) -> Result<LogEntryReader, LogError> {
        LogEntryReader::open(&self.file_for(position.log_version), position)
    }
}

/// A directory of versioned files sharing a name prefix and header magic.
#[derive(Debug, Clone)]
pub(crate) struct SegmentFiles {
    dir: PathBuf,
    prefix: &'static str,
    magic: [u8; 8],
}

impl SegmentFiles {
    pub(crate) fn new(dir: impl Into<PathBuf>, prefix: &'static str, magic: [u8; 8]) -> Self {
        Self {
            dir: dir.into(),
            prefix,
            magic,
        }
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn path(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{}.{version}", self.prefix))
    }

    pub(crate) fn versions(&self) -> Result<Vec<u64>, LogError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(version) = name
                .strip_prefix(self.prefix)
                .and_then(|rest| rest.strip_prefix('.'))
                .and_then(|v| v.parse::<u64>().ok())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    pub(crate) fn read_header(&self, version: u64) -> Result<LogHeader, LogError> {
        let path = self.path(version);
        let mut file = File::open(&path)?;
        let mut buf = Vec::with_capacity(LOG_HEADER_SIZE as usize);
        (&mut file).take(LOG_HEADER_SIZE).read_to_end(&mut buf)?;
        LogHeader::decode(&buf, &self.magic, &path)
    }

    /// Create a new file with `header` and make it durable.
    pub(crate) fn create(&self, header: &LogHeader) -> Result<File, LogError> {
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.path(header.log_version))?;
        file.write_all(&header.encode(&self.magic))?;
        file.sync_all()?;
        Ok(file)
    }

    pub(crate) fn delete(&self, version: u64) -> Result<(), LogError> {
        match fs::remove_file(self.path(version)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Directory-backed transaction log.
#[derive(Debug, Clone)]
pub struct TransactionLogFiles {
    segments: SegmentFiles,
}

impl TransactionLogFiles {
    /// Transaction log files under `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            segments: SegmentFiles::new(dir, TX_LOG_PREFIX, header::TX_LOG_MAGIC),
        }
    }

    /// Directory holding the files.
    #[must_use]
    pub fn dir(&self) -> &Path {
        self.segments.dir()
    }

    pub(crate) fn segments(&self) -> &SegmentFiles {
        &self.segments
    }
}

impl LogFiles for TransactionLogFiles {
    fn versions(&self) -> Result<Vec<u64>, LogError> {
        self.segments.versions()
    }

    fn file_for(&self, version: u64) -> PathBuf {
        self.segments.path(version)
    }

    fn delete_version(&self, version: u64) -> Result<(), LogError> {
        self.segments.delete(version)
    }

    fn read_header(&self, version: u64) -> Result<LogHeader, LogError> {
        self.segments.read_header(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{KernelVersion, StoreId};

    #[test]
    fn test_versions_sorted_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["txlog.10", "txlog.2", "txlog.0", "txlog.x", "checkpoint.1", "txlog"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let files = TransactionLogFiles::new(dir.path());
        assert_eq!(files.versions().unwrap(), vec![0, 2, 10]);
        assert_eq!(files.highest_version().unwrap(), Some(10));
        assert_eq!(files.lowest_version().unwrap(), Some(0));
    }

    #[test]
    fn test_missing_directory_has_no_versions() {
        let dir = tempfile::tempdir().unwrap();
        let files = TransactionLogFiles::new(dir.path().join("absent"));
        assert!(files.versions().unwrap().is_empty());
        assert_eq!(files.highest_version().unwrap(), None);
    }

    #[test]
    fn test_create_and_read_header() {
        let dir = tempfile::tempdir().unwrap();
        let files = TransactionLogFiles::new(dir.path());
        let header = LogHeader::new(3, KernelVersion::V3, 12, StoreId::new(1, 2, 3));
        files.segments().create(&header).unwrap();

        assert!(files.version_exists(3));
        assert_eq!(files.file_size(3).unwrap(), LOG_HEADER_SIZE);
        assert_eq!(files.read_header(3).unwrap(), header);

        files.delete_version(3).unwrap();
        assert!(!files.version_exists(3));
        // Deleting twice is fine.
        files.delete_version(3).unwrap();
    }
}
