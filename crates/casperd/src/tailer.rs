//! Log file tailer.
//!
//! Watches a single growing file and hands back whatever was appended since
//! the previous poll. The daemon polls once per tick and streams the chunk
//! to every connected client.
//!
//! The cursor only moves forward within an epoch. When the file is found to
//! be shorter than the cursor (truncation or copy-truncate rotation) a new
//! epoch starts at offset 0, so the bytes written after the truncation are
//! delivered instead of computing a negative length.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::{debug, info};

/// Tracks the read position in a watched file.
#[derive(Debug)]
pub struct LogTailer {
    path: PathBuf,
    file: File,
    position: u64,
    epoch: u64,
}

impl LogTailer {
    /// Opens `path` and positions the cursor at its current end.
    ///
    /// Existing content is not replayed; only bytes appended after this call
    /// are returned by [`LogTailer::poll`].
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TailError> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| TailError::io("open", &path, e))?;
        let position = file
            .metadata()
            .map_err(|e| TailError::io("stat", &path, e))?
            .len();

        debug!(path = %path.display(), position, "Log tailer opened");

        Ok(Self {
            path,
            file,
            position,
            epoch: 0,
        })
    }

    /// Returns the bytes appended since the last poll, if any.
    ///
    /// # Errors
    /// Any stat, seek or read failure. The caller is expected to drop the
    /// tailer and stop tailing for the rest of the session.
    pub fn poll(&mut self) -> Result<Option<Bytes>, TailError> {
        let size = self
            .file
            .metadata()
            .map_err(|e| TailError::io("stat", &self.path, e))?
            .len();

        if size < self.position {
            info!(
                path = %self.path.display(),
                previous = self.position,
                size,
                "Watched file shrank, restarting from the beginning"
            );
            self.position = 0;
            self.epoch += 1;
        }

        if size == self.position {
            return Ok(None);
        }

        let appended = size - self.position;
        self.file
            .seek(SeekFrom::Start(self.position))
            .map_err(|e| TailError::io("seek", &self.path, e))?;

        let mut chunk = Vec::with_capacity(usize::try_from(appended).unwrap_or(0));
        let read = (&mut self.file)
            .take(appended)
            .read_to_end(&mut chunk)
            .map_err(|e| TailError::io("read", &self.path, e))?;

        if read == 0 {
            return Ok(None);
        }

        self.position += read as u64;
        Ok(Some(Bytes::from(chunk)))
    }

    /// Offset of the next byte to deliver.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Number of truncations observed since the tailer was opened.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Errors that disable log tailing.
#[derive(Debug, thiserror::Error)]
pub enum TailError {
    #[error("Failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TailError {
    fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;

    fn append(path: &Path, bytes: &[u8]) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(bytes).unwrap();
    }

    #[test]
    fn test_starts_at_end_of_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        std::fs::write(&path, b"old content\n").unwrap();

        let mut tailer = LogTailer::open(&path).unwrap();
        assert_eq!(tailer.position(), 12);
        assert!(tailer.poll().unwrap().is_none());
    }

    #[test]
    fn test_returns_exactly_appended_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        std::fs::write(&path, b"existing\n").unwrap();
        let mut tailer = LogTailer::open(&path).unwrap();

        append(&path, b"first\n");
        assert_eq!(tailer.poll().unwrap().as_deref(), Some(&b"first\n"[..]));

        append(&path, b"second\n");
        append(&path, b"third\n");
        assert_eq!(
            tailer.poll().unwrap().as_deref(),
            Some(&b"second\nthird\n"[..])
        );
        assert!(tailer.poll().unwrap().is_none());
    }

    #[test]
    fn test_truncation_starts_new_epoch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        std::fs::write(&path, b"a fairly long first generation\n").unwrap();
        let mut tailer = LogTailer::open(&path).unwrap();

        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        append(&path, b"new\n");

        assert_eq!(tailer.poll().unwrap().as_deref(), Some(&b"new\n"[..]));
        assert_eq!(tailer.epoch(), 1);
        assert_eq!(tailer.position(), 4);
    }

    #[test]
    fn test_truncation_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.log");
        std::fs::write(&path, b"content\n").unwrap();
        let mut tailer = LogTailer::open(&path).unwrap();

        std::fs::write(&path, b"").unwrap();
        assert!(tailer.poll().unwrap().is_none());
        assert_eq!(tailer.position(), 0);

        append(&path, b"x");
        assert_eq!(tailer.poll().unwrap().as_deref(), Some(&b"x"[..]));
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = LogTailer::open(dir.path().join("missing.log")).unwrap_err();
        assert!(err.to_string().contains("open"));
        assert!(err.to_string().contains("missing.log"));
    }
}
