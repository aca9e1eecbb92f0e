//! Per-session capture log
//!
//! Every byte received on a session is appended to
//! `<capture_dir>/<timestamp>_connection.log` and flushed immediately, so the
//! file stays useful when a flash tool hangs the run.

use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

/// Append-only transcript of one session
#[derive(Debug)]
pub struct CaptureLog {
    path: PathBuf,
    file: File,
    bytes: u64,
}

impl CaptureLog {
    /// Create `<dir>/<timestamp>_connection.log`, creating `dir` if needed
    pub fn create_in(dir: &Path) -> Result<Self> {
        let dir = expand_home(dir);
        std::fs::create_dir_all(&dir)?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%6f");
        let path = dir.join(format!("{}_connection.log", stamp));
        Self::open(path)
    }

    /// Open (or append to) an explicit file
    pub fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Capturing session output to {}", path.display());
        Ok(Self {
            path,
            file,
            bytes: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far
    pub fn len(&self) -> u64 {
        self.bytes
    }

    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// Append and flush one chunk
    pub fn record(&mut self, chunk: &[u8]) {
        let written = self
            .file
            .write_all(chunk)
            .and_then(|_| self.file.flush());
        match written {
            Ok(()) => self.bytes += chunk.len() as u64,
            Err(e) => warn!("Capture write to {} failed: {}", self.path.display(), e),
        }
    }
}
