//! Action log - Single-slot notification file read by the editor UI

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Overwrite-only message slot; each write replaces the previous message
pub struct ActionLog {
    path: PathBuf,
}

impl ActionLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Truncate the log, creating it if needed
    pub fn clear(&self) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, "")
    }

    /// Replace the current message
    pub fn write(&self, message: &str) -> io::Result<()> {
        fs::write(&self.path, message)
    }

    /// Current message, empty if nothing has been written
    #[cfg(test)]
    pub fn read(&self) -> io::Result<String> {
        match fs::read_to_string(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            other => other,
        }
    }
}
