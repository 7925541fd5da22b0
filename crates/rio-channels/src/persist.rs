//! Retry backlog persistence.
//!
//! Cumulated-unsent snapshots are written one payload per line to a retry
//! file. On boot any leftover file is renamed to a timestamped copy and
//! its lines are handed back for recovery, so an agent restart never
//! silently drops queued telemetry.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};

/// One retry file on disk.
pub struct BacklogFile {
    path: PathBuf,
}

impl BacklogFile {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the file with a chronological snapshot.
    pub fn write_snapshot(&self, lines: &[String]) -> std::io::Result<()> {
        let mut text = lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        std::fs::write(&self.path, text)
    }

    /// Rotate a leftover file aside and return its lines for recovery.
    /// Returns an empty list when there is nothing to recover.
    pub fn rotate_and_read(&self) -> Vec<String> {
        if !self.path.exists() {
            return Vec::new();
        }
        let stamped = self.stamped_path();
        if let Err(err) = std::fs::rename(&self.path, &stamped) {
            warn!(path = %self.path.display(), error = %err, "retry file rotation failed");
            return Vec::new();
        }
        match std::fs::read_to_string(&stamped) {
            Ok(text) => {
                let lines: Vec<String> = text
                    .lines()
                    .filter(|line| !line.trim().is_empty())
                    .map(str::to_string)
                    .collect();
                info!(
                    path = %stamped.display(),
                    lines = lines.len(),
                    "recovered retry backlog"
                );
                lines
            }
            Err(err) => {
                warn!(path = %stamped.display(), error = %err, "retry file unreadable");
                Vec::new()
            }
        }
    }

    fn stamped_path(&self) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "retryBuffer".to_string());
        let extension = self
            .path
            .extension()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "txt".to_string());
        self.path
            .with_file_name(format!("{stem}-{stamp}.{extension}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_rotate_recovers_lines() {
        let dir = tempfile::tempdir().unwrap();
        let file = BacklogFile::new(dir.path().join("retryBuffer.txt"));
        file.write_snapshot(&["a".into(), "b".into(), "c".into()])
            .unwrap();

        let lines = file.rotate_and_read();
        assert_eq!(lines, vec!["a", "b", "c"]);
        // Original file is gone, a stamped copy remains.
        assert!(!file.path().exists());
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].starts_with("retryBuffer-"));
    }

    #[test]
    fn missing_file_recovers_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let file = BacklogFile::new(dir.path().join("retryBuffer.txt"));
        assert!(file.rotate_and_read().is_empty());
    }
}
