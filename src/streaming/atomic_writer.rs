//! Atomic file writer with automatic cleanup on failure.
//!
//! Writes to a temporary file in the same directory as the destination,
//! then atomically replaces the destination on `finish()`. If dropped
//! before finishing, the temporary file is automatically cleaned up.

use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

use crate::error::AppError;

/// An atomic download target.
///
/// Chunks are appended to a temporary file; `finish()` flushes, syncs and
/// renames it to the final path. Dropping without `finish()` deletes it.
pub struct AtomicDownload {
    /// Owns the temp path; deletes it on drop unless persisted.
    temp: NamedTempFile,
    /// Async handle onto the same file for writing.
    file: File,
    final_path: PathBuf,
    bytes_written: u64,
}

impl AtomicDownload {
    /// Creates the destination directory if needed and opens a temp file in it.
    ///
    /// The temp file lives beside `final_path` so the rename stays on one filesystem.
    pub async fn create(final_path: impl AsRef<Path>) -> Result<Self, AppError> {
        let final_path = final_path.as_ref().to_path_buf();

        let parent_dir = match final_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            Some(_) => PathBuf::from("."),
            None => {
                return Err(AppError::Internal(format!(
                    "Cannot determine parent directory for: {}",
                    final_path.display()
                )))
            }
        };

        tokio::fs::create_dir_all(&parent_dir).await.map_err(|e| {
            AppError::Internal(format!("Failed to create output directory: {}", e))
        })?;

        let temp = NamedTempFile::new_in(&parent_dir)
            .map_err(|e| AppError::Internal(format!("Failed to create temp file: {}", e)))?;
        let std_file = temp
            .reopen()
            .map_err(|e| AppError::Internal(format!("Failed to reopen temp file: {}", e)))?;

        Ok(Self {
            temp,
            file: File::from_std(std_file),
            final_path,
            bytes_written: 0,
        })
    }

    /// Appends a chunk to the temporary file.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), AppError> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| AppError::Internal(format!("Error writing to file: {}", e)))?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Flushes, syncs and atomically persists to the final path.
    ///
    /// # Returns
    ///
    /// The final path on success. On error the temp file is removed.
    pub async fn finish(mut self) -> Result<PathBuf, AppError> {
        self.file
            .flush()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to flush output file: {}", e)))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to sync output file: {}", e)))?;
        drop(self.file);

        self.temp.persist(&self.final_path).map_err(|e| {
            AppError::Internal(format!(
                "Failed to persist file to {}: {}",
                self.final_path.display(),
                e.error
            ))
        })?;

        Ok(self.final_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_successful_write() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let final_path = temp_dir.path().join("result.csv");

        let mut target = AtomicDownload::create(&final_path).await.unwrap();
        target.write_chunk(b"ID;Score\n").await.unwrap();
        target.write_chunk(b"3373871;2\n").await.unwrap();
        assert_eq!(target.bytes_written(), 19);

        let result_path = target.finish().await.expect("Failed to finish");

        assert_eq!(result_path, final_path);
        let content = fs::read_to_string(&final_path).unwrap();
        assert_eq!(content, "ID;Score\n3373871;2\n");
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_drop_cleanup() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let final_path = temp_dir.path().join("result.csv");

        {
            let mut target = AtomicDownload::create(&final_path).await.unwrap();
            target.write_chunk(b"partial").await.unwrap();
            // Dropped here without finish()
        }

        let entries: Vec<_> = fs::read_dir(temp_dir.path()).unwrap().collect();
        assert!(entries.is_empty(), "temp file should be cleaned up on drop");
        assert!(!final_path.exists());
    }

    #[tokio::test]
    async fn test_overwrite_behavior() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let final_path = temp_dir.path().join("result.csv");
        fs::write(&final_path, "OLD_CONTENT").unwrap();

        let mut target = AtomicDownload::create(&final_path).await.unwrap();
        target.write_chunk(b"NEW").await.unwrap();
        target.finish().await.unwrap();

        assert_eq!(fs::read_to_string(&final_path).unwrap(), "NEW");
    }

    #[tokio::test]
    async fn test_creates_missing_parent() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let final_path = temp_dir.path().join("a").join("b").join("result.csv");

        let target = AtomicDownload::create(&final_path).await.unwrap();
        target.finish().await.unwrap();

        assert!(final_path.exists());
        assert!(fs::read_to_string(&final_path).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_root_has_no_parent() {
        assert!(AtomicDownload::create("/").await.is_err());
    }
}
