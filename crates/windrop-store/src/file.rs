//! File-based snapshot store
//!
//! Maps each document name to a single `<dir>/<name>.bin` file holding the
//! latest full-state snapshot. Saves are whole-file replacements through a
//! temp file and an atomic rename, so a crash mid-save leaves the previous
//! snapshot intact.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::SnapshotStore;
use crate::error::StoreError;

/// Snapshot store backed by one file per document.
#[derive(Debug)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    doc_name: Option<String>,
}

impl FileSnapshotStore {
    /// Create a store rooted at `dir`. The directory is created on `init`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            doc_name: None,
        }
    }

    fn snapshot_path(&self) -> Result<PathBuf, StoreError> {
        let name = self.doc_name.as_ref().ok_or(StoreError::NotInitialized)?;
        Ok(self.dir.join(format!("{name}.bin")))
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn init(&mut self, doc_name: &str) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        self.doc_name = Some(doc_name.to_string());
        debug!(dir = %self.dir.display(), doc = doc_name, "file snapshot store ready");
        Ok(())
    }

    async fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.snapshot_path()?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "snapshot load failed");
                Err(e.into())
            }
        }
    }

    async fn save(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.snapshot_path()?;
        let tmp = path.with_extension("bin.tmp");

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp, &path).await?;
        debug!(path = %path.display(), len = bytes.len(), "snapshot saved");
        Ok(())
    }
}
