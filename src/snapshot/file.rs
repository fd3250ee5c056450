//! JSON file snapshot store

use super::{SessionSnapshot, SnapshotStore};
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Stores the snapshot as one JSON document
///
/// Writes go to a sibling temporary file that is renamed over the target,
/// so a crash mid-write keeps the previous snapshot.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> Result<Option<SessionSnapshot>> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no snapshot found");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot: SessionSnapshot = serde_json::from_slice(&data).map_err(|e| {
            ChatError::Snapshot(format!("corrupt snapshot {}: {}", self.path.display(), e))
        })?;

        info!(
            path = %self.path.display(),
            sessions = snapshot.session_count(),
            messages = snapshot.messages.len(),
            "snapshot loaded"
        );
        Ok(Some(snapshot))
    }

    async fn save(&self, snapshot: &SessionSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let data = serde_json::to_vec_pretty(snapshot)?;
        let temp = self.temp_path();
        fs::write(&temp, &data).await?;
        fs::rename(&temp, &self.path).await?;

        info!(
            path = %self.path.display(),
            sessions = snapshot.session_count(),
            messages = snapshot.messages.len(),
            "snapshot saved"
        );
        Ok(())
    }
}
