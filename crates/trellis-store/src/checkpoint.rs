use std::path::{Path, PathBuf};

use tracing::info;

use trellis_core::error::{Result, TrellisError};

/// Named snapshots of a session's durable state: `state.json` plus every
/// conversation cursor. Restore copies the files back byte-identically.
pub struct CheckpointStore {
    session_root: PathBuf,
}

impl CheckpointStore {
    pub fn new(session_root: impl Into<PathBuf>) -> Self {
        Self {
            session_root: session_root.into(),
        }
    }

    fn checkpoint_dir(&self, name: &str) -> PathBuf {
        self.session_root.join("checkpoints").join(name)
    }

    /// Snapshot the session's state and cursors under `checkpoints/{name}/`.
    pub async fn save(&self, name: &str) -> Result<()> {
        let dir = self.checkpoint_dir(name);
        if tokio::fs::try_exists(&dir).await? {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tokio::fs::create_dir_all(&dir).await?;

        let state = self.session_root.join("state.json");
        if tokio::fs::try_exists(&state).await? {
            tokio::fs::copy(&state, dir.join("state.json")).await?;
        }

        for (thread, cursor) in self.cursors().await? {
            let target_dir = dir.join("conversations").join(&thread);
            tokio::fs::create_dir_all(&target_dir).await?;
            tokio::fs::copy(&cursor, target_dir.join("cursor.json")).await?;
        }

        info!(name, session_root = %self.session_root.display(), "checkpoint saved");
        Ok(())
    }

    /// Copy a checkpoint's files back into place.
    pub async fn restore(&self, name: &str) -> Result<()> {
        let dir = self.checkpoint_dir(name);
        if !tokio::fs::try_exists(&dir).await? {
            return Err(TrellisError::CheckpointNotFound(name.to_string()));
        }

        let state = dir.join("state.json");
        if tokio::fs::try_exists(&state).await? {
            tokio::fs::copy(&state, self.session_root.join("state.json")).await?;
        }

        let conversations = dir.join("conversations");
        if tokio::fs::try_exists(&conversations).await? {
            let mut entries = tokio::fs::read_dir(&conversations).await?;
            while let Some(entry) = entries.next_entry().await? {
                let thread = entry.file_name();
                let source = entry.path().join("cursor.json");
                if !tokio::fs::try_exists(&source).await? {
                    continue;
                }
                let target_dir = self.session_root.join("conversations").join(&thread);
                tokio::fs::create_dir_all(&target_dir).await?;
                tokio::fs::copy(&source, target_dir.join("cursor.json")).await?;
            }
        }

        info!(name, "checkpoint restored");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        let dir = self.session_root.join("checkpoints");
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let dir = self.checkpoint_dir(name);
        if !tokio::fs::try_exists(&dir).await? {
            return Err(TrellisError::CheckpointNotFound(name.to_string()));
        }
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    /// All (thread, cursor path) pairs currently on disk.
    async fn cursors(&self) -> Result<Vec<(String, PathBuf)>> {
        let conversations = self.session_root.join("conversations");
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&conversations).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let cursor = entry.path().join("cursor.json");
            if tokio::fs::try_exists(&cursor).await? {
                if let Some(thread) = entry.file_name().to_str() {
                    out.push((thread.to_string(), cursor));
                }
            }
        }
        Ok(out)
    }
}

/// Convenience used on resume when a cursor is corrupt: restore the most
/// recent checkpoint if any exists.
pub async fn restore_latest(session_root: &Path) -> Result<bool> {
    let store = CheckpointStore::new(session_root);
    let names = store.list().await?;
    let Some(latest) = names.last() else {
        return Ok(false);
    };
    store.restore(latest).await?;
    Ok(true)
}
