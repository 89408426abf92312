use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::SessionId;

use crate::conversation::write_durable;

/// Total time spent waiting on the state lock before giving up.
const LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// The durable `state.json` for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub graph_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: SessionStatus,
    /// SharedMemory snapshot.
    #[serde(default)]
    pub memory: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
}

impl SessionState {
    pub fn new(session_id: &SessionId, graph_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.0.clone(),
            graph_id: graph_id.into(),
            created_at: now,
            updated_at: now,
            status: SessionStatus::Active,
            memory: serde_json::Map::new(),
            metrics: None,
        }
    }
}

/// Process-local registry of per-path write locks. Shared between a store
/// and every child store derived from it so concurrent graphs cannot
/// interleave writes to the same `state.json`.
#[derive(Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl LockRegistry {
    fn lock_for(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Filesystem-backed session store.
///
/// Layout per session root:
/// ```text
/// {root}/{session_id}/
///   state.json
///   data/
///   conversations/{thread}/parts, cursor.json
///   checkpoints/{name}/
///   logs/tool_logs.jsonl
///   graphs/{graph_id}/      <- child stores mirror this layout here
/// ```
#[derive(Clone)]
pub struct SessionStore {
    root: PathBuf,
    locks: Arc<LockRegistry>,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Arc::new(LockRegistry::default()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_root(&self, session_id: &SessionId) -> PathBuf {
        self.root.join(&session_id.0)
    }

    pub fn data_dir(&self, session_id: &SessionId) -> PathBuf {
        self.session_root(session_id).join("data")
    }

    pub fn conversation_dir(&self, session_id: &SessionId, thread: &str) -> PathBuf {
        self.session_root(session_id)
            .join("conversations")
            .join(thread)
    }

    pub fn checkpoints_dir(&self, session_id: &SessionId) -> PathBuf {
        self.session_root(session_id).join("checkpoints")
    }

    pub fn logs_dir(&self, session_id: &SessionId) -> PathBuf {
        self.session_root(session_id).join("logs")
    }

    fn state_path(&self, session_id: &SessionId) -> PathBuf {
        self.session_root(session_id).join("state.json")
    }

    pub async fn exists(&self, session_id: &SessionId) -> bool {
        tokio::fs::try_exists(self.state_path(session_id))
            .await
            .unwrap_or(false)
    }

    /// Create the session directory tree and its initial state.
    pub async fn create_session(
        &self,
        session_id: &SessionId,
        graph_id: &str,
    ) -> Result<SessionState> {
        let root = self.session_root(session_id);
        tokio::fs::create_dir_all(root.join("data")).await?;
        tokio::fs::create_dir_all(root.join("conversations")).await?;
        tokio::fs::create_dir_all(root.join("checkpoints")).await?;
        tokio::fs::create_dir_all(root.join("logs")).await?;
        let state = SessionState::new(session_id, graph_id);
        self.write_state(&state).await?;
        info!(session_id = %session_id, graph_id, "session created");
        Ok(state)
    }

    pub async fn read_state(&self, session_id: &SessionId) -> Result<SessionState> {
        let path = self.state_path(session_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TrellisError::SessionNotFound(session_id.0.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|e| TrellisError::CorruptState(format!("{}: {e}", path.display())))
    }

    /// Write `state.json` under the process-local lock for its path.
    /// Serialized across every store sharing the lock registry, so
    /// concurrent graphs cannot interleave.
    pub async fn write_state(&self, state: &SessionState) -> Result<()> {
        let session_id = SessionId::from_string(&state.session_id);
        let path = self.state_path(&session_id);
        let lock = self.locks.lock_for(&path);

        let guard = acquire_with_backoff(&lock, &path).await?;
        let bytes = serde_json::to_vec_pretty(state)?;
        write_durable(&path, &bytes).await?;
        drop(guard);
        debug!(session_id = %state.session_id, "state.json written");
        Ok(())
    }

    pub async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir()
                && tokio::fs::try_exists(entry.path().join("state.json")).await?
            {
                if let Some(name) = entry.file_name().to_str() {
                    out.push(name.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Delete a session and all of its data. Completion never deletes;
    /// only this explicit call does.
    pub async fn delete_session(&self, session_id: &SessionId) -> Result<()> {
        let root = self.session_root(session_id);
        if !tokio::fs::try_exists(&root).await? {
            return Err(TrellisError::SessionNotFound(session_id.0.clone()));
        }
        tokio::fs::remove_dir_all(&root).await?;
        info!(session_id = %session_id, "session deleted");
        Ok(())
    }

    /// A store for a secondary graph, rooted at
    /// `{session_root}/graphs/{graph_id}/` and sharing this store's lock
    /// registry. Its writes cannot touch the primary `state.json`.
    pub fn child_store_for(&self, session_id: &SessionId, graph_id: &str) -> SessionStore {
        SessionStore {
            root: self
                .session_root(session_id)
                .join("graphs")
                .join(graph_id),
            locks: self.locks.clone(),
        }
    }
}

async fn acquire_with_backoff<'a>(
    lock: &'a tokio::sync::Mutex<()>,
    path: &Path,
) -> Result<tokio::sync::MutexGuard<'a, ()>> {
    let deadline = tokio::time::Instant::now() + LOCK_TIMEOUT;
    let mut backoff = Duration::from_millis(10);
    loop {
        if let Ok(guard) = lock.try_lock() {
            return Ok(guard);
        }
        if tokio::time::Instant::now() + backoff > deadline {
            return Err(TrellisError::StateLockTimeout(path.display().to_string()));
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_millis(250));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, SessionStore) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn create_read_roundtrip() {
        let (_dir, store) = store();
        let sid = SessionId::from_string("s1");
        store.create_session(&sid, "g1").await.unwrap();

        let state = store.read_state(&sid).await.unwrap();
        assert_eq!(state.session_id, "s1");
        assert_eq!(state.graph_id, "g1");
        assert_eq!(state.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn layout_directories_exist() {
        let (dir, store) = store();
        let sid = SessionId::from_string("s1");
        store.create_session(&sid, "g1").await.unwrap();

        for sub in ["data", "conversations", "checkpoints", "logs"] {
            assert!(dir.path().join("s1").join(sub).is_dir(), "missing {sub}");
        }
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let (_dir, store) = store();
        let err = store
            .read_state(&SessionId::from_string("ghost"))
            .await
            .unwrap_err();
        assert!(matches!(err, TrellisError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn list_and_delete() {
        let (_dir, store) = store();
        store
            .create_session(&SessionId::from_string("a"), "g")
            .await
            .unwrap();
        store
            .create_session(&SessionId::from_string("b"), "g")
            .await
            .unwrap();
        assert_eq!(store.list_sessions().await.unwrap(), vec!["a", "b"]);

        store
            .delete_session(&SessionId::from_string("a"))
            .await
            .unwrap();
        assert_eq!(store.list_sessions().await.unwrap(), vec!["b"]);
    }

    #[tokio::test]
    async fn child_store_is_isolated_from_primary() {
        let (dir, store) = store();
        let primary = SessionId::from_string("main");
        let mut primary_state = store.create_session(&primary, "worker").await.unwrap();
        primary_state
            .memory
            .insert("task".into(), serde_json::json!("build"));
        store.write_state(&primary_state).await.unwrap();
        let primary_bytes = std::fs::read(dir.path().join("main/state.json")).unwrap();

        // Secondary graph writes under graphs/{gid}/ only.
        let child = store.child_store_for(&primary, "health_judge");
        let child_sid = SessionId::from_string("judge-session");
        let mut child_state = child.create_session(&child_sid, "health_judge").await.unwrap();
        child_state
            .memory
            .insert("verdicts".into(), serde_json::json!(["RETRY"]));
        child.write_state(&child_state).await.unwrap();

        assert!(dir
            .path()
            .join("main/graphs/health_judge/judge-session/state.json")
            .exists());
        assert_eq!(
            std::fs::read(dir.path().join("main/state.json")).unwrap(),
            primary_bytes
        );

        // Removing the secondary tree leaves the primary untouched.
        std::fs::remove_dir_all(dir.path().join("main/graphs/health_judge")).unwrap();
        assert_eq!(
            std::fs::read(dir.path().join("main/state.json")).unwrap(),
            primary_bytes
        );
    }

    #[tokio::test]
    async fn concurrent_writes_are_serialized() {
        let (_dir, store) = store();
        let sid = SessionId::from_string("busy");
        store.create_session(&sid, "g").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            let sid = sid.clone();
            handles.push(tokio::spawn(async move {
                let mut state = store.read_state(&sid).await.unwrap();
                state.memory.insert(format!("k{i}"), serde_json::json!(i));
                store.write_state(&state).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // The file is always one intact JSON document.
        let state = store.read_state(&sid).await.unwrap();
        assert_eq!(state.session_id, "busy");
    }
}
