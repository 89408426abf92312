use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::ConversationMessage;

/// Durable progress marker for one node visit, persisted next to the parts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeCursor {
    /// Which node's visit wrote this cursor. A different node re-entering
    /// a shared continuous thread starts fresh instead of inheriting it.
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub iteration: u32,
    /// Work-in-progress outputs, durable before judge acceptance.
    #[serde(default)]
    pub outputs: serde_json::Map<String, Value>,
    #[serde(default)]
    pub user_interaction_count: u32,
    #[serde(default)]
    pub recent_responses: Vec<String>,
    #[serde(default)]
    pub recent_tool_fingerprints: Vec<String>,
    #[serde(default)]
    pub last_message_ordinal: u64,
    // Stall counters
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub identical_retry_count: u32,
    /// Set while the node is parked on CLIENT_INPUT_REQUESTED.
    #[serde(default)]
    pub awaiting_input: bool,
}

struct ConvInner {
    dir: PathBuf,
    /// Serializes appends so ordinals never collide.
    last: Mutex<u64>,
}

/// Append-only message log for one (session, thread). Messages are written
/// as `parts/NNNNNNNNNN.json` with strictly increasing ordinals; each part
/// is written to a temp file, fsynced, then renamed into place. The cursor
/// is only updated after its part is durable.
#[derive(Clone)]
pub struct ConversationStore {
    inner: Arc<ConvInner>,
}

impl ConversationStore {
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(dir.join("parts")).await?;
        let last = scan_last_ordinal(&dir.join("parts")).await?;
        Ok(Self {
            inner: Arc::new(ConvInner {
                dir,
                last: Mutex::new(last),
            }),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    fn part_path(&self, ordinal: u64) -> PathBuf {
        self.inner
            .dir
            .join("parts")
            .join(format!("{ordinal:010}.json"))
    }

    /// Append a message, returning its ordinal.
    pub async fn append(&self, msg: &ConversationMessage) -> Result<u64> {
        let mut last = self.inner.last.lock().await;
        let ordinal = *last + 1;
        let path = self.part_path(ordinal);
        write_durable(&path, &serde_json::to_vec_pretty(msg)?).await?;
        *last = ordinal;
        debug!(ordinal, dir = %self.inner.dir.display(), "appended conversation part");
        Ok(ordinal)
    }

    /// Read all messages with ordinal >= `from`, in order.
    pub async fn read_from(&self, from: u64) -> Result<Vec<(u64, ConversationMessage)>> {
        let last = *self.inner.last.lock().await;
        let mut out = Vec::new();
        for ordinal in from.max(1)..=last {
            let path = self.part_path(ordinal);
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let msg = serde_json::from_slice(&bytes)?;
            out.push((ordinal, msg));
        }
        Ok(out)
    }

    pub async fn read_all(&self) -> Result<Vec<(u64, ConversationMessage)>> {
        self.read_from(1).await
    }

    pub async fn last_ordinal(&self) -> u64 {
        *self.inner.last.lock().await
    }

    pub async fn write_cursor(&self, cursor: &NodeCursor) -> Result<()> {
        let path = self.inner.dir.join("cursor.json");
        write_durable(&path, &serde_json::to_vec_pretty(cursor)?).await
    }

    pub async fn read_cursor(&self) -> Result<Option<NodeCursor>> {
        let path = self.inner.dir.join("cursor.json");
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| TrellisError::CorruptCursor(format!("{}: {e}", path.display())))
    }

    /// Repair after an interrupted run: any tool_call part without a
    /// matching tool_result gets a synthetic "interrupted" error result so
    /// the model can retry. Returns the number of repairs appended.
    pub async fn repair_orphan_tool_calls(&self) -> Result<usize> {
        let parts = self.read_all().await?;
        let resolved: HashSet<&str> = parts
            .iter()
            .filter_map(|(_, m)| match m {
                ConversationMessage::ToolResult { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();

        let orphans: Vec<(String, String)> = parts
            .iter()
            .filter_map(|(_, m)| match m {
                ConversationMessage::ToolCall { call_id, name, .. }
                    if !resolved.contains(call_id.as_str()) =>
                {
                    Some((call_id.clone(), name.clone()))
                }
                _ => None,
            })
            .collect();

        let count = orphans.len();
        for (call_id, name) in orphans {
            self.append(&ConversationMessage::tool_result(
                call_id,
                name,
                "Tool call interrupted before completion; retry if still needed.",
                true,
            ))
            .await?;
        }
        Ok(count)
    }
}

async fn scan_last_ordinal(parts_dir: &Path) -> Result<u64> {
    let mut max = 0u64;
    let mut entries = tokio::fs::read_dir(parts_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
            continue;
        };
        if let Ok(ordinal) = stem.parse::<u64>() {
            max = max.max(ordinal);
        }
    }
    Ok(max)
}

/// Write bytes to a temp file, fsync, then rename into place.
pub(crate) async fn write_durable(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, ConversationStore) {
        let dir = TempDir::new().unwrap();
        let store = ConversationStore::open(dir.path().join("thread")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn ordinals_are_strictly_increasing() {
        let (_dir, store) = store().await;
        let a = store.append(&ConversationMessage::user("one")).await.unwrap();
        let b = store.append(&ConversationMessage::user("two")).await.unwrap();
        let c = store.append(&ConversationMessage::user("three")).await.unwrap();
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(store.last_ordinal().await, 3);
    }

    #[tokio::test]
    async fn parts_use_ten_digit_names() {
        let (dir, store) = store().await;
        store.append(&ConversationMessage::user("x")).await.unwrap();
        let path = dir.path().join("thread/parts/0000000001.json");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn reopen_resumes_ordinals() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("thread");
        {
            let store = ConversationStore::open(&path).await.unwrap();
            store.append(&ConversationMessage::user("a")).await.unwrap();
            store.append(&ConversationMessage::user("b")).await.unwrap();
        }
        let store = ConversationStore::open(&path).await.unwrap();
        assert_eq!(store.last_ordinal().await, 2);
        let next = store.append(&ConversationMessage::user("c")).await.unwrap();
        assert_eq!(next, 3);
    }

    #[tokio::test]
    async fn existing_part_bytes_never_change() {
        let (dir, store) = store().await;
        store.append(&ConversationMessage::user("frozen")).await.unwrap();
        let path = dir.path().join("thread/parts/0000000001.json");
        let before = std::fs::read(&path).unwrap();

        for i in 0..5 {
            store
                .append(&ConversationMessage::user(format!("later {i}")))
                .await
                .unwrap();
        }
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn read_from_skips_earlier() {
        let (_dir, store) = store().await;
        for i in 0..4 {
            store
                .append(&ConversationMessage::user(format!("m{i}")))
                .await
                .unwrap();
        }
        let tail = store.read_from(3).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].0, 3);
    }

    #[tokio::test]
    async fn cursor_roundtrip() {
        let (_dir, store) = store().await;
        let mut cursor = NodeCursor::default();
        cursor.node_id = "intake".into();
        cursor.iteration = 4;
        cursor.outputs.insert("partial".into(), serde_json::json!(42));
        cursor.user_interaction_count = 1;
        cursor.last_message_ordinal = 9;
        store.write_cursor(&cursor).await.unwrap();

        let loaded = store.read_cursor().await.unwrap().unwrap();
        assert_eq!(loaded, cursor);
    }

    #[tokio::test]
    async fn missing_cursor_is_none() {
        let (_dir, store) = store().await;
        assert!(store.read_cursor().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_cursor_is_reported() {
        let (dir, store) = store().await;
        std::fs::write(dir.path().join("thread/cursor.json"), b"{not json").unwrap();
        assert!(matches!(
            store.read_cursor().await,
            Err(TrellisError::CorruptCursor(_))
        ));
    }

    #[tokio::test]
    async fn repair_appends_synthetic_results_for_orphans() {
        let (_dir, store) = store().await;
        store
            .append(&ConversationMessage::tool_call(
                "c1",
                "set_output",
                serde_json::json!({"key": "partial", "value": 42}),
            ))
            .await
            .unwrap();
        store
            .append(&ConversationMessage::tool_call("c2", "fetch", serde_json::json!({})))
            .await
            .unwrap();
        store
            .append(&ConversationMessage::tool_result("c1", "set_output", "ok", false))
            .await
            .unwrap();

        let repaired = store.repair_orphan_tool_calls().await.unwrap();
        assert_eq!(repaired, 1);

        let parts = store.read_all().await.unwrap();
        match &parts.last().unwrap().1 {
            ConversationMessage::ToolResult {
                call_id, is_error, ..
            } => {
                assert_eq!(call_id, "c2");
                assert!(is_error);
            }
            other => panic!("expected synthetic tool_result, got {other:?}"),
        }

        // Idempotent: nothing more to repair.
        assert_eq!(store.repair_orphan_tool_calls().await.unwrap(), 0);
    }
}
