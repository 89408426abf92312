use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use trellis_core::error::Result;

/// One line of `logs/tool_logs.jsonl`: a completed executor step.
///
/// This is the artifact health-judge tooling reads to observe a worker
/// from outside, so the field names are part of the monitoring contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: u64,
    pub node_id: String,
    pub iteration: u32,
    /// Judge verdict string: ACCEPT / RETRY / CONTINUE / ESCALATE.
    pub verdict: String,
    #[serde(default)]
    pub llm_text: String,
    #[serde(default)]
    pub tool_calls: Vec<String>,
    pub ts: String,
}

/// Append-only JSONL step logger. One JSON object per line, flushed per
/// line so every previously written step survives a crash.
#[derive(Clone)]
pub struct StepLog {
    path: PathBuf,
}

impl StepLog {
    /// `logs_dir` is the session's `logs/` directory.
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: logs_dir.into().join("tool_logs.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record. Logging failures are reported but never fail the
    /// step that produced them.
    pub async fn append(&self, record: &StepRecord) {
        if let Err(e) = self.try_append(record).await {
            warn!(error = %e, path = %self.path.display(), "step log write failed");
        }
    }

    async fn try_append(&self, record: &StepRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read every intact line; malformed lines are skipped.
    pub async fn read_all(&self) -> Result<Vec<StepRecord>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}
