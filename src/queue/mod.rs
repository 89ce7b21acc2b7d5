// Capture Queue (C4, spec.md §4.4): a disk-backed FIFO of captured turns. No
// teacher module matches this directly; the atomic write pattern (temp file +
// rename) and the single-drainer loop follow the reference's general async
// worker-loop style (batch-processing in a dedicated tokio task, errors logged
// and retried rather than propagated out of the loop).

use crate::error::{MemoryError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedTurn {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureItem {
    pub project_id: String,
    pub session_id: Option<String>,
    pub captured_at: DateTime<Utc>,
    pub source_agent: String,
    pub messages: Vec<CapturedTurn>,
}

pub struct CaptureQueue {
    spool_dir: PathBuf,
    dead_letter_dir: PathBuf,
    max_retries: u32,
    retry_base: Duration,
}

impl CaptureQueue {
    pub async fn new(spool_dir: PathBuf, max_retries: u32, retry_base_seconds: u64) -> Result<Self> {
        let dead_letter_dir = spool_dir.join("dead-letter");
        fs::create_dir_all(&spool_dir)
            .await
            .map_err(|e| MemoryError::internal(anyhow::anyhow!(e)))?;
        fs::create_dir_all(&dead_letter_dir)
            .await
            .map_err(|e| MemoryError::internal(anyhow::anyhow!(e)))?;
        Ok(CaptureQueue {
            spool_dir,
            dead_letter_dir,
            max_retries,
            retry_base: Duration::from_secs(retry_base_seconds),
        })
    }

    /// Enqueue is atomic: write to a temp file, then rename into the spool
    /// directory. A crash between write and rename loses at most the partial
    /// temp file, never a file visible to the drainer (spec.md §4.4).
    pub async fn enqueue(&self, item: &CaptureItem) -> Result<PathBuf> {
        let file_name = format!("{}-{}.json", item.captured_at.timestamp_nanos_opt().unwrap_or_default(), Uuid::new_v4());
        let final_path = self.spool_dir.join(&file_name);
        let tmp_path = self.spool_dir.join(format!(".{}.tmp", file_name));

        let body = serde_json::to_vec_pretty(item).map_err(|e| MemoryError::internal(anyhow::anyhow!(e)))?;
        fs::write(&tmp_path, &body)
            .await
            .map_err(|e| MemoryError::internal(anyhow::anyhow!(e)))?;
        fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| MemoryError::internal(anyhow::anyhow!(e)))?;
        debug!(path = %final_path.display(), "enqueued capture item");
        Ok(final_path)
    }

    /// Oldest-first listing by filename, which embeds a nanosecond timestamp —
    /// gives FIFO order without needing a separate index file.
    async fn spool_files(&self) -> Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(&self.spool_dir)
            .await
            .map_err(|e| MemoryError::internal(anyhow::anyhow!(e)))?;
        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| MemoryError::internal(anyhow::anyhow!(e)))?
        {
            let path = entry.path();
            if path.is_file() {
                let is_tmp = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with('.'))
                    .unwrap_or(false);
                if !is_tmp {
                    files.push(path);
                }
            }
        }
        files.sort();
        Ok(files)
    }

    pub async fn depth(&self) -> Result<usize> {
        Ok(self.spool_files().await?.len())
    }

    /// Drains the queue in FIFO order, invoking `post` for each item. On success
    /// the file is deleted; on a retryable error it is left for the next drain
    /// pass; on a non-retryable 4xx (anything but 429) it moves to dead-letter
    /// after exhausting `max_retries` attempts recorded in the filename.
    pub async fn drain_once<F, Fut>(&self, mut post: F) -> Result<DrainReport>
    where
        F: FnMut(CaptureItem) -> Fut,
        Fut: std::future::Future<Output = PostOutcome>,
    {
        let mut report = DrainReport::default();
        for path in self.spool_files().await? {
            let attempt = attempt_count(&path);
            let body = match fs::read(&path).await {
                Ok(b) => b,
                Err(e) => {
                    warn!(path = %path.display(), "failed to read spool file: {e}");
                    continue;
                }
            };
            let item: CaptureItem = match serde_json::from_slice(&body) {
                Ok(item) => item,
                Err(e) => {
                    error!(path = %path.display(), "corrupt spool file, moving to dead-letter: {e}");
                    self.move_to_dead_letter(&path).await;
                    report.dead_lettered += 1;
                    continue;
                }
            };

            match post(item).await {
                PostOutcome::Delivered => {
                    if let Err(e) = fs::remove_file(&path).await {
                        warn!(path = %path.display(), "delivered but failed to remove spool file: {e}");
                    }
                    report.delivered += 1;
                }
                PostOutcome::Retryable => {
                    if attempt + 1 >= self.max_retries {
                        warn!(path = %path.display(), "exhausted retries, moving to dead-letter");
                        self.move_to_dead_letter(&path).await;
                        report.dead_lettered += 1;
                    } else {
                        self.bump_attempt(&path, attempt).await;
                        report.left_in_queue += 1;
                        tokio::time::sleep(self.retry_base * 2u32.pow(attempt.min(6))).await;
                    }
                }
                PostOutcome::Rejected => {
                    self.move_to_dead_letter(&path).await;
                    report.dead_lettered += 1;
                }
            }
        }
        Ok(report)
    }

    async fn move_to_dead_letter(&self, path: &Path) {
        if let Some(name) = path.file_name() {
            let dest = self.dead_letter_dir.join(name);
            if let Err(e) = fs::rename(path, &dest).await {
                error!(path = %path.display(), "failed to move to dead-letter: {e}");
            }
        }
    }

    /// Attempt counts ride on the filename (`...__attemptN.json`) since the
    /// queue has no separate index store; rewriting the file under its new name
    /// is itself atomic via rename.
    async fn bump_attempt(&self, path: &Path, attempt: u32) {
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else { return };
        let base = stem.split("__attempt").next().unwrap_or(stem);
        let new_name = format!("{base}__attempt{}.json", attempt + 1);
        let new_path = self.spool_dir.join(new_name);
        if let Err(e) = fs::rename(path, &new_path).await {
            warn!(path = %path.display(), "failed to bump attempt count: {e}");
        }
    }

    pub async fn dead_letter_count(&self) -> usize {
        let Ok(mut entries) = fs::read_dir(&self.dead_letter_dir).await else {
            return 0;
        };
        let mut count = 0;
        while let Ok(Some(_)) = entries.next_entry().await {
            count += 1;
        }
        count
    }
}

fn attempt_count(path: &Path) -> u32 {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.split("__attempt").nth(1))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[derive(Debug, Default)]
pub struct DrainReport {
    pub delivered: usize,
    pub left_in_queue: usize,
    pub dead_lettered: usize,
}

pub enum PostOutcome {
    Delivered,
    Retryable,
    Rejected,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_item(n: usize) -> CaptureItem {
        CaptureItem {
            project_id: "global".to_string(),
            session_id: Some(format!("s{n}")),
            captured_at: Utc::now(),
            source_agent: "cli".to_string(),
            messages: vec![CapturedTurn {
                role: "HUMAN".to_string(),
                content: format!("message {n}"),
                timestamp: Utc::now(),
            }],
        }
    }

    #[tokio::test]
    async fn enqueue_then_drain_delivers_in_fifo_order() {
        let dir = tempdir().unwrap();
        let queue = CaptureQueue::new(dir.path().to_path_buf(), 5, 1).await.unwrap();
        for i in 0..3 {
            queue.enqueue(&sample_item(i)).await.unwrap();
        }
        assert_eq!(queue.depth().await.unwrap(), 3);

        let delivered = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let delivered_clone = delivered.clone();
        let report = queue
            .drain_once(move |item| {
                let delivered = delivered_clone.clone();
                async move {
                    delivered.lock().unwrap().push(item.session_id.clone());
                    PostOutcome::Delivered
                }
            })
            .await
            .unwrap();

        assert_eq!(report.delivered, 3);
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(
            *delivered.lock().unwrap(),
            vec![Some("s0".to_string()), Some("s1".to_string()), Some("s2".to_string())]
        );
    }

    #[tokio::test]
    async fn rejected_items_move_to_dead_letter() {
        let dir = tempdir().unwrap();
        let queue = CaptureQueue::new(dir.path().to_path_buf(), 5, 1).await.unwrap();
        queue.enqueue(&sample_item(0)).await.unwrap();

        queue.drain_once(|_| async { PostOutcome::Rejected }).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
        assert_eq!(queue.dead_letter_count().await, 1);
    }
}
