//! JSON-lines swap store: one append-only file per swap

use super::{SwapStore, TransitionRecord};
use crate::error::{SwapError, SwapResult};
use crate::swap::Swap;

use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Default)]
struct WriterState {
    loaded: bool,
    last_sequence: Option<u64>,
    /// File length after the last record this writer accounted for
    len: u64,
}

/// Parsed log of one swap
struct SwapLog {
    records: Vec<TransitionRecord>,
    /// Length of the well-formed prefix
    valid_len: u64,
    torn: bool,
}

/// File backend, fsync on every append
pub struct FileSwapStore {
    dir: PathBuf,
    /// Single writer per swap
    writers: DashMap<Uuid, Arc<Mutex<WriterState>>>,
}

impl FileSwapStore {
    pub async fn open(dir: impl AsRef<Path>) -> SwapResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            writers: DashMap::new(),
        })
    }

    fn path(&self, swap_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.jsonl", swap_id))
    }

    async fn file_len(&self, path: &Path) -> SwapResult<u64> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    async fn truncate(&self, path: &Path, len: u64) -> SwapResult<()> {
        let file = OpenOptions::new().write(true).open(path).await?;
        file.set_len(len).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn write_line(&self, path: &Path, line: &[u8]) -> SwapResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(line).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    fn writer(&self, swap_id: Uuid) -> Arc<Mutex<WriterState>> {
        self.writers.entry(swap_id).or_default().clone()
    }

    async fn read_log(&self, swap_id: Uuid) -> SwapResult<SwapLog> {
        let content = match fs::read_to_string(self.path(swap_id)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        let mut log = SwapLog {
            records: Vec::new(),
            valid_len: 0,
            torn: false,
        };
        let mut lines = content.split_inclusive('\n').peekable();

        while let Some(line) = lines.next() {
            let complete = line.ends_with('\n');
            let last = lines.peek().is_none();
            match serde_json::from_str::<TransitionRecord>(line.trim_end()) {
                Ok(record) if complete => {
                    log.records.push(record);
                    log.valid_len += line.len() as u64;
                }
                Err(e) if !last => return Err(e.into()),
                // A crash mid-append leaves at most one partial trailing line
                _ => {
                    warn!("Swap {}: ignoring torn trailing record", swap_id);
                    log.torn = true;
                }
            }
        }

        Ok(log)
    }
}

#[async_trait]
impl SwapStore for FileSwapStore {
    async fn append(&self, swap_id: Uuid, record: &TransitionRecord) -> SwapResult<()> {
        if record.swap_id != swap_id {
            return Err(SwapError::Internal(format!(
                "record for swap {} appended to {}",
                record.swap_id, swap_id
            )));
        }

        let writer = self.writer(swap_id);
        let mut state = writer.lock().await;
        let path = self.path(swap_id);

        // A failed append may have left part of a line behind
        let on_disk = self.file_len(&path).await?;
        if !state.loaded || on_disk != state.len {
            if state.loaded {
                warn!(
                    "Swap {}: log is {} bytes, expected {}; reloading",
                    swap_id, on_disk, state.len
                );
            }
            let log = self.read_log(swap_id).await?;
            if log.torn {
                self.truncate(&path, log.valid_len).await?;
            }
            state.last_sequence = log.records.last().map(|r| r.sequence);
            state.len = log.valid_len;
            state.loaded = true;
        }

        let expected = state.last_sequence.map_or(0, |s| s + 1);
        if record.sequence != expected {
            return Err(SwapError::SequenceConflict {
                swap_id,
                expected,
                got: record.sequence,
            });
        }

        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        if let Err(e) = self.write_line(&path, &line).await {
            warn!("Swap {}: append of sequence {} failed: {}", swap_id, record.sequence, e);
            if let Err(cleanup) = self.truncate(&path, state.len).await {
                warn!("Swap {}: cannot cut the partial record: {}", swap_id, cleanup);
            }
            state.loaded = false;
            return Err(e);
        }

        state.len += line.len() as u64;
        state.last_sequence = Some(record.sequence);
        debug!(
            "Swap {}: appended {} (sequence {})",
            swap_id, record.state, record.sequence
        );
        Ok(())
    }

    async fn resume(&self, swap_id: Uuid) -> SwapResult<Option<Swap>> {
        let log = self.read_log(swap_id).await?;
        Ok(log.records.into_iter().last().map(|r| r.swap))
    }

    async fn history(&self, swap_id: Uuid) -> SwapResult<Vec<TransitionRecord>> {
        Ok(self.read_log(swap_id).await?.records)
    }

    async fn unfinished(&self) -> SwapResult<Vec<Uuid>> {
        let mut entries = fs::read_dir(&self.dir).await?;
        let mut unfinished = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(swap_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| Uuid::parse_str(s).ok())
            else {
                continue;
            };

            if let Some(swap) = self.resume(swap_id).await? {
                if !swap.state.is_terminal() {
                    unfinished.push(swap_id);
                }
            }
        }

        unfinished.sort();
        Ok(unfinished)
    }

    async fn health_check(&self) -> SwapResult<()> {
        fs::metadata(&self.dir).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{test_swap, SwapRole, SwapState};

    fn advance(swap: &mut Swap, state: SwapState) -> TransitionRecord {
        swap.state = state;
        swap.sequence += 1;
        TransitionRecord::of(swap)
    }

    #[tokio::test]
    async fn test_append_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSwapStore::open(dir.path()).await.unwrap();
        let mut swap = test_swap(SwapRole::Maker);
        let id = swap.uuid;

        store.append(id, &TransitionRecord::of(&swap)).await.unwrap();
        store
            .append(id, &advance(&mut swap, SwapState::Negotiated))
            .await
            .unwrap();

        let resumed = store.resume(id).await.unwrap().unwrap();
        assert_eq!(resumed.state, SwapState::Negotiated);
        assert_eq!(resumed.sequence, 1);
        assert_eq!(resumed.secret, swap.secret);
        assert_eq!(store.history(id).await.unwrap().len(), 2);
        assert_eq!(store.unfinished().await.unwrap(), vec![id]);

        store
            .append(id, &advance(&mut swap, SwapState::Finished))
            .await
            .unwrap();
        assert!(store.unfinished().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sequence_must_follow_last() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSwapStore::open(dir.path()).await.unwrap();
        let mut swap = test_swap(SwapRole::Taker);
        let id = swap.uuid;

        swap.sequence = 1;
        assert!(matches!(
            store.append(id, &TransitionRecord::of(&swap)).await,
            Err(SwapError::SequenceConflict { expected: 0, got: 1, .. })
        ));

        swap.sequence = 0;
        let first = TransitionRecord::of(&swap);
        store.append(id, &first).await.unwrap();
        // Replaying a committed transition never overwrites it
        assert!(store.append(id, &first).await.is_err());
        assert_eq!(store.history(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_torn_tail_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut swap = test_swap(SwapRole::Maker);
        let id = swap.uuid;

        {
            let store = FileSwapStore::open(dir.path()).await.unwrap();
            store.append(id, &TransitionRecord::of(&swap)).await.unwrap();
        }

        // Simulate a crash in the middle of the second append
        let path = dir.path().join(format!("{}.jsonl", id));
        let mut file = OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(b"{\"swap_id\":\"").await.unwrap();
        file.sync_data().await.unwrap();

        let store = FileSwapStore::open(dir.path()).await.unwrap();
        assert_eq!(store.resume(id).await.unwrap().unwrap().sequence, 0);

        store
            .append(id, &advance(&mut swap, SwapState::Negotiated))
            .await
            .unwrap();
        let history = store.history(id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].state, SwapState::Negotiated);
    }

    #[tokio::test]
    async fn test_partial_append_in_running_store_is_cut() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSwapStore::open(dir.path()).await.unwrap();
        let mut swap = test_swap(SwapRole::Taker);
        let id = swap.uuid;
        store.append(id, &TransitionRecord::of(&swap)).await.unwrap();

        // An append that died half way, without the process restarting
        let path = dir.path().join(format!("{}.jsonl", id));
        let mut file = OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(b"{\"swap_id\":\"").await.unwrap();
        file.sync_data().await.unwrap();

        store
            .append(id, &advance(&mut swap, SwapState::Negotiated))
            .await
            .unwrap();

        let resumed = store.resume(id).await.unwrap().unwrap();
        assert_eq!(resumed.sequence, 1);
        assert_eq!(resumed.state, SwapState::Negotiated);
        assert_eq!(store.history(id).await.unwrap().len(), 2);
    }
}
