//! Append-only write-ahead-log checkpoint store (C1).
//!
//! Layout under a workspace root's `.checkpoints/` directory:
//!
//! - `wal/<seq>.entry` — one file per WAL entry, append-only, never mutated.
//! - `latest/<taskId>.ptr` — the WAL sequence number of the task's latest valid
//!   checkpoint, swapped in with write-temp-then-rename so the pointer update
//!   is atomic.
//! - `manifest.json` — rebuilt on demand by [`CheckpointStore::recover`]; not a
//!   source of truth, only a convenience snapshot.
//!
//! A plain append-only directory rather than a database file, so the WAL
//! stays inspectable and recoverable without a database engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Error from [`CheckpointStore`] operations.
#[derive(Debug, thiserror::Error, Clone)]
pub enum CheckpointError {
    #[error("checkpoint storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("checkpoint serialization error: {0}")]
    Serialization(String),
    #[error("no checkpoint found for task {0}")]
    NotFound(String),
}

impl From<CheckpointError> for crate::error::AgentError {
    fn from(e: CheckpointError) -> Self {
        crate::error::AgentError::StorageUnavailable(e.to_string())
    }
}

/// One checkpoint in a task's chain. `state` is opaque to the store — it is
/// whatever the task's own serializer produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub task_id: String,
    pub sequence_number: u64,
    pub state: serde_json::Value,
    pub created_at: i64,
    pub parent_checkpoint_id: Option<String>,
}

impl CheckpointRecord {
    pub fn checkpoint_id(&self) -> String {
        format!("{}-{}", self.task_id, self.sequence_number)
    }

    fn is_running(&self) -> bool {
        self.state
            .get("status")
            .and_then(|v| v.as_str())
            .map(|s| s == "running")
            .unwrap_or(false)
    }
}

/// Process-wide index of tasks whose latest on-disk checkpoint is `running`
/// but whose owning process is gone — built fresh by [`CheckpointStore::recover`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoveryManifest {
    pub task_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WalEntry {
    record: CheckpointRecord,
    checksum: u32,
}

fn crc32(bytes: &[u8]) -> u32 {
    // Plain bit-by-bit CRC-32 (IEEE 802.3 polynomial). Checkpoint writes are
    // infrequent (interval-gated), so a table isn't worth the code.
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in bytes {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// File-based append-only checkpoint store.
///
/// Per-task writes must be serialized by the caller (exactly one writer per
/// task's WAL); this type itself only guarantees that the global sequence
/// counter and the per-task pointer swap are atomic.
pub struct CheckpointStore {
    root: PathBuf,
    next_seq: AtomicU64,
    // Tracks each task's known-good sequence chain so a checksum-mismatched
    // pointer can fall back to the previous entry.
    chains: Mutex<HashMap<String, Vec<u64>>>,
}

impl CheckpointStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join("wal"))
            .map_err(|e| CheckpointError::StorageUnavailable(e.to_string()))?;
        std::fs::create_dir_all(root.join("latest"))
            .map_err(|e| CheckpointError::StorageUnavailable(e.to_string()))?;
        let next_seq = Self::scan_max_seq(&root)?.saturating_add(1);
        let chains = Self::scan_chains(&root);
        Ok(Self {
            root,
            next_seq: AtomicU64::new(next_seq),
            chains: Mutex::new(chains),
        })
    }

    fn scan_max_seq(root: &Path) -> Result<u64, CheckpointError> {
        let wal_dir = root.join("wal");
        let mut max = 0u64;
        if let Ok(entries) = std::fs::read_dir(&wal_dir) {
            for entry in entries.flatten() {
                if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                    if let Ok(seq) = stem.parse::<u64>() {
                        max = max.max(seq);
                    }
                }
            }
        }
        Ok(max)
    }

    /// Rebuilds the in-memory per-task chain map from `wal/*.entry` so that
    /// [`Self::latest_for_task`]'s corrupt-pointer fallback works across a
    /// process restart, not only for entries appended this process.
    /// Entries that fail their checksum are skipped — they're useless as a
    /// fallback target anyway.
    fn scan_chains(root: &Path) -> HashMap<String, Vec<u64>> {
        let mut chains: HashMap<String, Vec<u64>> = HashMap::new();
        let wal_dir = root.join("wal");
        let Ok(entries) = std::fs::read_dir(&wal_dir) else {
            return chains;
        };
        let mut seqs: Vec<u64> = entries
            .flatten()
            .filter_map(|entry| {
                entry
                    .path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u64>().ok())
            })
            .collect();
        seqs.sort_unstable();
        for seq in seqs {
            let path = root.join("wal").join(format!("{seq}.entry"));
            let Ok(bytes) = std::fs::read(&path) else {
                continue;
            };
            let Ok(entry) = serde_json::from_slice::<WalEntry>(&bytes) else {
                continue;
            };
            let Ok(payload) = serde_json::to_vec(&entry.record) else {
                continue;
            };
            if crc32(&payload) != entry.checksum {
                continue;
            }
            chains.entry(entry.record.task_id).or_default().push(seq);
        }
        chains
    }

    fn wal_path(&self, seq: u64) -> PathBuf {
        self.root.join("wal").join(format!("{seq}.entry"))
    }

    fn ptr_path(&self, task_id: &str) -> PathBuf {
        self.root.join("latest").join(format!("{task_id}.ptr"))
    }

    /// Writes `record` durably, then atomically updates the per-task
    /// latest-pointer. On return, a crash preserves the record.
    pub async fn append(&self, mut record: CheckpointRecord) -> Result<String, CheckpointError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        record.sequence_number = seq;
        if record.created_at == 0 {
            record.created_at = now_millis();
        }
        let task_id = record.task_id.clone();
        let checkpoint_id = record.checkpoint_id();

        let payload = serde_json::to_vec(&record)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        let checksum = crc32(&payload);
        let entry = WalEntry { record, checksum };
        let entry_bytes = serde_json::to_vec(&entry)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;

        let wal_path = self.wal_path(seq);
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || write_durable(&wal_path, &entry_bytes))
            .await
            .map_err(|e| CheckpointError::StorageUnavailable(e.to_string()))??;

        let ptr_path = self.ptr_path(&task_id);
        let seq_text = seq.to_string();
        tokio::task::spawn_blocking(move || write_atomic(&ptr_path, seq_text.as_bytes(), &root))
            .await
            .map_err(|e| CheckpointError::StorageUnavailable(e.to_string()))??;

        let mut chains = self.chains.lock().await;
        chains.entry(task_id.clone()).or_default().push(seq);
        drop(chains);

        tracing::debug!(task_id = %task_id, sequence_number = seq, "checkpoint appended to wal");
        Ok(checkpoint_id)
    }

    fn read_entry(&self, seq: u64) -> Option<CheckpointRecord> {
        let bytes = std::fs::read(self.wal_path(seq)).ok()?;
        let entry: WalEntry = serde_json::from_slice(&bytes).ok()?;
        let payload = serde_json::to_vec(&entry.record).ok()?;
        if crc32(&payload) != entry.checksum {
            return None;
        }
        Some(entry.record)
    }

    /// O(1) read of the latest-pointer, falling back through the task's
    /// known chain if the pointed-to entry fails its checksum.
    pub async fn latest_for_task(
        &self,
        task_id: &str,
    ) -> Result<Option<CheckpointRecord>, CheckpointError> {
        let ptr_path = self.ptr_path(task_id);
        let pointed_seq: Option<u64> = match std::fs::read_to_string(&ptr_path) {
            Ok(s) => s.trim().parse().ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(CheckpointError::StorageUnavailable(e.to_string())),
        };

        let Some(seq) = pointed_seq else {
            return Ok(None);
        };
        if let Some(record) = self.read_entry(seq) {
            return Ok(Some(record));
        }

        // Pointer names a corrupt entry: walk the known chain backward.
        tracing::warn!(task_id = %task_id, sequence_number = seq, "checkpoint pointer names a corrupt entry, falling back through chain");
        let chains = self.chains.lock().await;
        if let Some(seqs) = chains.get(task_id) {
            for &candidate in seqs.iter().rev() {
                if candidate == seq {
                    continue;
                }
                if let Some(record) = self.read_entry(candidate) {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    /// Scans the directory and returns every task whose latest valid record
    /// reports `status=running`.
    pub fn recover(&self) -> Result<RecoveryManifest, CheckpointError> {
        let latest_dir = self.root.join("latest");
        let mut task_ids = Vec::new();
        let entries = std::fs::read_dir(&latest_dir)
            .map_err(|e| CheckpointError::StorageUnavailable(e.to_string()))?;
        for entry in entries.flatten() {
            let Some(task_id) = entry
                .path()
                .file_stem()
                .and_then(|s| s.to_str())
                .map(String::from)
            else {
                continue;
            };
            let Ok(seq_text) = std::fs::read_to_string(entry.path()) else {
                continue;
            };
            let Ok(seq) = seq_text.trim().parse::<u64>() else {
                continue;
            };
            if let Some(record) = self.read_entry(seq) {
                if record.is_running() {
                    task_ids.push(task_id);
                }
            }
        }
        Ok(RecoveryManifest { task_ids })
    }

    /// Deletes checkpoint records for `task_id` older than the latest minus
    /// `retain` records. Returns the number of records removed.
    pub async fn compact(&self, task_id: &str, retain: usize) -> Result<usize, CheckpointError> {
        let mut chains = self.chains.lock().await;
        let seqs = chains.entry(task_id.to_string()).or_default();
        if seqs.len() <= retain {
            return Ok(0);
        }
        seqs.sort_unstable();
        let drop_count = seqs.len() - retain;
        let to_drop: Vec<u64> = seqs.drain(0..drop_count).collect();
        for seq in &to_drop {
            let _ = std::fs::remove_file(self.wal_path(*seq));
        }
        Ok(to_drop.len())
    }

    /// Removes all records and the latest-pointer for a completed task.
    pub async fn purge_task(&self, task_id: &str) -> Result<(), CheckpointError> {
        let mut chains = self.chains.lock().await;
        if let Some(seqs) = chains.remove(task_id) {
            for seq in seqs {
                let _ = std::fs::remove_file(self.wal_path(seq));
            }
        }
        let _ = std::fs::remove_file(self.ptr_path(task_id));
        Ok(())
    }
}

fn write_durable(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    use std::io::Write;
    let mut file = std::fs::File::create(path)
        .map_err(|e| CheckpointError::StorageUnavailable(e.to_string()))?;
    file.write_all(bytes)
        .map_err(|e| CheckpointError::StorageUnavailable(e.to_string()))?;
    file.sync_all()
        .map_err(|e| CheckpointError::StorageUnavailable(e.to_string()))?;
    Ok(())
}

fn write_atomic(path: &Path, bytes: &[u8], dir_for_tmp: &Path) -> Result<(), CheckpointError> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir_for_tmp)
        .map_err(|e| CheckpointError::StorageUnavailable(e.to_string()))?;
    use std::io::Write;
    tmp.write_all(bytes)
        .map_err(|e| CheckpointError::StorageUnavailable(e.to_string()))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| CheckpointError::StorageUnavailable(e.to_string()))?;
    tmp.persist(path)
        .map_err(|e| CheckpointError::StorageUnavailable(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(task_id: &str, status: &str) -> CheckpointRecord {
        CheckpointRecord {
            task_id: task_id.to_string(),
            sequence_number: 0,
            state: serde_json::json!({ "status": status, "n": 1 }),
            created_at: 0,
            parent_checkpoint_id: None,
        }
    }

    /// **Scenario**: checkpoint durability — append then latestForTask returns it.
    #[tokio::test]
    async fn append_then_latest_returns_same_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.append(record("t1", "running")).await.unwrap();
        let latest = store.latest_for_task("t1").await.unwrap().unwrap();
        assert_eq!(latest.state["n"], 1);
    }

    /// **Scenario**: sequence numbers are monotonic and never repeat across appends.
    #[tokio::test]
    async fn sequence_numbers_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        let id1 = store.append(record("t1", "running")).await.unwrap();
        let id2 = store.append(record("t1", "running")).await.unwrap();
        assert_ne!(id1, id2);
        let latest = store.latest_for_task("t1").await.unwrap().unwrap();
        assert_eq!(latest.sequence_number, 1);
    }

    /// **Scenario**: recover() surfaces only tasks whose latest record is running.
    #[tokio::test]
    async fn recover_returns_only_running_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.append(record("running-task", "running")).await.unwrap();
        store.append(record("done-task", "succeeded")).await.unwrap();
        let manifest = store.recover().unwrap();
        assert!(manifest.task_ids.contains(&"running-task".to_string()));
        assert!(!manifest.task_ids.contains(&"done-task".to_string()));
    }

    /// **Scenario**: a checksum-corrupted latest entry falls back to the prior chain entry.
    #[tokio::test]
    async fn corrupt_latest_entry_falls_back_to_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.append(record("t1", "running")).await.unwrap();
        let second_id = store.append(record("t1", "running")).await.unwrap();
        // Corrupt the latest WAL entry in place (never "mutated" by the store itself).
        let seq: u64 = second_id.rsplit('-').next().unwrap().parse().unwrap();
        std::fs::write(store.wal_path(seq), b"not json").unwrap();

        let latest = store.latest_for_task("t1").await.unwrap().unwrap();
        assert_eq!(latest.sequence_number, 0);
    }

    /// **Scenario**: compact retains only the most recent N records for a task.
    #[tokio::test]
    async fn compact_retains_only_latest_n() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        for _ in 0..5 {
            store.append(record("t1", "running")).await.unwrap();
        }
        let removed = store.compact("t1", 2).await.unwrap();
        assert_eq!(removed, 3);
    }

    /// **Scenario**: after dropping and reopening the store (simulating a process
    /// restart), a corrupted latest entry still falls back through the chain —
    /// `new()` must rebuild `chains` from the on-disk WAL, not only track
    /// entries appended by the live process.
    #[tokio::test]
    async fn chains_survive_reopen_and_corrupt_fallback_still_works() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = CheckpointStore::new(dir.path()).unwrap();
            store.append(record("t1", "running")).await.unwrap();
            store.append(record("t1", "running")).await.unwrap();
        }

        // Corrupt the latest entry out-of-process, then reopen fresh.
        let reopened = CheckpointStore::new(dir.path()).unwrap();
        std::fs::write(reopened.wal_path(1), b"not json").unwrap();

        let latest = reopened.latest_for_task("t1").await.unwrap().unwrap();
        assert_eq!(latest.sequence_number, 0);
    }

    /// **Scenario**: purging a task removes its pointer so latestForTask returns None.
    #[tokio::test]
    async fn purge_task_clears_latest_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.append(record("t1", "succeeded")).await.unwrap();
        store.purge_task("t1").await.unwrap();
        assert!(store.latest_for_task("t1").await.unwrap().is_none());
    }
}
