//! Named multi-conversation index with per-conversation serialization (C3).
//!
//! Generalizes [`loom_workspace`]'s SQLite-backed named-workspace index into an
//! in-process registry whose per-name lock doubles as the conversation's
//! [`HistoryStore`] guard: locking the entry's `tokio::sync::Mutex` *is*
//! acquiring the conversation lock, so there is no separate bookkeeping to
//! keep in sync with who currently owns the store.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};

use crate::error::AgentError;
use crate::history_store::{HistoryStore, HistoryStoreError};

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

/// Lightweight metadata view for [`ConversationRegistry::list`].
#[derive(Debug, Clone)]
pub struct ConversationMetadata {
    pub name: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub active_snapshot_name: Option<String>,
}

struct Entry {
    history: Mutex<HistoryStore>,
    created_at: i64,
    updated_at: RwLock<i64>,
}

/// Named conversation index; create/switch/delete/rename; per-conversation lock.
pub struct ConversationRegistry {
    conversations_dir: PathBuf,
    entries: RwLock<HashMap<String, Arc<Entry>>>,
    active: RwLock<Option<String>>,
}

impl ConversationRegistry {
    pub fn new(conversations_dir: impl Into<PathBuf>) -> Self {
        Self {
            conversations_dir: conversations_dir.into(),
            entries: RwLock::new(HashMap::new()),
            active: RwLock::new(None),
        }
    }

    pub async fn list(&self) -> Vec<ConversationMetadata> {
        let entries = self.entries.read().await;
        let mut out = Vec::with_capacity(entries.len());
        for (name, entry) in entries.iter() {
            out.push(ConversationMetadata {
                name: name.clone(),
                created_at: entry.created_at,
                updated_at: *entry.updated_at.read().await,
                active_snapshot_name: None,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Creates `name`, failing with `ConversationExists` if already present.
    /// Loads persisted history from disk if a conversation file exists
    /// (e.g. from a prior process), otherwise starts empty.
    pub async fn create(&self, name: &str) -> Result<(), AgentError> {
        if !is_valid_name(name) {
            return Err(AgentError::Other(format!("invalid conversation name: {name}")));
        }
        let mut entries = self.entries.write().await;
        if entries.contains_key(name) {
            return Err(AgentError::ConversationExists(name.to_string()));
        }
        let history = HistoryStore::load(&self.conversations_dir, name)
            .map_err(|e: HistoryStoreError| AgentError::StorageUnavailable(e.to_string()))?
            .unwrap_or_else(|| HistoryStore::new(&self.conversations_dir, name));
        entries.insert(
            name.to_string(),
            Arc::new(Entry {
                history: Mutex::new(history),
                created_at: now_millis(),
                updated_at: RwLock::new(now_millis()),
            }),
        );
        Ok(())
    }

    /// Makes `name` the default for subsequent unqualified requests.
    pub async fn switch_active(&self, name: &str) -> Result<(), AgentError> {
        let entries = self.entries.read().await;
        if !entries.contains_key(name) {
            return Err(AgentError::ConversationMissing(name.to_string()));
        }
        drop(entries);
        *self.active.write().await = Some(name.to_string());
        Ok(())
    }

    pub async fn active(&self) -> Option<String> {
        self.active.read().await.clone()
    }

    /// Refuses with `ConversationBusy` if a request currently holds the lock.
    pub async fn delete(&self, name: &str) -> Result<(), AgentError> {
        let entries = self.entries.read().await;
        let Some(entry) = entries.get(name) else {
            return Err(AgentError::ConversationMissing(name.to_string()));
        };
        let guard = entry.history.try_lock().map_err(|_| {
            tracing::warn!(conversation = %name, "delete refused, conversation lock held");
            AgentError::ConversationBusy(name.to_string())
        })?;
        drop(guard);
        let entry = Arc::clone(entry);
        drop(entries);

        let mut entries = self.entries.write().await;
        entries.remove(name);
        drop(entries);
        drop(entry);

        let mut active = self.active.write().await;
        if active.as_deref() == Some(name) {
            *active = None;
        }
        Ok(())
    }

    /// Atomically renames `old` to `new`.
    pub async fn rename(&self, old: &str, new: &str) -> Result<(), AgentError> {
        if !is_valid_name(new) {
            return Err(AgentError::Other(format!("invalid conversation name: {new}")));
        }
        let mut entries = self.entries.write().await;
        if !entries.contains_key(old) {
            return Err(AgentError::ConversationMissing(old.to_string()));
        }
        if entries.contains_key(new) {
            return Err(AgentError::ConversationExists(new.to_string()));
        }
        let entry = entries.remove(old).expect("checked above");
        entries.insert(new.to_string(), entry);
        drop(entries);

        let mut active = self.active.write().await;
        if active.as_deref() == Some(old) {
            *active = Some(new.to_string());
        }
        Ok(())
    }

    /// Acquires the conversation's lock (creating it lazily if `create_if_missing`
    /// and absent), invokes `f`, releases the lock. `tokio::sync::Mutex`'s
    /// internal wait queue gives FIFO ordering among waiters, which is what a
    /// fair, serializing per-conversation lock needs.
    pub async fn with_lock<F, Fut, T>(
        &self,
        name: &str,
        create_if_missing: bool,
        f: F,
    ) -> Result<T, AgentError>
    where
        F: FnOnce(&mut HistoryStore) -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let entry = {
            let entries = self.entries.read().await;
            entries.get(name).cloned()
        };
        let entry = match entry {
            Some(entry) => entry,
            None if create_if_missing => {
                self.create(name).await?;
                self.entries
                    .read()
                    .await
                    .get(name)
                    .cloned()
                    .expect("just created")
            }
            None => return Err(AgentError::ConversationMissing(name.to_string())),
        };

        tracing::debug!(conversation = %name, "acquiring conversation lock");
        let mut guard = entry.history.lock().await;
        tracing::debug!(conversation = %name, "conversation lock acquired");
        let result = f(&mut guard).await;
        *entry.updated_at.write().await = now_millis();
        tracing::debug!(conversation = %name, "conversation lock released");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// **Scenario**: create then duplicate create fails with ConversationExists.
    #[tokio::test]
    async fn duplicate_create_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConversationRegistry::new(dir.path());
        registry.create("chat").await.unwrap();
        let err = registry.create("chat").await.unwrap_err();
        assert!(matches!(err, AgentError::ConversationExists(_)));
    }

    /// **Scenario**: switching to a conversation that doesn't exist fails with ConversationMissing.
    #[tokio::test]
    async fn switch_active_missing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConversationRegistry::new(dir.path());
        let err = registry.switch_active("ghost").await.unwrap_err();
        assert!(matches!(err, AgentError::ConversationMissing(_)));
    }

    /// **Scenario**: deleting a conversation while its lock is held fails with ConversationBusy.
    #[tokio::test]
    async fn delete_while_locked_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ConversationRegistry::new(dir.path()));
        registry.create("chat").await.unwrap();

        let registry2 = Arc::clone(&registry);
        let handle = tokio::spawn(async move {
            registry2
                .with_lock("chat", false, |_h| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(())
                })
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let err = registry.delete("chat").await.unwrap_err();
        assert!(matches!(err, AgentError::ConversationBusy(_)));
        handle.await.unwrap().unwrap();
    }

    /// **Scenario**: conversation serialization — concurrent with_lock calls on one
    /// conversation never interleave: each sees the prior call's appended message.
    #[tokio::test]
    async fn same_conversation_requests_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ConversationRegistry::new(dir.path()));
        registry.create("chat").await.unwrap();

        let mut handles = Vec::new();
        for i in 0..5 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry
                    .with_lock("chat", false, move |h| async move {
                        h.append(Message::user(format!("msg-{i}")));
                        Ok::<_, AgentError>(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        registry
            .with_lock("chat", false, |h| async {
                assert_eq!(h.len(), 5);
                Ok(())
            })
            .await
            .unwrap();
    }

    /// **Scenario**: cross-conversation parallelism — two distinct conversations'
    /// with_lock calls run concurrently, not serialized against each other.
    #[tokio::test]
    async fn different_conversations_run_in_parallel() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ConversationRegistry::new(dir.path()));
        registry.create("a").await.unwrap();
        registry.create("b").await.unwrap();

        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for name in ["a", "b"] {
            let registry = Arc::clone(&registry);
            let concurrent = Arc::clone(&concurrent);
            let max_concurrent = Arc::clone(&max_concurrent);
            handles.push(tokio::spawn(async move {
                registry
                    .with_lock(name, false, move |_h| async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_concurrent.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, AgentError>(())
                    })
                    .await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 2);
    }

    /// **Scenario**: rename moves the entry and updates the active pointer if it named the old conversation.
    #[tokio::test]
    async fn rename_updates_active_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ConversationRegistry::new(dir.path());
        registry.create("old").await.unwrap();
        registry.switch_active("old").await.unwrap();
        registry.rename("old", "new").await.unwrap();
        assert_eq!(registry.active().await.as_deref(), Some("new"));
    }
}
