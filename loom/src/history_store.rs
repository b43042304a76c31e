//! Per-conversation bounded message history (C2).
//!
//! Snapshot/restore on an on-disk JSON file per conversation (`.conversations/<name>.json`,
//! write-temp-then-rename), adding token-budget truncation and named
//! snapshots. Not internally synchronized — the
//! [`crate::conversation_registry::ConversationRegistry`]'s per-conversation
//! lock is the sole concurrency gate.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::message::{Message, Role};

/// Error from [`HistoryStore`] operations.
#[derive(Debug, thiserror::Error, Clone)]
pub enum HistoryStoreError {
    #[error("history store I/O error: {0}")]
    Io(String),
    #[error("history store serialization error: {0}")]
    Serialization(String),
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),
}

impl From<HistoryStoreError> for crate::error::AgentError {
    fn from(e: HistoryStoreError) -> Self {
        crate::error::AgentError::StorageUnavailable(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ConversationFile {
    name: String,
    created_at: i64,
    updated_at: i64,
    messages: Vec<Message>,
}

/// A named immutable copy of a conversation's messages at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub name: String,
    pub created_at: i64,
    pub messages: Vec<Message>,
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Rough token estimate: 4 characters per token. Pluggable tokenizers can
/// replace this function at the call site without changing the store's shape.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

fn message_tokens(m: &Message) -> usize {
    let content_tokens = m.content.as_deref().map(estimate_tokens).unwrap_or(0);
    let tool_call_tokens = m
        .tool_calls
        .as_ref()
        .map(|calls| {
            calls
                .iter()
                .map(|c| estimate_tokens(&c.arguments.to_string()) + estimate_tokens(&c.tool_name))
                .sum::<usize>()
        })
        .unwrap_or(0);
    content_tokens + tool_call_tokens
}

/// Holds the ordered message list for one conversation, backed by a JSON file.
pub struct HistoryStore {
    conversations_dir: PathBuf,
    name: String,
    created_at: i64,
    messages: Vec<Message>,
}

impl HistoryStore {
    /// Creates an empty, unpersisted store for `name`.
    pub fn new(conversations_dir: impl AsRef<Path>, name: impl Into<String>) -> Self {
        Self {
            conversations_dir: conversations_dir.as_ref().to_path_buf(),
            name: name.into(),
            created_at: now_millis(),
            messages: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn file_path(&self) -> PathBuf {
        self.conversations_dir.join(format!("{}.json", self.name))
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.conversations_dir.join(format!("{}.snapshots", self.name))
    }

    /// Appends a message and returns the new history length.
    pub fn append(&mut self, message: Message) -> usize {
        self.messages.push(message);
        self.messages.len()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// All messages, unbudgeted. Mostly useful for tests and snapshot/restore.
    pub fn all_messages(&self) -> &[Message] {
        &self.messages
    }

    /// Returns the latest-suffix of history fitting within `budget` estimated
    /// tokens. Always includes the leading system message (if present) and
    /// never splits a tool call from its tool result; drops whole
    /// (user, assistant-chain) units from the oldest end. If no suffix of
    /// whole units fits, falls back to system + last user message +
    /// truncation marker.
    pub fn messages(&self, budget: usize) -> Vec<Message> {
        let system = self.messages.first().filter(|m| m.role == Role::System);
        let rest_start = if system.is_some() { 1 } else { 0 };
        let rest = &self.messages[rest_start..];

        let units = Self::group_into_turns(rest);
        let system_tokens = system.map(message_tokens).unwrap_or(0);

        let mut kept_units: Vec<&[Message]> = Vec::new();
        let mut used = system_tokens;
        for unit in units.iter().rev() {
            let unit_tokens: usize = unit.iter().map(message_tokens).sum();
            if used + unit_tokens > budget && !kept_units.is_empty() {
                break;
            }
            if used + unit_tokens > budget && kept_units.is_empty() {
                // Doesn't even fit alone; stop here, minimal fallback below decides.
                break;
            }
            used += unit_tokens;
            kept_units.push(unit);
        }
        kept_units.reverse();

        let dropped = units.len() - kept_units.len();

        let mut out = Vec::new();
        if let Some(sys) = system {
            out.push(sys.clone());
        }

        if kept_units.is_empty() {
            // Minimal fallback: system + last user message + marker.
            if let Some(last_user) = rest.iter().rev().find(|m| m.role == Role::User) {
                out.push(Message::system(format!("[truncated {dropped} earlier turns]")));
                out.push(last_user.clone());
            }
            return out;
        }

        if dropped > 0 {
            out.push(Message::system(format!("[truncated {dropped} earlier turns]")));
        }
        for unit in kept_units {
            out.extend_from_slice(unit);
        }
        out
    }

    /// Groups a flat message slice into turn units: each unit starts at a
    /// `role=user` message (or, for any messages before the first user
    /// message, forms a leading unit) and runs through the following
    /// assistant/tool messages up to (not including) the next user message.
    /// This keeps every tool-call/tool-result pair inside one unit.
    fn group_into_turns(messages: &[Message]) -> Vec<&[Message]> {
        let mut units = Vec::new();
        let mut start = 0usize;
        for (i, m) in messages.iter().enumerate() {
            if m.role == Role::User && i != start {
                units.push(&messages[start..i]);
                start = i;
            }
        }
        if start < messages.len() {
            units.push(&messages[start..]);
        }
        units
    }

    /// Removes all messages.
    pub fn clear(&mut self) {
        self.messages.clear();
    }

    /// Replaces the current message list with a snapshot's content.
    pub fn restore(&mut self, snapshot_name: &str) -> Result<(), HistoryStoreError> {
        let path = self.snapshots_dir().join(format!("{snapshot_name}.json"));
        let bytes = std::fs::read(&path)
            .map_err(|_| HistoryStoreError::SnapshotNotFound(snapshot_name.to_string()))?;
        let snapshot: HistorySnapshot = serde_json::from_slice(&bytes)
            .map_err(|e| HistoryStoreError::Serialization(e.to_string()))?;
        self.messages = snapshot.messages;
        Ok(())
    }

    /// Writes a named immutable copy of the current messages.
    pub fn snapshot(&self, snapshot_name: &str) -> Result<(), HistoryStoreError> {
        let dir = self.snapshots_dir();
        std::fs::create_dir_all(&dir).map_err(|e| HistoryStoreError::Io(e.to_string()))?;
        let snapshot = HistorySnapshot {
            name: snapshot_name.to_string(),
            created_at: now_millis(),
            messages: self.messages.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| HistoryStoreError::Serialization(e.to_string()))?;
        write_atomic(&dir.join(format!("{snapshot_name}.json")), &bytes, &dir)
    }

    pub fn list_snapshots(&self) -> Result<Vec<String>, HistoryStoreError> {
        let dir = self.snapshots_dir();
        let mut names = Vec::new();
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Ok(names);
        };
        for entry in entries.flatten() {
            if let Some(stem) = entry.path().file_stem().and_then(|s| s.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn delete_snapshot(&self, snapshot_name: &str) -> Result<(), HistoryStoreError> {
        let path = self.snapshots_dir().join(format!("{snapshot_name}.json"));
        std::fs::remove_file(&path)
            .map_err(|_| HistoryStoreError::SnapshotNotFound(snapshot_name.to_string()))
    }

    /// Atomically serializes the conversation to its single on-disk file.
    pub fn persist(&self) -> Result<(), HistoryStoreError> {
        std::fs::create_dir_all(&self.conversations_dir)
            .map_err(|e| HistoryStoreError::Io(e.to_string()))?;
        let file = ConversationFile {
            name: self.name.clone(),
            created_at: self.created_at,
            updated_at: now_millis(),
            messages: self.messages.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| HistoryStoreError::Serialization(e.to_string()))?;
        write_atomic(&self.file_path(), &bytes, &self.conversations_dir)
    }

    /// Loads a conversation from disk; returns `Ok(None)` if no file exists yet.
    pub fn load(
        conversations_dir: impl AsRef<Path>,
        name: impl Into<String>,
    ) -> Result<Option<Self>, HistoryStoreError> {
        let conversations_dir = conversations_dir.as_ref().to_path_buf();
        let name = name.into();
        let path = conversations_dir.join(format!("{name}.json"));
        match std::fs::read(&path) {
            Ok(bytes) => {
                let file: ConversationFile = serde_json::from_slice(&bytes)
                    .map_err(|e| HistoryStoreError::Serialization(e.to_string()))?;
                Ok(Some(Self {
                    conversations_dir,
                    name: file.name,
                    created_at: file.created_at,
                    messages: file.messages,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HistoryStoreError::Io(e.to_string())),
        }
    }
}

fn write_atomic(path: &Path, bytes: &[u8], dir_for_tmp: &Path) -> Result<(), HistoryStoreError> {
    use std::io::Write;
    let mut tmp = tempfile::NamedTempFile::new_in(dir_for_tmp)
        .map_err(|e| HistoryStoreError::Io(e.to_string()))?;
    tmp.write_all(bytes)
        .map_err(|e| HistoryStoreError::Io(e.to_string()))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| HistoryStoreError::Io(e.to_string()))?;
    tmp.persist(path)
        .map_err(|e| HistoryStoreError::Io(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolCall;

    fn with_tool_turn(store: &mut HistoryStore) {
        store.append(Message::user("hi"));
        store.append(Message::assistant_with_tool_calls(
            None,
            vec![ToolCall {
                call_id: "c1".into(),
                tool_name: "now".into(),
                arguments: serde_json::json!({}),
            }],
        ));
        store.append(Message::tool_result("c1", "2031-06-14T12:00:00Z"));
        store.append(Message::assistant("It is noon."));
    }

    /// **Scenario**: append returns the running length.
    #[test]
    fn append_returns_new_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::new(dir.path(), "chat");
        assert_eq!(store.append(Message::user("hi")), 1);
        assert_eq!(store.append(Message::assistant("hello")), 2);
    }

    /// **Scenario**: snapshot round-trip — snapshot, append, restore leaves history equal to the snapshot.
    #[test]
    fn snapshot_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::new(dir.path(), "chat");
        store.append(Message::user("first"));
        store.snapshot("n1").unwrap();
        store.append(Message::assistant("second"));
        assert_eq!(store.len(), 2);
        store.restore("n1").unwrap();
        assert_eq!(store.all_messages().len(), 1);
        assert_eq!(store.all_messages()[0].content.as_deref(), Some("first"));
    }

    /// **Scenario**: persist then load round-trips the full conversation.
    #[test]
    fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::new(dir.path(), "chat");
        store.append(Message::user("hi"));
        store.append(Message::assistant("hello"));
        store.persist().unwrap();

        let loaded = HistoryStore::load(dir.path(), "chat").unwrap().unwrap();
        assert_eq!(loaded.all_messages().len(), 2);
        assert_eq!(loaded.name(), "chat");
    }

    /// **Scenario**: loading a conversation that was never persisted returns None.
    #[test]
    fn load_missing_conversation_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(HistoryStore::load(dir.path(), "nope").unwrap().is_none());
    }

    /// **Scenario**: a large budget returns the full history unmodified.
    #[test]
    fn messages_with_ample_budget_returns_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::new(dir.path(), "chat");
        with_tool_turn(&mut store);
        let out = store.messages(10_000);
        assert_eq!(out.len(), 4);
    }

    /// **Scenario**: a tool call and its tool result are never split by truncation.
    #[test]
    fn truncation_never_splits_tool_call_from_result() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::new(dir.path(), "chat");
        store.append(Message::system("sys"));
        // Two user turns; make the first one large enough to be dropped under a tight budget.
        store.append(Message::user("a".repeat(400)));
        store.append(Message::assistant_with_tool_calls(
            None,
            vec![ToolCall {
                call_id: "c1".into(),
                tool_name: "now".into(),
                arguments: serde_json::json!({}),
            }],
        ));
        store.append(Message::tool_result("c1", "result-1"));
        store.append(Message::user("second turn"));
        store.append(Message::assistant("done"));

        let out = store.messages(40);
        // Must never contain a lone tool message without its preceding tool call.
        let has_orphan_tool = out.iter().any(|m| {
            m.role == Role::Tool
                && !out.iter().any(|other| {
                    other
                        .tool_calls
                        .as_ref()
                        .is_some_and(|calls| calls.iter().any(|c| Some(c.call_id.as_str()) == m.tool_call_id.as_deref()))
                })
        });
        assert!(!has_orphan_tool);
    }

    /// **Scenario**: when nothing fits, the fallback is system + last user message + marker.
    #[test]
    fn impossible_budget_falls_back_to_system_and_last_user() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::new(dir.path(), "chat");
        store.append(Message::system("sys"));
        store.append(Message::user("a".repeat(4000)));
        store.append(Message::assistant("reply"));
        store.append(Message::user("final question"));

        let out = store.messages(5);
        assert_eq!(out[0].role, Role::System);
        assert!(out.iter().any(|m| m.content.as_deref() == Some("final question")));
    }

    /// **Scenario**: estimate_tokens approximates 4 characters per token.
    #[test]
    fn estimate_tokens_is_four_chars_per_token() {
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }

    /// **Scenario**: clear removes all messages but leaves the store usable.
    #[test]
    fn clear_empties_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::new(dir.path(), "chat");
        store.append(Message::user("hi"));
        store.clear();
        assert!(store.is_empty());
    }

    /// **Scenario**: deleting a snapshot that doesn't exist reports SnapshotNotFound.
    #[test]
    fn delete_missing_snapshot_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::new(dir.path(), "chat");
        let err = store.delete_snapshot("ghost").unwrap_err();
        assert!(matches!(err, HistoryStoreError::SnapshotNotFound(_)));
    }
}
