//! Append-only chat log kept by the client, stored as a JSON document.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Entries older than this are dropped when a history file is loaded.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub sender_id: String,
    pub sender_nickname: String,
    pub body: String,
    pub message_id: String,
    pub delivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatHistory {
    pub client_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<HistoryEntry>,
}

impl ChatHistory {
    pub fn new(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            created_at: Utc::now(),
            messages: Vec::new(),
        }
    }

    /// Reads the history at `path`, or starts an empty one when the file does
    /// not exist yet.
    pub fn load_or_new(path: &Path, client_id: &str) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(client_id));
        }
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read chat history {}", path.display()))?;
        let mut history = Self::from_json(&json)
            .with_context(|| format!("failed to parse chat history {}", path.display()))?;
        history.client_id = client_id.to_string();
        Ok(history)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        fs::write(path, self.to_json()?)
            .with_context(|| format!("failed to write chat history {}", path.display()))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize chat history")
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid chat history document")
    }

    pub fn record(
        &mut self,
        sender_id: &str,
        sender_nickname: &str,
        body: &str,
        message_id: &str,
        delivered: bool,
    ) {
        self.messages.push(HistoryEntry {
            timestamp: Utc::now(),
            sender_id: sender_id.to_string(),
            sender_nickname: sender_nickname.to_string(),
            body: body.to_string(),
            message_id: message_id.to_string(),
            delivered,
        });
    }

    pub fn mark_delivered(&mut self, message_id: &str) -> bool {
        match self
            .messages
            .iter_mut()
            .find(|entry| entry.message_id == message_id)
        {
            Some(entry) => {
                entry.delivered = true;
                true
            }
            None => false,
        }
    }

    /// The last `count` entries in insertion order.
    pub fn recent(&self, count: usize) -> &[HistoryEntry] {
        let start = self.messages.len().saturating_sub(count);
        &self.messages[start..]
    }

    /// Drops entries older than `max_age` relative to `now`; returns how many
    /// were removed.
    pub fn prune_older_than(&mut self, now: DateTime<Utc>, max_age: Duration) -> usize {
        let cutoff = now - max_age;
        let before = self.messages.len();
        self.messages.retain(|entry| entry.timestamp >= cutoff);
        before - self.messages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marks_delivery_by_message_id() {
        let mut history = ChatHistory::new("me");
        history.record("me", "alice", "hello", "m1", false);
        history.record("me", "alice", "again", "m2", false);

        assert!(history.mark_delivered("m2"));
        assert!(!history.mark_delivered("missing"));
        assert!(!history.messages[0].delivered);
        assert!(history.messages[1].delivered);
    }

    #[test]
    fn recent_returns_tail_in_order() {
        let mut history = ChatHistory::new("me");
        for id in ["m1", "m2", "m3"] {
            history.record("u1", "bob", id, id, true);
        }
        let ids: Vec<&str> = history
            .recent(2)
            .iter()
            .map(|entry| entry.message_id.as_str())
            .collect();
        assert_eq!(ids, vec!["m2", "m3"]);
        assert_eq!(history.recent(10).len(), 3);
    }

    #[test]
    fn prunes_old_entries() {
        let mut history = ChatHistory::new("me");
        history.record("u1", "bob", "old", "m1", true);
        history.record("u1", "bob", "new", "m2", true);
        history.messages[0].timestamp = Utc::now() - Duration::days(30);

        let removed = history.prune_older_than(Utc::now(), Duration::days(DEFAULT_RETENTION_DAYS));
        assert_eq!(removed, 1);
        assert_eq!(history.messages[0].message_id, "m2");
    }

    #[test]
    fn save_then_load_restores_entries() {
        let dir = tempfile::tempdir().expect("scratch dir");
        let path = dir.path().join("nested").join("history.json");
        let mut history = ChatHistory::new("first-run");
        history.record("me", "alice", "persist me", "m1", true);
        history.save(&path).expect("save history");

        let loaded = ChatHistory::load_or_new(&path, "second-run").expect("load history");
        assert_eq!(loaded.client_id, "second-run");
        assert_eq!(loaded.messages, history.messages);
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().expect("scratch dir");
        let path = dir.path().join("absent.json");
        let history = ChatHistory::load_or_new(&path, "me").expect("empty history");
        assert!(history.messages.is_empty());
        assert_eq!(history.client_id, "me");
    }
}
