//! The reconciliation engine: one room's deduplicated, ordered message log.
//!
//! The log merges the open-time snapshot with live change-feed events into a
//! single in-memory sequence. It is built for the feed's real delivery
//! semantics: events may arrive before, during, or after the snapshot
//! resolves, may be duplicated, and may be out of order. Invariants held
//! after every operation: no two entries share an id; the materialized
//! sequence is ascending by `(created_at, id)`; no entry belongs to a
//! foreign room; applying the same event twice is a no-op.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attachments::{self, Attachment};
use crate::types::{MessageRow, UserProfile};

/// Sender identity attached to a log entry.
///
/// Starts as a placeholder carrying only the raw author id; the enrichment
/// pipeline fills in the profile fields when (and if) the lookup resolves.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sender {
    pub user_id: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
}

impl Sender {
    pub fn placeholder(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: None,
            avatar_url: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.display_name.is_some() || self.avatar_url.is_some()
    }

    pub(crate) fn resolve(&mut self, profile: &UserProfile) {
        self.display_name = profile.display_name.clone();
        self.avatar_url = profile.avatar_url.clone();
    }

    /// Name shown in the UI; falls back to a short form of the raw author id.
    pub fn display_label(&self) -> String {
        match &self.display_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => self.user_id.chars().take(8).collect(),
        }
    }
}

/// A message entry as materialized for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub sender: Sender,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
}

impl ChatMessage {
    fn from_row(row: &MessageRow) -> Self {
        Self {
            id: row.id.clone(),
            room_id: row.room_id.clone(),
            sender: Sender::placeholder(&row.user_id),
            content: row.content.clone().unwrap_or_default(),
            attachments: attachments::decode_attachments(&row.attachments),
            created_at: row.created_at,
            edited_at: row.edited_at,
        }
    }

    /// Position key: ascending `(created_at, id)`, the id breaking timestamp ties.
    fn log_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

/// Outcome of applying one change to the log. `Ignored` covers duplicate
/// inserts, unknown-id updates/deletes, and foreign-room rows.
#[derive(Debug, Clone, PartialEq)]
pub enum LogMutation {
    Inserted(ChatMessage),
    Updated(ChatMessage),
    Removed(ChatMessage),
    Ignored,
}

/// One room's message log. Created empty at room open, seeded by the
/// snapshot, mutated only through the operations below, discarded in full
/// when the room is closed or switched away from.
#[derive(Debug)]
pub struct MessageLog {
    room_id: String,
    ids: HashSet<String>,
    entries: Vec<ChatMessage>,
}

impl MessageLog {
    pub fn new(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            ids: HashSet::new(),
            entries: Vec::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.ids.contains(message_id)
    }

    /// The materialized sequence, ascending by `(created_at, id)`.
    pub fn messages(&self) -> &[ChatMessage] {
        &self.entries
    }

    /// Apply an insert. Duplicate delivery of an already-present id is a
    /// no-op; a row for a foreign room is dropped. The common case appends,
    /// but arrival order is untrusted so the position is always found by
    /// `(created_at, id)`.
    pub fn insert(&mut self, row: &MessageRow) -> LogMutation {
        if row.room_id != self.room_id {
            tracing::warn!(
                target: "quadrangle::message_log::insert",
                "Dropping message {} scoped to room {} (log is for room {})",
                row.id,
                row.room_id,
                self.room_id
            );
            return LogMutation::Ignored;
        }
        if self.ids.contains(&row.id) {
            return LogMutation::Ignored;
        }

        let entry = ChatMessage::from_row(row);
        let at = self
            .entries
            .partition_point(|existing| existing.log_key() < entry.log_key());
        self.ids.insert(entry.id.clone());
        self.entries.insert(at, entry.clone());
        LogMutation::Inserted(entry)
    }

    /// Apply an update by merging the mutable fields into the existing
    /// entry. An update for an id the log has never seen is discarded, not
    /// queued. Edits do not re-timestamp: the position stays keyed on
    /// `created_at`.
    pub fn update(&mut self, row: &MessageRow) -> LogMutation {
        let Some(entry) = self.entries.iter_mut().find(|entry| entry.id == row.id) else {
            return LogMutation::Ignored;
        };

        entry.content = row.content.clone().unwrap_or_default();
        entry.attachments = attachments::decode_attachments(&row.attachments);
        entry.edited_at = row.edited_at;
        LogMutation::Updated(entry.clone())
    }

    /// Remove an entry. Unknown ids are a no-op.
    pub fn remove(&mut self, message_id: &str) -> LogMutation {
        let Some(at) = self.entries.iter().position(|entry| entry.id == message_id) else {
            return LogMutation::Ignored;
        };
        self.ids.remove(message_id);
        LogMutation::Removed(self.entries.remove(at))
    }

    /// Seed the log from a snapshot using the same insert semantics as the
    /// live feed, so events that raced ahead of the fetch are neither lost
    /// nor duplicated. Returns the entries that were actually inserted.
    pub fn merge_snapshot(&mut self, rows: &[MessageRow]) -> Vec<ChatMessage> {
        let mut inserted = Vec::new();
        for row in rows {
            if let LogMutation::Inserted(entry) = self.insert(row) {
                inserted.push(entry);
            }
        }
        inserted
    }

    /// Reconcile against a fresh snapshot: insert-merge the rows, then drop
    /// entries the snapshot no longer contains. Used after a change-feed
    /// connection is resumed, where deletes may have been missed entirely.
    pub fn reconcile(&mut self, rows: &[MessageRow]) -> (Vec<ChatMessage>, Vec<ChatMessage>) {
        let keep: HashSet<&str> = rows.iter().map(|row| row.id.as_str()).collect();

        let mut removed = Vec::new();
        let mut at = 0;
        while at < self.entries.len() {
            if keep.contains(self.entries[at].id.as_str()) {
                at += 1;
            } else {
                removed.push(self.entries.remove(at));
            }
        }
        for entry in &removed {
            self.ids.remove(&entry.id);
        }

        let inserted = self.merge_snapshot(rows);
        (inserted, removed)
    }

    /// Attach a resolved profile to one entry's sender fields. Returns the
    /// updated entry, or `None` when the entry is gone (deleted while the
    /// lookup was in flight).
    pub(crate) fn apply_profile(
        &mut self,
        message_id: &str,
        profile: &UserProfile,
    ) -> Option<ChatMessage> {
        let entry = self.entries.iter_mut().find(|entry| entry.id == message_id)?;
        entry.sender.resolve(profile);
        Some(entry.clone())
    }
}
