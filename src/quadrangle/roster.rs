//! Room roster and the membership tracker's full-refresh strategy.
//!
//! Membership changes are low-frequency relative to messages, so the roster
//! has no incremental representation: any participants change event makes
//! the session refetch the full set and replace it wholesale. A burst of N
//! events costs up to N refetches; the property that matters is that the
//! final roster equals the backend's current set.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{ParticipantRole, ParticipantRow};

/// A member of a room's roster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Participant {
    pub room_id: String,
    pub user_id: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub last_read_at: Option<DateTime<Utc>>,
}

impl From<ParticipantRow> for Participant {
    fn from(row: ParticipantRow) -> Self {
        Self {
            room_id: row.room_id,
            user_id: row.user_id,
            role: row.role,
            joined_at: row.joined_at,
            last_read_at: row.last_read_at,
        }
    }
}

/// The current full participant set for one room.
#[derive(Debug)]
pub struct Roster {
    room_id: String,
    participants: Vec<Participant>,
}

impl Roster {
    pub fn new(room_id: &str) -> Self {
        Self {
            room_id: room_id.to_string(),
            participants: Vec::new(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.participants
            .iter()
            .any(|participant| participant.user_id == user_id)
    }

    /// Replace the roster wholesale with a fresh fetch. Rows scoped to a
    /// foreign room are dropped, duplicates collapse to the first row per
    /// user, and the result is ordered by `(joined_at, user_id)`.
    pub fn replace(&mut self, rows: Vec<ParticipantRow>) {
        let mut incoming: Vec<Participant> = rows
            .into_iter()
            .filter(|row| {
                if row.room_id == self.room_id {
                    true
                } else {
                    tracing::warn!(
                        target: "quadrangle::roster::replace",
                        "Dropping participant {} scoped to room {} (roster is for room {})",
                        row.user_id,
                        row.room_id,
                        self.room_id
                    );
                    false
                }
            })
            .map(Participant::from)
            .collect();

        incoming.sort_by(|a, b| {
            (a.joined_at, a.user_id.as_str()).cmp(&(b.joined_at, b.user_id.as_str()))
        });
        let mut seen = HashSet::new();
        incoming.retain(|participant| seen.insert(participant.user_id.clone()));

        self.participants = incoming;
    }
}
