//! Wire row types shared by the backend interface and the change feed.
//!
//! These structs mirror the server's row shapes exactly; everything the
//! client derives from them (decoded attachments, resolved senders, the
//! ordered log) lives in the `quadrangle` module tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A message row as stored by the backend and mirrored over the change feed.
///
/// `attachments` is carried raw: depending on the writer it arrives as a
/// native JSON array, a JSON-encoded string, or null. Only the attachment
/// codec turns it into descriptors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub user_id: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub attachments: Value,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
}

/// Role of a room participant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Member,
    Admin,
}

/// A participant row as stored by the backend and mirrored over the change feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParticipantRow {
    pub room_id: String,
    pub user_id: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    #[serde(default)]
    pub last_read_at: Option<DateTime<Utc>>,
}

/// Profile data returned by the collaborator profile lookup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}
