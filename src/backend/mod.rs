//! Collaborator interface to the managed backend.
//!
//! The sync core never talks to a concrete data-access client; everything it
//! needs from the platform backend is expressed here and injected at
//! initialization, which keeps teardown deterministic and lets tests run
//! against in-memory doubles.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{MessageRow, ParticipantRow, UserProfile};

/// Ceiling for a single outbound attachment, enforced before any network call.
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Request rejected: {0}")]
    Rejected(String),
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// File payload attached to an outbound message. Upload mechanics belong to
/// the backend; the core only validates and forwards it.
#[derive(Clone)]
pub struct OutboundAttachment {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl OutboundAttachment {
    pub fn byte_len(&self) -> u64 {
        self.bytes.len() as u64
    }
}

impl std::fmt::Debug for OutboundAttachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundAttachment")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("bytes", &format!("<{} bytes>", self.bytes.len()))
            .finish()
    }
}

/// A new message to submit. At least one of trimmed `content` or
/// `attachment` must be present; the session validates before sending.
#[derive(Debug, Clone, Default)]
pub struct OutboundMessage {
    pub content: Option<String>,
    pub attachment: Option<OutboundAttachment>,
}

impl OutboundMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            attachment: None,
        }
    }
}

/// The backend operations this subsystem calls into.
///
/// Implementations wrap the platform's data-access client. All methods are
/// room- or id-scoped; none of them may mutate cross-room client state.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Full ordered message history for a room, ascending by `(created_at, id)`.
    /// Fetched in full on every room open; history is not paginated.
    async fn fetch_messages(&self, room_id: &str) -> Result<Vec<MessageRow>>;

    /// Current full participant set for a room.
    async fn fetch_participants(&self, room_id: &str) -> Result<Vec<ParticipantRow>>;

    /// Persist a new message and return the stored row. The caller relies on
    /// the change feed to mirror the row back into the log.
    async fn send_message(&self, room_id: &str, outbound: OutboundMessage) -> Result<MessageRow>;

    /// Advance the caller's last-read marker for a room.
    async fn mark_room_read(&self, room_id: &str) -> Result<()>;

    /// Delete a message. Returns `true` when the backend confirmed the delete.
    async fn delete_message(&self, message_id: &str) -> Result<bool>;

    /// Look up a user's profile. `Ok(None)` means the user has none.
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;
}
