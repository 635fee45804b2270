use thiserror::Error;

use crate::backend::BackendError;
use crate::feed::FeedError;

pub type Result<T> = core::result::Result<T, QuadrangleError>;

#[derive(Error, Debug)]
pub enum QuadrangleError {
    #[error("Filesystem error: {0}")]
    Filesystem(#[from] std::io::Error),

    #[error("Logging setup error: {0}")]
    LoggingSetup(String),

    #[error("Failed to load room {room_id}: {source}")]
    RoomLoad {
        room_id: String,
        source: BackendError,
    },

    #[error("Room session is closed")]
    RoomClosed,

    #[error("Message must contain text or an attachment")]
    EmptyMessage,

    #[error("Attachment is {size} bytes, above the {limit} byte ceiling")]
    AttachmentTooLarge { size: u64, limit: u64 },

    #[error("Change feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}
