//! Change feed abstraction.
//!
//! The server pushes row-level insert/update/delete events for the tables a
//! client is watching. This module keeps the sync core transport-agnostic: a
//! concrete transport implements [`ChangeFeed`] and delivers raw
//! [`ChangeRecord`]s over a channel, filtered server-side to one room.
//!
//! Delivery semantics the core is built around: at-least-once, with no
//! ordering guarantee relative to the snapshot fetch. Duplicates are normal.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::Receiver;
use uuid::Uuid;

pub mod envelope;

pub use envelope::{ChangeEvent, ChangeRecord, EnvelopeError, EventType, RowChange};

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Subscribe failed: {0}")]
    Subscribe(String),
    #[error("Unsubscribe failed: {0}")]
    Unsubscribe(String),
    #[error("Feed connection closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, FeedError>;

/// Table a subscription is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedTable {
    Messages,
    Participants,
}

impl FeedTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedTable::Messages => "messages",
            FeedTable::Participants => "participants",
        }
    }
}

/// Subscription filter: one table, one `room_id` equality predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedFilter {
    pub table: FeedTable,
    pub room_id: String,
}

impl FeedFilter {
    pub fn messages(room_id: &str) -> Self {
        Self {
            table: FeedTable::Messages,
            room_id: room_id.to_string(),
        }
    }

    pub fn participants(room_id: &str) -> Self {
        Self {
            table: FeedTable::Participants,
            room_id: room_id.to_string(),
        }
    }

    /// Generate a subscription id for this filter, unique per open.
    pub fn subscription_id(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}_{}_{}", self.room_id, self.table.as_str(), &suffix[..12])
    }
}

/// A live subscription: its id (for teardown) and the event channel.
pub struct FeedSubscription {
    pub id: String,
    pub events: Receiver<ChangeRecord>,
}

impl std::fmt::Debug for FeedSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSubscription")
            .field("id", &self.id)
            .finish()
    }
}

/// Transport seam for the server-pushed change feed.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Open one logical subscription for the filter. Each open room holds two
    /// of these, one per table.
    async fn subscribe(&self, filter: FeedFilter) -> Result<FeedSubscription>;

    /// Tear down a subscription. Idempotent: unknown ids are a no-op.
    async fn unsubscribe(&self, subscription_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_constructors_scope_table_and_room() {
        let filter = FeedFilter::messages("r1");
        assert_eq!(filter.table, FeedTable::Messages);
        assert_eq!(filter.room_id, "r1");

        let filter = FeedFilter::participants("r2");
        assert_eq!(filter.table, FeedTable::Participants);
        assert_eq!(filter.room_id, "r2");
    }

    #[test]
    fn subscription_ids_are_unique_per_open() {
        let filter = FeedFilter::messages("r1");
        let a = filter.subscription_id();
        let b = filter.subscription_id();

        assert!(a.starts_with("r1_messages_"));
        assert_ne!(a, b);
    }
}
