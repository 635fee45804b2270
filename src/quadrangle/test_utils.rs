//! In-memory collaborator doubles and fixture constructors for tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};
use uuid::Uuid;

use crate::backend::{BackendError, ChatBackend, OutboundMessage};
use crate::feed::envelope::{ChangeRecord, EventType};
use crate::feed::{self, ChangeFeed, FeedFilter, FeedSubscription};
use crate::types::{MessageRow, ParticipantRole, ParticipantRow, UserProfile};

/// Poll a condition until it holds or the test times out. The condition may
/// await; state settles through spawned tasks rather than direct calls.
macro_rules! wait_until {
    ($cond:expr, $what:expr) => {{
        let mut satisfied = false;
        for _ in 0..400 {
            if $cond {
                satisfied = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(satisfied, "timed out waiting for {}", $what);
    }};
}
pub(crate) use wait_until;

/// Short settle window for asserting that something did NOT happen.
pub(crate) async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

pub(crate) fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

pub(crate) fn message_row(
    id: &str,
    room_id: &str,
    user_id: &str,
    content: &str,
    secs: i64,
) -> MessageRow {
    MessageRow {
        id: id.to_string(),
        room_id: room_id.to_string(),
        user_id: user_id.to_string(),
        content: Some(content.to_string()),
        attachments: Value::Null,
        created_at: ts(secs),
        edited_at: None,
    }
}

pub(crate) fn participant_row(user_id: &str, room_id: &str, secs: i64) -> ParticipantRow {
    ParticipantRow {
        room_id: room_id.to_string(),
        user_id: user_id.to_string(),
        role: ParticipantRole::Member,
        joined_at: ts(secs),
        last_read_at: None,
    }
}

pub(crate) fn profile(display_name: &str) -> UserProfile {
    UserProfile {
        display_name: Some(display_name.to_string()),
        avatar_url: None,
    }
}

fn record(event_type: EventType, table: &str, new: Option<Value>, old: Option<Value>) -> ChangeRecord {
    ChangeRecord {
        event_type,
        schema: "public".to_string(),
        table: table.to_string(),
        new,
        old,
    }
}

pub(crate) fn insert_record(row: &MessageRow) -> ChangeRecord {
    record(
        EventType::Insert,
        "messages",
        Some(serde_json::to_value(row).unwrap()),
        None,
    )
}

pub(crate) fn update_record(old: &MessageRow, new: &MessageRow) -> ChangeRecord {
    record(
        EventType::Update,
        "messages",
        Some(serde_json::to_value(new).unwrap()),
        Some(serde_json::to_value(old).unwrap()),
    )
}

pub(crate) fn delete_record(row: &MessageRow) -> ChangeRecord {
    record(
        EventType::Delete,
        "messages",
        None,
        Some(serde_json::to_value(row).unwrap()),
    )
}

pub(crate) fn participant_insert_record(row: &ParticipantRow) -> ChangeRecord {
    record(
        EventType::Insert,
        "participants",
        Some(serde_json::to_value(row).unwrap()),
        None,
    )
}

pub(crate) fn participant_delete_record(row: &ParticipantRow) -> ChangeRecord {
    record(
        EventType::Delete,
        "participants",
        None,
        Some(serde_json::to_value(row).unwrap()),
    )
}

/// In-memory [`ChatBackend`]. Fetches can be failed or gated per call site
/// to reproduce load errors and in-flight races.
#[derive(Default)]
pub(crate) struct MockBackend {
    pub(crate) messages: Mutex<HashMap<String, Vec<MessageRow>>>,
    pub(crate) participants: Mutex<HashMap<String, Vec<ParticipantRow>>>,
    pub(crate) profiles: Mutex<HashMap<String, UserProfile>>,
    pub(crate) read_marks: Mutex<Vec<String>>,
    pub(crate) deleted: Mutex<Vec<String>>,
    pub(crate) refuse_deletes: AtomicBool,
    pub(crate) fail_message_fetch: AtomicBool,
    pub(crate) fail_participant_fetch: AtomicBool,
    pub(crate) send_calls: AtomicUsize,
    pub(crate) profile_calls: AtomicUsize,
    pub(crate) participant_fetches: AtomicUsize,
    message_fetch_gate: Mutex<Option<Arc<Semaphore>>>,
    profile_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl MockBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn seed_message(&self, row: MessageRow) {
        self.messages
            .lock()
            .unwrap()
            .entry(row.room_id.clone())
            .or_default()
            .push(row);
    }

    pub(crate) fn seed_participants(&self, room_id: &str, rows: Vec<ParticipantRow>) {
        self.participants
            .lock()
            .unwrap()
            .insert(room_id.to_string(), rows);
    }

    pub(crate) fn set_profile(&self, user_id: &str, profile: UserProfile) {
        self.profiles
            .lock()
            .unwrap()
            .insert(user_id.to_string(), profile);
    }

    /// Block every profile lookup until permits are added to the returned gate.
    pub(crate) fn gate_profiles(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.profile_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    /// Block every snapshot fetch until permits are added to the returned gate.
    pub(crate) fn gate_message_fetches(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.message_fetch_gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

async fn pass_gate(slot: &Mutex<Option<Arc<Semaphore>>>) -> Result<(), BackendError> {
    let gate = slot.lock().unwrap().clone();
    if let Some(gate) = gate {
        let permit = gate
            .acquire()
            .await
            .map_err(|_| BackendError::Transport("gate closed".to_string()))?;
        permit.forget();
    }
    Ok(())
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn fetch_messages(&self, room_id: &str) -> Result<Vec<MessageRow>, BackendError> {
        pass_gate(&self.message_fetch_gate).await?;
        if self.fail_message_fetch.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("snapshot fetch failed".to_string()));
        }

        let mut rows = self
            .messages
            .lock()
            .unwrap()
            .get(room_id)
            .cloned()
            .unwrap_or_default();
        rows.sort_by(|a, b| (a.created_at, a.id.as_str()).cmp(&(b.created_at, b.id.as_str())));
        Ok(rows)
    }

    async fn fetch_participants(&self, room_id: &str) -> Result<Vec<ParticipantRow>, BackendError> {
        self.participant_fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_participant_fetch.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("roster fetch failed".to_string()));
        }

        Ok(self
            .participants
            .lock()
            .unwrap()
            .get(room_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(
        &self,
        room_id: &str,
        outbound: OutboundMessage,
    ) -> Result<MessageRow, BackendError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);

        let row = MessageRow {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            user_id: "self".to_string(),
            content: outbound.content,
            attachments: Value::Null,
            created_at: Utc::now(),
            edited_at: None,
        };
        self.seed_message(row.clone());
        Ok(row)
    }

    async fn mark_room_read(&self, room_id: &str) -> Result<(), BackendError> {
        self.read_marks.lock().unwrap().push(room_id.to_string());
        Ok(())
    }

    async fn delete_message(&self, message_id: &str) -> Result<bool, BackendError> {
        self.deleted.lock().unwrap().push(message_id.to_string());
        Ok(!self.refuse_deletes.load(Ordering::SeqCst))
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, BackendError> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        pass_gate(&self.profile_gate).await?;
        Ok(self.profiles.lock().unwrap().get(user_id).cloned())
    }
}

/// In-memory [`ChangeFeed`]: routes published records to every live
/// subscription whose table and room filter match, emulating the server-side
/// equality predicate.
#[derive(Default)]
pub(crate) struct MemoryFeed {
    subscriptions: Mutex<HashMap<String, (FeedFilter, mpsc::Sender<ChangeRecord>)>>,
    pub(crate) unsubscribed: Mutex<Vec<String>>,
}

impl MemoryFeed {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }

    pub(crate) fn publish(&self, record: ChangeRecord) {
        let room_id = record_room(&record);
        let senders: Vec<mpsc::Sender<ChangeRecord>> = self
            .subscriptions
            .lock()
            .unwrap()
            .values()
            .filter(|(filter, _)| {
                filter.table.as_str() == record.table && Some(&filter.room_id) == room_id.as_ref()
            })
            .map(|(_, sender)| sender.clone())
            .collect();

        for sender in senders {
            sender
                .try_send(record.clone())
                .expect("feed buffer overflow in test");
        }
    }
}

fn record_room(record: &ChangeRecord) -> Option<String> {
    for value in [&record.new, &record.old] {
        if let Some(Value::Object(map)) = value {
            if let Some(Value::String(room_id)) = map.get("room_id") {
                return Some(room_id.clone());
            }
        }
    }
    None
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn subscribe(&self, filter: FeedFilter) -> feed::Result<FeedSubscription> {
        let (sender, events) = mpsc::channel(64);
        let id = filter.subscription_id();
        self.subscriptions
            .lock()
            .unwrap()
            .insert(id.clone(), (filter, sender));
        Ok(FeedSubscription { id, events })
    }

    async fn unsubscribe(&self, subscription_id: &str) -> feed::Result<()> {
        self.subscriptions.lock().unwrap().remove(subscription_id);
        self.unsubscribed
            .lock()
            .unwrap()
            .push(subscription_id.to_string());
        Ok(())
    }
}
