//! Room model and the per-room session.
//!
//! A [`RoomSession`] owns everything one open room needs: the message log,
//! the roster, two change-feed subscriptions, and the pump task that applies
//! feed events. Opening a session attaches the feed first and seeds the log
//! from the snapshot afterwards, so events that race ahead of the fetch are
//! merged instead of lost. Closing (or dropping) the session tears the
//! subscriptions down and cancels in-flight enrichment.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;

use super::enrichment::{self, EnrichmentConfig, EnrichmentContext, ProfileCache};
use super::error::{QuadrangleError, Result};
use super::message_log::{ChatMessage, LogMutation, MessageLog};
use super::roster::{Participant, Roster};
use crate::backend::{BackendError, ChatBackend, MAX_ATTACHMENT_BYTES, OutboundMessage};
use crate::feed::envelope::{ChangeEvent, ChangeRecord, RowChange};
use crate::feed::{ChangeFeed, FeedFilter, FeedSubscription};
use crate::types::MessageRow;

const UPDATE_BUFFER_SIZE: usize = 100;

/// A chat room. Immutable for this subsystem's purposes except deletion,
/// which tears down all room state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_by: String,
    #[serde(default)]
    pub is_private: bool,
}

/// What triggered a room update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateTrigger {
    /// The snapshot (or a resync) was merged into the log.
    SnapshotLoaded,

    /// A new message entered the log.
    MessageInserted,

    /// An existing entry's mutable fields changed.
    MessageEdited,

    /// An entry was removed.
    MessageDeleted,

    /// An entry's sender profile resolved.
    SenderResolved,

    /// The roster was replaced after a membership change.
    RosterChanged,
}

/// A single update pushed to subscribers. Message-level triggers carry the
/// complete current state of the affected entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomUpdate {
    pub trigger: UpdateTrigger,
    pub message: Option<ChatMessage>,
}

/// All mutable state for one open room. Exclusively owned by the session;
/// every write goes through the log/roster operations.
pub(crate) struct RoomState {
    pub(crate) log: MessageLog,
    pub(crate) roster: Roster,
}

/// A live view over one room: ordered message log, roster, and an update
/// stream, kept current by the change feed.
///
/// Only one session per room should be active per client; callers switching
/// rooms must `close().await` the old session before opening the new one so
/// the old subscriptions are gone before the new ones attach.
pub struct RoomSession {
    room_id: String,
    backend: Arc<dyn ChatBackend>,
    profiles: ProfileCache,
    enrichment_config: EnrichmentConfig,
    state: Arc<RwLock<RoomState>>,
    updates: broadcast::Sender<RoomUpdate>,
    closed: Arc<AtomicBool>,
    shutdown: mpsc::Sender<()>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RoomSession {
    /// Open a room: attach both change-feed subscriptions, start the pump,
    /// seed the log from the snapshot, load the roster, and advance the
    /// read marker.
    pub(crate) async fn open(
        backend: Arc<dyn ChatBackend>,
        feed: Arc<dyn ChangeFeed>,
        profiles: ProfileCache,
        enrichment_config: EnrichmentConfig,
        room_id: &str,
    ) -> Result<RoomSession> {
        tracing::debug!(
            target: "quadrangle::rooms::open",
            "Opening room {}",
            room_id
        );

        // Subscriptions attach before the snapshot fetch so events that race
        // ahead of it are merged, not lost.
        let message_events = feed.subscribe(FeedFilter::messages(room_id)).await?;
        let participant_events = match feed.subscribe(FeedFilter::participants(room_id)).await {
            Ok(subscription) => subscription,
            Err(e) => {
                let _ = feed.unsubscribe(&message_events.id).await;
                return Err(e.into());
            }
        };

        let state = Arc::new(RwLock::new(RoomState {
            log: MessageLog::new(room_id),
            roster: Roster::new(room_id),
        }));
        let (updates, _) = broadcast::channel(UPDATE_BUFFER_SIZE);
        let closed = Arc::new(AtomicBool::new(false));
        let (shutdown_sender, shutdown_receiver) = mpsc::channel(1);

        let ctx = PumpContext {
            room_id: room_id.to_string(),
            state: state.clone(),
            backend: backend.clone(),
            feed: feed.clone(),
            profiles: profiles.clone(),
            enrichment_config: enrichment_config.clone(),
            updates: updates.clone(),
            closed: closed.clone(),
        };
        let pump = tokio::spawn(run_pump(
            ctx,
            message_events,
            participant_events,
            shutdown_receiver,
        ));

        let session = RoomSession {
            room_id: room_id.to_string(),
            backend,
            profiles,
            enrichment_config,
            state,
            updates,
            closed,
            shutdown: shutdown_sender,
            pump: Mutex::new(Some(pump)),
        };

        // Seed the log. Same insert semantics as the live feed, so stream
        // events that already arrived are no-ops here.
        let rows = match session.backend.fetch_messages(room_id).await {
            Ok(rows) => rows,
            Err(source) => {
                session.close().await;
                return Err(QuadrangleError::RoomLoad {
                    room_id: room_id.to_string(),
                    source,
                });
            }
        };
        let inserted = {
            let mut guard = session.state.write().await;
            guard.log.merge_snapshot(&rows)
        };
        for message in &inserted {
            session.spawn_enrichment(message);
        }
        session.emit(UpdateTrigger::SnapshotLoaded, None);

        let participants = match session.backend.fetch_participants(room_id).await {
            Ok(rows) => rows,
            Err(source) => {
                session.close().await;
                return Err(QuadrangleError::RoomLoad {
                    room_id: room_id.to_string(),
                    source,
                });
            }
        };
        {
            let mut guard = session.state.write().await;
            guard.roster.replace(participants);
        }
        session.emit(UpdateTrigger::RosterChanged, None);

        // Read receipt on entry.
        session.mark_read();

        tracing::debug!(
            target: "quadrangle::rooms::open",
            "Opened room {} with {} messages",
            room_id,
            inserted.len()
        );

        Ok(session)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Subscribe to update notifications for this room.
    pub fn updates(&self) -> broadcast::Receiver<RoomUpdate> {
        self.updates.subscribe()
    }

    /// Current materialized log, ascending by `(created_at, id)`.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        self.state.read().await.log.messages().to_vec()
    }

    /// Current roster.
    pub async fn roster(&self) -> Vec<Participant> {
        self.state.read().await.roster.participants().to_vec()
    }

    /// Validate and submit a new message.
    ///
    /// At least one of trimmed content or an attachment must be present, and
    /// an attachment must fit under [`MAX_ATTACHMENT_BYTES`]; both checks run
    /// before any network call. On success the persisted row is returned but
    /// not inserted locally: the message becomes visible when the change
    /// feed mirrors it back.
    pub async fn send(&self, outbound: OutboundMessage) -> Result<MessageRow> {
        if self.is_closed() {
            return Err(QuadrangleError::RoomClosed);
        }

        let has_text = outbound
            .content
            .as_deref()
            .is_some_and(|content| !content.trim().is_empty());
        if !has_text && outbound.attachment.is_none() {
            return Err(QuadrangleError::EmptyMessage);
        }
        if let Some(attachment) = &outbound.attachment {
            let size = attachment.byte_len();
            if size > MAX_ATTACHMENT_BYTES {
                return Err(QuadrangleError::AttachmentTooLarge {
                    size,
                    limit: MAX_ATTACHMENT_BYTES,
                });
            }
        }

        let row = self.backend.send_message(&self.room_id, outbound).await?;
        self.mark_read();
        Ok(row)
    }

    /// Delete a message on the backend. The local entry is removed when the
    /// feed delivers the corresponding Delete event, mirroring the
    /// non-optimistic send path.
    pub async fn delete_message(&self, message_id: &str) -> Result<()> {
        let confirmed = self.backend.delete_message(message_id).await?;
        if !confirmed {
            return Err(QuadrangleError::Backend(BackendError::Rejected(format!(
                "delete of message {} was not confirmed",
                message_id
            ))));
        }
        Ok(())
    }

    /// Advance the caller's last-read marker. Fire-and-forget: failure is
    /// logged, never retried, never surfaced.
    pub fn mark_read(&self) {
        let backend = self.backend.clone();
        let room_id = self.room_id.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.mark_room_read(&room_id).await {
                tracing::warn!(
                    target: "quadrangle::rooms::mark_read",
                    "Failed to advance read marker for room {}: {}",
                    room_id,
                    e
                );
            }
        });
    }

    /// Re-reconcile against a fresh snapshot and roster.
    ///
    /// Intended for transports that re-establish a dropped change-feed
    /// connection: inserts missed during the outage are merged and entries
    /// the snapshot no longer contains (missed deletes) are pruned.
    pub async fn resync(&self) -> Result<()> {
        if self.is_closed() {
            return Err(QuadrangleError::RoomClosed);
        }

        let rows = self
            .backend
            .fetch_messages(&self.room_id)
            .await
            .map_err(|source| QuadrangleError::RoomLoad {
                room_id: self.room_id.clone(),
                source,
            })?;
        let (inserted, removed) = {
            let mut guard = self.state.write().await;
            guard.log.reconcile(&rows)
        };
        tracing::debug!(
            target: "quadrangle::rooms::resync",
            "Resynced room {}: {} inserted, {} pruned",
            self.room_id,
            inserted.len(),
            removed.len()
        );
        for message in &inserted {
            self.spawn_enrichment(message);
        }
        self.emit(UpdateTrigger::SnapshotLoaded, None);

        let participants = self
            .backend
            .fetch_participants(&self.room_id)
            .await
            .map_err(|source| QuadrangleError::RoomLoad {
                room_id: self.room_id.clone(),
                source,
            })?;
        {
            let mut guard = self.state.write().await;
            guard.roster.replace(participants);
        }
        self.emit(UpdateTrigger::RosterChanged, None);

        Ok(())
    }

    /// Close the session: stop the pump, tear down both subscriptions, and
    /// mark in-flight enrichment for discard. Idempotent; callers switching
    /// rooms await this before opening the next room.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(
            target: "quadrangle::rooms::close",
            "Closing room {}",
            self.room_id
        );

        let _ = self.shutdown.send(()).await;
        let pump = self.pump.lock().expect("pump handle lock poisoned").take();
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                tracing::warn!(
                    target: "quadrangle::rooms::close",
                    "Pump task for room {} ended abnormally: {}",
                    self.room_id,
                    e
                );
            }
        }
    }

    fn spawn_enrichment(&self, message: &ChatMessage) {
        enrichment::spawn_lookup(
            EnrichmentContext {
                room_id: self.room_id.clone(),
                state: Arc::downgrade(&self.state),
                closed: self.closed.clone(),
                backend: self.backend.clone(),
                profiles: self.profiles.clone(),
                config: self.enrichment_config.clone(),
                updates: self.updates.clone(),
            },
            message.id.clone(),
            message.sender.user_id.clone(),
        );
    }

    fn emit(&self, trigger: UpdateTrigger, message: Option<ChatMessage>) {
        let _ = self.updates.send(RoomUpdate { trigger, message });
    }
}

impl Drop for RoomSession {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // The pump observes the signal (or the dropped sender) and tears the
        // subscriptions down in the background.
        let _ = self.shutdown.try_send(());
    }
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("room_id", &self.room_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Everything the pump task owns.
struct PumpContext {
    room_id: String,
    state: Arc<RwLock<RoomState>>,
    backend: Arc<dyn ChatBackend>,
    feed: Arc<dyn ChangeFeed>,
    profiles: ProfileCache,
    enrichment_config: EnrichmentConfig,
    updates: broadcast::Sender<RoomUpdate>,
    closed: Arc<AtomicBool>,
}

impl PumpContext {
    fn enrichment_context(&self) -> EnrichmentContext {
        EnrichmentContext {
            room_id: self.room_id.clone(),
            state: Arc::downgrade(&self.state),
            closed: self.closed.clone(),
            backend: self.backend.clone(),
            profiles: self.profiles.clone(),
            config: self.enrichment_config.clone(),
            updates: self.updates.clone(),
        }
    }

    fn emit(&self, trigger: UpdateTrigger, message: Option<ChatMessage>) {
        let _ = self.updates.send(RoomUpdate { trigger, message });
    }
}

/// Main event loop for one open room: applies feed events until the session
/// shuts down or every channel closes, then tears both subscriptions down.
async fn run_pump(
    ctx: PumpContext,
    mut message_events: FeedSubscription,
    mut participant_events: FeedSubscription,
    mut shutdown: mpsc::Receiver<()>,
) {
    tracing::debug!(
        target: "quadrangle::rooms::run_pump",
        "Starting change-feed pump for room {}",
        ctx.room_id
    );

    loop {
        tokio::select! {
            Some(record) = message_events.events.recv() => {
                handle_record(&ctx, record).await;
            }
            Some(record) = participant_events.events.recv() => {
                handle_record(&ctx, record).await;
            }
            Some(_) = shutdown.recv() => {
                tracing::debug!(
                    target: "quadrangle::rooms::run_pump",
                    "Room {} closing, stopping pump",
                    ctx.room_id
                );
                break;
            }
            else => {
                tracing::debug!(
                    target: "quadrangle::rooms::run_pump",
                    "Feed channels closed for room {}, stopping pump",
                    ctx.room_id
                );
                break;
            }
        }
    }

    // Exactly one teardown pass per session; unsubscribe itself is
    // idempotent on the transport side.
    for subscription_id in [&message_events.id, &participant_events.id] {
        if let Err(e) = ctx.feed.unsubscribe(subscription_id).await {
            tracing::warn!(
                target: "quadrangle::rooms::run_pump",
                "Failed to close subscription {}: {}",
                subscription_id,
                e
            );
        }
    }
}

async fn handle_record(ctx: &PumpContext, record: ChangeRecord) {
    if ctx.closed.load(Ordering::Acquire) {
        return;
    }

    let event = match record.decode() {
        Ok(event) => event,
        Err(e) => {
            tracing::warn!(
                target: "quadrangle::rooms::handle_record",
                "Dropping malformed change event for room {}: {}",
                ctx.room_id,
                e
            );
            return;
        }
    };

    match event {
        ChangeEvent::Message(change) => apply_message_change(ctx, change).await,
        // Insert, update and delete all take the same path: refetch the
        // roster wholesale.
        ChangeEvent::Participant(_) => refresh_roster(ctx).await,
    }
}

async fn apply_message_change(ctx: &PumpContext, change: RowChange<MessageRow>) {
    let mut state = ctx.state.write().await;
    match change {
        RowChange::Insert(row) => {
            if let LogMutation::Inserted(message) = state.log.insert(&row) {
                drop(state);
                enrichment::spawn_lookup(
                    ctx.enrichment_context(),
                    message.id.clone(),
                    message.sender.user_id.clone(),
                );
                ctx.emit(UpdateTrigger::MessageInserted, Some(message));
            }
        }
        RowChange::Update { new, .. } => {
            if let LogMutation::Updated(message) = state.log.update(&new) {
                drop(state);
                ctx.emit(UpdateTrigger::MessageEdited, Some(message));
            }
        }
        RowChange::Delete(row) => {
            if let LogMutation::Removed(message) = state.log.remove(&row.id) {
                drop(state);
                ctx.emit(UpdateTrigger::MessageDeleted, Some(message));
            }
        }
    }
}

async fn refresh_roster(ctx: &PumpContext) {
    match ctx.backend.fetch_participants(&ctx.room_id).await {
        Ok(rows) => {
            let mut state = ctx.state.write().await;
            state.roster.replace(rows);
            drop(state);
            ctx.emit(UpdateTrigger::RosterChanged, None);
        }
        Err(e) => {
            // Keep the previous roster; stale but structurally valid.
            tracing::warn!(
                target: "quadrangle::rooms::refresh_roster",
                "Roster refetch failed for room {}: {}",
                ctx.room_id,
                e
            );
        }
    }
}
