//! Sender profile enrichment.
//!
//! Profile lookups run off the hot path: the log entry is inserted with a
//! placeholder sender immediately, and a spawned task resolves the profile
//! and patches the entry afterwards. The task captures the room id and a
//! weak handle to the room state at spawn time; a resolution that lands
//! after the room was closed or switched is discarded, never applied to
//! whatever room is active by then.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::{RwLock, broadcast};

use super::rooms::{RoomState, RoomUpdate, UpdateTrigger};
use crate::backend::ChatBackend;
use crate::types::UserProfile;

/// Configuration for the enrichment pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrichmentConfig {
    /// Whether resolved profiles are kept in the shared cache and reused
    /// across lookups and sessions.
    pub use_profile_cache: bool,

    /// Whether to enable detailed logging of lookup steps.
    pub enable_debug_logging: bool,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            use_profile_cache: true,
            enable_debug_logging: false,
        }
    }
}

/// Crate-wide cache of resolved profiles, keyed by user id. Shared across
/// room sessions so switching back into a room does not refetch every
/// sender.
#[derive(Debug, Clone, Default)]
pub struct ProfileCache {
    inner: Arc<DashMap<String, UserProfile>>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, user_id: &str) -> Option<UserProfile> {
        self.inner.get(user_id).map(|entry| entry.value().clone())
    }

    pub fn store(&self, user_id: &str, profile: UserProfile) {
        self.inner.insert(user_id.to_string(), profile);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Everything a lookup task captures at spawn time. The room id and state
/// handle are pinned here so the stale-write race on room switch cannot
/// happen: the old room's state either no longer upgrades or no longer
/// matches the captured id.
pub(crate) struct EnrichmentContext {
    pub(crate) room_id: String,
    pub(crate) state: Weak<RwLock<RoomState>>,
    pub(crate) closed: Arc<AtomicBool>,
    pub(crate) backend: Arc<dyn ChatBackend>,
    pub(crate) profiles: ProfileCache,
    pub(crate) config: EnrichmentConfig,
    pub(crate) updates: broadcast::Sender<RoomUpdate>,
}

/// Resolve the author's profile for a freshly inserted entry and patch the
/// entry in place. Failures keep the fallback identity permanently; there
/// is no retry.
pub(crate) fn spawn_lookup(ctx: EnrichmentContext, message_id: String, user_id: String) {
    tokio::spawn(async move {
        if ctx.config.enable_debug_logging {
            tracing::debug!(
                target: "quadrangle::enrichment::spawn_lookup",
                "Resolving sender profile for message {} (user {})",
                message_id,
                user_id
            );
        }
        let Some(profile) = resolve(&ctx, &user_id).await else {
            return;
        };
        apply(&ctx, &message_id, &profile).await;
    });
}

async fn resolve(ctx: &EnrichmentContext, user_id: &str) -> Option<UserProfile> {
    if ctx.config.use_profile_cache {
        if let Some(hit) = ctx.profiles.get(user_id) {
            return Some(hit);
        }
    }

    match ctx.backend.get_profile(user_id).await {
        Ok(Some(profile)) => {
            if ctx.config.use_profile_cache {
                ctx.profiles.store(user_id, profile.clone());
            }
            Some(profile)
        }
        Ok(None) => {
            tracing::debug!(
                target: "quadrangle::enrichment::resolve",
                "No profile for user {}, keeping fallback identity",
                user_id
            );
            None
        }
        Err(e) => {
            tracing::warn!(
                target: "quadrangle::enrichment::resolve",
                "Profile lookup failed for user {}: {}, keeping fallback identity",
                user_id,
                e
            );
            None
        }
    }
}

async fn apply(ctx: &EnrichmentContext, message_id: &str, profile: &UserProfile) {
    let Some(state) = ctx.state.upgrade() else {
        tracing::debug!(
            target: "quadrangle::enrichment::apply",
            "Discarding profile for message {}: room {} state torn down",
            message_id,
            ctx.room_id
        );
        return;
    };

    let mut state = state.write().await;
    if ctx.closed.load(Ordering::Acquire) || state.log.room_id() != ctx.room_id {
        tracing::debug!(
            target: "quadrangle::enrichment::apply",
            "Discarding profile for message {}: room {} no longer active",
            message_id,
            ctx.room_id
        );
        return;
    }

    if let Some(message) = state.log.apply_profile(message_id, profile) {
        let _ = ctx.updates.send(RoomUpdate {
            trigger: UpdateTrigger::SenderResolved,
            message: Some(message),
        });
    }
}
