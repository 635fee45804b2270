use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

pub mod attachments;
pub mod enrichment;
pub mod error;
pub mod message_log;
pub mod rooms;
pub mod roster;

#[cfg(test)]
pub(crate) mod test_utils;

use crate::backend::ChatBackend;
use crate::feed::ChangeFeed;
use crate::init_tracing;
use enrichment::{EnrichmentConfig, ProfileCache};
use error::{QuadrangleError, Result};
use rooms::RoomSession;

#[derive(Clone, Debug)]
pub struct QuadrangleConfig {
    /// Directory for application logs
    pub logs_dir: PathBuf,

    /// Configuration for the sender enrichment pipeline
    pub enrichment_config: Option<EnrichmentConfig>,
}

impl QuadrangleConfig {
    pub fn new(logs_dir: &Path) -> Self {
        let env_suffix = if cfg!(debug_assertions) {
            "dev"
        } else {
            "release"
        };

        Self {
            logs_dir: logs_dir.join(env_suffix),
            enrichment_config: None, // Use default enrichment configuration
        }
    }

    /// Create a new configuration with custom enrichment settings
    pub fn new_with_enrichment_config(
        logs_dir: &Path,
        enrichment_config: EnrichmentConfig,
    ) -> Self {
        let mut config = Self::new(logs_dir);
        config.enrichment_config = Some(enrichment_config);
        config
    }
}

/// The sync core's context object.
///
/// Holds the injected collaborator handles (backend and change feed) and the
/// shared profile cache. There is deliberately no global instance: passing
/// the context around keeps teardown deterministic and lets tests construct
/// isolated cores against in-memory collaborators.
pub struct Quadrangle {
    pub config: QuadrangleConfig,
    backend: Arc<dyn ChatBackend>,
    feed: Arc<dyn ChangeFeed>,
    profiles: ProfileCache,
    enrichment_config: EnrichmentConfig,
}

impl Quadrangle {
    /// Initializes the sync core with the provided configuration and
    /// collaborator handles.
    ///
    /// Sets up the log directory and tracing, then returns a ready context.
    /// Repeated initialization reuses the already-installed tracing
    /// subscriber.
    ///
    /// # Arguments
    ///
    /// * `config` - A [`QuadrangleConfig`] specifying the logs directory.
    /// * `backend` - The platform data-access collaborator.
    /// * `feed` - The change-feed transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the logs directory cannot be created.
    pub fn initialize(
        config: QuadrangleConfig,
        backend: Arc<dyn ChatBackend>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.logs_dir)
            .with_context(|| format!("Failed to create logs directory: {:?}", config.logs_dir))
            .map_err(QuadrangleError::from)?;

        init_tracing(&config.logs_dir);
        tracing::debug!(
            target: "quadrangle::initialize",
            "Logging initialized in directory: {:?}",
            config.logs_dir
        );

        let enrichment_config = config.enrichment_config.clone().unwrap_or_default();

        Ok(Self {
            config,
            backend,
            feed,
            profiles: ProfileCache::new(),
            enrichment_config,
        })
    }

    /// Open a room and return its live session.
    ///
    /// Callers switching rooms must `close().await` the previous session
    /// before opening the next one, so the old subscriptions are torn down
    /// before the new ones attach.
    pub async fn open_room(&self, room_id: &str) -> Result<RoomSession> {
        RoomSession::open(
            self.backend.clone(),
            self.feed.clone(),
            self.profiles.clone(),
            self.enrichment_config.clone(),
            room_id,
        )
        .await
    }

    /// Shared sender-profile cache, exposed for advanced usage.
    pub fn profiles(&self) -> &ProfileCache {
        &self.profiles
    }
}

impl std::fmt::Debug for Quadrangle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Quadrangle")
            .field("config", &self.config)
            .field("backend", &"<REDACTED>")
            .field("feed", &"<REDACTED>")
            .finish()
    }
}
