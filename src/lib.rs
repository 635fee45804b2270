use std::sync::{Mutex, OnceLock};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

pub mod backend;
pub mod feed;
pub mod quadrangle;
pub mod types;

pub use backend::{ChatBackend, MAX_ATTACHMENT_BYTES, OutboundAttachment, OutboundMessage};
pub use feed::{ChangeFeed, FeedFilter, FeedSubscription, FeedTable};
pub use quadrangle::attachments::Attachment;
pub use quadrangle::enrichment::{EnrichmentConfig, ProfileCache};
pub use quadrangle::error::{QuadrangleError, Result};
pub use quadrangle::message_log::{ChatMessage, MessageLog, Sender};
pub use quadrangle::rooms::{Room, RoomSession, RoomUpdate, UpdateTrigger};
pub use quadrangle::roster::Participant;
pub use quadrangle::{Quadrangle, QuadrangleConfig};

static TRACING_GUARDS: OnceLock<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

pub(crate) fn init_tracing(logs_dir: &std::path::Path) {
    TRACING_INIT.get_or_init(|| {
        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("quadrangle")
            .filename_suffix("log")
            .build(logs_dir)
            .expect("Failed to create file appender");

        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        TRACING_GUARDS
            .set(Mutex::new(Some((file_guard, stdout_guard))))
            .ok();

        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = Layer::new()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true);

        Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .init();
    });
}
