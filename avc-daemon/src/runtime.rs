//! Wiring of the download and session contexts over one storage backend.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::downloader::sink::PackageSink;
use crate::downloader::source::PackageSource;
use crate::downloader::{Downloader, DownloaderConfig, DownloaderHandle};
use crate::events::EventBus;
use crate::installer::Installer;
use crate::notify::Reporter;
use crate::resume::ResumeStore;
use crate::session::connectivity::DataConnection;
use crate::session::lwm2m::{Lwm2mClient, Lwm2mError};
use crate::session::push::Pusher;
use crate::session::{SessionConfig, SessionCoordinator, SessionDeps, SessionHandle};
use crate::storage::Storage;
use crate::update::{UpdateError, UpdateStateMachine};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error(transparent)]
    Lwm2m(#[from] Lwm2mError),
}

/// Platform pieces the daemon drives.
pub struct Collaborators {
    pub lwm2m: Arc<dyn Lwm2mClient>,
    pub connection: Arc<dyn DataConnection>,
    pub source: Arc<dyn PackageSource>,
    pub sink: Arc<dyn PackageSink>,
    pub installer: Arc<dyn Installer>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub downloader: DownloaderConfig,
    pub session: SessionConfig,
    /// Longest wait for the server to acknowledge a pushed result.
    pub push_ack_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            downloader: DownloaderConfig::default(),
            session: SessionConfig::default(),
            push_ack_timeout: Duration::from_secs(30),
        }
    }
}

/// Handles onto a running daemon.
pub struct Runtime<S> {
    pub session: SessionHandle,
    pub downloader: DownloaderHandle,
    pub update: UpdateStateMachine<S>,
    pub reporter: Reporter<S>,
    pub resume: ResumeStore<S>,
    pub bus: EventBus,
}

/// Load persisted state and start both contexts. They stop when `cancel`
/// fires.
pub async fn start<S: Storage + Clone>(
    storage: S,
    parts: Collaborators,
    settings: Settings,
    cancel: CancellationToken,
) -> Result<Runtime<S>, RuntimeError> {
    let reporter = Reporter::new(storage.clone());
    let update = UpdateStateMachine::load(storage.clone(), reporter.clone()).await?;
    let resume = ResumeStore::new(storage);
    let bus = EventBus::default();

    let lwm2m_events = parts.lwm2m.start(cancel.clone()).await?;
    let pusher = Pusher::new(parts.lwm2m.clone(), settings.push_ack_timeout);

    let (downloader_tx, downloader_rx) = mpsc::unbounded_channel();
    let downloader = Downloader::new(
        resume.clone(),
        update.clone(),
        parts.source,
        parts.sink.clone(),
        settings.downloader,
        downloader_tx,
    )
    .spawn(cancel.clone());

    let session = SessionCoordinator::spawn(
        SessionDeps {
            config: settings.session,
            lwm2m: parts.lwm2m,
            connection: parts.connection,
            downloader: downloader.clone(),
            update: update.clone(),
            reporter: reporter.clone(),
            resume: resume.clone(),
            installer: parts.installer,
            sink: parts.sink,
            pusher,
            bus: bus.clone(),
        },
        lwm2m_events,
        downloader_rx,
        cancel,
    );

    info!("download and session contexts started");

    Ok(Runtime {
        session,
        downloader,
        update,
        reporter,
        resume,
        bus,
    })
}
