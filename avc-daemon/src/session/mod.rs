//! Device-management session context.
//!
//! [`SessionCoordinator`] runs as a single task and is the only owner of the
//! pending download. The download context and the LWM2M client talk to it
//! through channels; applications go through a [`SessionHandle`].

pub mod connectivity;
pub mod lwm2m;
pub mod push;
pub mod timer;

use std::sync::Arc;
use std::time::Duration;

use avc_core::{AvcStatus, SessionState, UpdateResult, UpdateState, UpdateType};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::downloader::sink::PackageSink;
use crate::downloader::{DownloadError, DownloadRequest, DownloaderEvent, DownloaderHandle};
use crate::events::{EventBus, StatusEvent};
use crate::installer::Installer;
use crate::notify::{Delivery, Reporter};
use crate::resume::{ResumeStore, validate_uri};
use crate::storage::Storage;
use crate::update::UpdateStateMachine;

use connectivity::{ConnectivityError, DataConnection};
use lwm2m::{Lwm2mClient, Lwm2mError, Lwm2mEvent};
use push::Pusher;
use timer::Timer;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("a session is already open")]
    Duplicate,
    #[error("a session attempt is already under way")]
    Busy,
    #[error("no session to release")]
    NotConnected,
    #[error("no download is waiting for agreement")]
    NoPendingDownload,
    #[error(transparent)]
    Lwm2m(#[from] Lwm2mError),
    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error("session coordinator stopped")]
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Waits between failed session attempts. Zero entries are skipped and
    /// the list starts over once exhausted.
    pub retry_timers: Vec<Duration>,
    /// Idle time after which an open session is released. Zero disables it.
    pub activity_timeout: Duration,
    pub polling_interval: Option<Duration>,
    /// Whether downloads wait for [`SessionHandle::accept_download`].
    pub download_user_agreement: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry_timers: [15, 60, 240, 480, 1440, 2880, 0, 0]
                .into_iter()
                .map(|minutes| Duration::from_secs(minutes * 60))
                .collect(),
            activity_timeout: Duration::from_secs(20),
            polling_interval: None,
            download_user_agreement: true,
        }
    }
}

/// A download the server asked for that is not running right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingDownload {
    pub uri: String,
    pub kind: UpdateType,
    pub resume: bool,
    #[serde(skip)]
    pub expected_digest: Option<blake3::Hash>,
    pub bytes_left: Option<u64>,
    /// Consent given for this download. Survives reconnects, not restarts.
    pub agreed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub pending: Option<PendingDownload>,
    pub downloading: Option<UpdateType>,
    pub retry_scheduled: bool,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    RequestSession { reply: Reply<()> },
    ReleaseSession { reply: Reply<()> },
    AcceptDownload { reply: Reply<()> },
    AbortDownload { kind: UpdateType, reply: Reply<()> },
    Status { reply: oneshot::Sender<SessionStatus> },
}

/// Work finished outside the session loop.
enum Internal {
    RetryTimer,
    ActivityTimer,
    PollingTimer,
    InstallFinished {
        kind: UpdateType,
        result: Option<UpdateResult>,
    },
}

/// Client side of the session context.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)?
    }

    /// Open a session to the server.
    ///
    /// Fails with [`SessionError::Duplicate`] when one is open and with
    /// [`SessionError::Busy`] while an attempt or a retry is pending.
    pub async fn request_session(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::RequestSession { reply }).await
    }

    pub async fn release_session(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::ReleaseSession { reply }).await
    }

    /// Give consent for the pending download.
    pub async fn accept_download(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::AcceptDownload { reply }).await
    }

    pub async fn abort_download(&self, kind: UpdateType) -> Result<(), SessionError> {
        self.request(|reply| Command::AbortDownload { kind, reply })
            .await
    }

    pub async fn status(&self) -> Result<SessionStatus, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply })
            .await
            .map_err(|_| SessionError::Stopped)?;
        rx.await.map_err(|_| SessionError::Stopped)
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }
}

/// Everything the session context works with.
pub struct SessionDeps<S> {
    pub config: SessionConfig,
    pub lwm2m: Arc<dyn Lwm2mClient>,
    pub connection: Arc<dyn DataConnection>,
    pub downloader: DownloaderHandle,
    pub update: UpdateStateMachine<S>,
    pub reporter: Reporter<S>,
    pub resume: ResumeStore<S>,
    pub installer: Arc<dyn Installer>,
    pub sink: Arc<dyn PackageSink>,
    pub pusher: Pusher,
    pub bus: EventBus,
}

pub struct SessionCoordinator<S> {
    deps: SessionDeps<S>,
    /// Transport state; `UserAgreementPending` is derived, never stored here.
    link: SessionState,
    pending: Option<PendingDownload>,
    /// The download handed to the download context.
    active: Option<PendingDownload>,
    online: bool,
    retry_index: usize,
    retry_timer: Timer,
    activity_timer: Timer,
    polling_timer: Timer,
    internal_tx: mpsc::UnboundedSender<Internal>,
    state_tx: watch::Sender<SessionState>,
}

impl<S: Storage + Clone> SessionCoordinator<S> {
    /// Start the session context. It runs until `cancel` fires.
    pub fn spawn(
        deps: SessionDeps<S>,
        lwm2m_events: mpsc::Receiver<Lwm2mEvent>,
        downloader_events: mpsc::UnboundedReceiver<DownloaderEvent>,
        cancel: CancellationToken,
    ) -> SessionHandle {
        let (tx, rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let coordinator = Self {
            deps,
            link: SessionState::Disconnected,
            pending: None,
            active: None,
            online: false,
            retry_index: 0,
            retry_timer: Timer::new("session-retry"),
            activity_timer: Timer::new("activity"),
            polling_timer: Timer::new("polling"),
            internal_tx,
            state_tx,
        };

        tokio::spawn(coordinator.run(rx, internal_rx, lwm2m_events, downloader_events, cancel));

        SessionHandle {
            tx,
            state: state_rx,
        }
    }

    #[instrument(name = "session", skip_all)]
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut lwm2m_events: mpsc::Receiver<Lwm2mEvent>,
        mut downloads: mpsc::UnboundedReceiver<DownloaderEvent>,
        cancel: CancellationToken,
    ) {
        let mut connectivity = self.deps.connection.subscribe();
        self.online = *connectivity.borrow_and_update();

        self.recover().await;
        self.restart_polling_timer();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("session coordinator shutting down");
                    break;
                }
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(event) = lwm2m_events.recv() => self.handle_lwm2m(event).await,
                Some(event) = downloads.recv() => self.handle_download(event).await,
                Some(event) = internal.recv() => self.handle_internal(event).await,
                Ok(()) = connectivity.changed() => {
                    let online = *connectivity.borrow_and_update();
                    self.handle_connectivity(online).await;
                }
            }
        }
    }

    /// Pick up a download interrupted by a restart. It is queued again as a
    /// pending download and needs a fresh agreement.
    ///
    /// Stored resume information is enough to resume while the update never
    /// got past downloading, even when the package size was never learned.
    async fn recover(&mut self) {
        let info = match self.deps.resume.load().await {
            Ok(Some(info)) => info,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "failed to read resume information");
                return;
            }
        };

        let state = self.deps.update.get_update_state(info.update_type).await;
        if !matches!(state, UpdateState::Idle | UpdateState::Downloading) {
            info!(kind = %info.update_type, ?state, "stored download cannot be resumed");
            return;
        }

        let pending = PendingDownload {
            kind: info.update_type,
            resume: true,
            expected_digest: None,
            bytes_left: info.bytes_left(),
            agreed: !self.deps.config.download_user_agreement,
            uri: info.uri.into(),
        };
        info!(
            kind = %pending.kind,
            bytes_downloaded = info.bytes_downloaded,
            bytes_left = ?pending.bytes_left,
            "found interrupted download"
        );
        self.publish(
            StatusEvent::new(AvcStatus::DownloadPending)
                .kind(pending.kind)
                .num_bytes(pending.bytes_left),
        );
        self.pending = Some(pending);
        self.publish_state();
    }

    fn current_state(&self) -> SessionState {
        match &self.pending {
            Some(pending) if !pending.agreed => SessionState::UserAgreementPending,
            _ => self.link,
        }
    }

    fn publish_state(&self) {
        let state = self.current_state();
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = ?*current, to = ?state, "session state changed");
            *current = state;
            true
        });
    }

    fn publish(&self, event: StatusEvent) {
        self.deps.bus.publish(event);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::RequestSession { reply } => {
                let _ = reply.send(self.request_session().await);
            }
            Command::ReleaseSession { reply } => {
                let _ = reply.send(self.release_session().await);
            }
            Command::AcceptDownload { reply } => {
                let _ = reply.send(self.accept_download().await);
            }
            Command::AbortDownload { kind, reply } => {
                let _ = reply.send(self.abort_download(kind).await);
            }
            Command::Status { reply } => {
                let _ = reply.send(SessionStatus {
                    state: self.current_state(),
                    pending: self.pending.clone(),
                    downloading: self.active.as_ref().map(|active| active.kind),
                    retry_scheduled: self.retry_timer.is_running(),
                });
            }
        }
    }

    async fn request_session(&mut self) -> Result<(), SessionError> {
        match self.link {
            SessionState::DeviceManagement | SessionState::Bootstrapping => {
                return Err(SessionError::Duplicate);
            }
            SessionState::Connecting => return Err(SessionError::Busy),
            _ if self.retry_timer.is_running() => return Err(SessionError::Busy),
            _ => {}
        }

        self.connect().await
    }

    async fn connect(&mut self) -> Result<(), SessionError> {
        self.deps.connection.request().await?;
        self.deps.lwm2m.connect().await?;

        info!("connecting to device-management server");
        self.link = SessionState::Connecting;
        self.publish_state();
        Ok(())
    }

    async fn release_session(&mut self) -> Result<(), SessionError> {
        let retry_cancelled = self.retry_timer.stop().is_ok();

        if self.link == SessionState::Disconnected {
            return if retry_cancelled {
                info!("pending session retry cancelled");
                Ok(())
            } else {
                Err(SessionError::NotConnected)
            };
        }

        let _ = self.activity_timer.stop();
        match self.deps.lwm2m.disconnect().await {
            Ok(()) | Err(Lwm2mError::NoSession) => {}
            Err(e) => return Err(e.into()),
        }
        if let Err(e) = self.deps.connection.release().await {
            warn!(error = %e, "failed to release data connection");
        }

        info!("session released");
        self.link = SessionState::Disconnected;
        self.deps.pusher.cancel_all();
        self.publish(StatusEvent::new(AvcStatus::SessionStopped));
        self.publish_state();
        Ok(())
    }

    async fn accept_download(&mut self) -> Result<(), SessionError> {
        let pending = self
            .pending
            .as_mut()
            .ok_or(SessionError::NoPendingDownload)?;
        pending.agreed = true;
        info!(kind = %pending.kind, uri = %pending.uri, "download accepted");
        self.publish_state();

        match self.link {
            SessionState::DeviceManagement => self.maybe_start_download().await,
            SessionState::Disconnected if !self.retry_timer.is_running() => {
                // The download starts once the session is up.
                self.connect().await?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn abort_download(&mut self, kind: UpdateType) -> Result<(), SessionError> {
        if self.pending.as_ref().is_some_and(|p| p.kind == kind) {
            self.pending = None;
        }
        self.publish_state();

        self.deps.downloader.abort_download(kind).await?;
        Ok(())
    }

    async fn handle_lwm2m(&mut self, event: Lwm2mEvent) {
        match event {
            Lwm2mEvent::BootstrapStarted => {
                info!("bootstrap session started");
                self.link = SessionState::Bootstrapping;
                self.publish_state();
            }
            Lwm2mEvent::SessionStarted => self.on_session_started().await,
            Lwm2mEvent::SessionFailed => {
                warn!("session attempt failed");
                self.link = SessionState::Disconnected;
                let _ = self.activity_timer.stop();
                self.schedule_retry();
                self.publish_state();
            }
            Lwm2mEvent::SessionClosed => {
                if self.link != SessionState::Disconnected {
                    info!("session closed by server");
                    self.link = SessionState::Disconnected;
                    self.publish(StatusEvent::new(AvcStatus::SessionStopped));
                }
                let _ = self.activity_timer.stop();
                self.deps.pusher.cancel_all();
                self.publish_state();
            }
            Lwm2mEvent::PackageUri {
                kind,
                uri,
                expected_digest,
            } => self.on_package_uri(kind, uri, expected_digest).await,
            Lwm2mEvent::InstallRequested { kind } => self.on_install_requested(kind).await,
            Lwm2mEvent::AbortRequested { kind } => {
                info!(kind = %kind, "server requested abort");
                if let Err(e) = self.abort_download(kind).await {
                    warn!(kind = %kind, error = %e, "abort failed");
                }
            }
            Lwm2mEvent::PushAck { mid, acked } => self.deps.pusher.resolve(mid, acked),
        }
    }

    async fn on_session_started(&mut self) {
        info!("device-management session started");
        self.link = SessionState::DeviceManagement;
        self.retry_index = 0;
        let _ = self.retry_timer.stop();

        self.publish(StatusEvent::new(AvcStatus::SessionStarted));
        self.restart_activity_timer();
        self.spawn_notification_check();

        if let Some(pending) = self.pending.as_ref().filter(|p| !p.agreed) {
            self.publish(
                StatusEvent::new(AvcStatus::DownloadPending)
                    .kind(pending.kind)
                    .num_bytes(pending.bytes_left),
            );
        }

        self.maybe_start_download().await;
        self.publish_state();
    }

    async fn on_package_uri(
        &mut self,
        kind: UpdateType,
        uri: String,
        expected_digest: Option<blake3::Hash>,
    ) {
        if let Some(active) = &self.active {
            warn!(active = %active.kind, "download in progress, ignoring package uri");
            return;
        }
        if let Err(e) = validate_uri(&uri) {
            warn!(error = %e, "rejecting package uri");
            return;
        }

        info!(kind = %kind, %uri, "package available");
        self.pending = Some(PendingDownload {
            uri,
            kind,
            resume: false,
            expected_digest,
            bytes_left: None,
            agreed: !self.deps.config.download_user_agreement,
        });
        self.publish(StatusEvent::new(AvcStatus::DownloadPending).kind(kind));

        self.maybe_start_download().await;
        self.publish_state();
    }

    /// Hand the pending download to the download context once it has
    /// consent, a session and connectivity.
    async fn maybe_start_download(&mut self) {
        let Some(pending) = &self.pending else {
            return;
        };
        if !pending.agreed {
            debug!(kind = %pending.kind, "download waits for agreement");
            return;
        }
        if self.link != SessionState::DeviceManagement || !self.online {
            debug!(kind = %pending.kind, online = self.online, "download waits for session");
            return;
        }

        let Some(pending) = self.pending.take() else {
            return;
        };
        let request = DownloadRequest::new(pending.uri.clone(), pending.kind)
            .resume(pending.resume)
            .expected_digest(pending.expected_digest);

        let result = match self.deps.downloader.start_download(request.clone()).await {
            Err(DownloadError::ResumeMismatch { stored, requested }) => {
                warn!(%stored, %requested, "resume information mismatch, restarting download");
                self.deps
                    .downloader
                    .start_download(request.resume(false))
                    .await
            }
            result => result,
        };

        match result {
            Ok(()) => {
                let _ = self.activity_timer.stop();
                self.active = Some(pending);
            }
            Err(DownloadError::Busy) => {
                debug!("download context busy, keeping download pending");
                self.pending = Some(pending);
            }
            Err(e) => {
                error!(kind = %pending.kind, error = %e, "failed to start download");
                self.publish(
                    StatusEvent::new(AvcStatus::DownloadFailed)
                        .kind(pending.kind)
                        .error_code(avc_core::AvcErrorCode::Internal),
                );
            }
        }
        self.publish_state();
    }

    async fn on_install_requested(&mut self, kind: UpdateType) {
        let state = self.deps.update.get_update_state(kind).await;
        if state != UpdateState::InstallPending {
            warn!(kind = %kind, ?state, "install requested with no package ready");
            return;
        }

        info!(kind = %kind, "installing package");
        let _ = self.activity_timer.stop();
        self.publish(StatusEvent::new(AvcStatus::InstallInProgress).kind(kind));

        let update = self.deps.update.clone();
        let installer = self.deps.installer.clone();
        let package = self.deps.sink.package_path(kind);
        let tx = self.internal_tx.clone();

        tokio::spawn(async move {
            let result = match update.install(kind, installer.as_ref(), &package).await {
                Ok(result) => Some(result),
                Err(e) => {
                    error!(kind = %kind, error = %e, "install could not be recorded");
                    None
                }
            };
            let _ = tx.send(Internal::InstallFinished { kind, result });
        });
    }

    async fn handle_download(&mut self, event: DownloaderEvent) {
        match event {
            DownloaderEvent::Started { kind, offset } => {
                debug!(kind = %kind, offset, "download running");
                self.publish(StatusEvent::new(AvcStatus::DownloadInProgress).kind(kind));
            }
            DownloaderEvent::Progress {
                kind,
                total_size,
                percent,
                ..
            } => {
                self.publish(
                    StatusEvent::new(AvcStatus::DownloadInProgress)
                        .kind(kind)
                        .num_bytes(total_size)
                        .progress(Some(percent)),
                );
            }
            DownloaderEvent::Completed { kind } => {
                self.active = None;
                self.publish(StatusEvent::new(AvcStatus::DownloadComplete).kind(kind));
                self.publish(StatusEvent::new(AvcStatus::InstallPending).kind(kind));
                self.restart_activity_timer();
            }
            DownloaderEvent::Failed { kind, result } => {
                self.active = None;
                self.publish(
                    StatusEvent::new(AvcStatus::DownloadFailed)
                        .kind(kind)
                        .error_code(result.error_code()),
                );
                self.restart_activity_timer();
                self.spawn_notification_check();
            }
            DownloaderEvent::Suspended { kind, bytes_left } => {
                if let Some(mut suspended) = self.active.take() {
                    suspended.resume = true;
                    suspended.bytes_left = bytes_left;
                    self.pending = Some(suspended);
                }
                self.publish(
                    StatusEvent::new(AvcStatus::DownloadPending)
                        .kind(kind)
                        .num_bytes(bytes_left),
                );
                self.maybe_start_download().await;
            }
            DownloaderEvent::Aborted { kind } => {
                if self.active.as_ref().is_some_and(|a| a.kind == kind) {
                    self.active = None;
                }
                if self.pending.as_ref().is_some_and(|p| p.kind == kind) {
                    self.pending = None;
                }
                self.publish(StatusEvent::new(AvcStatus::NoUpdate).kind(kind));
                self.restart_activity_timer();
            }
        }
        self.publish_state();
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::RetryTimer => {
                if self.link == SessionState::Disconnected {
                    info!("retrying session");
                    if let Err(e) = self.connect().await {
                        warn!(error = %e, "session retry failed");
                        self.schedule_retry();
                    }
                }
            }
            Internal::ActivityTimer => {
                if self.link != SessionState::DeviceManagement {
                    return;
                }
                if self.active.is_some() {
                    self.restart_activity_timer();
                    return;
                }
                info!("session idle, releasing");
                if let Err(e) = self.release_session().await {
                    warn!(error = %e, "failed to release idle session");
                }
            }
            Internal::PollingTimer => {
                if self.link == SessionState::DeviceManagement {
                    if let Err(e) = self.deps.lwm2m.update().await {
                        warn!(error = %e, "registration update failed");
                    }
                } else {
                    match self.request_session().await {
                        Ok(()) | Err(SessionError::Busy | SessionError::Duplicate) => {}
                        Err(e) => warn!(error = %e, "polling session request failed"),
                    }
                }
                self.restart_polling_timer();
            }
            Internal::InstallFinished { kind, result } => {
                let status = match result {
                    Some(UpdateResult::Ok) => AvcStatus::InstallComplete,
                    _ => AvcStatus::InstallFailed,
                };
                let error_code = result
                    .map(UpdateResult::error_code)
                    .unwrap_or(avc_core::AvcErrorCode::Internal);
                info!(kind = %kind, ?status, "install finished");

                self.publish(StatusEvent::new(status).kind(kind).error_code(error_code));
                self.restart_activity_timer();
                self.spawn_notification_check();
            }
        }
    }

    async fn handle_connectivity(&mut self, online: bool) {
        self.online = online;

        if !online {
            if self.active.is_some() {
                info!("connectivity lost, suspending download");
                if let Err(e) = self.deps.downloader.suspend_download().await {
                    warn!(error = %e, "failed to suspend download");
                }
            }
            return;
        }

        self.maybe_start_download().await;
    }

    fn spawn_notification_check(&self) {
        if self.link != SessionState::DeviceManagement {
            return;
        }

        let reporter = self.deps.reporter.clone();
        let update = self.deps.update.clone();
        let pusher = self.deps.pusher.clone();
        // Acks arrive through this loop, so the check must not run inside it.
        tokio::spawn(async move {
            match reporter.check_notification_to_send(&pusher).await {
                Ok(Delivery::Reported {
                    update_type,
                    captured_at,
                }) => {
                    info!(kind = %update_type, "pending result sent to server");
                    if let Err(e) = update.clear_reported(update_type, captured_at).await {
                        error!(kind = %update_type, error = %e, "failed to clear reported update");
                    }
                }
                Ok(Delivery::Superseded) => info!("result sent, a newer one is pending"),
                Ok(Delivery::Nothing) => debug!("no result pending"),
                Err(e) => warn!(error = %e, "result notification failed"),
            }
        });
    }

    fn schedule_retry(&mut self) {
        let timers = &self.deps.config.retry_timers;
        while let Some(delay) = timers.get(self.retry_index).copied() {
            self.retry_index += 1;
            if !delay.is_zero() {
                info!(?delay, "scheduling session retry");
                self.retry_timer
                    .start(delay, self.internal_tx.clone(), Internal::RetryTimer);
                return;
            }
        }

        warn!("session retry timers exhausted");
        self.retry_index = 0;
    }

    fn restart_activity_timer(&mut self) {
        let timeout = self.deps.config.activity_timeout;
        if self.link != SessionState::DeviceManagement || self.active.is_some() || timeout.is_zero()
        {
            return;
        }
        self.activity_timer
            .start(timeout, self.internal_tx.clone(), Internal::ActivityTimer);
    }

    fn restart_polling_timer(&mut self) {
        if let Some(interval) = self.deps.config.polling_interval {
            self.polling_timer
                .start(interval, self.internal_tx.clone(), Internal::PollingTimer);
        }
    }
}
