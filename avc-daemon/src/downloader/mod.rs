//! Package download context.
//!
//! The [`Downloader`] actor owns the in-flight transfer and is driven through
//! a [`DownloaderHandle`]. Network I/O happens on a separate task per
//! transfer, so nothing here ever blocks the session context.

pub mod retry;
pub mod sink;
pub mod source;
mod transfer;

use std::sync::Arc;
use std::time::Duration;

use avc_core::{UpdateResult, UpdateState, UpdateType};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use crate::resume::{ResumeError, ResumeStore, validate_uri};
use crate::storage::Storage;
use crate::update::{UpdateError, UpdateStateMachine};

use retry::RetryPolicy;
use sink::PackageSink;
use source::PackageSource;
use transfer::{Outcome, Transfer};

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("a download is already in progress")]
    Busy,
    #[error("invalid package uri: {0}")]
    InvalidUri(String),
    #[error("stored resume information is for {stored}, not {requested}")]
    ResumeMismatch { stored: String, requested: String },
    #[error("no download in progress")]
    NotActive,
    #[error("the download is already being stopped")]
    Stopping,
    #[error("bytes left to download are undefined in the current state")]
    Undefined,
    #[error(transparent)]
    Update(#[from] UpdateError),
    #[error(transparent)]
    Resume(#[from] ResumeError),
    #[error("downloader task stopped")]
    Stopped,
}

/// What to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub uri: String,
    pub kind: UpdateType,
    /// Continue from the stored resume offset instead of starting over.
    pub resume: bool,
    pub expected_digest: Option<blake3::Hash>,
}

impl DownloadRequest {
    pub fn new(uri: impl Into<String>, kind: UpdateType) -> Self {
        Self {
            uri: uri.into(),
            kind,
            resume: false,
            expected_digest: None,
        }
    }

    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn expected_digest(mut self, digest: Option<blake3::Hash>) -> Self {
        self.expected_digest = digest;
        self
    }
}

/// Reported to the session context as transfers progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloaderEvent {
    Started {
        kind: UpdateType,
        offset: u64,
    },
    Progress {
        kind: UpdateType,
        bytes_downloaded: u64,
        total_size: Option<u64>,
        percent: u8,
    },
    /// Downloaded and verified; the update waits for installation.
    Completed {
        kind: UpdateType,
    },
    Failed {
        kind: UpdateType,
        result: UpdateResult,
    },
    /// Stopped with resume information kept.
    Suspended {
        kind: UpdateType,
        bytes_left: Option<u64>,
    },
    Aborted {
        kind: UpdateType,
    },
}

#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    pub retry: RetryPolicy,
    /// Longest wait for the next chunk before the attempt counts as failed.
    pub chunk_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            chunk_timeout: Duration::from_secs(30),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, DownloadError>>;

enum Command {
    Start {
        request: DownloadRequest,
        reply: Reply<()>,
    },
    Abort {
        kind: UpdateType,
        reply: Reply<()>,
    },
    Suspend {
        reply: Reply<()>,
    },
    BytesLeft {
        reply: Reply<u64>,
    },
    IsBusy {
        reply: oneshot::Sender<bool>,
    },
}

enum StopReason {
    Abort,
    Suspend,
}

struct Active {
    kind: UpdateType,
    expected_digest: Option<blake3::Hash>,
    token: CancellationToken,
    stop: Option<(StopReason, Reply<()>)>,
}

/// Client side of the download context.
#[derive(Clone)]
pub struct DownloaderHandle {
    tx: mpsc::Sender<Command>,
}

impl DownloaderHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, DownloadError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| DownloadError::Stopped)?;
        rx.await.map_err(|_| DownloadError::Stopped)?
    }

    /// Start a transfer. Fails with [`DownloadError::Busy`] while another one
    /// is running.
    pub async fn start_download(&self, request: DownloadRequest) -> Result<(), DownloadError> {
        self.request(|reply| Command::Start { request, reply }).await
    }

    /// Stop the transfer of `kind`, forget its resume information and return
    /// the update to idle. Replies once the transfer has ended.
    pub async fn abort_download(&self, kind: UpdateType) -> Result<(), DownloadError> {
        self.request(|reply| Command::Abort { kind, reply }).await
    }

    /// Stop the running transfer but keep its resume information.
    pub async fn suspend_download(&self) -> Result<(), DownloadError> {
        self.request(|reply| Command::Suspend { reply }).await
    }

    pub async fn bytes_left_to_download(&self) -> Result<u64, DownloadError> {
        self.request(|reply| Command::BytesLeft { reply }).await
    }

    pub async fn is_busy(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::IsBusy { reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }
}

/// Dependencies of the download context.
pub struct Downloader<S> {
    resume: ResumeStore<S>,
    update: UpdateStateMachine<S>,
    source: Arc<dyn PackageSource>,
    sink: Arc<dyn PackageSink>,
    config: DownloaderConfig,
    events: mpsc::UnboundedSender<DownloaderEvent>,
    active: Option<Active>,
}

impl<S: Storage + Clone> Downloader<S> {
    pub fn new(
        resume: ResumeStore<S>,
        update: UpdateStateMachine<S>,
        source: Arc<dyn PackageSource>,
        sink: Arc<dyn PackageSink>,
        config: DownloaderConfig,
        events: mpsc::UnboundedSender<DownloaderEvent>,
    ) -> Self {
        Self {
            resume,
            update,
            source,
            sink,
            config,
            events,
            active: None,
        }
    }

    /// Run the download context until `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> DownloaderHandle {
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(self.run(rx, cancel));
        DownloaderHandle { tx }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(active) = &self.active {
                        active.token.cancel();
                    }
                    info!("downloader shutting down");
                    break;
                }
                Some(command) = rx.recv() => self.handle(command, &done_tx).await,
                Some(outcome) = done_rx.recv() => self.end_download(outcome).await,
            }
        }
    }

    async fn handle(&mut self, command: Command, done: &mpsc::UnboundedSender<Outcome>) {
        match command {
            Command::Start { request, reply } => {
                let _ = reply.send(self.start(request, done).await);
            }
            Command::Abort { kind, reply } => match &mut self.active {
                Some(active) if active.kind == kind => {
                    if active.stop.is_some() {
                        let _ = reply.send(Err(DownloadError::Stopping));
                    } else {
                        info!(kind = %kind, "aborting download");
                        active.stop = Some((StopReason::Abort, reply));
                        active.token.cancel();
                    }
                }
                _ => {
                    let result = self.discard(kind).await;
                    if result.is_ok() {
                        let _ = self.events.send(DownloaderEvent::Aborted { kind });
                    }
                    let _ = reply.send(result);
                }
            },
            Command::Suspend { reply } => match &mut self.active {
                Some(active) if active.stop.is_none() => {
                    info!(kind = %active.kind, "suspending download");
                    active.stop = Some((StopReason::Suspend, reply));
                    active.token.cancel();
                }
                Some(_) => {
                    let _ = reply.send(Err(DownloadError::Stopping));
                }
                None => {
                    let _ = reply.send(Err(DownloadError::NotActive));
                }
            },
            Command::BytesLeft { reply } => {
                let _ = reply.send(self.bytes_left().await);
            }
            Command::IsBusy { reply } => {
                let _ = reply.send(self.active.is_some());
            }
        }
    }

    async fn start(
        &mut self,
        request: DownloadRequest,
        done: &mpsc::UnboundedSender<Outcome>,
    ) -> Result<(), DownloadError> {
        if self.active.is_some() {
            return Err(DownloadError::Busy);
        }

        let DownloadRequest {
            uri,
            kind,
            resume,
            expected_digest,
        } = request;

        validate_uri(&uri).map_err(|e| DownloadError::InvalidUri(e.to_string()))?;
        let url = Url::parse(&uri).map_err(|e| DownloadError::InvalidUri(e.to_string()))?;

        let state = self.update.get_update_state(kind).await;
        let stored = self.resume.load().await?;

        // Everything above is checked before anything is written.
        let (offset, total_size) = if resume {
            if !state.can_transition_to(UpdateState::Downloading) {
                return Err(UpdateError::InvalidTransition {
                    kind,
                    from: state,
                    to: UpdateState::Downloading,
                }
                .into());
            }

            match stored {
                Some(info) if info.uri.as_ref() == uri && info.update_type == kind => {
                    (info.bytes_downloaded, info.package_size)
                }
                Some(info) => {
                    return Err(DownloadError::ResumeMismatch {
                        stored: info.uri.into(),
                        requested: uri,
                    });
                }
                None => {
                    self.resume.save(&uri, kind, 0).await?;
                    (0, None)
                }
            }
        } else {
            // A new package supersedes whatever the previous one left behind.
            if !state.can_transition_to(UpdateState::Downloading) {
                self.update.clear(kind).await?;
            }
            self.resume.delete().await?;
            self.resume.save(&uri, kind, 0).await?;
            (0, None)
        };

        self.update
            .set_update_state(kind, UpdateState::Downloading)
            .await?;

        let token = CancellationToken::new();
        let transfer = Transfer {
            kind,
            uri: uri.clone(),
            url,
            offset,
            total_size,
            resume: self.resume.clone(),
            source: self.source.clone(),
            sink: self.sink.clone(),
            retry: self.config.retry.clone(),
            chunk_timeout: self.config.chunk_timeout,
            token: token.clone(),
            events: self.events.clone(),
        };

        let done = done.clone();
        tokio::spawn(async move {
            let outcome = transfer.run().await;
            let _ = done.send(outcome);
        });

        info!(kind = %kind, %uri, offset, resume, "download started");
        self.active = Some(Active {
            kind,
            expected_digest,
            token,
            stop: None,
        });
        let _ = self.events.send(DownloaderEvent::Started { kind, offset });

        Ok(())
    }

    /// Release the finished transfer and move the update on.
    async fn end_download(&mut self, outcome: Outcome) {
        let Some(mut active) = self.active.take() else {
            warn!(?outcome, "transfer ended with no download active");
            return;
        };
        let kind = active.kind;

        let event = match (outcome, active.stop.take()) {
            (_, Some((StopReason::Abort, reply))) => {
                let result = self.discard(kind).await;
                let event = result.is_ok().then_some(DownloaderEvent::Aborted { kind });
                let _ = reply.send(result);
                event
            }
            (Outcome::Stopped, Some((StopReason::Suspend, reply))) => {
                let bytes_left = match self.resume.load().await {
                    Ok(info) => info.and_then(|info| info.bytes_left()),
                    Err(e) => {
                        error!(error = %e, "failed to read resume information");
                        None
                    }
                };
                info!(kind = %kind, ?bytes_left, "download suspended");
                let _ = reply.send(Ok(()));
                Some(DownloaderEvent::Suspended { kind, bytes_left })
            }
            (Outcome::Stopped, None) => None,
            (outcome, suspend) => {
                if let Some((_, reply)) = suspend {
                    let _ = reply.send(Err(DownloadError::NotActive));
                }
                Some(self.finish(kind, outcome, active.expected_digest).await)
            }
        };

        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    async fn finish(
        &self,
        kind: UpdateType,
        outcome: Outcome,
        expected_digest: Option<blake3::Hash>,
    ) -> DownloaderEvent {
        let result = match outcome {
            Outcome::Completed { digest } => self.verify(kind, digest, expected_digest).await,
            Outcome::Failed(result) => Ok(result),
            Outcome::Stopped => Ok(UpdateResult::ConnectionError),
        };

        match result {
            Ok(UpdateResult::Ok) => {
                info!(kind = %kind, "download complete, install pending");
                DownloaderEvent::Completed { kind }
            }
            Ok(result) => {
                if let Err(e) = self.update.fail(kind, result).await {
                    error!(kind = %kind, error = %e, "failed to record download failure");
                }
                DownloaderEvent::Failed { kind, result }
            }
            Err(e) => {
                error!(kind = %kind, error = %e, "failed to record download completion");
                if let Err(e) = self.update.fail(kind, UpdateResult::BadPackage).await {
                    error!(kind = %kind, error = %e, "failed to record download failure");
                }
                DownloaderEvent::Failed {
                    kind,
                    result: UpdateResult::BadPackage,
                }
            }
        }
    }

    async fn verify(
        &self,
        kind: UpdateType,
        digest: blake3::Hash,
        expected: Option<blake3::Hash>,
    ) -> Result<UpdateResult, DownloadError> {
        self.resume.delete().await?;
        self.update
            .set_update_state(kind, UpdateState::Downloaded)
            .await?;
        self.update
            .set_update_state(kind, UpdateState::Verifying)
            .await?;

        if let Some(expected) = expected
            && expected != digest
        {
            warn!(
                kind = %kind,
                expected = %expected.to_hex(),
                actual = %digest.to_hex(),
                "package digest mismatch"
            );
            return Ok(UpdateResult::ChecksumMismatch);
        }

        self.update
            .set_update_state(kind, UpdateState::InstallPending)
            .await?;
        Ok(UpdateResult::Ok)
    }

    /// Forget the download of `kind` and bring its update back to idle.
    async fn discard(&self, kind: UpdateType) -> Result<(), DownloadError> {
        if let Some(info) = self.resume.load().await?
            && info.update_type == kind
        {
            self.resume.delete().await?;
        }

        let state = self.update.get_update_state(kind).await;
        if state == UpdateState::Installing {
            return Err(UpdateError::InvalidTransition {
                kind,
                from: state,
                to: UpdateState::Idle,
            }
            .into());
        }

        self.update.clear(kind).await?;
        info!(kind = %kind, "download discarded");
        Ok(())
    }

    async fn bytes_left(&self) -> Result<u64, DownloadError> {
        match self.resume.load().await? {
            Some(info) => {
                let record = self.update.record(info.update_type).await;
                match (record.state, record.result) {
                    (UpdateState::Idle, None) => info.package_size.ok_or(DownloadError::Undefined),
                    (UpdateState::Downloading, None) => {
                        info.bytes_left().ok_or(DownloadError::Undefined)
                    }
                    _ => Err(DownloadError::Undefined),
                }
            }
            None => {
                for kind in UpdateType::ALL {
                    let record = self.update.record(kind).await;
                    if record.state == UpdateState::Downloaded
                        && matches!(record.result, None | Some(UpdateResult::Ok))
                    {
                        return Ok(0);
                    }
                }
                Err(DownloadError::Undefined)
            }
        }
    }
}
