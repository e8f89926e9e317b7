use std::sync::Arc;
use std::time::Duration;

use avc_core::{UpdateResult, UpdateType};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use super::DownloaderEvent;
use super::retry::RetryPolicy;
use super::sink::{PackageSink, PackageWriter, SinkError};
use super::source::{FetchError, PackageSource};
use crate::resume::{ResumeError, ResumeStore};
use crate::storage::Storage;

/// How a transfer task ended.
#[derive(Debug)]
pub(super) enum Outcome {
    Completed { digest: blake3::Hash },
    Failed(UpdateResult),
    /// Cancelled through the transfer's token.
    Stopped,
}

#[derive(Debug, thiserror::Error)]
enum AttemptError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Resume(#[from] ResumeError),
    #[error("cancelled")]
    Cancelled,
}

impl AttemptError {
    fn update_result(&self) -> UpdateResult {
        match self {
            AttemptError::Fetch(e) => e.update_result(),
            AttemptError::Sink(e) => e.update_result(),
            // Resume info can no longer be kept in step with the package.
            AttemptError::Resume(_) => UpdateResult::NoSpace,
            AttemptError::Cancelled => UpdateResult::ConnectionError,
        }
    }
}

/// One package download, run on its own task.
pub(super) struct Transfer<S> {
    pub kind: UpdateType,
    pub uri: String,
    pub url: Url,
    pub offset: u64,
    pub total_size: Option<u64>,
    pub resume: ResumeStore<S>,
    pub source: Arc<dyn PackageSource>,
    pub sink: Arc<dyn PackageSink>,
    pub retry: RetryPolicy,
    pub chunk_timeout: Duration,
    pub token: CancellationToken,
    pub events: mpsc::UnboundedSender<DownloaderEvent>,
}

impl<S: Storage + Clone> Transfer<S> {
    #[instrument(skip_all, fields(kind = %self.kind, uri = %self.uri))]
    pub(super) async fn run(mut self) -> Outcome {
        let mut writer = match self.open_writer().await {
            Ok(writer) => writer,
            Err(e) => {
                warn!(error = %e, "cannot open package storage");
                return Outcome::Failed(e.update_result());
            }
        };

        let mut failures = 0u32;
        let mut last_percent = None;

        loop {
            let before = self.offset;

            match self.attempt(&mut writer, &mut last_percent).await {
                Ok(()) => break,
                Err(AttemptError::Cancelled) => return Outcome::Stopped,
                Err(AttemptError::Fetch(e)) if e.is_transient() => {
                    failures = if self.offset > before { 1 } else { failures + 1 };
                    if self.retry.exhausted(failures) {
                        warn!(attempts = failures, error = %e, "download failed, giving up");
                        return Outcome::Failed(UpdateResult::ConnectionError);
                    }

                    let delay = self.retry.delay(failures);
                    warn!(
                        attempt = failures,
                        offset = self.offset,
                        ?delay,
                        error = %e,
                        "download attempt failed, retrying"
                    );

                    tokio::select! {
                        _ = self.token.cancelled() => return Outcome::Stopped,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(error = %e, offset = self.offset, "download failed");
                    return Outcome::Failed(e.update_result());
                }
            }
        }

        drop(writer);
        match self.sink.digest(self.kind).await {
            Ok(digest) => Outcome::Completed { digest },
            Err(e) => Outcome::Failed(e.update_result()),
        }
    }

    async fn open_writer(&mut self) -> Result<Box<dyn PackageWriter>, AttemptError> {
        match self.sink.open(self.kind, self.offset).await {
            Ok(writer) => Ok(writer),
            Err(SinkError::Truncated { expected, actual }) => {
                warn!(expected, actual, "stored package shorter than resume offset, restarting");
                self.offset = 0;
                self.resume.save(&self.uri, self.kind, 0).await?;
                Ok(self.sink.open(self.kind, 0).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn attempt(
        &mut self,
        writer: &mut Box<dyn PackageWriter>,
        last_percent: &mut Option<u8>,
    ) -> Result<(), AttemptError> {
        // Every byte was stored before the restart, only verification is left.
        if self.offset > 0 && self.total_size == Some(self.offset) {
            debug!(bytes = self.offset, "package already complete, nothing to fetch");
            return Ok(());
        }

        let stream = tokio::select! {
            _ = self.token.cancelled() => return Err(AttemptError::Cancelled),
            stream = self.source.fetch(&self.url, self.offset) => stream?,
        };

        if stream.offset != self.offset {
            *writer = self.sink.open(self.kind, stream.offset).await?;
            self.offset = stream.offset;
            self.resume.save(&self.uri, self.kind, self.offset).await?;
        }

        if let Some(total) = stream.total_size
            && self.total_size != Some(total)
        {
            self.resume.set_package_size(total).await?;
            self.total_size = Some(total);
        }

        let mut chunks = stream.chunks;
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => return Err(AttemptError::Cancelled),
                next = tokio::time::timeout(self.chunk_timeout, chunks.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    return Err(FetchError::Interrupted(format!(
                        "no data for {:?}",
                        self.chunk_timeout
                    ))
                    .into());
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            writer.write(&chunk).await?;
            writer.commit().await?;
            self.offset += chunk.len() as u64;
            self.resume.save(&self.uri, self.kind, self.offset).await?;

            self.report_progress(last_percent);
        }

        if let Some(total) = self.total_size
            && self.offset < total
        {
            return Err(FetchError::Interrupted(format!(
                "stream ended at {} of {total} bytes",
                self.offset
            ))
            .into());
        }

        debug!(bytes = self.offset, "package stream complete");
        Ok(())
    }

    fn report_progress(&self, last_percent: &mut Option<u8>) {
        let Some(total) = self.total_size.filter(|total| *total > 0) else {
            return;
        };

        #[allow(clippy::cast_possible_truncation)]
        let percent = (self.offset.min(total) * 100 / total) as u8;
        if *last_percent == Some(percent) {
            return;
        }
        *last_percent = Some(percent);

        let _ = self.events.send(DownloaderEvent::Progress {
            kind: self.kind,
            bytes_downloaded: self.offset,
            total_size: Some(total),
            percent,
        });
    }
}
