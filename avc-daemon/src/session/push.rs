use std::sync::Arc;
use std::time::Duration;

use avc_core::{ContentType, MessageId};
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::oneshot;

use super::lwm2m::{Lwm2mClient, Lwm2mError};

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push failed: {0}")]
    Failed(#[from] Lwm2mError),
    #[error("server rejected message {0:?}")]
    Rejected(MessageId),
    #[error("ack channel closed: {0}")]
    ChannelClosed(#[from] oneshot::error::RecvError),
    #[error("timeout: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),
}

/// Push primitive of the session: sends a payload and waits for the
/// server's delivery report.
#[derive(Clone)]
pub struct Pusher {
    client: Arc<dyn Lwm2mClient>,
    pending: Arc<DashMap<MessageId, oneshot::Sender<bool>>>,
    timeout: Duration,
}

impl Pusher {
    pub fn new(client: Arc<dyn Lwm2mClient>, timeout: Duration) -> Self {
        Self {
            client,
            pending: Arc::new(DashMap::new()),
            timeout,
        }
    }

    pub async fn push_and_wait(
        &self,
        payload: Bytes,
        content_type: ContentType,
    ) -> Result<MessageId, PushError> {
        let mid = MessageId::new();
        let (tx_wait, rx_wait) = oneshot::channel();

        // Registered before sending so a fast ack cannot be missed.
        self.pending.insert(mid, tx_wait);

        if let Err(e) = self.client.push(mid, payload, content_type).await {
            self.pending.remove(&mid);
            return Err(e.into());
        }

        match tokio::time::timeout(self.timeout, rx_wait).await {
            Ok(Ok(true)) => Ok(mid),
            Ok(Ok(false)) => Err(PushError::Rejected(mid)),
            Ok(Err(closed)) => Err(PushError::ChannelClosed(closed)),
            Err(elapsed) => {
                self.pending.remove(&mid);
                Err(PushError::Timeout(elapsed))
            }
        }
    }

    /// Hand a delivery report to its waiter.
    pub fn resolve(&self, mid: MessageId, acked: bool) {
        match self.pending.remove(&mid) {
            Some((_, tx)) => {
                let _ = tx.send(acked);
            }
            None => tracing::warn!(?mid, "no waiter found for push ack"),
        }
    }

    /// Fail every outstanding push, e.g. when the session closes.
    pub fn cancel_all(&self) {
        self.pending.clear();
    }

    pub fn outstanding(&self) -> usize {
        self.pending.len()
    }
}
