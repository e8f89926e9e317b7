use avc_core::{AvcErrorCode, AvcStatus, UpdateType};
use serde::Serialize;
use tokio::sync::broadcast;

/// Status change delivered to local subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusEvent {
    pub status: AvcStatus,
    pub kind: Option<UpdateType>,
    /// Package size when known.
    pub num_bytes: Option<u64>,
    /// Download progress in whole percent.
    pub progress: Option<u8>,
    pub error_code: AvcErrorCode,
}

impl StatusEvent {
    pub fn new(status: AvcStatus) -> Self {
        Self {
            status,
            kind: None,
            num_bytes: None,
            progress: None,
            error_code: AvcErrorCode::None,
        }
    }

    pub fn kind(mut self, kind: UpdateType) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn num_bytes(mut self, num_bytes: Option<u64>) -> Self {
        self.num_bytes = num_bytes;
        self
    }

    pub fn progress(mut self, progress: Option<u8>) -> Self {
        self.progress = progress;
        self
    }

    pub fn error_code(mut self, error_code: AvcErrorCode) -> Self {
        self.error_code = error_code;
        self
    }
}

/// Fan-out of [`StatusEvent`]s in publication order.
///
/// Dropping a receiver unregisters it. Slow receivers lose the oldest events
/// once `capacity` is exceeded.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<StatusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: StatusEvent) {
        tracing::debug!(status = ?event.status, kind = ?event.kind, "publishing status event");
        // No subscribers is fine.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}
