use std::sync::Arc;

use avc_core::{
    AvcErrorCode, AvcStatus, ContentType, NotificationPending, UpdateResult, UpdateType,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::session::push::{PushError, Pusher};
use crate::storage::{BoxError, Storage, boxed};

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("failed to persist notification: {0}")]
    Storage(#[source] BoxError),
    #[error("failed to encode notification: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("failed to push notification: {0}")]
    Push(#[from] PushError),
}

/// Body of the result notification pushed to the server.
#[derive(Debug, Serialize)]
struct ResultPayload {
    #[serde(rename = "type")]
    update_type: UpdateType,
    status: AvcStatus,
    error_code: AvcErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<UpdateResult>,
}

/// What a notification check achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// No result was waiting for the server.
    Nothing,
    /// The server acknowledged the result of `update_type` captured at
    /// `captured_at`, and it is no longer pending.
    Reported {
        update_type: UpdateType,
        captured_at: jiff::Timestamp,
    },
    /// The push was acknowledged but a newer result replaced it meanwhile.
    Superseded,
}

/// Keeps track of the terminal update result the server has not seen yet.
#[derive(Clone)]
pub struct Reporter<S> {
    storage: S,
    /// Serializes read-modify-write of the stored record.
    record_lock: Arc<Mutex<()>>,
    /// Serializes whole send attempts so two callers never push the same
    /// record.
    send_lock: Arc<Mutex<()>>,
}

impl<S: Storage + Clone> Reporter<S> {
    pub fn new(storage: S) -> Self {
        Self {
            storage,
            record_lock: Arc::new(Mutex::new(())),
            send_lock: Arc::new(Mutex::new(())),
        }
    }

    /// The only writer of the pending notification record.
    pub async fn set_update_notification(
        &self,
        update_type: UpdateType,
        requested: bool,
        status: AvcStatus,
        error_code: AvcErrorCode,
        result: Option<UpdateResult>,
    ) -> Result<(), NotifyError> {
        let _guard = self.record_lock.lock().await;

        let notification = NotificationPending {
            requested,
            update_type,
            status,
            error_code,
            result,
            captured_at: jiff::Timestamp::now(),
        };

        info!(
            kind = %update_type,
            requested,
            ?status,
            ?error_code,
            "update notification recorded"
        );

        self.storage
            .save_notification(&notification)
            .await
            .map_err(|e| NotifyError::Storage(boxed(e)))
    }

    pub async fn pending(&self) -> Result<Option<NotificationPending>, NotifyError> {
        self.storage
            .load_notification()
            .await
            .map_err(|e| NotifyError::Storage(boxed(e)))
    }

    /// Push the pending result, if any, and clear the flag once the server
    /// acknowledged it.
    ///
    #[instrument(skip_all)]
    pub async fn check_notification_to_send(
        &self,
        pusher: &Pusher,
    ) -> Result<Delivery, NotifyError> {
        let _send = self.send_lock.lock().await;

        let Some(notification) = self.pending().await?.filter(|n| n.requested) else {
            return Ok(Delivery::Nothing);
        };

        let payload = serde_json::to_vec(&ResultPayload {
            update_type: notification.update_type,
            status: notification.status,
            error_code: notification.error_code,
            result: notification.result,
        })?;

        let mid = match pusher.push_and_wait(payload.into(), ContentType::Json).await {
            Ok(mid) => mid,
            Err(e) => {
                warn!(error = %e, "result notification not delivered, keeping it pending");
                return Err(e.into());
            }
        };

        let _guard = self.record_lock.lock().await;
        let current = self.pending().await?;

        // A newer result recorded while the push was in flight stays pending.
        match current {
            Some(mut current) if current.captured_at == notification.captured_at => {
                current.requested = false;
                self.storage
                    .save_notification(&current)
                    .await
                    .map_err(|e| NotifyError::Storage(boxed(e)))?;
                info!(
                    ?mid,
                    kind = %current.update_type,
                    status = ?current.status,
                    "result notification delivered"
                );
                Ok(Delivery::Reported {
                    update_type: current.update_type,
                    captured_at: current.captured_at,
                })
            }
            _ => {
                info!(?mid, "result notification delivered, newer result still pending");
                Ok(Delivery::Superseded)
            }
        }
    }
}
