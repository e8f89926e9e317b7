pub mod file;
pub mod memory;
pub mod models;
pub mod sqlite;

use async_trait::async_trait;
use avc_core::{DownloadResumeInfo, NotificationPending, UpdateRecord, UpdateType};

/// Durable key-value storage for everything the connector must remember
/// across restarts.
///
/// Every write must be crash-atomic: after a crash a reader sees either the
/// previous value or the new one, never a partial record.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Error type specific to this storage implementation
    type Error: std::error::Error + Send + Sync + 'static;

    /// Replace the stored resume information.
    async fn save_resume_info(&self, info: &DownloadResumeInfo) -> Result<(), Self::Error>;

    /// Fetch the stored resume information, if any.
    async fn load_resume_info(&self) -> Result<Option<DownloadResumeInfo>, Self::Error>;

    /// Remove the stored resume information. Removing nothing is not an error.
    async fn delete_resume_info(&self) -> Result<(), Self::Error>;

    /// Replace the update record of one update type.
    async fn save_update_record(
        &self,
        update_type: UpdateType,
        record: &UpdateRecord,
    ) -> Result<(), Self::Error>;

    /// Fetch the update record of one update type, if it was ever written.
    async fn load_update_record(
        &self,
        update_type: UpdateType,
    ) -> Result<Option<UpdateRecord>, Self::Error>;

    /// Replace the pending notification record.
    async fn save_notification(&self, notification: &NotificationPending)
    -> Result<(), Self::Error>;

    /// Fetch the pending notification record, if any.
    async fn load_notification(&self) -> Result<Option<NotificationPending>, Self::Error>;
}

/// Boxed storage error, used by components that are generic over the backend.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) fn boxed<E>(err: E) -> BoxError
where
    E: std::error::Error + Send + Sync + 'static,
{
    Box::new(err)
}
