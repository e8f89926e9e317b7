use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use avc_core::{DownloadResumeInfo, NotificationPending, UpdateRecord, UpdateType};

use crate::storage::Storage;

/// Keeps everything in process memory; used by tests and when persistence
/// is switched off. Nothing survives a restart.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    resume_info: Option<DownloadResumeInfo>,
    update_records: HashMap<UpdateType, UpdateRecord>,
    notification: Option<NotificationPending>,
}

#[derive(Debug, thiserror::Error)]
pub enum MemoryStorageError {
    #[error("storage lock poisoned by a panicked writer: {0}")]
    Poisoned(String),
}

impl<T> From<PoisonError<T>> for MemoryStorageError {
    fn from(err: PoisonError<T>) -> Self {
        MemoryStorageError::Poisoned(err.to_string())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    type Error = MemoryStorageError;

    async fn save_resume_info(&self, info: &DownloadResumeInfo) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock()?;
        inner.resume_info = Some(info.clone());
        Ok(())
    }

    async fn load_resume_info(&self) -> Result<Option<DownloadResumeInfo>, Self::Error> {
        let inner = self.inner.lock()?;
        Ok(inner.resume_info.clone())
    }

    async fn delete_resume_info(&self) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock()?;
        inner.resume_info = None;
        Ok(())
    }

    async fn save_update_record(
        &self,
        update_type: UpdateType,
        record: &UpdateRecord,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock()?;
        inner.update_records.insert(update_type, record.clone());
        Ok(())
    }

    async fn load_update_record(
        &self,
        update_type: UpdateType,
    ) -> Result<Option<UpdateRecord>, Self::Error> {
        let inner = self.inner.lock()?;
        Ok(inner.update_records.get(&update_type).cloned())
    }

    async fn save_notification(
        &self,
        notification: &NotificationPending,
    ) -> Result<(), Self::Error> {
        let mut inner = self.inner.lock()?;
        inner.notification = Some(notification.clone());
        Ok(())
    }

    async fn load_notification(&self) -> Result<Option<NotificationPending>, Self::Error> {
        let inner = self.inner.lock()?;
        Ok(inner.notification.clone())
    }
}
