use avc_core::{DownloadResumeInfo, PACKAGE_URI_MAX_BYTES, UpdateType};
use tracing::debug;

use crate::storage::{BoxError, Storage, boxed};

#[derive(Debug, thiserror::Error)]
pub enum ResumeError {
    #[error("package uri must be 1..={PACKAGE_URI_MAX_BYTES} bytes, got {0}")]
    InvalidUri(usize),
    #[error("no resume information stored")]
    NotFound,
    #[error("failed to persist resume information: {0}")]
    Storage(#[source] BoxError),
}

pub fn validate_uri(uri: &str) -> Result<(), ResumeError> {
    if uri.is_empty() || uri.len() > PACKAGE_URI_MAX_BYTES {
        return Err(ResumeError::InvalidUri(uri.len()));
    }
    Ok(())
}

/// Persisted progress of the one download that may be in flight.
#[derive(Clone)]
pub struct ResumeStore<S> {
    storage: S,
}

impl<S: Storage + Clone> ResumeStore<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Record that `bytes_downloaded` bytes of `uri` are durably stored.
    ///
    /// The known package size is carried over while the uri and type stay the
    /// same.
    pub async fn save(
        &self,
        uri: &str,
        update_type: UpdateType,
        bytes_downloaded: u64,
    ) -> Result<(), ResumeError> {
        validate_uri(uri)?;

        let package_size = self
            .load()
            .await?
            .filter(|info| info.uri.as_ref() == uri && info.update_type == update_type)
            .and_then(|info| info.package_size);

        let info = DownloadResumeInfo {
            uri: uri.into(),
            update_type,
            bytes_downloaded,
            package_size,
            updated_at: jiff::Timestamp::now(),
        };

        self.storage
            .save_resume_info(&info)
            .await
            .map_err(|e| ResumeError::Storage(boxed(e)))
    }

    pub async fn load(&self) -> Result<Option<DownloadResumeInfo>, ResumeError> {
        self.storage
            .load_resume_info()
            .await
            .map_err(|e| ResumeError::Storage(boxed(e)))
    }

    pub async fn delete(&self) -> Result<(), ResumeError> {
        debug!("deleting resume information");
        self.storage
            .delete_resume_info()
            .await
            .map_err(|e| ResumeError::Storage(boxed(e)))
    }

    pub async fn set_package_size(&self, package_size: u64) -> Result<(), ResumeError> {
        let mut info = self.load().await?.ok_or(ResumeError::NotFound)?;
        info.package_size = Some(package_size);
        info.updated_at = jiff::Timestamp::now();

        self.storage
            .save_resume_info(&info)
            .await
            .map_err(|e| ResumeError::Storage(boxed(e)))
    }
}
