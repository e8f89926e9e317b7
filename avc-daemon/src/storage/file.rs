use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use avc_core::{DownloadResumeInfo, NotificationPending, UpdateRecord, UpdateType};
use serde::{Serialize, de::DeserializeOwned};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::storage::{Storage, models::RecordKey};

#[derive(Debug, thiserror::Error)]
pub enum FileStorageError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Directory-backed storage with one postcard file per record.
///
/// Writes land in a sibling `.tmp` file which is synced and then renamed over
/// the target, so a crash leaves either the old record or the new one.
#[derive(Clone)]
pub struct FileStorage {
    dir: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl FileStorage {
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self, FileStorageError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| FileStorageError::Io {
                path: dir.clone(),
                source,
            })?;

        Ok(Self {
            dir,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn path(&self, key: RecordKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    async fn read<T: DeserializeOwned>(
        &self,
        key: RecordKey,
    ) -> Result<Option<T>, FileStorageError> {
        let path = self.path(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(postcard::from_bytes(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(FileStorageError::Io { path, source }),
        }
    }

    async fn write<T: Serialize>(&self, key: RecordKey, value: &T) -> Result<(), FileStorageError> {
        let bytes = postcard::to_allocvec(value)?;
        let path = self.path(key);
        let tmp = path.with_extension("tmp");

        let _guard = self.write_lock.lock().await;

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(io_error(tmp.clone()))?;
        file.write_all(&bytes).await.map_err(io_error(tmp.clone()))?;
        file.sync_all().await.map_err(io_error(tmp.clone()))?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(io_error(path.clone()))?;
        sync_dir(&self.dir).await
    }

    async fn remove(&self, key: RecordKey) -> Result<(), FileStorageError> {
        let path = self.path(key);
        let _guard = self.write_lock.lock().await;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => sync_dir(&self.dir).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(FileStorageError::Io { path, source }),
        }
    }
}

fn io_error(path: PathBuf) -> impl FnOnce(std::io::Error) -> FileStorageError {
    move |source| FileStorageError::Io { path, source }
}

#[cfg(unix)]
async fn sync_dir(dir: &Path) -> Result<(), FileStorageError> {
    let handle = tokio::fs::File::open(dir)
        .await
        .map_err(io_error(dir.to_path_buf()))?;
    handle.sync_all().await.map_err(io_error(dir.to_path_buf()))
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) -> Result<(), FileStorageError> {
    Ok(())
}

#[async_trait]
impl Storage for FileStorage {
    type Error = FileStorageError;

    async fn save_resume_info(&self, info: &DownloadResumeInfo) -> Result<(), Self::Error> {
        self.write(RecordKey::ResumeInfo, info).await
    }

    async fn load_resume_info(&self) -> Result<Option<DownloadResumeInfo>, Self::Error> {
        self.read(RecordKey::ResumeInfo).await
    }

    async fn delete_resume_info(&self) -> Result<(), Self::Error> {
        self.remove(RecordKey::ResumeInfo).await
    }

    async fn save_update_record(
        &self,
        update_type: UpdateType,
        record: &UpdateRecord,
    ) -> Result<(), Self::Error> {
        self.write(RecordKey::Update(update_type), record).await
    }

    async fn load_update_record(
        &self,
        update_type: UpdateType,
    ) -> Result<Option<UpdateRecord>, Self::Error> {
        self.read(RecordKey::Update(update_type)).await
    }

    async fn save_notification(
        &self,
        notification: &NotificationPending,
    ) -> Result<(), Self::Error> {
        self.write(RecordKey::Notification, notification).await
    }

    async fn load_notification(&self) -> Result<Option<NotificationPending>, Self::Error> {
        self.read(RecordKey::Notification).await
    }
}
