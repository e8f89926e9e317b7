use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use avc_core::{UpdateResult, UpdateType};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("package storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored package has {actual} bytes, expected at least {expected}")]
    Truncated { expected: u64, actual: u64 },
}

impl SinkError {
    pub fn update_result(&self) -> UpdateResult {
        match self {
            SinkError::Io(e) if e.kind() == ErrorKind::StorageFull => UpdateResult::NoSpace,
            SinkError::Io(e) if e.kind() == ErrorKind::OutOfMemory => UpdateResult::NoMemory,
            _ => UpdateResult::BadPackage,
        }
    }
}

/// Writes received bytes of one package.
#[async_trait]
pub trait PackageWriter: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError>;

    /// Make everything written so far durable.
    async fn commit(&mut self) -> Result<(), SinkError>;
}

/// Package storage for downloaded updates.
#[async_trait]
pub trait PackageSink: Send + Sync + 'static {
    /// Open the package of `kind` for writing at `offset`, discarding any
    /// bytes stored past it.
    async fn open(&self, kind: UpdateType, offset: u64)
    -> Result<Box<dyn PackageWriter>, SinkError>;

    /// Digest of the stored package.
    async fn digest(&self, kind: UpdateType) -> Result<blake3::Hash, SinkError>;

    /// Location handed to the installer.
    fn package_path(&self, kind: UpdateType) -> PathBuf;
}

/// Stores each package as a file in a work directory.
pub struct FilePackageSink {
    dir: PathBuf,
}

impl FilePackageSink {
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self, SinkError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }
}

struct FileWriter {
    file: File,
}

#[async_trait]
impl PackageWriter for FileWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        self.file.write_all(chunk).await?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), SinkError> {
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(())
    }
}

#[async_trait]
impl PackageSink for FilePackageSink {
    async fn open(
        &self,
        kind: UpdateType,
        offset: u64,
    ) -> Result<Box<dyn PackageWriter>, SinkError> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.package_path(kind))
            .await?;

        let actual = file.metadata().await?.len();
        if actual < offset {
            return Err(SinkError::Truncated {
                expected: offset,
                actual,
            });
        }

        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        Ok(Box::new(FileWriter { file }))
    }

    async fn digest(&self, kind: UpdateType) -> Result<blake3::Hash, SinkError> {
        let mut file = File::open(self.package_path(kind)).await?;
        let mut hasher = blake3::Hasher::new();
        let mut buffer = vec![0; 64 * 1024];

        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }

        Ok(hasher.finalize())
    }

    fn package_path(&self, kind: UpdateType) -> PathBuf {
        self.dir.join(format!("{}.pkg", kind.as_str()))
    }
}
