use std::path::{Path, PathBuf};

use async_trait::async_trait;
use avc_core::UpdateType;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("failed to run installer: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("installer exited with status {0:?}")]
    Exited(Option<i32>),
}

/// Applies a downloaded and verified package.
#[async_trait]
pub trait Installer: Send + Sync + 'static {
    async fn install(&self, kind: UpdateType, package: &Path) -> Result<(), InstallError>;
}

/// Accepts every package without touching the system.
pub struct NoopInstaller;

#[async_trait]
impl Installer for NoopInstaller {
    async fn install(&self, kind: UpdateType, package: &Path) -> Result<(), InstallError> {
        info!(kind = %kind, package = %package.display(), "noop installer accepted package");
        Ok(())
    }
}

/// Runs an external program as `<program> <args..> <kind> <package>`.
pub struct CommandInstaller {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandInstaller {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Installer for CommandInstaller {
    async fn install(&self, kind: UpdateType, package: &Path) -> Result<(), InstallError> {
        info!(program = %self.program.display(), kind = %kind, "running installer");

        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(kind.as_str())
            .arg(package)
            .status()
            .await?;

        if status.success() {
            Ok(())
        } else {
            Err(InstallError::Exited(status.code()))
        }
    }
}
