use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

// Package URIs are fixed once the server hands them over.
type BoxStr = Box<str>;

/// Maximum length in bytes of a package URI accepted from the server.
pub const PACKAGE_URI_MAX_BYTES: usize = 255;

/// Unique identifier for a message pushed to the device-management server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Ulid);

impl MessageId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of package carried by an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateType {
    /// Modem or application-processor firmware (FOTA).
    Firmware,
    /// Application bundle managed by the software update daemon (SOTA).
    Software,
}

impl UpdateType {
    pub const ALL: [UpdateType; 2] = [UpdateType::Firmware, UpdateType::Software];

    pub fn as_str(self) -> &'static str {
        match self {
            UpdateType::Firmware => "firmware",
            UpdateType::Software => "software",
        }
    }
}

impl fmt::Display for UpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownUpdateType(pub String);

impl fmt::Display for UnknownUpdateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown update type: {}", self.0)
    }
}

impl std::error::Error for UnknownUpdateType {}

impl FromStr for UpdateType {
    type Err = UnknownUpdateType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "firmware" | "fw" => Ok(UpdateType::Firmware),
            "software" | "sw" => Ok(UpdateType::Software),
            _ => Err(UnknownUpdateType(s.to_string())),
        }
    }
}

/// Progress of an update through its lifecycle.
///
/// The mandatory path is
/// `Idle -> Downloading -> Downloaded -> Verifying -> InstallPending -> Installing -> Installed`.
/// `Failed` can be reached from every state except `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum UpdateState {
    #[default]
    Idle,
    Downloading,
    Downloaded,
    Verifying,
    InstallPending,
    Installing,
    Installed,
    Failed,
}

impl UpdateState {
    /// Whether moving from `self` to `next` keeps every mandatory step.
    pub fn can_transition_to(self, next: UpdateState) -> bool {
        use UpdateState::*;

        match (self, next) {
            // Resuming a download re-enters the same state.
            (Downloading, Downloading) => true,
            (Idle, Failed) => false,
            (current, Failed) => current != Failed,
            (Idle | Installed | Failed, Downloading) => true,
            (Downloading, Downloaded)
            | (Downloaded, Verifying)
            | (Verifying, InstallPending)
            | (InstallPending, Installing)
            | (Installing, Installed) => true,
            // Abort or acknowledgement brings the machine back to rest.
            (Downloading | Installed | Failed, Idle) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UpdateState::Installed | UpdateState::Failed)
    }

    /// A result may only be recorded once verification has started.
    pub fn accepts_result(self) -> bool {
        matches!(
            self,
            UpdateState::Verifying
                | UpdateState::InstallPending
                | UpdateState::Installing
                | UpdateState::Installed
                | UpdateState::Failed
        )
    }
}

/// Outcome of an update once it has left the downloading phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UpdateResult {
    Ok,
    ConnectionError,
    NoMemory,
    NoSpace,
    ChecksumMismatch,
    BadPackage,
    Unsupported,
    InstallFailure,
}

impl UpdateResult {
    /// Error code reported to applications and to the server for this result.
    pub fn error_code(self) -> AvcErrorCode {
        match self {
            UpdateResult::Ok => AvcErrorCode::None,
            UpdateResult::BadPackage | UpdateResult::Unsupported => AvcErrorCode::BadPackage,
            UpdateResult::ChecksumMismatch => AvcErrorCode::SecurityFailure,
            UpdateResult::ConnectionError
            | UpdateResult::NoMemory
            | UpdateResult::NoSpace
            | UpdateResult::InstallFailure => AvcErrorCode::Internal,
        }
    }
}

/// Persisted state of one update type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub state: UpdateState,
    /// Unset until the update has left `Downloading`.
    pub result: Option<UpdateResult>,
    pub updated_at: jiff::Timestamp,
}

impl Default for UpdateRecord {
    fn default() -> Self {
        Self {
            state: UpdateState::Idle,
            result: None,
            updated_at: jiff::Timestamp::UNIX_EPOCH,
        }
    }
}

/// Everything needed to continue an interrupted download after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadResumeInfo {
    /// Package URI as written by the server.
    pub uri: BoxStr,
    pub update_type: UpdateType,
    /// Bytes durably stored in the package sink.
    pub bytes_downloaded: u64,
    /// Full package size, once the server has announced it.
    pub package_size: Option<u64>,
    pub updated_at: jiff::Timestamp,
}

impl DownloadResumeInfo {
    pub fn bytes_left(&self) -> Option<u64> {
        self.package_size
            .map(|size| size.saturating_sub(self.bytes_downloaded))
    }
}

/// Status values delivered to applications and pushed to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AvcStatus {
    NoUpdate,
    DownloadPending,
    DownloadInProgress,
    DownloadComplete,
    DownloadFailed,
    InstallPending,
    InstallInProgress,
    InstallComplete,
    InstallFailed,
    SessionStarted,
    SessionStopped,
}

/// Error codes attached to a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AvcErrorCode {
    #[default]
    None,
    Unknown,
    BadPackage,
    Internal,
    SecurityFailure,
}

/// A terminal update result that still has to reach the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPending {
    pub requested: bool,
    pub update_type: UpdateType,
    pub status: AvcStatus,
    pub error_code: AvcErrorCode,
    /// Specific failure reason, when the status carries one.
    pub result: Option<UpdateResult>,
    pub captured_at: jiff::Timestamp,
}

/// State of the device-management session as seen by applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Bootstrapping,
    DeviceManagement,
    /// A download is waiting for explicit consent.
    UserAgreementPending,
}

/// Content format of a pushed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    PlainText,
    Json,
    Cbor,
    Tlv,
}
