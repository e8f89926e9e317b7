use avc_core::UpdateType;

/// Logical records kept by the storage backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKey {
    ResumeInfo,
    Update(UpdateType),
    Notification,
}

impl RecordKey {
    /// File name used by the file backend.
    pub fn file_name(self) -> &'static str {
        match self {
            RecordKey::ResumeInfo => "resume_info.bin",
            RecordKey::Update(UpdateType::Firmware) => "fw_update.bin",
            RecordKey::Update(UpdateType::Software) => "sw_update.bin",
            RecordKey::Notification => "notification.bin",
        }
    }
}
