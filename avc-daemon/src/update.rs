use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use avc_core::{AvcStatus, UpdateRecord, UpdateResult, UpdateState, UpdateType};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::installer::Installer;
use crate::notify::{NotifyError, Reporter};
use crate::storage::{BoxError, Storage, boxed};

#[derive(Debug, thiserror::Error)]
pub enum UpdateError {
    #[error("{kind} update cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        kind: UpdateType,
        from: UpdateState,
        to: UpdateState,
    },
    #[error("{kind} update in state {state:?} cannot take a result yet")]
    ResultTooEarly { kind: UpdateType, state: UpdateState },
    #[error("failed to persist update record: {0}")]
    Persistence(#[source] BoxError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
}

/// Status reported to the server for a terminal record.
fn terminal_status(state: UpdateState, result: UpdateResult) -> Option<AvcStatus> {
    match (state, result) {
        (UpdateState::Installed, UpdateResult::Ok) => Some(AvcStatus::InstallComplete),
        (UpdateState::Installed, _) => Some(AvcStatus::InstallFailed),
        (UpdateState::Failed, UpdateResult::InstallFailure) => Some(AvcStatus::InstallFailed),
        (UpdateState::Failed, _) => Some(AvcStatus::DownloadFailed),
        _ => None,
    }
}

/// Firmware and software update progress, written through to storage.
///
/// The in-memory copy is only changed after the write succeeded, so a failed
/// write leaves both views on the previous state.
#[derive(Clone)]
pub struct UpdateStateMachine<S> {
    storage: S,
    reporter: Reporter<S>,
    records: Arc<Mutex<HashMap<UpdateType, UpdateRecord>>>,
}

impl<S: Storage + Clone> UpdateStateMachine<S> {
    /// Load the persisted records of every update type.
    pub async fn load(storage: S, reporter: Reporter<S>) -> Result<Self, UpdateError> {
        let mut records = HashMap::new();
        for kind in UpdateType::ALL {
            let record = storage
                .load_update_record(kind)
                .await
                .map_err(|e| UpdateError::Persistence(boxed(e)))?
                .unwrap_or_default();
            info!(
                kind = %kind,
                state = ?record.state,
                result = ?record.result,
                "loaded update record"
            );
            records.insert(kind, record);
        }

        Ok(Self {
            storage,
            reporter,
            records: Arc::new(Mutex::new(records)),
        })
    }

    pub async fn get_update_state(&self, kind: UpdateType) -> UpdateState {
        self.record(kind).await.state
    }

    pub async fn get_update_result(&self, kind: UpdateType) -> Option<UpdateResult> {
        self.record(kind).await.result
    }

    pub async fn record(&self, kind: UpdateType) -> UpdateRecord {
        let records = self.records.lock().await;
        records.get(&kind).cloned().unwrap_or_default()
    }

    pub async fn set_update_state(
        &self,
        kind: UpdateType,
        next: UpdateState,
    ) -> Result<(), UpdateError> {
        let mut records = self.records.lock().await;
        let current = records.get(&kind).cloned().unwrap_or_default();

        if !current.state.can_transition_to(next) {
            return Err(UpdateError::InvalidTransition {
                kind,
                from: current.state,
                to: next,
            });
        }

        // A fresh download or a return to rest forgets the previous result.
        let result = match next {
            UpdateState::Downloading if current.state != UpdateState::Downloading => None,
            UpdateState::Idle => None,
            _ => current.result,
        };

        let record = UpdateRecord {
            state: next,
            result,
            updated_at: jiff::Timestamp::now(),
        };
        self.persist(kind, &record).await?;
        records.insert(kind, record);

        info!(kind = %kind, from = ?current.state, to = ?next, "update state changed");
        Ok(())
    }

    pub async fn set_update_result(
        &self,
        kind: UpdateType,
        result: UpdateResult,
    ) -> Result<(), UpdateError> {
        let mut records = self.records.lock().await;
        let current = records.get(&kind).cloned().unwrap_or_default();

        if !current.state.accepts_result() {
            return Err(UpdateError::ResultTooEarly {
                kind,
                state: current.state,
            });
        }

        let record = UpdateRecord {
            result: Some(result),
            updated_at: jiff::Timestamp::now(),
            ..current
        };
        self.persist(kind, &record).await?;
        records.insert(kind, record.clone());
        drop(records);

        info!(kind = %kind, ?result, "update result recorded");
        self.notify_if_terminal(kind, &record).await
    }

    /// Move to `Failed` and store `result` with a single write.
    pub async fn fail(&self, kind: UpdateType, result: UpdateResult) -> Result<(), UpdateError> {
        self.settle(kind, UpdateState::Failed, result).await
    }

    /// Enter the terminal `next` state together with its result, so a crash
    /// can never leave a terminal state without one.
    async fn settle(
        &self,
        kind: UpdateType,
        next: UpdateState,
        result: UpdateResult,
    ) -> Result<(), UpdateError> {
        let mut records = self.records.lock().await;
        let current = records.get(&kind).cloned().unwrap_or_default();

        if !current.state.can_transition_to(next) {
            return Err(UpdateError::InvalidTransition {
                kind,
                from: current.state,
                to: next,
            });
        }

        let record = UpdateRecord {
            state: next,
            result: Some(result),
            updated_at: jiff::Timestamp::now(),
        };
        self.persist(kind, &record).await?;
        records.insert(kind, record.clone());
        drop(records);

        if result == UpdateResult::Ok {
            info!(kind = %kind, from = ?current.state, to = ?next, "update finished");
        } else {
            warn!(kind = %kind, from = ?current.state, ?result, "update failed");
        }
        self.notify_if_terminal(kind, &record).await
    }

    /// Return to idle with no result, whatever the current state.
    pub async fn clear(&self, kind: UpdateType) -> Result<(), UpdateError> {
        let mut records = self.records.lock().await;
        let record = UpdateRecord {
            updated_at: jiff::Timestamp::now(),
            ..UpdateRecord::default()
        };
        self.persist(kind, &record).await?;
        records.insert(kind, record);

        info!(kind = %kind, "update record cleared");
        Ok(())
    }

    /// Forget a terminal record once the server acknowledged the result
    /// captured at `reported_at`.
    ///
    /// Records that moved on after that point are left alone. Returns whether
    /// the record was cleared.
    pub async fn clear_reported(
        &self,
        kind: UpdateType,
        reported_at: jiff::Timestamp,
    ) -> Result<bool, UpdateError> {
        let mut records = self.records.lock().await;
        let current = records.get(&kind).cloned().unwrap_or_default();
        if !current.state.is_terminal() || current.updated_at > reported_at {
            return Ok(false);
        }

        let record = UpdateRecord {
            updated_at: jiff::Timestamp::now(),
            ..UpdateRecord::default()
        };
        self.persist(kind, &record).await?;
        records.insert(kind, record);

        info!(
            kind = %kind,
            from = ?current.state,
            result = ?current.result,
            "reported update cleared"
        );
        Ok(true)
    }

    /// Apply a verified package through `installer`.
    pub async fn install(
        &self,
        kind: UpdateType,
        installer: &dyn Installer,
        package: &Path,
    ) -> Result<UpdateResult, UpdateError> {
        self.set_update_state(kind, UpdateState::Installing).await?;

        match installer.install(kind, package).await {
            Ok(()) => {
                self.settle(kind, UpdateState::Installed, UpdateResult::Ok)
                    .await?;
                Ok(UpdateResult::Ok)
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "installer reported failure");
                self.fail(kind, UpdateResult::InstallFailure).await?;
                Ok(UpdateResult::InstallFailure)
            }
        }
    }

    async fn persist(&self, kind: UpdateType, record: &UpdateRecord) -> Result<(), UpdateError> {
        self.storage
            .save_update_record(kind, record)
            .await
            .map_err(|e| UpdateError::Persistence(boxed(e)))
    }

    async fn notify_if_terminal(
        &self,
        kind: UpdateType,
        record: &UpdateRecord,
    ) -> Result<(), UpdateError> {
        let Some(result) = record.result else {
            return Ok(());
        };
        let Some(status) = terminal_status(record.state, result) else {
            return Ok(());
        };

        self.reporter
            .set_update_notification(kind, true, status, result.error_code(), Some(result))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::{InstallError, NoopInstaller};
    use crate::storage::memory::{MemoryStorage, MemoryStorageError};
    use async_trait::async_trait;
    use avc_core::{AvcErrorCode, DownloadResumeInfo, NotificationPending};

    async fn machine() -> (UpdateStateMachine<MemoryStorage>, MemoryStorage) {
        let storage = MemoryStorage::default();
        let reporter = Reporter::new(storage.clone());
        let machine = UpdateStateMachine::load(storage.clone(), reporter)
            .await
            .unwrap();
        (machine, storage)
    }

    async fn walk_to<S: Storage + Clone>(
        machine: &UpdateStateMachine<S>,
        kind: UpdateType,
        target: UpdateState,
    ) {
        use UpdateState::*;
        for state in [Downloading, Downloaded, Verifying, InstallPending, Installing, Installed] {
            machine.set_update_state(kind, state).await.unwrap();
            if state == target {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_defaults_when_never_written() {
        let (machine, _) = machine().await;
        assert_eq!(
            machine.get_update_state(UpdateType::Software).await,
            UpdateState::Idle
        );
        assert_eq!(machine.get_update_result(UpdateType::Software).await, None);
    }

    #[tokio::test]
    async fn test_skipping_steps_is_rejected() {
        let (machine, storage) = machine().await;
        walk_to(&machine, UpdateType::Firmware, UpdateState::Downloading).await;

        let err = machine
            .set_update_state(UpdateType::Firmware, UpdateState::Installing)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::InvalidTransition { .. }));

        let stored = storage
            .load_update_record(UpdateType::Firmware)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, UpdateState::Downloading);
    }

    #[tokio::test]
    async fn test_result_before_verifying_leaves_state_unchanged() {
        let (machine, storage) = machine().await;

        for target in [UpdateState::Idle, UpdateState::Downloading, UpdateState::Downloaded] {
            if target != UpdateState::Idle {
                machine
                    .set_update_state(UpdateType::Firmware, target)
                    .await
                    .unwrap();
            }
            let before = storage.load_update_record(UpdateType::Firmware).await.unwrap();

            let err = machine
                .set_update_result(UpdateType::Firmware, UpdateResult::Ok)
                .await
                .unwrap_err();
            assert!(matches!(err, UpdateError::ResultTooEarly { .. }));
            assert_eq!(machine.get_update_state(UpdateType::Firmware).await, target);
            assert_eq!(machine.get_update_result(UpdateType::Firmware).await, None);
            assert_eq!(
                storage.load_update_record(UpdateType::Firmware).await.unwrap(),
                before
            );
        }
    }

    #[tokio::test]
    async fn test_fresh_download_resets_result() {
        let (machine, _) = machine().await;
        machine
            .set_update_state(UpdateType::Firmware, UpdateState::Downloading)
            .await
            .unwrap();
        machine
            .fail(UpdateType::Firmware, UpdateResult::NoSpace)
            .await
            .unwrap();
        assert_eq!(
            machine.get_update_result(UpdateType::Firmware).await,
            Some(UpdateResult::NoSpace)
        );

        machine
            .set_update_state(UpdateType::Firmware, UpdateState::Downloading)
            .await
            .unwrap();
        assert_eq!(machine.get_update_result(UpdateType::Firmware).await, None);
    }

    #[tokio::test]
    async fn test_failure_sets_notification() {
        let (machine, storage) = machine().await;
        walk_to(&machine, UpdateType::Firmware, UpdateState::Downloading).await;

        machine
            .fail(UpdateType::Firmware, UpdateResult::ConnectionError)
            .await
            .unwrap();

        let notification = storage.load_notification().await.unwrap().unwrap();
        assert!(notification.requested);
        assert_eq!(notification.status, AvcStatus::DownloadFailed);
        assert_eq!(notification.error_code, AvcErrorCode::Internal);
        assert_eq!(notification.update_type, UpdateType::Firmware);
    }

    #[tokio::test]
    async fn test_records_survive_reload() {
        let (machine, storage) = machine().await;
        walk_to(&machine, UpdateType::Software, UpdateState::Verifying).await;

        let reloaded = UpdateStateMachine::load(storage.clone(), Reporter::new(storage))
            .await
            .unwrap();
        assert_eq!(
            reloaded.get_update_state(UpdateType::Software).await,
            UpdateState::Verifying
        );
        assert_eq!(
            reloaded.get_update_state(UpdateType::Firmware).await,
            UpdateState::Idle
        );
    }

    struct BrokenInstaller;

    #[async_trait]
    impl Installer for BrokenInstaller {
        async fn install(&self, _kind: UpdateType, _package: &Path) -> Result<(), InstallError> {
            Err(InstallError::Exited(Some(1)))
        }
    }

    #[tokio::test]
    async fn test_install_outcomes() {
        let (machine, storage) = machine().await;
        let package = Path::new("/tmp/fw.bin");

        walk_to(&machine, UpdateType::Firmware, UpdateState::InstallPending).await;
        let result = machine
            .install(UpdateType::Firmware, &NoopInstaller, package)
            .await
            .unwrap();
        assert_eq!(result, UpdateResult::Ok);
        assert_eq!(
            machine.get_update_state(UpdateType::Firmware).await,
            UpdateState::Installed
        );
        let notification = storage.load_notification().await.unwrap().unwrap();
        assert_eq!(notification.status, AvcStatus::InstallComplete);

        walk_to(&machine, UpdateType::Software, UpdateState::InstallPending).await;
        let result = machine
            .install(UpdateType::Software, &BrokenInstaller, package)
            .await
            .unwrap();
        assert_eq!(result, UpdateResult::InstallFailure);
        let notification = storage.load_notification().await.unwrap().unwrap();
        assert_eq!(notification.status, AvcStatus::InstallFailed);
        assert_eq!(notification.update_type, UpdateType::Software);
    }

    #[tokio::test]
    async fn test_install_requires_install_pending() {
        let (machine, _) = machine().await;
        let err = machine
            .install(UpdateType::Firmware, &NoopInstaller, Path::new("/tmp/fw.bin"))
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_acknowledged_failure_returns_to_idle() {
        let (machine, storage) = machine().await;
        walk_to(&machine, UpdateType::Firmware, UpdateState::Downloading).await;
        machine
            .fail(UpdateType::Firmware, UpdateResult::NoMemory)
            .await
            .unwrap();
        let reported = storage.load_notification().await.unwrap().unwrap();

        assert!(
            machine
                .clear_reported(UpdateType::Firmware, reported.captured_at)
                .await
                .unwrap()
        );
        assert_eq!(
            machine.record(UpdateType::Firmware).await,
            storage
                .load_update_record(UpdateType::Firmware)
                .await
                .unwrap()
                .unwrap()
        );
        assert_eq!(
            machine.get_update_state(UpdateType::Firmware).await,
            UpdateState::Idle
        );
        assert_eq!(machine.get_update_result(UpdateType::Firmware).await, None);
    }

    #[tokio::test]
    async fn test_newer_update_is_not_cleared_by_old_report() {
        let (machine, storage) = machine().await;
        walk_to(&machine, UpdateType::Software, UpdateState::Downloading).await;
        machine
            .fail(UpdateType::Software, UpdateResult::ConnectionError)
            .await
            .unwrap();
        let reported = storage.load_notification().await.unwrap().unwrap();

        // The next package already started downloading.
        machine
            .set_update_state(UpdateType::Software, UpdateState::Downloading)
            .await
            .unwrap();
        assert!(
            !machine
                .clear_reported(UpdateType::Software, reported.captured_at)
                .await
                .unwrap()
        );
        assert_eq!(
            machine.get_update_state(UpdateType::Software).await,
            UpdateState::Downloading
        );

        // And failed again before the old report was acknowledged.
        machine
            .fail(UpdateType::Software, UpdateResult::NoSpace)
            .await
            .unwrap();
        assert!(
            !machine
                .clear_reported(UpdateType::Software, reported.captured_at)
                .await
                .unwrap()
        );
        assert_eq!(
            machine.get_update_result(UpdateType::Software).await,
            Some(UpdateResult::NoSpace)
        );
    }

    #[derive(Debug, thiserror::Error)]
    enum FlakyError {
        #[error(transparent)]
        Memory(#[from] MemoryStorageError),
        #[error("update record write refused")]
        Refused,
    }

    /// Memory storage that can refuse update record writes and remembers
    /// every record it accepted.
    #[derive(Clone, Default)]
    struct FlakyStorage {
        inner: MemoryStorage,
        record_writes_left: Arc<std::sync::Mutex<Option<usize>>>,
        accepted: Arc<std::sync::Mutex<Vec<UpdateRecord>>>,
    }

    impl FlakyStorage {
        fn allow_record_writes(&self, writes: Option<usize>) {
            *self.record_writes_left.lock().unwrap() = writes;
        }

        fn accepted(&self) -> Vec<UpdateRecord> {
            self.accepted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Storage for FlakyStorage {
        type Error = FlakyError;

        async fn save_resume_info(&self, info: &DownloadResumeInfo) -> Result<(), Self::Error> {
            Ok(self.inner.save_resume_info(info).await?)
        }

        async fn load_resume_info(&self) -> Result<Option<DownloadResumeInfo>, Self::Error> {
            Ok(self.inner.load_resume_info().await?)
        }

        async fn delete_resume_info(&self) -> Result<(), Self::Error> {
            Ok(self.inner.delete_resume_info().await?)
        }

        async fn save_update_record(
            &self,
            update_type: UpdateType,
            record: &UpdateRecord,
        ) -> Result<(), Self::Error> {
            {
                let mut left = self.record_writes_left.lock().unwrap();
                match left.as_mut() {
                    Some(0) => return Err(FlakyError::Refused),
                    Some(n) => *n -= 1,
                    None => {}
                }
            }
            self.inner.save_update_record(update_type, record).await?;
            self.accepted.lock().unwrap().push(record.clone());
            Ok(())
        }

        async fn load_update_record(
            &self,
            update_type: UpdateType,
        ) -> Result<Option<UpdateRecord>, Self::Error> {
            Ok(self.inner.load_update_record(update_type).await?)
        }

        async fn save_notification(
            &self,
            notification: &NotificationPending,
        ) -> Result<(), Self::Error> {
            Ok(self.inner.save_notification(notification).await?)
        }

        async fn load_notification(&self) -> Result<Option<NotificationPending>, Self::Error> {
            Ok(self.inner.load_notification().await?)
        }
    }

    #[tokio::test]
    async fn test_installed_is_never_stored_without_result() {
        let storage = FlakyStorage::default();
        let machine = UpdateStateMachine::load(storage.clone(), Reporter::new(storage.clone()))
            .await
            .unwrap();
        let package = Path::new("/tmp/fw.bin");

        // Installing is written, the completion write is refused.
        walk_to(&machine, UpdateType::Firmware, UpdateState::InstallPending).await;
        storage.allow_record_writes(Some(1));
        let err = machine
            .install(UpdateType::Firmware, &NoopInstaller, package)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Persistence(_)));

        let stored = storage
            .load_update_record(UpdateType::Firmware)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, UpdateState::Installing);
        assert_eq!(stored.result, None);
        assert_eq!(machine.record(UpdateType::Firmware).await, stored);
        assert_eq!(storage.inner.load_notification().await.unwrap(), None);

        storage.allow_record_writes(None);
        walk_to(&machine, UpdateType::Software, UpdateState::InstallPending).await;
        machine
            .install(UpdateType::Software, &NoopInstaller, package)
            .await
            .unwrap();

        let stored = storage
            .load_update_record(UpdateType::Software)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, UpdateState::Installed);
        assert_eq!(stored.result, Some(UpdateResult::Ok));
        assert!(
            storage
                .accepted()
                .iter()
                .all(|record| record.state != UpdateState::Installed || record.result.is_some())
        );
    }
}
