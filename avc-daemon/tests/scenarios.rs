mod common;

use std::path::Path;
use std::time::Duration;

use avc_core::{
    AvcStatus, DownloadResumeInfo, SessionState, UpdateRecord, UpdateResult, UpdateState,
    UpdateType,
};
use avc_daemon::downloader::{DownloadError, DownloadRequest};
use avc_daemon::session::lwm2m::Lwm2mEvent;
use avc_daemon::storage::Storage;
use avc_daemon::storage::memory::MemoryStorage;
use avc_daemon::storage::sqlite::SqliteStorage;
use avc_daemon::update::UpdateError;

use common::{FakeSource, PACKAGE_URI, eventually, package, settings, start, wait_for_status};

fn firmware_uri() -> Lwm2mEvent {
    Lwm2mEvent::PackageUri {
        kind: UpdateType::Firmware,
        uri: PACKAGE_URI.into(),
        expected_digest: None,
    }
}

#[tokio::test]
async fn test_failed_download_is_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::cut_at(package(4096), 1000);
    let harness = start(
        MemoryStorage::default(),
        source.clone(),
        dir.path(),
        settings(false),
    )
    .await;
    let runtime = &harness.runtime;
    let mut events = runtime.bus.subscribe();

    runtime.session.request_session().await.unwrap();
    wait_for_status(&mut events, AvcStatus::SessionStarted).await;

    harness.lwm2m.inject(firmware_uri()).await.unwrap();
    let failed = wait_for_status(&mut events, AvcStatus::DownloadFailed).await;
    assert_eq!(failed.kind, Some(UpdateType::Firmware));

    assert_eq!(source.requests(), vec![0, 1000]);

    eventually("result pushed and cleared", || async move {
        let pending = runtime.reporter.pending().await.unwrap().unwrap();
        assert_eq!(pending.status, AvcStatus::DownloadFailed);
        !pending.requested
    })
    .await;
    // Once the server has the result the update goes back to rest.
    eventually("update record cleared", || async move {
        runtime.update.get_update_state(UpdateType::Firmware).await == UpdateState::Idle
    })
    .await;
    assert_eq!(runtime.update.get_update_result(UpdateType::Firmware).await, None);

    let pushes = harness.lwm2m.pushes();
    assert_eq!(pushes.len(), 1);
    let payload: serde_json::Value = serde_json::from_slice(&pushes[0].payload).unwrap();
    assert_eq!(payload["type"], "Firmware");
    assert_eq!(payload["status"], "DownloadFailed");
    assert_eq!(payload["result"], "ConnectionError");

    // A new session finds nothing left to report.
    runtime.session.release_session().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    runtime.session.request_session().await.unwrap();
    wait_for_status(&mut events, AvcStatus::SessionStarted).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.lwm2m.pushes().len(), 1);
}

/// Leave behind what a crash after `durable` stored bytes would.
async fn seed_interrupted_download(
    storage: &MemoryStorage,
    work_dir: &Path,
    pkg: &[u8],
    durable: u64,
    package_size: Option<u64>,
    state: UpdateState,
) {
    storage
        .save_resume_info(&DownloadResumeInfo {
            uri: PACKAGE_URI.into(),
            update_type: UpdateType::Firmware,
            bytes_downloaded: durable,
            package_size,
            updated_at: jiff::Timestamp::now(),
        })
        .await
        .unwrap();
    storage
        .save_update_record(
            UpdateType::Firmware,
            &UpdateRecord {
                state,
                result: None,
                updated_at: jiff::Timestamp::now(),
            },
        )
        .await
        .unwrap();
    tokio::fs::write(work_dir.join("firmware.pkg"), &pkg[..durable as usize])
        .await
        .unwrap();
}

#[tokio::test]
async fn test_resume_after_restart_waits_for_agreement() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = package(2000);
    let storage = MemoryStorage::default();
    seed_interrupted_download(
        &storage,
        dir.path(),
        &pkg,
        500,
        Some(2000),
        UpdateState::Downloading,
    )
    .await;

    let source = FakeSource::serving(pkg.clone());
    let harness = start(storage, source.clone(), dir.path(), settings(true)).await;
    let runtime = &harness.runtime;
    let mut events = runtime.bus.subscribe();

    eventually("interrupted download queued", || async move {
        let status = runtime.session.status().await.unwrap();
        status.pending.is_some_and(|p| p.resume && !p.agreed && p.bytes_left == Some(1500))
    })
    .await;
    assert_eq!(runtime.session.state(), SessionState::UserAgreementPending);
    assert_eq!(runtime.downloader.bytes_left_to_download().await.unwrap(), 1500);

    runtime.session.request_session().await.unwrap();
    wait_for_status(&mut events, AvcStatus::SessionStarted).await;

    // Neither the session nor returning coverage starts it.
    harness.connection.set_available(false);
    tokio::time::sleep(Duration::from_millis(20)).await;
    harness.connection.set_available(true);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(source.requests().is_empty());
    assert_eq!(runtime.session.state(), SessionState::UserAgreementPending);

    runtime.session.accept_download().await.unwrap();
    wait_for_status(&mut events, AvcStatus::DownloadComplete).await;

    assert_eq!(source.requests(), vec![500]);
    assert_eq!(
        runtime.update.get_update_state(UpdateType::Firmware).await,
        UpdateState::InstallPending
    );
    assert_eq!(runtime.resume.load().await.unwrap(), None);
    let stored = tokio::fs::read(dir.path().join("firmware.pkg")).await.unwrap();
    assert_eq!(stored, pkg);
    assert_eq!(runtime.session.state(), SessionState::DeviceManagement);
}

#[tokio::test]
async fn test_resume_after_restart_without_known_size() {
    let pkg = package(2000);

    for state in [UpdateState::Downloading, UpdateState::Idle] {
        let dir = tempfile::tempdir().unwrap();
        let storage = MemoryStorage::default();
        seed_interrupted_download(&storage, dir.path(), &pkg, 500, None, state).await;

        let source = FakeSource::serving(pkg.clone());
        let harness = start(storage, source.clone(), dir.path(), settings(false)).await;
        let runtime = &harness.runtime;
        let mut events = runtime.bus.subscribe();

        eventually("interrupted download queued", || async move {
            let status = runtime.session.status().await.unwrap();
            status
                .pending
                .is_some_and(|p| p.resume && p.agreed && p.bytes_left.is_none())
        })
        .await;
        assert!(matches!(
            runtime.downloader.bytes_left_to_download().await,
            Err(DownloadError::Undefined)
        ));

        runtime.session.request_session().await.unwrap();
        wait_for_status(&mut events, AvcStatus::DownloadComplete).await;

        assert_eq!(source.requests(), vec![500]);
        assert_eq!(
            runtime.update.get_update_state(UpdateType::Firmware).await,
            UpdateState::InstallPending
        );
        assert_eq!(runtime.resume.load().await.unwrap(), None);
        let stored = tokio::fs::read(dir.path().join("firmware.pkg")).await.unwrap();
        assert_eq!(stored, pkg);
    }
}

#[tokio::test]
async fn test_fully_stored_package_is_not_fetched_again() {
    let dir = tempfile::tempdir().unwrap();
    let pkg = package(2000);
    let storage = MemoryStorage::default();
    seed_interrupted_download(
        &storage,
        dir.path(),
        &pkg,
        2000,
        Some(2000),
        UpdateState::Downloading,
    )
    .await;

    let source = FakeSource::serving(pkg.clone());
    let harness = start(storage, source.clone(), dir.path(), settings(false)).await;
    let runtime = &harness.runtime;
    let mut events = runtime.bus.subscribe();

    runtime.session.request_session().await.unwrap();
    wait_for_status(&mut events, AvcStatus::DownloadComplete).await;

    assert!(source.requests().is_empty());
    assert_eq!(
        runtime.update.get_update_state(UpdateType::Firmware).await,
        UpdateState::InstallPending
    );
    assert_eq!(runtime.resume.load().await.unwrap(), None);
}

#[tokio::test]
async fn test_install_is_reported_to_server() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::serving(package(3000));
    let harness = start(MemoryStorage::default(), source, dir.path(), settings(true)).await;
    let runtime = &harness.runtime;
    let mut events = runtime.bus.subscribe();

    runtime.session.request_session().await.unwrap();
    wait_for_status(&mut events, AvcStatus::SessionStarted).await;

    harness.lwm2m.inject(firmware_uri()).await.unwrap();
    let pending = wait_for_status(&mut events, AvcStatus::DownloadPending).await;
    assert_eq!(pending.kind, Some(UpdateType::Firmware));

    runtime.session.accept_download().await.unwrap();
    wait_for_status(&mut events, AvcStatus::InstallPending).await;

    harness
        .lwm2m
        .inject(Lwm2mEvent::InstallRequested {
            kind: UpdateType::Firmware,
        })
        .await
        .unwrap();
    wait_for_status(&mut events, AvcStatus::InstallComplete).await;

    eventually("install result delivered", || async move {
        runtime
            .reporter
            .pending()
            .await
            .unwrap()
            .is_some_and(|n| !n.requested && n.status == AvcStatus::InstallComplete)
    })
    .await;
    eventually("installed update cleared", || async move {
        runtime.update.get_update_state(UpdateType::Firmware).await == UpdateState::Idle
    })
    .await;

    let pushed = harness.lwm2m.pushes();
    let payload: serde_json::Value = serde_json::from_slice(&pushed[0].payload).unwrap();
    assert_eq!(payload["status"], "InstallComplete");
    assert_eq!(payload["result"], "Ok");
}

#[tokio::test]
async fn test_server_abort_discards_download() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::stalled(package(3000));
    let harness = start(MemoryStorage::default(), source, dir.path(), settings(false)).await;
    let runtime = &harness.runtime;
    let mut events = runtime.bus.subscribe();

    runtime.session.request_session().await.unwrap();
    wait_for_status(&mut events, AvcStatus::SessionStarted).await;
    harness.lwm2m.inject(firmware_uri()).await.unwrap();
    wait_for_status(&mut events, AvcStatus::DownloadInProgress).await;

    harness
        .lwm2m
        .inject(Lwm2mEvent::AbortRequested {
            kind: UpdateType::Firmware,
        })
        .await
        .unwrap();
    wait_for_status(&mut events, AvcStatus::NoUpdate).await;

    assert_eq!(
        runtime.update.get_update_state(UpdateType::Firmware).await,
        UpdateState::Idle
    );
    assert_eq!(runtime.resume.load().await.unwrap(), None);
    let status = runtime.session.status().await.unwrap();
    assert_eq!(status.pending, None);
    assert_eq!(status.downloading, None);
}

#[tokio::test]
async fn test_connectivity_loss_suspends_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::stalled(package(3000));
    let harness = start(
        MemoryStorage::default(),
        source.clone(),
        dir.path(),
        settings(false),
    )
    .await;
    let runtime = &harness.runtime;
    let mut events = runtime.bus.subscribe();

    runtime.session.request_session().await.unwrap();
    wait_for_status(&mut events, AvcStatus::SessionStarted).await;
    harness.lwm2m.inject(firmware_uri()).await.unwrap();
    wait_for_status(&mut events, AvcStatus::DownloadInProgress).await;

    harness.connection.set_available(false);
    let suspended = wait_for_status(&mut events, AvcStatus::DownloadPending).await;
    assert_eq!(suspended.num_bytes, Some(3000));
    assert!(runtime.resume.load().await.unwrap().is_some());

    harness.connection.set_available(true);
    wait_for_status(&mut events, AvcStatus::DownloadInProgress).await;
    eventually("transfer resumed", || {
        let resumed = source.requests().len() == 2;
        async move { resumed }
    })
    .await;
    assert_eq!(
        runtime.update.get_update_state(UpdateType::Firmware).await,
        UpdateState::Downloading
    );
}

#[tokio::test]
async fn test_concurrent_starts_admit_one() {
    let dir = tempfile::tempdir().unwrap();
    let source = FakeSource::stalled(package(3000));
    let harness = start(MemoryStorage::default(), source, dir.path(), settings(false)).await;
    let downloader = harness.runtime.downloader.clone();

    let attempts = (0..8).map(|_| {
        let downloader = downloader.clone();
        tokio::spawn(async move {
            downloader
                .start_download(DownloadRequest::new(PACKAGE_URI, UpdateType::Software))
                .await
        })
    });
    let results = futures::future::join_all(attempts).await;

    let mut admitted = 0;
    let mut busy = 0;
    for result in results {
        match result.unwrap() {
            Ok(()) => admitted += 1,
            Err(DownloadError::Busy) => busy += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert_eq!((admitted, busy), (1, 7));
    assert!(downloader.is_busy().await);

    downloader.abort_download(UpdateType::Software).await.unwrap();
    assert!(!downloader.is_busy().await);
}

#[tokio::test]
async fn test_result_before_verifying_is_rejected() {
    let storage = SqliteStorage::new_in_memory().await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let harness = start(
        storage,
        FakeSource::serving(package(10)),
        dir.path(),
        settings(true),
    )
    .await;
    let update = &harness.runtime.update;

    update
        .set_update_state(UpdateType::Software, UpdateState::Downloading)
        .await
        .unwrap();
    update
        .set_update_state(UpdateType::Software, UpdateState::Downloaded)
        .await
        .unwrap();

    let err = update
        .set_update_result(UpdateType::Software, UpdateResult::Ok)
        .await
        .unwrap_err();
    assert!(matches!(err, UpdateError::ResultTooEarly { .. }));

    let record = update.record(UpdateType::Software).await;
    assert_eq!(record.state, UpdateState::Downloaded);
    assert_eq!(record.result, None);
}

#[tokio::test]
async fn test_session_requests_are_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let harness = start(
        MemoryStorage::default(),
        FakeSource::serving(package(10)),
        dir.path(),
        settings(true),
    )
    .await;
    let session = &harness.runtime.session;
    let mut events = harness.runtime.bus.subscribe();

    assert!(matches!(
        session.release_session().await,
        Err(avc_daemon::session::SessionError::NotConnected)
    ));
    assert!(matches!(
        session.accept_download().await,
        Err(avc_daemon::session::SessionError::NoPendingDownload)
    ));

    session.request_session().await.unwrap();
    wait_for_status(&mut events, AvcStatus::SessionStarted).await;
    assert!(matches!(
        session.request_session().await,
        Err(avc_daemon::session::SessionError::Duplicate)
    ));

    session.release_session().await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_failed_session_schedules_retry() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(true);
    settings.session.retry_timers = vec![Duration::from_millis(200); 10];
    let harness = start(
        MemoryStorage::default(),
        FakeSource::serving(package(10)),
        dir.path(),
        settings,
    )
    .await;
    let session = &harness.runtime.session;
    let mut events = harness.runtime.bus.subscribe();

    harness.lwm2m.set_accept_sessions(false);
    session.request_session().await.unwrap();

    eventually("retry scheduled", || async move {
        session.status().await.unwrap().retry_scheduled
    })
    .await;
    assert!(matches!(
        session.request_session().await,
        Err(avc_daemon::session::SessionError::Busy)
    ));

    harness.lwm2m.set_accept_sessions(true);
    wait_for_status(&mut events, AvcStatus::SessionStarted).await;
    assert_eq!(session.state(), SessionState::DeviceManagement);
}
