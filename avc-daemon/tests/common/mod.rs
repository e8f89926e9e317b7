#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use avc_core::AvcStatus;
use avc_daemon::downloader::DownloaderConfig;
use avc_daemon::downloader::retry::RetryPolicy;
use avc_daemon::downloader::sink::FilePackageSink;
use avc_daemon::downloader::source::{FetchError, PackageSource, PackageStream};
use avc_daemon::events::StatusEvent;
use avc_daemon::installer::NoopInstaller;
use avc_daemon::runtime::{self, Collaborators, Runtime, Settings};
use avc_daemon::session::SessionConfig;
use avc_daemon::session::connectivity::ManualConnection;
use avc_daemon::session::lwm2m::MockLwm2mClient;
use avc_daemon::storage::Storage;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const PACKAGE_URI: &str = "http://updates.example.com/fw.bin";

pub fn package(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}

#[derive(Clone, Copy)]
enum Behaviour {
    Serve,
    /// Serve bytes up to this offset, then drop the connection.
    CutAt(u64),
    /// Answer and then never send a byte.
    Stall,
}

/// Package server kept in memory, recording the offset of every request.
pub struct FakeSource {
    package: Bytes,
    behaviour: Behaviour,
    requests: Mutex<Vec<u64>>,
}

impl FakeSource {
    pub fn serving(package: Bytes) -> Arc<Self> {
        Self::with(package, Behaviour::Serve)
    }

    pub fn cut_at(package: Bytes, offset: u64) -> Arc<Self> {
        Self::with(package, Behaviour::CutAt(offset))
    }

    pub fn stalled(package: Bytes) -> Arc<Self> {
        Self::with(package, Behaviour::Stall)
    }

    fn with(package: Bytes, behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            package,
            behaviour,
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<u64> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PackageSource for FakeSource {
    async fn fetch(&self, _uri: &Url, offset: u64) -> Result<PackageStream, FetchError> {
        self.requests.lock().unwrap().push(offset);

        let total = self.package.len() as u64;
        let total_size = Some(total);

        let chunks = match self.behaviour {
            Behaviour::Stall => futures::stream::pending::<Result<Bytes, FetchError>>().boxed(),
            Behaviour::Serve | Behaviour::CutAt(_) => {
                let end = match self.behaviour {
                    Behaviour::CutAt(cut) => cut.min(total),
                    _ => total,
                };
                let mut items: Vec<Result<Bytes, FetchError>> = Vec::new();
                let mut at = offset.min(end);
                while at < end {
                    let next = (at + 256).min(end);
                    items.push(Ok(self.package.slice(at as usize..next as usize)));
                    at = next;
                }
                if end < total {
                    items.push(Err(FetchError::Interrupted("connection reset".into())));
                }
                futures::stream::iter(items).boxed()
            }
        };

        Ok(PackageStream {
            offset,
            total_size,
            chunks,
        })
    }
}

pub struct Harness<S> {
    pub runtime: Runtime<S>,
    pub lwm2m: MockLwm2mClient,
    pub connection: ManualConnection,
    pub cancel: CancellationToken,
}

impl<S> Drop for Harness<S> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn settings(user_agreement: bool) -> Settings {
    Settings {
        downloader: DownloaderConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                jitter_factor: 0.0,
            },
            chunk_timeout: Duration::from_secs(5),
        },
        session: SessionConfig {
            retry_timers: vec![Duration::from_millis(50)],
            activity_timeout: Duration::ZERO,
            polling_interval: None,
            download_user_agreement: user_agreement,
        },
        push_ack_timeout: Duration::from_secs(2),
    }
}

pub async fn start<S: Storage + Clone>(
    storage: S,
    source: Arc<FakeSource>,
    work_dir: &Path,
    settings: Settings,
) -> Harness<S> {
    let lwm2m = MockLwm2mClient::new(Duration::ZERO);
    let connection = ManualConnection::new(true);
    let cancel = CancellationToken::new();

    let parts = Collaborators {
        lwm2m: Arc::new(lwm2m.clone()),
        connection: Arc::new(connection.clone()),
        source,
        sink: Arc::new(FilePackageSink::new(work_dir).await.unwrap()),
        installer: Arc::new(NoopInstaller),
    };

    let runtime = runtime::start(storage, parts, settings, cancel.clone())
        .await
        .unwrap();

    Harness {
        runtime,
        lwm2m,
        connection,
        cancel,
    }
}

/// Wait for the next event with `status`, skipping others.
pub async fn wait_for_status(
    rx: &mut broadcast::Receiver<StatusEvent>,
    status: AvcStatus,
) -> StatusEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if event.status == status => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {status:?} event"))
}

/// Poll `check` until it holds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
