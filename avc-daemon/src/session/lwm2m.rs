use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use avc_core::{ContentType, MessageId, UpdateType};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Server-driven events raised by the LWM2M client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lwm2mEvent {
    BootstrapStarted,
    SessionStarted,
    SessionFailed,
    SessionClosed,
    /// The server wrote a package URI to the firmware or software object.
    PackageUri {
        kind: UpdateType,
        uri: String,
        expected_digest: Option<blake3::Hash>,
    },
    InstallRequested {
        kind: UpdateType,
    },
    AbortRequested {
        kind: UpdateType,
    },
    /// Delivery report for a pushed message.
    PushAck {
        mid: MessageId,
        acked: bool,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum Lwm2mError {
    #[error("client has not been started")]
    NotStarted,
    #[error("no device-management session")]
    NoSession,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Session and transport layer towards the device-management server.
///
/// Implementations deliver server-driven events to the receiver returned by
/// `start`; the background tasks stop when the token is cancelled.
#[async_trait]
pub trait Lwm2mClient: Send + Sync + 'static {
    async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Lwm2mEvent>, Lwm2mError>;

    /// Begin opening a session. The outcome arrives as an event.
    async fn connect(&self) -> Result<(), Lwm2mError>;

    async fn disconnect(&self) -> Result<(), Lwm2mError>;

    /// Send a registration update on the open session.
    async fn update(&self) -> Result<(), Lwm2mError>;

    /// Push a payload to the server. The delivery report arrives as
    /// [`Lwm2mEvent::PushAck`] carrying `mid`.
    async fn push(
        &self,
        mid: MessageId,
        payload: Bytes,
        content_type: ContentType,
    ) -> Result<(), Lwm2mError>;
}

/// A message recorded by [`MockLwm2mClient::push`].
#[derive(Debug, Clone)]
pub struct PushedMessage {
    pub mid: MessageId,
    pub payload: Bytes,
    pub content_type: ContentType,
}

/// In-process stand-in for the device-management server.
///
/// Sessions open immediately and pushes are acknowledged after `ack_delay`,
/// unless told otherwise.
#[derive(Clone)]
pub struct MockLwm2mClient {
    inner: Arc<Mutex<MockInner>>,
    ack_delay: Duration,
}

struct MockInner {
    tx: Option<mpsc::Sender<Lwm2mEvent>>,
    cancel: CancellationToken,
    connected: bool,
    accept_sessions: bool,
    /// `None` leaves pushes unanswered.
    push_ack: Option<bool>,
    pushes: Vec<PushedMessage>,
}

impl MockLwm2mClient {
    pub fn new(ack_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MockInner {
                tx: None,
                cancel: CancellationToken::new(),
                connected: false,
                accept_sessions: true,
                push_ack: Some(true),
                pushes: Vec::new(),
            })),
            ack_delay,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_accept_sessions(&self, accept: bool) {
        self.lock().accept_sessions = accept;
    }

    pub fn set_push_ack(&self, ack: Option<bool>) {
        self.lock().push_ack = ack;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn pushes(&self) -> Vec<PushedMessage> {
        self.lock().pushes.clone()
    }

    /// Deliver an event as if the server had sent it.
    pub async fn inject(&self, event: Lwm2mEvent) -> Result<(), Lwm2mError> {
        let tx = self.lock().tx.clone().ok_or(Lwm2mError::NotStarted)?;
        tx.send(event)
            .await
            .map_err(|e| Lwm2mError::Transport(e.to_string()))
    }

    fn emit(inner: &MockInner, event: Lwm2mEvent, delay: Duration) -> Result<(), Lwm2mError> {
        let tx = inner.tx.clone().ok_or(Lwm2mError::NotStarted)?;
        let cancel = inner.cancel.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(event).await;
                }
            }
        });

        Ok(())
    }
}

#[async_trait]
impl Lwm2mClient for MockLwm2mClient {
    async fn start(
        &self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<Lwm2mEvent>, Lwm2mError> {
        let (tx, rx) = mpsc::channel(64);
        let mut inner = self.lock();
        inner.tx = Some(tx);
        inner.cancel = cancel;

        info!("mock lwm2m client started");
        Ok(rx)
    }

    async fn connect(&self) -> Result<(), Lwm2mError> {
        let mut inner = self.lock();
        let event = if inner.accept_sessions {
            inner.connected = true;
            Lwm2mEvent::SessionStarted
        } else {
            Lwm2mEvent::SessionFailed
        };

        debug!(?event, "mock connect");
        Self::emit(&inner, event, Duration::ZERO)
    }

    async fn disconnect(&self) -> Result<(), Lwm2mError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(Lwm2mError::NoSession);
        }
        inner.connected = false;

        Self::emit(&inner, Lwm2mEvent::SessionClosed, Duration::ZERO)
    }

    async fn update(&self) -> Result<(), Lwm2mError> {
        if !self.lock().connected {
            return Err(Lwm2mError::NoSession);
        }
        Ok(())
    }

    async fn push(
        &self,
        mid: MessageId,
        payload: Bytes,
        content_type: ContentType,
    ) -> Result<(), Lwm2mError> {
        let mut inner = self.lock();
        if !inner.connected {
            return Err(Lwm2mError::NoSession);
        }

        inner.pushes.push(PushedMessage {
            mid,
            payload,
            content_type,
        });

        match inner.push_ack {
            Some(acked) => Self::emit(&inner, Lwm2mEvent::PushAck { mid, acked }, self.ack_delay),
            None => Ok(()),
        }
    }
}
