use async_trait::async_trait;
use tokio::sync::watch;

#[derive(Debug, thiserror::Error)]
pub enum ConnectivityError {
    #[error("data connection unavailable")]
    Unavailable,
}

/// Radio data-connection provider.
#[async_trait]
pub trait DataConnection: Send + Sync + 'static {
    /// Ask for the data connection to be brought up.
    async fn request(&self) -> Result<(), ConnectivityError>;

    async fn release(&self) -> Result<(), ConnectivityError>;

    /// Current availability, updated on every change.
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// Data connection whose availability is set by hand.
///
/// Used on hosts where the link is always up and by tests that simulate
/// coverage loss.
#[derive(Clone)]
pub struct ManualConnection {
    tx: watch::Sender<bool>,
}

impl ManualConnection {
    pub fn new(available: bool) -> Self {
        let (tx, _) = watch::channel(available);
        Self { tx }
    }

    pub fn set_available(&self, available: bool) {
        tracing::info!(available, "data connection changed");
        self.tx.send_replace(available);
    }

    pub fn is_available(&self) -> bool {
        *self.tx.borrow()
    }
}

#[async_trait]
impl DataConnection for ManualConnection {
    async fn request(&self) -> Result<(), ConnectivityError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(ConnectivityError::Unavailable)
        }
    }

    async fn release(&self) -> Result<(), ConnectivityError> {
        Ok(())
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
