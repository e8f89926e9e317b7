use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("timer {0} is not running")]
    NotRunning(&'static str),
}

/// One-shot timer whose expiry is delivered as a message into the session
/// context.
pub struct Timer {
    name: &'static str,
    task: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self { name, task: None }
    }

    /// Arm the timer, replacing any previous deadline.
    pub fn start<T: Send + 'static>(
        &mut self,
        after: Duration,
        tx: mpsc::UnboundedSender<T>,
        message: T,
    ) {
        if let Some(task) = self.task.take() {
            task.abort();
        }

        tracing::debug!(timer = self.name, ?after, "timer started");
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(message);
        }));
    }

    /// Disarm the timer. Stopping a timer that is not running is an error,
    /// never a panic.
    pub fn stop(&mut self) -> Result<(), TimerError> {
        match self.task.take() {
            Some(task) if !task.is_finished() => {
                task.abort();
                tracing::debug!(timer = self.name, "timer stopped");
                Ok(())
            }
            _ => Err(TimerError::NotRunning(self.name)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
