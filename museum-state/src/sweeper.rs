//! Periodic background expiry.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};

use crate::error::{Result, StateError};

/// A background task that calls a closure at a fixed period until shut down.
///
/// Used to expire feedback deadlines and stale devices. The first tick fires
/// one period after start. Ticks missed under load are delayed, not bunched.
pub struct Sweeper {
    name: &'static str,
    background_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl Sweeper {
    pub fn start<F>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut(Instant) + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let background_task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!("{} sweeper started ({:?})", name, period);

            loop {
                tokio::select! {
                    now = ticker.tick() => tick(now),
                    _ = shutdown_rx.recv() => break,
                }
            }

            tracing::debug!("{} sweeper stopped", name);
        });

        Self {
            name,
            background_task: Some(background_task),
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Signal the task to stop and wait up to 5 seconds for it.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(()).await;
        }

        let Some(task) = self.background_task.take() else {
            return Ok(());
        };
        match timeout(Duration::from_secs(5), task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(StateError::Shutdown(format!(
                "{} sweeper panicked: {e}",
                self.name
            ))),
            Err(_) => Err(StateError::Shutdown(format!(
                "{} sweeper shutdown timed out after 5 seconds",
                self.name
            ))),
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        if let Some(task) = self.background_task.take() {
            task.abort();
        }
    }
}
