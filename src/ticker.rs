//! Cancellable fixed-cadence background work.
//!
//! Both the per-viewer code stream and the external sync dispatcher are "run this every N"
//! loops. [`PeriodicTask`] owns such a loop: the first run happens immediately, missed
//! ticks are skipped rather than bunched up, and stopping is idempotent.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub struct PeriodicTask {
    name: String,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Spawn `f` to run every `interval` until stopped.
    ///
    /// A run that is in progress when the task is stopped is allowed to finish.
    pub fn spawn<F, Fut>(name: impl Into<String>, interval: Duration, mut f: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if token.is_cancelled() {
                    break;
                }
                f().await;
            }
            tracing::debug!(task = %task_name, "Periodic task stopped");
        });

        tracing::debug!(task = %name, ?interval, "Periodic task started");
        Self {
            name,
            cancel,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Signal the loop to stop without waiting for it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Stop the loop and wait for it to exit. Once this returns no further run starts.
    /// Calling it again is a no-op.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    tracing::error!(task = %self.name, "Periodic task panicked: {}", e);
                }
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
