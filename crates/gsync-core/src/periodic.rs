//! Timer-driven callbacks independent of any UI or render loop

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A callback run every `period` on the tokio runtime
///
/// The first run happens one period after spawning. Dropping the task
/// stops it.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn onto the current runtime
    ///
    /// # Panics
    /// If called outside a tokio runtime
    pub fn spawn(
        name: &'static str,
        period: Duration,
        mut tick: impl FnMut() + Send + 'static,
    ) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                tick();
            }
        });
        tracing::debug!(task = name, ?period, "periodic task started");
        Self { name, handle }
    }

    /// Task name
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the task has stopped
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop the task
    pub fn stop(self) {
        tracing::debug!(task = self.name, "periodic task stopped");
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
