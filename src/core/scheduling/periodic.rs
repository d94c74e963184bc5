// Recurring background jobs (voice XP ticks, mute reconciliation sweeps).
//
// Each job runs on its own tokio task. The task records when its next iteration
// is due so commands can answer "next iteration in M:SS".

use super::clock::Clock;
use super::deferred::delay_until;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::AbortHandle;

pub struct PeriodicTask {
    name: &'static str,
    interval: Duration,
    clock: Arc<dyn Clock>,
    next_iteration: Arc<Mutex<Option<DateTime<Utc>>>>,
    handle: Mutex<Option<AbortHandle>>,
}

impl PeriodicTask {
    pub fn new(name: &'static str, interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            name,
            interval,
            clock,
            next_iteration: Arc::new(Mutex::new(None)),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start running `job` now and then once every interval.
    ///
    /// Starting an already running task restarts it.
    pub fn start<F, Fut>(&self, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = self.name;
        let interval = self.interval;
        let clock = Arc::clone(&self.clock);
        let next_iteration = Arc::clone(&self.next_iteration);

        let task = tokio::spawn(async move {
            loop {
                tracing::debug!(task = name, "Periodic task iteration starting");
                job().await;

                let next = clock.now()
                    + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::zero());
                *next_iteration
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(next);

                tokio::time::sleep(interval).await;
            }
        });

        let previous = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task.abort_handle());
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop the job. Its next iteration is forgotten.
    pub fn stop(&self) {
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        *self
            .next_iteration
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// How long until the next iteration. `None` when the task is not running
    /// (or has not finished its first iteration yet).
    pub fn time_until_next_cycle(&self) -> Option<Duration> {
        let next = *self
            .next_iteration
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        next.map(|at| delay_until(at, self.clock.now()))
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Render a duration as `M:SS`, the way cycle countdowns are shown to users.
pub fn format_countdown(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}", secs / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduling::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_then_every_interval() {
        let clock = Arc::new(ManualClock::new());
        let task = PeriodicTask::new(
            "test",
            Duration::from_secs(60),
            clock.clone() as Arc<dyn Clock>,
        );
        let runs = Arc::new(AtomicUsize::new(0));

        assert_eq!(task.time_until_next_cycle(), None);

        let counter = Arc::clone(&runs);
        task.start(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        });
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(task.time_until_next_cycle(), Some(Duration::from_secs(60)));

        clock.advance_secs(45);
        assert_eq!(task.time_until_next_cycle(), Some(Duration::from_secs(15)));

        clock.advance_secs(15);
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_task_reports_no_next_cycle() {
        let clock = Arc::new(ManualClock::new());
        let task = PeriodicTask::new("test", Duration::from_secs(5), clock as Arc<dyn Clock>);
        task.start(|| std::future::ready(()));
        settle().await;
        assert!(task.time_until_next_cycle().is_some());

        task.stop();
        assert_eq!(task.time_until_next_cycle(), None);
    }

    #[test]
    fn countdown_format_pads_seconds() {
        assert_eq!(format_countdown(Duration::from_secs(0)), "0:00");
        assert_eq!(format_countdown(Duration::from_secs(65)), "1:05");
        assert_eq!(format_countdown(Duration::from_secs(900)), "15:00");
    }
}
