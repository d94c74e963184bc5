// Deferred actions: "run this at time T", keyed so a later schedule for the same
// key replaces the earlier one and an administrator can cancel it.
//
// The timers themselves live in memory (one tokio task per action). Durability
// comes from the caller: whatever a deferred action undoes must also be persisted,
// and on startup the caller re-derives the outstanding actions from storage and
// schedules them again (see `ModerationService::recover_mutes`).

use super::clock::Clock;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

struct PendingAction {
    token: u64,
    run_at: DateTime<Utc>,
    handle: AbortHandle,
}

/// One-shot timers keyed by `K`.
pub struct DeferredScheduler<K>
where
    K: Eq + Hash,
{
    pending: Arc<DashMap<K, PendingAction>>,
    clock: Arc<dyn Clock>,
    next_token: AtomicU64,
}

impl<K> DeferredScheduler<K>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            pending: Arc::new(DashMap::new()),
            clock,
            next_token: AtomicU64::new(1),
        }
    }

    /// Arrange for `action` to run at `run_at` (immediately if that is in the past).
    ///
    /// Any action already pending under `key` is cancelled and replaced.
    pub fn schedule<F, Fut>(&self, key: K, run_at: DateTime<Utc>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let delay = delay_until(run_at, self.clock.now());
        let pending = Arc::clone(&self.pending);
        let task_key = key.clone();

        // The task must not look itself up before it has been registered.
        let (armed_tx, armed_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            if armed_rx.await.is_err() {
                return;
            }
            tokio::time::sleep(delay).await;

            // Deregister before acting: once removed, cancel() can no longer
            // abort us halfway through the action.
            let still_ours = pending
                .remove_if(&task_key, |_, p| p.token == token)
                .is_some();
            if still_ours {
                tracing::debug!(key = ?task_key, "Running deferred action");
                action().await;
            }
        });

        let replaced = self.pending.insert(
            key.clone(),
            PendingAction {
                token,
                run_at,
                handle: task.abort_handle(),
            },
        );
        if let Some(previous) = replaced {
            tracing::debug!(key = ?key, "Replacing pending deferred action");
            previous.handle.abort();
        }

        let _ = armed_tx.send(());
    }

    /// Cancel the pending action for `key`. Returns whether one was pending.
    pub fn cancel(&self, key: &K) -> bool {
        match self.pending.remove(key) {
            Some((_, action)) => {
                action.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Time left before the action for `key` fires.
    pub fn time_until(&self, key: &K) -> Option<Duration> {
        self.pending
            .get(key)
            .map(|p| delay_until(p.run_at, self.clock.now()))
    }

    /// Number of actions still waiting to fire.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl<K> Drop for DeferredScheduler<K>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        for entry in self.pending.iter() {
            entry.value().handle.abort();
        }
    }
}

/// Non-negative delay from `now` until `run_at`.
pub fn delay_until(run_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (run_at - now).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::scheduling::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    fn scheduler() -> (Arc<ManualClock>, DeferredScheduler<u64>) {
        let clock = Arc::new(ManualClock::new());
        let scheduler = DeferredScheduler::new(clock.clone() as Arc<dyn Clock>);
        (clock, scheduler)
    }

    /// Let spawned tasks observe the current (paused) time.
    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn counting_action(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> std::future::Ready<()> {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn action_fires_after_delay() {
        let (clock, scheduler) = scheduler();
        let fired = Arc::new(AtomicUsize::new(0));

        let run_at = clock.now() + chrono::Duration::seconds(5);
        scheduler.schedule(1, run_at, counting_action(&fired));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.pending(), 1);

        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn past_due_action_runs_immediately() {
        let (clock, scheduler) = scheduler();
        let fired = Arc::new(AtomicUsize::new(0));

        let run_at = clock.now() - chrono::Duration::seconds(30);
        scheduler.schedule(7, run_at, counting_action(&fired));
        settle().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_action_never_fires() {
        let (clock, scheduler) = scheduler();
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(
            1,
            clock.now() + chrono::Duration::seconds(5),
            counting_action(&fired),
        );
        assert!(scheduler.cancel(&1));
        assert!(!scheduler.cancel(&1));

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rescheduling_replaces_the_pending_action() {
        let (clock, scheduler) = scheduler();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        scheduler.schedule(
            1,
            clock.now() + chrono::Duration::seconds(5),
            counting_action(&first),
        );
        scheduler.schedule(
            1,
            clock.now() + chrono::Duration::seconds(20),
            counting_action(&second),
        );
        assert_eq!(scheduler.pending(), 1);

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn time_until_tracks_the_clock() {
        let (clock, scheduler) = scheduler();
        scheduler.schedule(
            3,
            clock.now() + chrono::Duration::seconds(5),
            || std::future::ready(()),
        );

        assert_eq!(scheduler.time_until(&3), Some(Duration::from_secs(5)));
        clock.advance_secs(2);
        assert_eq!(scheduler.time_until(&3), Some(Duration::from_secs(3)));
        clock.advance_secs(10);
        assert_eq!(scheduler.time_until(&3), Some(Duration::ZERO));
        assert_eq!(scheduler.time_until(&4), None);
    }

    #[test]
    fn delay_until_never_goes_negative() {
        let now = Utc::now();
        assert_eq!(
            delay_until(now - chrono::Duration::seconds(1), now),
            Duration::ZERO
        );
        assert_eq!(
            delay_until(now + chrono::Duration::milliseconds(1500), now),
            Duration::from_millis(1500)
        );
    }
}
