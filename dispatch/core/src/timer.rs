//! Scheduled Tasks
//!
//! A `ScheduledTask` is an owned handle to one deferred or periodic action:
//! the pool's idle sweep, a connection state's deadline, a queued request's
//! expiry. The handle lives next to the entity it belongs to, and dropping or
//! cancelling it aborts the action. No timer outlives its owner.

use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Cancellable handle for a deferred or periodic action
///
/// Aborts the underlying tokio task on drop.
#[derive(Debug)]
pub struct ScheduledTask {
    label: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Run `action` once after `delay`, measured from this call
    ///
    /// Outside a tokio runtime nothing is scheduled and the returned handle
    /// is inert.
    pub fn after<F>(label: &'static str, delay: Duration, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let handle = Self::spawn(label, async move {
            tokio::time::sleep_until(deadline).await;
            action();
        });
        Self { label, handle }
    }

    /// Run `action` every `period`, first firing one period from now
    pub fn every<F>(label: &'static str, period: Duration, mut action: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let start = Instant::now() + period;
        let handle = Self::spawn(label, async move {
            let mut ticker = interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                action();
            }
        });
        Self { label, handle }
    }

    fn spawn<Fut>(label: &'static str, fut: Fut) -> Option<JoinHandle<()>>
    where
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        match Handle::try_current() {
            Ok(rt) => Some(rt.spawn(fut)),
            Err(_) => {
                tracing::warn!(task = label, "No tokio runtime; scheduled task not started");
                None
            }
        }
    }

    /// Abort the action if it has not run yet
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Whether the action is still pending (or, for periodic tasks, running)
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Label given at creation
    #[must_use]
    pub fn label(&self) -> &'static str {
        self.label
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_after_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let task = ScheduledTask::after("test", Duration::from_secs(5), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(task.is_active());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_firing() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let mut task = ScheduledTask::after("test", Duration::from_secs(1), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();
        assert!(!task.is_active());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        drop(ScheduledTask::after("test", Duration::from_secs(1), move || {
            f.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_repeats() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let _task = ScheduledTask::every("tick", Duration::from_secs(10), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_without_runtime_is_inert() {
        let task = ScheduledTask::after("orphan", Duration::from_secs(1), || {});
        assert!(!task.is_active());
        assert_eq!(task.label(), "orphan");
    }
}
