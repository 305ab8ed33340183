//! Per-connection keepalive supervisor.
//!
//! The teacher drives idle disconnection inline, via a read-timeout
//! wrapped around each socket read (`stratum/server_v2.rs`'s
//! `handle_connection` loop). This crate instead runs the timer as its
//! own task per connection so the same escalation policy (tolerate a
//! few missed ticks before closing) applies uniformly regardless of
//! how the read side is implemented.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// Runs until `stop()` is called or `on_timeout` is invoked once, then
/// exits. `on_timeout` is guaranteed to run at most once even if
/// `stop()` races with the final missed tick.
pub struct KeepaliveSupervisor {
    stop: Arc<Notify>,
    stopped: Arc<AtomicBool>,
}

impl KeepaliveSupervisor {
    /// Spawn a ticking supervisor: every `interval`, check whether
    /// `last_activity_secs_ago()` exceeds `interval`; after
    /// `max_missed` consecutive misses, call `on_timeout` once and stop.
    pub fn spawn<F, T>(
        interval: Duration,
        max_missed: u32,
        last_activity_secs_ago: F,
        on_timeout: T,
    ) -> Self
    where
        F: Fn() -> u64 + Send + 'static,
        T: FnOnce() + Send + 'static,
    {
        let stop = Arc::new(Notify::new());
        let stopped = Arc::new(AtomicBool::new(false));

        let stop_task = stop.clone();
        let stopped_task = stopped.clone();

        tokio::spawn(async move {
            let mut missed = 0u32;
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = stop_task.notified() => {
                        return;
                    }
                    _ = ticker.tick() => {
                        if last_activity_secs_ago() > interval.as_secs() {
                            missed += 1;
                        } else {
                            missed = 0;
                        }

                        if missed >= max_missed {
                            if !stopped_task.swap(true, Ordering::SeqCst) {
                                on_timeout();
                            }
                            return;
                        }
                    }
                }
            }
        });

        Self { stop, stopped }
    }

    /// Stop the supervisor without firing `on_timeout` — used when the
    /// connection closes normally (the miner disconnected, or a higher
    /// layer is tearing the session down for some other reason).
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.stop.notify_one();
        }
    }
}

impl Drop for KeepaliveSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn fires_on_timeout_after_max_missed_ticks() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let idle_secs = Arc::new(AtomicU64::new(9999));
        let idle_secs_clone = idle_secs.clone();

        let _sup = KeepaliveSupervisor::spawn(
            Duration::from_secs(1),
            3,
            move || idle_secs_clone.load(Ordering::Relaxed),
            move || fired_clone.store(true, Ordering::SeqCst),
        );

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }

        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn activity_resets_the_miss_counter() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let idle_secs = Arc::new(AtomicU64::new(0));
        let idle_secs_clone = idle_secs.clone();

        let sup = KeepaliveSupervisor::spawn(
            Duration::from_secs(1),
            3,
            move || idle_secs_clone.load(Ordering::Relaxed),
            move || fired_clone.store(true, Ordering::SeqCst),
        );

        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }

        assert!(!fired.load(Ordering::SeqCst));
        sup.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_timeout_from_firing() {
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let idle_secs = Arc::new(AtomicU64::new(9999));
        let idle_secs_clone = idle_secs.clone();

        let sup = KeepaliveSupervisor::spawn(
            Duration::from_secs(1),
            3,
            move || idle_secs_clone.load(Ordering::Relaxed),
            move || fired_clone.store(true, Ordering::SeqCst),
        );
        sup.stop();

        for _ in 0..5 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }

        assert!(!fired.load(Ordering::SeqCst));
    }
}
