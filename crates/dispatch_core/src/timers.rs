//! Timer service (C12): acknowledgement deadline, auto-resolution deadline,
//! and periodic sweeper tick, as three independently-keyed timer kinds.
//!
//! All cancellable, all idempotent: arming again for the same key cancels
//! the prior timer (spec §4.12). Built fresh around `tokio::time::sleep` and
//! `tokio_util::sync::CancellationToken`, in the `tokio::select!` shape
//! `mavkit::event_loop`'s cancellable loop uses — the teacher's own
//! `clock.rs` models a deterministic virtual clock with a `BinaryHeap`,
//! which has no equivalent here since this service runs against real wall
//! time.

use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// One independently-keyed family of cancellable timers (e.g. all ack
/// deadlines, keyed by faultId; or all auto-resolve deadlines, keyed by
/// vehicleId).
pub struct TimerFamily<K: Eq + Hash + Clone + Send + Sync + 'static> {
    active: Arc<DashMap<K, CancellationToken>>,
    name: &'static str,
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> TimerFamily<K> {
    pub fn new(name: &'static str) -> Self {
        Self { active: Arc::new(DashMap::new()), name }
    }

    /// Arm a timer for `key`. If one is already armed for this key, it is
    /// cancelled first. `on_fire` is invoked only if the timer runs to
    /// completion (not cancelled).
    pub fn arm<F>(&self, key: K, duration: Duration, on_fire: F)
    where
        F: FnOnce() -> BoxFuture + Send + 'static,
    {
        self.cancel(&key);

        let token = CancellationToken::new();
        self.active.insert(key.clone(), token.clone());

        let active = self.active.clone();
        let name = self.name;
        let fire_key = key.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sleep(duration) => {
                    // `arm` always cancels any prior timer for this key before
                    // inserting a new token, so a sleep that runs to
                    // completion is always still the current entry.
                    active.remove(&fire_key);
                    debug!(timer = name, "timer fired");
                    on_fire().await;
                }
                _ = token.cancelled() => {
                    debug!(timer = name, "timer cancelled");
                }
            }
        });
    }

    pub fn cancel(&self, key: &K) {
        if let Some((_, token)) = self.active.remove(key) {
            token.cancel();
        }
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.active.contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn fires_after_duration() {
        let family: TimerFamily<u32> = TimerFamily::new("test");
        let fired = Arc::new(AtomicU32::new(0));
        let fired2 = fired.clone();
        family.arm(1, Duration::from_millis(10), move || {
            Box::pin(async move {
                fired2.fetch_add(1, Ordering::SeqCst);
            })
        });
        assert!(family.is_armed(&1));
        tokio::time::advance(Duration::from_millis(20)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_cancels_prior_timer() {
        let family: TimerFamily<u32> = TimerFamily::new("test");
        let fired = Arc::new(AtomicU32::new(0));

        let f1 = fired.clone();
        family.arm(1, Duration::from_millis(10), move || {
            Box::pin(async move {
                f1.fetch_add(1, Ordering::SeqCst);
            })
        });

        let f2 = fired.clone();
        family.arm(1, Duration::from_millis(50), move || {
            Box::pin(async move {
                f2.fetch_add(10, Ordering::SeqCst);
            })
        });

        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn cancel_prevents_fire() {
        let family: TimerFamily<u32> = TimerFamily::new("test");
        let fired = Arc::new(AtomicU32::new(0));
        let f1 = fired.clone();
        family.arm(1, Duration::from_millis(5), move || {
            Box::pin(async move {
                f1.fetch_add(1, Ordering::SeqCst);
            })
        });
        family.cancel(&1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
