//! Process-wide timer
//!
//! TigerStyle: One injected timer per process, explicit task handles.
//!
//! Reconciliation, TTL scans, subscription GC and the client refresh loop all
//! schedule through a `Timer` passed in at construction. Each scheduled task is
//! a spawned tokio task, so these methods must be called from within a runtime.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle of a scheduled task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

#[derive(Debug, Default)]
struct TimerState {
    next_id: u64,
    tasks: HashMap<TimerId, JoinHandle<()>>,
    stopped: bool,
}

/// Timer running one-shot and periodic callbacks
#[derive(Debug, Default, Clone)]
pub struct Timer {
    state: Arc<Mutex<TimerState>>,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(state: &Mutex<TimerState>) -> MutexGuard<'_, TimerState> {
        match state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Run `task` once after `delay_ms`
    pub fn set_timeout<F, Fut>(&self, delay_ms: u64, task: F) -> TimerId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut state = Self::lock(&self.state);
        let id = TimerId(state.next_id);
        state.next_id += 1;
        if state.stopped {
            warn!(timer = %id, "timer stopped, timeout not scheduled");
            return id;
        }

        let shared = self.state.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            task().await;
            Self::lock(&shared).tasks.remove(&id);
        });
        state.tasks.insert(id, handle);
        debug!(timer = %id, delay_ms, "timeout scheduled");
        id
    }

    /// Run `task` every `interval_ms`, first after `first_delay_ms`
    ///
    /// Runs never overlap: the next interval starts once the previous run returns.
    pub fn set_interval<F, Fut>(&self, first_delay_ms: u64, interval_ms: u64, task: F) -> TimerId
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        assert!(interval_ms > 0, "interval must be positive");

        let mut state = Self::lock(&self.state);
        let id = TimerId(state.next_id);
        state.next_id += 1;
        if state.stopped {
            warn!(timer = %id, "timer stopped, interval not scheduled");
            return id;
        }

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(first_delay_ms)).await;
            loop {
                task().await;
                tokio::time::sleep(Duration::from_millis(interval_ms)).await;
            }
        });
        state.tasks.insert(id, handle);
        debug!(timer = %id, first_delay_ms, interval_ms, "interval scheduled");
        id
    }

    /// Cancel a scheduled task; returns false if it already finished or is unknown
    pub fn remove(&self, id: TimerId) -> bool {
        match Self::lock(&self.state).tasks.remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every task and refuse new ones
    pub fn stop(&self) {
        let mut state = Self::lock(&self.state);
        state.stopped = true;
        for (_, handle) in state.tasks.drain() {
            handle.abort();
        }
    }

    /// Number of scheduled tasks that have not finished
    pub fn active_count(&self) -> usize {
        Self::lock(&self.state).tasks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_set_timeout_fires_once() {
        let timer = Timer::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        timer.set_timeout(100, move || async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(timer.active_count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(timer.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_interval_and_remove() {
        let timer = Timer::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        let id = timer.set_interval(10, 100, move || {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        assert!(timer.remove(id));
        assert!(!timer.remove(id));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_everything() {
        let timer = Timer::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        timer.set_timeout(100, move || async move {
            h.fetch_add(1, Ordering::SeqCst);
        });
        timer.stop();

        let h = hits.clone();
        timer.set_timeout(10, move || async move {
            h.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(timer.active_count(), 0);
    }
}
