//! Serial executors for peer fan-out
//!
//! TigerStyle: Bounded pending count, strict FIFO, one task at a time.
//!
//! A `SerialExecutor` runs submitted futures one after another on its own
//! tokio task. A `SerialExecutorPool` binds a key (peer worker ID) to one
//! executor by hash, so everything sent to one peer is delivered in order and
//! never concurrently, while different peers proceed in parallel.

use futures::future::BoxFuture;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// A unit of work for a serial executor
pub type SerialTask = BoxFuture<'static, ()>;

/// Runs tasks strictly one at a time in submission order
pub struct SerialExecutor {
    sender: mpsc::UnboundedSender<SerialTask>,
    /// Queued plus running tasks
    pending: Arc<AtomicUsize>,
    pending_max: usize,
    dropped: AtomicU64,
    handle: JoinHandle<()>,
}

impl SerialExecutor {
    /// Spawn the executor loop; must be called within a tokio runtime
    pub fn new(pending_max: usize) -> Self {
        assert!(pending_max > 0, "pending ceiling must be positive");

        let (sender, mut receiver) = mpsc::unbounded_channel::<SerialTask>();
        let pending = Arc::new(AtomicUsize::new(0));
        let counter = pending.clone();
        let handle = tokio::spawn(async move {
            while let Some(task) = receiver.recv().await {
                task.await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }
        });

        Self {
            sender,
            pending,
            pending_max,
            dropped: AtomicU64::new(0),
            handle,
        }
    }

    /// Queue a task; returns false if the ceiling is reached and the task was dropped
    pub fn submit(&self, task: SerialTask) -> bool {
        let admitted = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.pending_max).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            self.dropped.fetch_add(1, Ordering::SeqCst);
            return false;
        }

        if self.sender.send(task).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            debug!("serial executor closed, task discarded");
            return false;
        }
        true
    }

    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Tasks rejected by the ceiling since creation
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Fixed set of serial executors selected by key hash
pub struct SerialExecutorPool {
    executors: Vec<SerialExecutor>,
}

impl SerialExecutorPool {
    pub fn new(executor_count: usize, pending_max: usize) -> Self {
        assert!(executor_count > 0, "executor count must be positive");
        Self {
            executors: (0..executor_count)
                .map(|_| SerialExecutor::new(pending_max))
                .collect(),
        }
    }

    pub fn executor_for(&self, key: &str) -> &SerialExecutor {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % self.executors.len() as u64) as usize;
        &self.executors[index]
    }

    /// Submit to the executor bound to `key`; false if dropped by backpressure
    pub fn submit(&self, key: &str, task: SerialTask) -> bool {
        self.executor_for(key).submit(task)
    }

    /// Pending tasks across all executors
    pub fn pending_count(&self) -> usize {
        self.executors.iter().map(|e| e.pending_count()).sum()
    }

    pub fn dropped_count(&self) -> u64 {
        self.executors.iter().map(|e| e.dropped_count()).sum()
    }

    pub fn stop(&self) {
        for executor in &self.executors {
            executor.stop();
        }
    }
}
