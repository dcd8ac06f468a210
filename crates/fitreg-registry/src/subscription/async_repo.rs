//! Write-behind subscription repository
//!
//! TigerStyle: One global FIFO, one consumer, bounded per-item retry.
//!
//! Subscription traffic is light compared to registrations, so a single queue
//! suffices. Enqueueing an insert or remove first clears any queued item for the
//! same `(fitable, listener)` and then merges into the tail batch if it has the
//! same state.

use super::SubscriptionRepository;
use crate::error::RegistryResult;
use async_trait::async_trait;
use fitreg_core::{FitableKey, Listener, SubscriptionConfig, SubscriptionEntry};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncSubscriptionState {
    Insert,
    Remove,
    RemoveByListener,
}

/// A queued subscription batch
#[derive(Debug, Clone)]
pub struct AsyncSubscriptionInfo {
    pub state: AsyncSubscriptionState,
    pub items: Vec<SubscriptionEntry>,
}

#[derive(Debug, Default)]
struct SubscriptionQueue {
    batches: VecDeque<AsyncSubscriptionInfo>,
    in_flight_items: usize,
    stopping: bool,
}

impl SubscriptionQueue {
    fn clear_same_entry(&mut self, entry: &SubscriptionEntry) {
        let target = entry.listener.id();
        for batch in self
            .batches
            .iter_mut()
            .filter(|b| b.state != AsyncSubscriptionState::RemoveByListener)
        {
            batch
                .items
                .retain(|item| item.fitable_key != entry.fitable_key || item.listener.id() != target);
        }
        self.batches.retain(|b| !b.items.is_empty());
    }

    fn push(&mut self, info: AsyncSubscriptionInfo) {
        if info.state != AsyncSubscriptionState::RemoveByListener {
            for item in &info.items {
                self.clear_same_entry(item);
            }
        }
        match self.batches.back_mut() {
            Some(tail) if tail.state == info.state => tail.items.extend(info.items),
            _ => self.batches.push_back(info),
        }
    }

    fn pop(&mut self) -> Option<AsyncSubscriptionInfo> {
        let batch = self.batches.pop_front()?;
        self.in_flight_items = batch.items.len();
        Some(batch)
    }

    fn queued_items(&self) -> usize {
        self.batches.iter().map(|b| b.items.len()).sum()
    }
}

#[derive(Debug, Default)]
struct Shared {
    queue: Mutex<SubscriptionQueue>,
    notify: Notify,
}

/// Write-behind decorator over a [`SubscriptionRepository`]
pub struct AsyncSubscriptionRepository {
    inner: Arc<dyn SubscriptionRepository>,
    shared: Arc<Shared>,
    config: SubscriptionConfig,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncSubscriptionRepository {
    pub fn new(inner: Arc<dyn SubscriptionRepository>, config: SubscriptionConfig) -> Self {
        Self {
            inner,
            shared: Arc::new(Shared::default()),
            config,
            consumer: Mutex::new(None),
        }
    }

    async fn enqueue(&self, state: AsyncSubscriptionState, items: Vec<SubscriptionEntry>) {
        if items.is_empty() {
            return;
        }
        self.shared
            .queue
            .lock()
            .await
            .push(AsyncSubscriptionInfo { state, items });
        self.shared.notify.notify_one();
    }

    pub async fn pending_count(&self) -> usize {
        let queue = self.shared.queue.lock().await;
        queue.queued_items() + queue.in_flight_items
    }

    pub async fn queued_batch_count(&self) -> usize {
        self.shared.queue.lock().await.batches.len()
    }

    /// Wait until the queue has drained
    pub async fn flush(&self) {
        while self.pending_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn consume(shared: Arc<Shared>, inner: Arc<dyn SubscriptionRepository>, config: SubscriptionConfig) {
        loop {
            let batch = {
                let mut queue = shared.queue.lock().await;
                queue.in_flight_items = 0;
                match queue.pop() {
                    Some(batch) => batch,
                    None if queue.stopping => break,
                    None => {
                        drop(queue);
                        shared.notify.notified().await;
                        continue;
                    }
                }
            };
            for item in &batch.items {
                Self::apply(inner.as_ref(), &config, batch.state, item).await;
            }
        }
    }

    /// Apply one item with bounded retry; the last failure is logged and dropped
    async fn apply(
        inner: &dyn SubscriptionRepository,
        config: &SubscriptionConfig,
        state: AsyncSubscriptionState,
        item: &SubscriptionEntry,
    ) {
        for attempt in 1..=config.write_retry_count_max {
            let result = match state {
                AsyncSubscriptionState::Insert => inner.insert(item).await,
                AsyncSubscriptionState::Remove => inner.remove(item).await,
                AsyncSubscriptionState::RemoveByListener => {
                    inner.remove_by_listener(&item.listener).await.map(|_| ())
                }
            };
            match result {
                Ok(()) => {
                    debug!(?state, fitable = %item.fitable_key, "subscription write applied");
                    return;
                }
                Err(e) if attempt < config.write_retry_count_max => {
                    warn!(?state, fitable = %item.fitable_key, attempt, error = %e, "subscription write failed, retrying");
                    tokio::time::sleep(Duration::from_millis(config.write_retry_backoff_ms)).await;
                }
                Err(e) => {
                    error!(?state, fitable = %item.fitable_key, attempt, error = %e, "subscription write dropped");
                }
            }
        }
    }
}

#[async_trait]
impl SubscriptionRepository for AsyncSubscriptionRepository {
    async fn start(&self) -> RegistryResult<()> {
        self.inner.start().await?;
        let mut consumer = self.consumer.lock().await;
        if consumer.is_some() {
            return Ok(());
        }
        self.shared.queue.lock().await.stopping = false;
        *consumer = Some(tokio::spawn(Self::consume(
            self.shared.clone(),
            self.inner.clone(),
            self.config.clone(),
        )));
        info!("write-behind subscription repository started");
        Ok(())
    }

    /// Drain the queue, then stop the consumer and the wrapped repository
    async fn stop(&self) -> RegistryResult<()> {
        self.shared.queue.lock().await.stopping = true;
        self.shared.notify.notify_one();
        let consumer = self.consumer.lock().await.take();
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.await {
                warn!(error = %e, "subscription consumer ended abnormally");
            }
        }
        self.inner.stop().await
    }

    async fn insert(&self, entry: &SubscriptionEntry) -> RegistryResult<()> {
        self.enqueue(AsyncSubscriptionState::Insert, vec![entry.clone()])
            .await;
        Ok(())
    }

    async fn remove(&self, entry: &SubscriptionEntry) -> RegistryResult<()> {
        self.enqueue(AsyncSubscriptionState::Remove, vec![entry.clone()])
            .await;
        Ok(())
    }

    /// Returns the entries durable right now; the deletion itself is deferred
    async fn remove_by_listener(&self, listener: &Listener) -> RegistryResult<Vec<SubscriptionEntry>> {
        let target = listener.id();
        let existing: Vec<SubscriptionEntry> = self
            .inner
            .query_all()
            .await?
            .into_iter()
            .filter(|e| e.listener.id() == target)
            .collect();
        let marker = SubscriptionEntry::new(FitableKey::new("", "", ""), listener.clone());
        self.enqueue(AsyncSubscriptionState::RemoveByListener, vec![marker])
            .await;
        Ok(existing)
    }

    async fn query(&self, key: &FitableKey) -> RegistryResult<Vec<SubscriptionEntry>> {
        self.inner.query(key).await
    }

    async fn query_all(&self) -> RegistryResult<Vec<SubscriptionEntry>> {
        self.inner.query_all().await
    }
}
