//! Listener garbage collection by cycle
//!
//! TigerStyle: Two strikes before removal.
//!
//! Each cycle the liveness port reports which listener workers are alive. Known
//! listeners missing from that set become dying candidates. An ID is removed
//! only if it was a candidate in the previous cycle and is still one now, so a
//! single missed heartbeat never drops a subscriber.

use super::SubscriptionService;
use async_trait::async_trait;
use fitreg_core::{Timer, TimerId};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Source of the listener worker IDs that are currently alive
#[async_trait]
pub trait ListenerLiveness: Send + Sync {
    async fn alive_listener_ids(&self) -> HashSet<String>;
}

/// Fixed alive set for tests and static deployments
#[derive(Debug, Default)]
pub struct StaticLiveness {
    alive: RwLock<HashSet<String>>,
}

impl StaticLiveness {
    pub fn new(alive: impl IntoIterator<Item = String>) -> Self {
        Self {
            alive: RwLock::new(alive.into_iter().collect()),
        }
    }

    pub async fn set_alive(&self, alive: impl IntoIterator<Item = String>) {
        *self.alive.write().await = alive.into_iter().collect();
    }
}

#[async_trait]
impl ListenerLiveness for StaticLiveness {
    async fn alive_listener_ids(&self) -> HashSet<String> {
        self.alive.read().await.clone()
    }
}

#[derive(Debug, Default)]
struct DyingSets {
    previous: HashSet<String>,
    current: HashSet<String>,
}

/// Two-strike collector of subscriptions whose listener went away
pub struct ListenerGarbageCollector {
    service: Arc<SubscriptionService>,
    liveness: Arc<dyn ListenerLiveness>,
    dying: Mutex<DyingSets>,
    timer: Timer,
    interval_ms: u64,
    cycle_timer: Mutex<Option<TimerId>>,
}

impl ListenerGarbageCollector {
    pub fn new(
        service: Arc<SubscriptionService>,
        liveness: Arc<dyn ListenerLiveness>,
        timer: Timer,
        interval_ms: u64,
    ) -> Self {
        assert!(interval_ms > 0, "gc interval must be positive");
        Self {
            service,
            liveness,
            dying: Mutex::new(DyingSets::default()),
            timer,
            interval_ms,
            cycle_timer: Mutex::new(None),
        }
    }

    /// Record candidate-dead IDs for the current cycle
    pub async fn add_dying_listener_ids(&self, ids: impl IntoIterator<Item = String>) {
        self.dying.lock().await.current.extend(ids);
    }

    /// Clear IDs that reconfirmed during the current cycle
    pub async fn remove_dying_listener_ids(&self, ids: &HashSet<String>) {
        let mut dying = self.dying.lock().await;
        dying.current.retain(|id| !ids.contains(id));
        dying.previous.retain(|id| !ids.contains(id));
    }

    /// Close the cycle; returns the IDs dying in both this and the previous cycle
    pub async fn update_dying_listener_ids(&self) -> Vec<String> {
        let mut dying = self.dying.lock().await;
        let mut confirmed: Vec<String> = dying
            .current
            .intersection(&dying.previous)
            .cloned()
            .collect();
        confirmed.sort();
        let current = std::mem::take(&mut dying.current);
        dying.previous = current
            .into_iter()
            .filter(|id| !confirmed.contains(id))
            .collect();
        confirmed
    }

    /// Run one collection cycle; returns the worker IDs whose subscriptions were dropped
    pub async fn run_cycle(&self) -> Vec<String> {
        if !self.service.is_elected_for_gc().await {
            debug!("not elected, listener gc skipped");
            return Vec::new();
        }

        let alive = self.liveness.alive_listener_ids().await;
        let known: HashSet<String> = self
            .service
            .memory()
            .query_all_listeners()
            .await
            .into_iter()
            .map(|l| l.address.id)
            .collect();

        self.add_dying_listener_ids(known.difference(&alive).cloned())
            .await;
        self.remove_dying_listener_ids(&alive).await;

        let confirmed = self.update_dying_listener_ids().await;
        if !confirmed.is_empty() {
            let removed = self.service.remove_listeners(&confirmed).await;
            info!(listeners = confirmed.len(), subscriptions = removed.len(), "dead listeners collected");
        }
        confirmed
    }

    pub async fn start(self: &Arc<Self>) {
        let mut cycle_timer = self.cycle_timer.lock().await;
        if cycle_timer.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *cycle_timer = Some(self.timer.set_interval(
            self.interval_ms,
            self.interval_ms,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(gc) = weak.upgrade() {
                        gc.run_cycle().await;
                    }
                }
            },
        ));
        info!(interval_ms = self.interval_ms, "listener gc started");
    }

    pub async fn stop(&self) {
        if let Some(id) = self.cycle_timer.lock().await.take() {
            self.timer.remove(id);
        }
    }
}
