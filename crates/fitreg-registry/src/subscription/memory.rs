//! Subscription memory repository
//!
//! TigerStyle: Set semantics per fitable, monotonic generation markers.

use fitreg_core::{FitableKey, Listener, ListenerId, RegistryCode, SubscriptionEntry};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::RwLock;
use tracing::debug;

type ListenerSet = BTreeMap<ListenerId, Listener>;

/// In-memory subscription index: fitable key -> listeners
#[derive(Debug, Default)]
pub struct SubscriptionMemoryRepository {
    state: RwLock<BTreeMap<FitableKey, ListenerSet>>,
}

impl SubscriptionMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry
    ///
    /// Returns `Exist` without touching fields when the listener is already
    /// subscribed; its generation still advances if the incoming one is greater.
    pub async fn insert_subscription_entry(&self, entry: &SubscriptionEntry) -> RegistryCode {
        let mut state = self.state.write().await;
        let listeners = state.entry(entry.fitable_key.clone()).or_default();
        match listeners.get_mut(&entry.listener.id()) {
            Some(existing) => {
                if entry.listener.sync_count > existing.sync_count {
                    existing.sync_count = entry.listener.sync_count;
                }
                RegistryCode::Exist
            }
            None => {
                listeners.insert(entry.listener.id(), entry.listener.clone());
                RegistryCode::Success
            }
        }
    }

    /// Remove an entry; returns false if it was not present
    pub async fn remove_subscription_entry(&self, entry: &SubscriptionEntry) -> bool {
        let mut state = self.state.write().await;
        let Some(listeners) = state.get_mut(&entry.fitable_key) else {
            return false;
        };
        let removed = listeners.remove(&entry.listener.id()).is_some();
        if listeners.is_empty() {
            state.remove(&entry.fitable_key);
        }
        removed
    }

    pub async fn query_subscription_set(&self, key: &FitableKey) -> Vec<SubscriptionEntry> {
        self.state
            .read()
            .await
            .get(key)
            .map(|listeners| {
                listeners
                    .values()
                    .map(|l| SubscriptionEntry::new(key.clone(), l.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn query_subscription_entry(
        &self,
        key: &FitableKey,
        listener: &Listener,
    ) -> Option<SubscriptionEntry> {
        self.state
            .read()
            .await
            .get(key)
            .and_then(|listeners| listeners.get(&listener.id()))
            .map(|l| SubscriptionEntry::new(key.clone(), l.clone()))
    }

    pub async fn query_listener_set(&self, key: &FitableKey) -> Vec<Listener> {
        self.state
            .read()
            .await
            .get(key)
            .map(|listeners| listeners.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn query_all_subscription_sets(&self) -> Vec<SubscriptionEntry> {
        let state = self.state.read().await;
        state
            .iter()
            .flat_map(|(key, listeners)| {
                listeners
                    .values()
                    .map(move |l| SubscriptionEntry::new(key.clone(), l.clone()))
            })
            .collect()
    }

    /// Every distinct listener across all fitables
    pub async fn query_all_listeners(&self) -> Vec<Listener> {
        let state = self.state.read().await;
        let mut seen = HashSet::new();
        state
            .values()
            .flat_map(|listeners| listeners.iter())
            .filter(|(id, _)| seen.insert((*id).clone()))
            .map(|(_, l)| l.clone())
            .collect()
    }

    pub async fn is_listener_exist(&self, entry: &SubscriptionEntry) -> bool {
        self.state
            .read()
            .await
            .get(&entry.fitable_key)
            .map(|listeners| listeners.contains_key(&entry.listener.id()))
            .unwrap_or(false)
    }

    /// Advance the stored generation; lower or equal values are ignored
    pub async fn update_sync_count(&self, entry: &SubscriptionEntry, sync_count: u64) -> bool {
        let mut state = self.state.write().await;
        match state
            .get_mut(&entry.fitable_key)
            .and_then(|listeners| listeners.get_mut(&entry.listener.id()))
        {
            Some(existing) if sync_count > existing.sync_count => {
                existing.sync_count = sync_count;
                true
            }
            _ => false,
        }
    }

    /// Remove every entry whose listener runs on one of `worker_ids`
    pub async fn remove_by_listener_ids(&self, worker_ids: &[String]) -> Vec<SubscriptionEntry> {
        let targets: HashSet<&str> = worker_ids.iter().map(String::as_str).collect();
        let mut state = self.state.write().await;
        let mut removed = Vec::new();
        state.retain(|key, listeners| {
            listeners.retain(|_, l| {
                if targets.contains(l.address.id.as_str()) {
                    removed.push(SubscriptionEntry::new(key.clone(), l.clone()));
                    false
                } else {
                    true
                }
            });
            !listeners.is_empty()
        });
        if !removed.is_empty() {
            debug!(count = removed.len(), "subscriptions removed by listener");
        }
        removed
    }

    /// Entries whose generation differs from `sync_count`
    pub async fn get_entries_not_updated(&self, sync_count: u64) -> Vec<SubscriptionEntry> {
        let state = self.state.read().await;
        state
            .iter()
            .flat_map(|(key, listeners)| {
                listeners
                    .values()
                    .filter(move |l| l.sync_count != sync_count)
                    .map(move |l| SubscriptionEntry::new(key.clone(), l.clone()))
            })
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.values().map(|l| l.len()).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
