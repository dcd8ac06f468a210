//! Memory tables for raw registration rows
//!
//! TigerStyle: Plain indexed maps, no locking, no failure besides emptiness.
//!
//! The tables are composed under a single lock by
//! [`FitableMemoryRepository`](crate::memory::FitableMemoryRepository).

use fitreg_core::{Address, Application, Extensions, FitableKey};
use std::collections::{BTreeMap, HashMap};

// =============================================================================
// Rows
// =============================================================================

/// A worker and the application it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEntry {
    pub worker_id: String,
    pub application: Application,
    pub environment: String,
}

/// Binding of a fitable to an application
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitableMeta {
    pub fitable: FitableKey,
    pub application: Application,
    pub aliases: Vec<String>,
    pub tags: Vec<String>,
    pub extensions: Extensions,
}

// =============================================================================
// WorkerTable
// =============================================================================

/// worker ID -> worker
#[derive(Debug, Default)]
pub struct WorkerTable {
    by_id: HashMap<String, WorkerEntry>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(&self, worker_id: &str) -> Vec<WorkerEntry> {
        self.by_id.get(worker_id).cloned().into_iter().collect()
    }

    pub fn query_by_application(&self, application: &Application) -> Vec<WorkerEntry> {
        self.by_id
            .values()
            .filter(|w| &w.application == application)
            .cloned()
            .collect()
    }

    pub fn query_all(&self) -> Vec<WorkerEntry> {
        self.by_id.values().cloned().collect()
    }

    /// Insert or replace by worker ID; returns the previous row
    pub fn save(&mut self, worker: WorkerEntry) -> Option<WorkerEntry> {
        self.by_id.insert(worker.worker_id.clone(), worker)
    }

    pub fn delete(&mut self, worker_id: &str) -> Option<WorkerEntry> {
        self.by_id.remove(worker_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

// =============================================================================
// AddressTable
// =============================================================================

/// worker ID -> endpoints
#[derive(Debug, Default)]
pub struct AddressTable {
    by_worker: HashMap<String, Vec<Address>>,
}

impl AddressTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(&self, worker_id: &str) -> Vec<Address> {
        self.by_worker.get(worker_id).cloned().unwrap_or_default()
    }

    pub fn query_all(&self) -> Vec<Address> {
        self.by_worker.values().flatten().cloned().collect()
    }

    /// Upsert addresses; an address with the same `(id, port)` is replaced in place
    pub fn save(&mut self, addresses: &[Address]) {
        for address in addresses {
            let rows = self.by_worker.entry(address.id.clone()).or_default();
            match rows.iter_mut().find(|a| a.same_endpoint(address)) {
                Some(existing) => *existing = address.clone(),
                None => rows.push(address.clone()),
            }
        }
    }

    pub fn delete(&mut self, worker_id: &str) -> Vec<Address> {
        self.by_worker.remove(worker_id).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_worker.is_empty()
    }
}

// =============================================================================
// FitableTable
// =============================================================================

/// fitable key -> application bindings
#[derive(Debug, Default)]
pub struct FitableTable {
    by_key: BTreeMap<FitableKey, Vec<FitableMeta>>,
}

impl FitableTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(&self, key: &FitableKey) -> Vec<FitableMeta> {
        self.by_key.get(key).cloned().unwrap_or_default()
    }

    /// All bindings whose key has the given generic ID
    pub fn query_by_generic_id(&self, generic_id: &str) -> Vec<FitableMeta> {
        let start = FitableKey::new(generic_id, "", "");
        self.by_key
            .range(start..)
            .take_while(|(key, _)| key.generic_id == generic_id)
            .flat_map(|(_, metas)| metas.iter().cloned())
            .collect()
    }

    /// Distinct keys with the given generic ID
    pub fn keys_by_generic_id(&self, generic_id: &str) -> Vec<FitableKey> {
        let start = FitableKey::new(generic_id, "", "");
        self.by_key
            .range(start..)
            .take_while(|(key, _)| key.generic_id == generic_id)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn query_all(&self) -> Vec<FitableMeta> {
        self.by_key.values().flatten().cloned().collect()
    }

    /// Insert or replace by `(fitable, application)`
    pub fn save(&mut self, meta: FitableMeta) {
        let rows = self.by_key.entry(meta.fitable.clone()).or_default();
        match rows.iter_mut().find(|m| m.application == meta.application) {
            Some(existing) => *existing = meta,
            None => rows.push(meta),
        }
    }

    /// Remove every binding of an application
    pub fn delete(&mut self, application: &Application) -> Vec<FitableMeta> {
        let mut removed = Vec::new();
        self.by_key.retain(|_, rows| {
            rows.retain(|m| {
                if &m.application == application {
                    removed.push(m.clone());
                    false
                } else {
                    true
                }
            });
            !rows.is_empty()
        });
        removed
    }

    /// Remove one `(fitable, application)` binding
    pub fn delete_fitable(&mut self, key: &FitableKey, application: &Application) -> bool {
        let Some(rows) = self.by_key.get_mut(key) else {
            return false;
        };
        let before = rows.len();
        rows.retain(|m| &m.application != application);
        let removed = rows.len() != before;
        if rows.is_empty() {
            self.by_key.remove(key);
        }
        removed
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}
