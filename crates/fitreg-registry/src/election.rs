//! Master election port
//!
//! Exactly one registry node should re-persist stale records and collect dead
//! listeners. How that node is chosen is outside this crate.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// Answers whether this node currently performs cluster-wide repair
#[async_trait]
pub trait GcElection: Send + Sync {
    async fn is_elected_for_gc(&self) -> bool;
}

/// Fixed election result, switchable at runtime
#[derive(Debug)]
pub struct StaticGcElection {
    elected: AtomicBool,
}

impl StaticGcElection {
    pub fn new(elected: bool) -> Self {
        Self {
            elected: AtomicBool::new(elected),
        }
    }

    pub fn set_elected(&self, elected: bool) {
        self.elected.store(elected, Ordering::SeqCst);
    }
}

#[async_trait]
impl GcElection for StaticGcElection {
    async fn is_elected_for_gc(&self) -> bool {
        self.elected.load(Ordering::SeqCst)
    }
}
