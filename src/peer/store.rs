//! Data received from peers

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::types::Credentials;
use crate::wire::{PayloadMap, Value};

/// Received variables keyed by sender credentials.
///
/// Later batches overwrite earlier values per (sender, variable); other
/// variables from the same sender are kept. Nothing is ever evicted.
#[derive(Debug, Default)]
pub struct ReceivedStore {
    data: RwLock<HashMap<Credentials, HashMap<String, Value>>>,
    arrived: Notify,
    batches: AtomicU64,
}

impl ReceivedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one decoded batch
    pub fn apply(&self, from: &Credentials, variables: &PayloadMap) {
        {
            let mut data = self.data.write();
            let entry = data.entry(from.clone()).or_default();
            for (name, value) in variables {
                entry.insert(name.clone(), value.clone());
            }
        }
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.arrived.notify_waiters();
    }

    /// Copy of everything received so far
    pub fn snapshot(&self) -> HashMap<Credentials, HashMap<String, Value>> {
        self.data.read().clone()
    }

    /// Variables received from one sender
    pub fn from_sender(&self, from: &Credentials) -> Option<HashMap<String, Value>> {
        self.data.read().get(from).cloned()
    }

    pub fn get(&self, from: &Credentials, name: &str) -> Option<Value> {
        self.data.read().get(from).and_then(|vars| vars.get(name).cloned())
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    pub fn sender_count(&self) -> usize {
        self.data.read().len()
    }

    /// Total batches applied, including empty ones
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Wait until at least one batch has arrived. Returns false on timeout.
    pub async fn wait_for_data(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a concurrent apply can't slip between
            let notified = self.arrived.notified();
            if self.batch_count() > 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.batch_count() > 0;
            }
        }
    }
}
