//! Which peers have been sent to, and which sends are in flight

use std::collections::HashSet;

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct TrackerState {
    sent: HashSet<String>,
    in_progress: HashSet<String>,
}

/// Per-process record of delivery state by peer ID.
///
/// A peer moves `unknown -> in progress -> sent`; `sent` only grows, so a
/// peer receives at most one batch for the life of the process.
#[derive(Debug, Default)]
pub struct PeerTracker {
    state: Mutex<TrackerState>,
}

impl PeerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a peer for sending. Returns false when the peer was already
    /// sent to or another task is sending to it.
    pub fn try_begin(&self, peer_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.sent.contains(peer_id) || state.in_progress.contains(peer_id) {
            return false;
        }
        state.in_progress.insert(peer_id.to_string())
    }

    /// Record a successful delivery
    pub fn mark_sent(&self, peer_id: &str) {
        let mut state = self.state.lock();
        state.in_progress.remove(peer_id);
        state.sent.insert(peer_id.to_string());
    }

    /// Release a claim without recording delivery
    pub fn abandon(&self, peer_id: &str) {
        self.state.lock().in_progress.remove(peer_id);
    }

    pub fn is_sent(&self, peer_id: &str) -> bool {
        self.state.lock().sent.contains(peer_id)
    }

    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn in_progress_count(&self) -> usize {
        self.state.lock().in_progress.len()
    }

    /// IDs of every peer delivered to, sorted
    pub fn sent_peers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().sent.iter().cloned().collect();
        ids.sort();
        ids
    }
}
