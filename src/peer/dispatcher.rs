//! Outbound delivery: match discovered peers and send each one the
//! current payload, retrying until it lands

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::{Backoff, Constant};
use parking_lot::{Mutex, RwLock};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::PeerTracker;
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::registry::PeerSource;
use crate::types::{Credentials, PeerRecord};
use crate::wire::{encode_frame, now_secs, PayloadMap};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Our own registry ID, never dispatched to
    pub self_id: String,

    /// Peers are selected when a tag or their service name is one of these
    pub target_roles: Vec<String>,

    /// Interval between discovery polls
    pub poll_interval: Duration,

    /// Timeout for establishing a peer connection
    pub connect_timeout: Duration,

    /// Delay before retrying a failed delivery
    pub retry_delay: Duration,
}

impl DispatchConfig {
    pub fn from_node_config(self_id: impl Into<String>, config: &NodeConfig) -> Self {
        Self {
            self_id: self_id.into(),
            target_roles: config.dispatch.target_roles.clone(),
            poll_interval: config.registry.poll_interval(),
            connect_timeout: config.dispatch.connect_timeout(),
            retry_delay: config.dispatch.retry_delay(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────

/// Sends the submitted payload once to every matching peer
pub struct Dispatcher {
    config: DispatchConfig,
    credentials: Credentials,
    source: Arc<dyn PeerSource>,
    tracker: PeerTracker,

    /// Payload sent to peers; replaced on every submit
    outbound: RwLock<Option<Arc<PayloadMap>>>,

    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub fn new(config: DispatchConfig, credentials: Credentials, source: Arc<dyn PeerSource>) -> Self {
        Self {
            config,
            credentials,
            source,
            tracker: PeerTracker::new(),
            outbound: RwLock::new(None),
            poll_task: Mutex::new(None),
        }
    }

    /// Start the fixed-interval poll loop if it is not already running.
    ///
    /// Every tick polls the peer source; matching peers are only dispatched
    /// to once a payload has been submitted. The loop holds a weak
    /// reference and ends on its own once the dispatcher is dropped.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.poll_task.lock();
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }

        let weak = Arc::downgrade(self);
        let period = self.config.poll_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(dispatcher) = weak.upgrade() else {
                    break;
                };
                dispatcher.poll_and_dispatch().await;
            }
        }));
        debug!(interval_ms = period.as_millis() as u64, "Peer polling started");
    }

    /// Set the payload to broadcast, starting the poll loop if needed.
    ///
    /// Peers that were already sent to do not receive the new payload;
    /// sends still retrying pick it up on their next attempt.
    pub fn submit(self: &Arc<Self>, payload: PayloadMap) -> Result<()> {
        // Surface encoding problems to the caller instead of every send task
        encode_frame(&self.credentials, &payload, None)?;

        let variables = payload.len();
        let replaced = self.outbound.write().replace(Arc::new(payload)).is_some();
        self.start();

        if replaced {
            info!(variables, "Payload replaced");
        } else {
            info!(
                variables,
                target_roles = ?self.config.target_roles,
                "Payload submitted, dispatch started"
            );
        }
        Ok(())
    }

    /// Poll the peer source once and, when a payload is set, start a send
    /// task for every matching peer not yet sent to or in flight. Returns
    /// the number of tasks started.
    pub async fn poll_and_dispatch(self: &Arc<Self>) -> usize {
        let peers = match self.source.poll_peers().await {
            Ok(peers) => peers,
            Err(e) => {
                debug!(error = %e, "No peers this round");
                return 0;
            }
        };

        if self.outbound.read().is_none() {
            debug!(peers = peers.len(), "Nothing submitted, skipping dispatch");
            return 0;
        }

        let mut started = 0;
        for peer in peers {
            if !self.matches(&peer) || !self.tracker.try_begin(&peer.id) {
                continue;
            }
            debug!(peer = %peer, "Dispatching to peer");
            let dispatcher = Arc::clone(self);
            tokio::spawn(dispatcher.send_to_peer(peer));
            started += 1;
        }
        started
    }

    /// Whether a peer is a delivery target
    pub fn matches(&self, peer: &PeerRecord) -> bool {
        peer.id != self.config.self_id && peer.matches_roles(&self.config.target_roles)
    }

    /// Deliver to one peer, retrying at a fixed delay until it succeeds
    async fn send_to_peer(self: Arc<Self>, peer: PeerRecord) {
        let mut backoff = Constant::new(self.config.retry_delay);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.deliver(&peer).await {
                Ok(bytes) => {
                    self.tracker.mark_sent(&peer.id);
                    info!(
                        peer = %peer.id,
                        endpoint = %peer.endpoint(),
                        bytes,
                        attempt,
                        "Data sent to peer"
                    );
                    return;
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(self.config.retry_delay);
                    warn!(
                        peer = %peer.id,
                        endpoint = %peer.endpoint(),
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Delivery failed"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One delivery attempt: connect, write one frame, close
    async fn deliver(&self, peer: &PeerRecord) -> Result<usize> {
        let endpoint = peer.endpoint();
        let payload = self
            .outbound
            .read()
            .clone()
            .ok_or_else(|| Error::Internal("dispatch started without a payload".to_string()))?;

        let mut stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((peer.address.as_str(), peer.port)),
        )
        .await
        .map_err(|_| {
            Error::connection_timeout(&endpoint, self.config.connect_timeout.as_millis() as u64)
        })?
        .map_err(|e| Error::connection_failed(&endpoint, e.to_string()))?;

        let frame = encode_frame(&self.credentials, &payload, Some(now_secs()))?;
        stream
            .write_all(&frame)
            .await
            .map_err(|e| Error::connection_failed(&endpoint, e.to_string()))?;
        stream.flush().await?;
        stream.shutdown().await?;

        Ok(frame.len())
    }

    /// Stop polling. Send tasks already running keep retrying.
    pub fn stop(&self) {
        if let Some(task) = self.poll_task.lock().take() {
            task.abort();
            debug!("Dispatch polling stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.poll_task
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Payload currently being broadcast
    pub fn current_payload(&self) -> Option<Arc<PayloadMap>> {
        self.outbound.read().clone()
    }

    pub fn tracker(&self) -> &PeerTracker {
        &self.tracker
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
