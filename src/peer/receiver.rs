//! Inbound connections: accept, decode frames, store batches

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::ReceivedStore;
use crate::error::{Error, Result};
use crate::types::Credentials;
use crate::wire::{now_secs, FrameDecoder, PayloadMap};

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 64 * 1024;

/// Application callback, invoked once per decoded batch on the
/// connection's task
pub type OnReceive = Arc<dyn Fn(&ReceivedBatch) + Send + Sync>;

/// One batch as handed to the application callback
#[derive(Debug, Clone)]
pub struct ReceivedBatch {
    pub from: Credentials,
    pub peer_addr: SocketAddr,
    pub variables: PayloadMap,

    /// Transit time in seconds, when the sender stamped the frame
    pub latency_secs: Option<f64>,
}

/// Shared state for every connection task
#[derive(Clone)]
pub struct ReceiveContext {
    pub store: Arc<ReceivedStore>,
    pub on_receive: Option<OnReceive>,
    pub max_frame_bytes: Option<usize>,
}

impl ReceiveContext {
    pub fn new(store: Arc<ReceivedStore>) -> Self {
        Self {
            store,
            on_receive: None,
            max_frame_bytes: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Receiver
// ─────────────────────────────────────────────────────────────────

/// TCP listener plus its accept loop
pub struct Receiver {
    local_addr: SocketAddr,
    active: Arc<AtomicUsize>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Receiver {
    /// Bind the listener and start accepting connections
    pub async fn bind(host: &str, port: u16, ctx: ReceiveContext) -> Result<Self> {
        let listener = TcpListener::bind((host, port))
            .await
            .map_err(|e| Error::Bind {
                addr: format!("{}:{}", host, port),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Receiver listening");

        let active = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn(accept_loop(listener, ctx, Arc::clone(&active)));

        Ok(Self {
            local_addr,
            active,
            accept_task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections currently being read
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.accept_task
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Stop accepting. Connections already accepted run to completion.
    pub fn stop(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
            debug!(addr = %self.local_addr, "Receiver stopped");
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Counts one live connection; released on drop, including when the
/// connection task unwinds
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn enter(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(active))
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

async fn accept_loop(listener: TcpListener, ctx: ReceiveContext, active: Arc<AtomicUsize>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!(peer_addr = %peer_addr, "Incoming connection");
                let ctx = ctx.clone();
                let guard = ConnectionGuard::enter(&active);
                tokio::spawn(async move {
                    let _guard = guard;
                    match serve_connection(stream, peer_addr, &ctx).await {
                        Ok(frames) => debug!(peer_addr = %peer_addr, frames, "Connection closed"),
                        Err(e) => warn!(peer_addr = %peer_addr, error = %e, "Dropping connection"),
                    }
                });
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Read frames from one connection until the peer closes it.
///
/// Returns the number of batches stored. A malformed frame ends the
/// connection with an error; batches decoded before it are kept.
pub async fn serve_connection<R>(mut reader: R, peer_addr: SocketAddr, ctx: &ReceiveContext) -> Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new().with_max_frame_bytes(ctx.max_frame_bytes);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut frames = 0;

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            if !decoder.is_idle() {
                debug!(
                    peer_addr = %peer_addr,
                    buffered = decoder.buffered(),
                    "Peer closed with a partial frame pending"
                );
            }
            return Ok(frames);
        }

        decoder.feed(&buf[..n]);
        while let Some(frame) = decoder.next_frame()? {
            let received_at = now_secs();
            let latency_secs = frame.latency_secs(received_at);
            ctx.store.apply(&frame.credentials, &frame.variables);
            frames += 1;

            info!(
                from = %frame.credentials,
                peer_addr = %peer_addr,
                variables = frame.variables.len(),
                latency_secs = ?latency_secs,
                "Received batch"
            );

            if let Some(callback) = &ctx.on_receive {
                let batch = ReceivedBatch {
                    from: frame.credentials,
                    peer_addr,
                    variables: frame.variables,
                    latency_secs,
                };
                callback(&batch);
            }
        }
    }
}
