//! Discovery registry integration
//!
//! Registers this node with the registry agent (Consul HTTP API) and polls
//! it for the other nodes of the deployment.

mod address;
mod client;
mod models;

pub use address::{primary_interface_address, resolve_self_address};
pub use client::RegistryClient;
pub use models::{AgentService, ServiceRegistration, TcpHealthCheck};

use async_trait::async_trait;

use crate::error::Result;
use crate::types::PeerRecord;

/// A directory of peers that the dispatcher polls
#[async_trait]
pub trait PeerSource: Send + Sync {
    /// Every currently known peer, this node included
    async fn poll_peers(&self) -> Result<Vec<PeerRecord>>;
}
