//! Node facade
//!
//! Ties the pieces together: binds the receiver, registers with the
//! registry, and exposes the send / receive API to the application.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::error::Result;
use crate::peer::{DispatchConfig, Dispatcher, OnReceive, ReceiveContext, ReceivedStore, Receiver};
use crate::registry::{resolve_self_address, PeerSource, RegistryClient};
use crate::types::{Credentials, NodeIdentity, PeerRecord};
use crate::wire::{PayloadMap, Value};

/// A running node
pub struct Node {
    identity: NodeIdentity,
    advertised: IpAddr,
    registry: Arc<RegistryClient>,
    receiver: Receiver,
    dispatcher: Arc<Dispatcher>,
    store: Arc<ReceivedStore>,
    deregister_on_shutdown: bool,
}

impl Node {
    /// Start a node: bind the receiver, register with the registry and
    /// start polling it for peers.
    ///
    /// Registration failures are logged and do not stop the node; the
    /// receiver keeps accepting data either way.
    pub async fn start(config: NodeConfig, on_receive: Option<OnReceive>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(ReceivedStore::new());
        let ctx = ReceiveContext {
            store: Arc::clone(&store),
            on_receive,
            max_frame_bytes: config.receiver.frame_limit(),
        };
        let receiver = Receiver::bind(&config.node.listen_host, config.node.listen_port, ctx).await?;

        let identity = NodeIdentity::new(
            config.node_id(),
            config.container_name(),
            config.node.role.clone(),
            config.node.device.clone(),
            &config.node.tags,
            config.node.listen_host.clone(),
            receiver.local_addr().port(),
        );

        let advertised = match config.node.advertise_address {
            Some(addr) => addr,
            None => resolve_self_address(config.node.service_name.as_deref()).await,
        };

        let registry = Arc::new(RegistryClient::new(&config.registry)?);
        if let Err(e) = registry.register(&identity, advertised).await {
            warn!(
                error = %e,
                registry = %registry.base_url(),
                "Registration failed, continuing without it"
            );
        }

        let dispatcher = Arc::new(Dispatcher::new(
            DispatchConfig::from_node_config(identity.node_id.clone(), &config),
            identity.credentials(),
            Arc::clone(&registry) as Arc<dyn PeerSource>,
        ));
        dispatcher.start();

        info!(
            id = %identity.node_id,
            name = %identity.container_name,
            role = %identity.role,
            listen = %receiver.local_addr(),
            advertised = %advertised,
            "Node started"
        );

        Ok(Self {
            identity,
            advertised,
            registry,
            receiver,
            dispatcher,
            store,
            deregister_on_shutdown: config.registry.deregister_on_shutdown,
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    /// Credentials stamped on everything this node sends
    pub fn credentials(&self) -> Credentials {
        self.identity.credentials()
    }

    /// Address the receiver is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.receiver.local_addr()
    }

    /// Address announced to the registry
    pub fn advertised_address(&self) -> IpAddr {
        self.advertised
    }

    /// Broadcast a payload to every peer playing one of the target roles.
    ///
    /// Returns once the payload is accepted; delivery happens in the
    /// background, once per peer.
    pub fn send_data_to_peers(&self, payload: PayloadMap) -> Result<()> {
        self.dispatcher.submit(payload)
    }

    /// Snapshot of everything received, keyed by sender
    pub fn received_data(&self) -> HashMap<Credentials, HashMap<String, Value>> {
        self.store.snapshot()
    }

    pub fn received_from(&self, sender: &Credentials) -> Option<HashMap<String, Value>> {
        self.store.from_sender(sender)
    }

    /// Block until the first batch arrives or `timeout` elapses
    pub async fn wait_for_data(&self, timeout: Duration) -> bool {
        self.store.wait_for_data(timeout).await
    }

    /// Peers reported by the last successful registry poll
    pub fn known_peers(&self) -> Vec<PeerRecord> {
        self.registry.last_known_peers()
    }

    /// Number of peers delivered to so far
    pub fn sent_peer_count(&self) -> usize {
        self.dispatcher.tracker().sent_count()
    }

    /// Stop accepting connections and polling, then leave the registry.
    ///
    /// Send tasks still retrying are not cancelled.
    pub async fn shutdown(&self) {
        self.dispatcher.stop();
        self.receiver.stop();

        if self.deregister_on_shutdown {
            if let Err(e) = self.registry.deregister(&self.identity.node_id).await {
                warn!(error = %e, "Deregistration failed");
            }
        }
        info!(id = %self.identity.node_id, "Node stopped");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.dispatcher.stop();
    }
}
