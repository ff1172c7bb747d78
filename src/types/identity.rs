//! Node identity and sender credentials

use std::fmt;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────
// Credentials
// ─────────────────────────────────────────────────────────────────

/// Sender tag carried in every outbound batch.
///
/// Identifies who produced a batch; it is never checked or trusted for
/// authentication.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Credentials {
    /// Container (node) name of the sender
    pub name: String,

    /// Role the sender registered under
    pub role: String,
}

impl Credentials {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
        }
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.name, self.role)
    }
}

// ─────────────────────────────────────────────────────────────────
// Node Identity
// ─────────────────────────────────────────────────────────────────

/// Identity of the local node, fixed once the listener is bound
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Registry service ID (also used to filter ourselves out of polls)
    pub node_id: String,

    /// Container / service name announced to the registry
    pub container_name: String,

    /// Role announced as the first tag
    pub role: String,

    /// Compute device announced as the second tag
    pub device: String,

    /// Full tag set: role, device, then any extra tags
    pub tags: Vec<String>,

    /// Interface the receiver is bound to
    pub listen_host: String,

    /// Port the receiver is actually bound to
    pub listen_port: u16,
}

impl NodeIdentity {
    pub fn new(
        node_id: impl Into<String>,
        container_name: impl Into<String>,
        role: impl Into<String>,
        device: impl Into<String>,
        extra_tags: &[String],
        listen_host: impl Into<String>,
        listen_port: u16,
    ) -> Self {
        let role = role.into();
        let device = device.into();

        let mut tags = vec![role.clone(), device.clone()];
        for tag in extra_tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }

        Self {
            node_id: node_id.into(),
            container_name: container_name.into(),
            role,
            device,
            tags,
            listen_host: listen_host.into(),
            listen_port,
        }
    }

    /// Credentials stamped on every batch this node sends
    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.container_name.clone(), self.role.clone())
    }
}

/// Default node ID: the host name, or a random `node-xxxxxxxx` when the
/// host name is unavailable
pub fn default_node_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.trim().is_empty())
        .unwrap_or_else(|| format!("node-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]))
}
