//! Registry agent API bodies (Consul field naming)

use serde::{Deserialize, Serialize};

use crate::types::PeerRecord;

/// Body of `PUT /v1/agent/service/register`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    /// Service name
    #[serde(rename = "Name")]
    pub name: String,

    /// Service ID, unique per agent
    #[serde(rename = "ID")]
    pub id: String,

    #[serde(rename = "Port")]
    pub port: u16,

    #[serde(rename = "Tags")]
    pub tags: Vec<String>,

    /// Address peers should connect to
    #[serde(rename = "Address")]
    pub address: String,

    #[serde(rename = "Check")]
    pub check: TcpHealthCheck,
}

/// TCP health check attached to a registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpHealthCheck {
    /// `host:port` the agent dials
    #[serde(rename = "TCP")]
    pub tcp: String,

    #[serde(rename = "Interval")]
    pub interval: String,

    #[serde(rename = "Timeout")]
    pub timeout: String,

    #[serde(rename = "DeregisterCriticalServiceAfter")]
    pub deregister_critical_service_after: String,
}

/// One entry of `GET /v1/agent/services`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentService {
    #[serde(rename = "ID", default)]
    pub id: String,

    #[serde(rename = "Service", default)]
    pub service: String,

    #[serde(rename = "Tags", default)]
    pub tags: Option<Vec<String>>,

    #[serde(rename = "Port", default)]
    pub port: u16,

    #[serde(rename = "Address", default)]
    pub address: String,
}

impl AgentService {
    /// Convert into a peer record. `key` is the entry's key in the services
    /// map, used when the entry carries no ID. Services registered without
    /// an address are reachable through the agent's own host.
    pub fn into_peer(self, key: &str) -> PeerRecord {
        PeerRecord {
            id: if self.id.is_empty() { key.to_string() } else { self.id },
            address: if self.address.is_empty() {
                "127.0.0.1".to_string()
            } else {
                self.address
            },
            port: self.port,
            tags: self.tags.unwrap_or_default(),
            service_name: self.service,
        }
    }
}
