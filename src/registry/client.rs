//! HTTP client for the registry agent API

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use url::Url;

use super::models::{AgentService, ServiceRegistration, TcpHealthCheck};
use super::PeerSource;
use crate::config::RegistrySettings;
use crate::error::{Error, Result};
use crate::types::{NodeIdentity, PeerRecord};

// ─────────────────────────────────────────────────────────────────
// Registry Client
// ─────────────────────────────────────────────────────────────────

/// Client for the registry agent: registration and peer discovery
pub struct RegistryClient {
    http: Client,
    base_url: Url,
    settings: RegistrySettings,

    /// Result of the last successful poll
    last_peers: RwLock<Vec<PeerRecord>>,
}

impl RegistryClient {
    pub fn new(settings: &RegistrySettings) -> Result<Self> {
        let mut base_url = Url::parse(&settings.url).map_err(|e| {
            Error::config_field_invalid("registry.url", format!("Invalid registry URL: {}", e))
        })?;
        // Url::join replaces the last segment unless the path ends in '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()?;

        debug!(url = %base_url, "Registry client created");

        Ok(Self {
            http,
            base_url,
            settings: settings.clone(),
            last_peers: RwLock::new(Vec::new()),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::Internal(format!("Invalid registry path '{}': {}", path, e)))
    }

    /// Registration body for this node advertised at `address`
    pub fn registration_for(&self, identity: &NodeIdentity, address: IpAddr) -> ServiceRegistration {
        let address = address.to_string();
        let check_target = if address.contains(':') {
            format!("[{}]:{}", address, identity.listen_port)
        } else {
            format!("{}:{}", address, identity.listen_port)
        };

        ServiceRegistration {
            name: identity.container_name.clone(),
            id: identity.node_id.clone(),
            port: identity.listen_port,
            tags: identity.tags.clone(),
            address,
            check: TcpHealthCheck {
                tcp: check_target,
                interval: self.settings.check_interval.clone(),
                timeout: self.settings.check_timeout.clone(),
                deregister_critical_service_after: self.settings.deregister_after.clone(),
            },
        }
    }

    /// Announce this node to the registry with a TCP health check
    pub async fn register(&self, identity: &NodeIdentity, address: IpAddr) -> Result<()> {
        let url = self.endpoint("v1/agent/service/register")?;
        let body = self.registration_for(identity, address);

        let response = self.http.put(url.clone()).json(&body).send().await?;
        check_status(&url, response).await?;

        info!(
            id = %body.id,
            name = %body.name,
            address = %body.address,
            port = body.port,
            tags = ?body.tags,
            "Registered with registry"
        );
        Ok(())
    }

    /// Remove a service registration
    pub async fn deregister(&self, service_id: &str) -> Result<()> {
        let url = self.endpoint(&format!("v1/agent/service/deregister/{}", service_id))?;
        let response = self.http.put(url.clone()).send().await?;
        check_status(&url, response).await?;

        info!(id = service_id, "Deregistered from registry");
        Ok(())
    }

    /// Fetch every service known to the agent
    pub async fn fetch_peers(&self) -> Result<Vec<PeerRecord>> {
        let url = self.endpoint("v1/agent/services")?;
        let response = self.http.get(url.clone()).send().await?;
        let services: HashMap<String, AgentService> = parse_json(&url, response).await?;

        let mut peers: Vec<PeerRecord> = services
            .into_iter()
            .map(|(key, svc)| svc.into_peer(&key))
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));

        debug!(count = peers.len(), "Fetched peers from registry");
        *self.last_peers.write() = peers.clone();
        Ok(peers)
    }

    /// Peers from the last successful poll
    pub fn last_known_peers(&self) -> Vec<PeerRecord> {
        self.last_peers.read().clone()
    }
}

#[async_trait]
impl PeerSource for RegistryClient {
    async fn poll_peers(&self) -> Result<Vec<PeerRecord>> {
        self.fetch_peers().await.map_err(|e| {
            warn!(error = %e, "Discovery poll failed");
            e
        })
    }
}

async fn check_status(url: &Url, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::RegistryRejected {
        url: url.to_string(),
        status: status.as_u16(),
        body,
    })
}

async fn parse_json<T: DeserializeOwned>(url: &Url, response: Response) -> Result<T> {
    let response = check_status(url, response).await?;
    Ok(response.json::<T>().await?)
}
