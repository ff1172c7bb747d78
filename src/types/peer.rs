//! Peers as reported by the discovery registry

use std::fmt;

/// One service entry from the registry, refreshed wholesale on every poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Registry service ID
    pub id: String,

    /// Host name or IP to connect to
    pub address: String,

    /// TCP port of the peer's receiver
    pub port: u16,

    /// Tags the peer registered with (role, device, ...)
    pub tags: Vec<String>,

    /// Declared service name
    pub service_name: String,
}

impl PeerRecord {
    /// Whether this peer plays one of the given roles.
    ///
    /// A role matches when it appears in the peer's tags or equals its
    /// service name. Roles are trimmed before comparison.
    pub fn matches_roles<S: AsRef<str>>(&self, roles: &[S]) -> bool {
        roles.iter().map(|r| r.as_ref().trim()).any(|role| {
            !role.is_empty()
                && (self.tags.iter().any(|t| t == role) || self.service_name.trim() == role)
        })
    }

    /// `address:port` for logging and errors
    pub fn endpoint(&self) -> String {
        if self.address.contains(':') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}", self.id, self.service_name, self.endpoint())
    }
}
