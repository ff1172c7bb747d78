//! Resolve the address this node advertises to the registry

use std::net::{IpAddr, Ipv4Addr};

use if_addrs::IfAddr;
use tracing::{debug, warn};

/// Pick the address to register under.
///
/// Tries, in order: DNS resolution of `service_name` (a service VIP behind
/// an overlay network), the first non-loopback IPv4 interface address, and
/// finally loopback.
pub async fn resolve_self_address(service_name: Option<&str>) -> IpAddr {
    if let Some(name) = service_name.map(str::trim).filter(|n| !n.is_empty()) {
        match tokio::net::lookup_host((name, 0)).await {
            Ok(addrs) => {
                let addrs: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
                if let Some(ip) = addrs
                    .iter()
                    .find(|ip| ip.is_ipv4())
                    .or_else(|| addrs.first())
                {
                    debug!(service = name, address = %ip, "Resolved service address");
                    return *ip;
                }
                warn!(service = name, "Service name resolved to no addresses");
            }
            Err(e) => {
                warn!(service = name, error = %e, "Failed to resolve service name, using interface address");
            }
        }
    }

    match primary_interface_address() {
        Some(ip) => ip,
        None => {
            warn!("No non-loopback interface address found, advertising 127.0.0.1");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        }
    }
}

/// First non-loopback IPv4 interface address
pub fn primary_interface_address() -> Option<IpAddr> {
    if_addrs::get_if_addrs()
        .ok()?
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .find_map(|iface| match iface.addr {
            IfAddr::V4(v4) => Some(IpAddr::V4(v4.ip)),
            _ => None,
        })
}
