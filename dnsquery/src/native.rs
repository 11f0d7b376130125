//! Resolvers configured on the host.

use std::net::IpAddr;
use std::sync::Arc;

use crate::endpoint::Endpoint;

#[cfg(unix)]
const RESOLV_PATH: &str = "/etc/resolv.conf";
const DNS_PORT: u16 = 53;

/// UDP endpoints for every `nameserver` in the system resolver configuration.
///
/// Returns an empty list when the configuration is missing or unreadable.
pub fn native_endpoints() -> Vec<Arc<Endpoint>> {
    #[cfg(unix)]
    {
        match std::fs::read_to_string(RESOLV_PATH) {
            Ok(content) => parse_resolv_conf(&content),
            Err(e) => {
                tracing::debug!(path = RESOLV_PATH, "no native resolvers: {}", e);
                Vec::new()
            }
        }
    }
    #[cfg(not(unix))]
    {
        Vec::new()
    }
}

pub(crate) fn parse_resolv_conf(content: &str) -> Vec<Arc<Endpoint>> {
    content
        .lines()
        .map(|l| l.split(['#', ';']).next().unwrap_or_default())
        .filter_map(|l| {
            let mut parts = l.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("nameserver"), Some(addr)) => Some(addr),
                _ => None,
            }
        })
        // drop the zone of link-local addresses, e.g. `fe80::1%eth0`
        .map(|addr| addr.split('%').next().unwrap_or(addr))
        .filter_map(|addr| addr.parse::<IpAddr>().ok())
        .map(|ip| Arc::new(Endpoint::udp_addr(ip, DNS_PORT)))
        .collect()
}
