//! Host identity recorded on every process document.

use std::net::{IpAddr, Ipv4Addr, UdpSocket};

use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIdentity {
    pub host_id: String,
    pub host_address: String,
}

impl HostIdentity {
    pub fn new(host_id: impl Into<String>, host_address: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            host_address: host_address.into(),
        }
    }

    /// Identify this machine: its hostname and the local address of the
    /// default outbound route.
    pub fn detect() -> Self {
        let host_id = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let host_address = outbound_address()
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .to_string();
        debug!(%host_id, %host_address, "host identity detected");
        Self {
            host_id,
            host_address,
        }
    }
}

/// Connecting a UDP socket selects a route without sending anything.
fn outbound_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
