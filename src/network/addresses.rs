//! Local address enumeration for service publication

use std::net::Ipv4Addr;

/// Source of this host's advertisable addresses
pub trait AddressSource: Send {
    /// Currently routable, non-loopback, non-link-local IPv4 addresses
    fn routable_ipv4(&self) -> Vec<Ipv4Addr>;
}

/// Enumerates the host's network interfaces
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAddresses;

impl AddressSource for SystemAddresses {
    fn routable_ipv4(&self) -> Vec<Ipv4Addr> {
        let interfaces = match if_addrs::get_if_addrs() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                tracing::warn!("Failed to enumerate network interfaces: {}", e);
                return Vec::new();
            }
        };

        let mut addresses: Vec<Ipv4Addr> = interfaces
            .into_iter()
            .filter_map(|iface| match iface.ip() {
                std::net::IpAddr::V4(ip) => Some(ip),
                std::net::IpAddr::V6(_) => None,
            })
            .filter(|ip| is_advertisable(*ip))
            .collect();
        addresses.dedup();
        addresses
    }
}

/// Fixed address list, for tests and manual configuration
#[derive(Debug, Default, Clone)]
pub struct StaticAddresses(pub Vec<Ipv4Addr>);

impl AddressSource for StaticAddresses {
    fn routable_ipv4(&self) -> Vec<Ipv4Addr> {
        self.0.iter().copied().filter(|ip| is_advertisable(*ip)).collect()
    }
}

/// Loopback, unspecified and APIPA (169.254.0.0/16) addresses are never advertised
pub fn is_advertisable(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_link_local() && !ip.is_unspecified()
}

/// Order-insensitive comparison of two address sets
pub fn same_address_set(a: &[Ipv4Addr], b: &[Ipv4Addr]) -> bool {
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort();
    b.sort();
    a.dedup();
    b.dedup();
    a == b
}
