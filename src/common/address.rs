//! Address and destination types for network connections

use std::net::{IpAddr, SocketAddr};

/// Transport-layer network kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
}

impl Default for Network {
    fn default() -> Self {
        Network::Tcp
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IPv4 or IPv6 address
    Ip(IpAddr),
    /// Domain name
    Domain(String),
}

impl Address {
    pub fn domain(domain: impl Into<String>) -> Self {
        Address::Domain(domain.into())
    }

    pub fn ip(ip: IpAddr) -> Self {
        Address::Ip(ip)
    }

    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_))
    }

    pub fn is_ip(&self) -> bool {
        matches!(self, Address::Ip(_))
    }

    pub fn as_ip(&self) -> Option<IpAddr> {
        match self {
            Address::Ip(ip) => Some(*ip),
            Address::Domain(_) => None,
        }
    }

    pub fn as_domain(&self) -> Option<&str> {
        match self {
            Address::Domain(d) => Some(d),
            Address::Ip(_) => None,
        }
    }

    /// Parse either an IP literal or a domain name.
    pub fn parse(s: &str) -> Self {
        match s.parse::<IpAddr>() {
            Ok(ip) => Address::Ip(ip),
            Err(_) => Address::Domain(s.to_string()),
        }
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Ip(ip) => write!(f, "{}", ip),
            Address::Domain(d) => write!(f, "{}", d),
        }
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Address::Ip(ip)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Address::parse(s)
    }
}

/// The triple a connection is headed for: network kind, address, port.
/// Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    pub network: Network,
    pub address: Address,
    pub port: u16,
}

impl Destination {
    pub fn tcp(address: Address, port: u16) -> Self {
        Self {
            network: Network::Tcp,
            address,
            port,
        }
    }

    pub fn udp(address: Address, port: u16) -> Self {
        Self {
            network: Network::Udp,
            address,
            port,
        }
    }

    /// Resolve to a socket address without DNS; fails for domain targets.
    pub fn as_socket_addr(&self) -> Option<SocketAddr> {
        self.address.as_ip().map(|ip| SocketAddr::new(ip, self.port))
    }

    /// `host:port` form suitable for `tokio::net::lookup_host`.
    pub fn host_port(&self) -> String {
        match &self.address {
            Address::Ip(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            Address::Ip(IpAddr::V4(ip)) => format!("{}:{}", ip, self.port),
            Address::Domain(d) => format!("{}:{}", d, self.port),
        }
    }

    /// Same destination with the address swapped for a resolved IP.
    pub fn with_ip(&self, ip: IpAddr) -> Self {
        Self {
            network: self.network,
            address: Address::Ip(ip),
            port: self.port,
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.network, self.host_port())
    }
}

impl From<SocketAddr> for Destination {
    fn from(addr: SocketAddr) -> Self {
        Destination::tcp(Address::Ip(addr.ip()), addr.port())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_parse() {
        assert!(Address::parse("10.0.0.1").is_ip());
        assert!(Address::parse("::1").is_ip());
        assert!(Address::parse("example.com").is_domain());
    }

    #[test]
    fn test_destination_display() {
        let d = Destination::tcp(Address::parse("example.com"), 443);
        assert_eq!(d.to_string(), "tcp:example.com:443");

        let d = Destination::udp(Address::parse("::1"), 53);
        assert_eq!(d.to_string(), "udp:[::1]:53");
    }

    #[test]
    fn test_as_socket_addr() {
        let d = Destination::tcp(Address::parse("127.0.0.1"), 80);
        assert_eq!(d.as_socket_addr().unwrap().port(), 80);

        let d = Destination::tcp(Address::domain("example.com"), 80);
        assert!(d.as_socket_addr().is_none());
    }
}
