//! Session metadata and per-connection context
//!
//! Router ONLY depends on Metadata, never on streams or IO.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio_util::sync::CancellationToken;

use super::{Address, Destination, Network};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Metadata extracted at accept time.
/// This is the ONLY context the router can depend on.
#[derive(Debug, Clone)]
pub struct Metadata {
    /// Source address of the connection
    pub source: Option<SocketAddr>,
    /// Destination the client wants to reach
    pub destination: Option<Destination>,
    /// Network kind (TCP/UDP)
    pub network: Network,
    /// Inbound tag for routing decisions
    pub inbound_tag: String,
    /// Authenticated user, if the inbound produced one
    pub user: Option<String>,
    /// Protocol name reported by the inbound
    pub protocol: String,
}

impl Metadata {
    pub fn new(destination: Destination) -> Self {
        Self {
            source: None,
            network: destination.network,
            destination: Some(destination),
            inbound_tag: String::new(),
            user: None,
            protocol: String::new(),
        }
    }

    pub fn with_source(mut self, source: SocketAddr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_inbound_tag(mut self, tag: impl Into<String>) -> Self {
        self.inbound_tag = tag.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            source: None,
            destination: None,
            network: Network::Tcp,
            inbound_tag: String::new(),
            user: None,
            protocol: String::new(),
        }
    }
}

/// Per-session state created at accept time and destroyed when the
/// relay returns. Never shared across sessions.
#[derive(Debug)]
pub struct SessionContext {
    /// Stable session id, unique for the process lifetime
    pub id: u64,
    pub metadata: Metadata,
    /// When set, the copy phase runs detached from the inbound's
    /// cancellation; only inactivity terminates it.
    pub timeout_only: bool,
    /// Root cancellation for everything this session spawns
    pub token: CancellationToken,
}

impl SessionContext {
    pub fn new(metadata: Metadata) -> Self {
        Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            metadata,
            timeout_only: false,
            token: CancellationToken::new(),
        }
    }

    pub fn with_timeout_only(mut self, timeout_only: bool) -> Self {
        self.timeout_only = timeout_only;
        self
    }

    /// Target destination, or `missing-target` when the inbound never
    /// produced one.
    pub fn target(&self) -> Option<&Destination> {
        self.metadata.destination.as_ref()
    }

    pub fn target_addr(&self) -> Option<&Address> {
        self.metadata.destination.as_ref().map(|d| &d.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_ids_unique() {
        let a = SessionContext::new(Metadata::default());
        let b = SessionContext::new(Metadata::default());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_metadata_builder() {
        let m = Metadata::new(Destination::tcp(Address::domain("example.com"), 443))
            .with_inbound_tag("socks-in")
            .with_protocol("socks");
        assert_eq!(m.inbound_tag, "socks-in");
        assert_eq!(m.network, Network::Tcp);
        assert_eq!(m.destination.unwrap().port, 443);
    }
}
