//! Nexum - a general-purpose proxy relay platform
//!
//! # Architecture
//!
//! ```text
//! Transport listener (tcp/kcp/quic/websocket/http/httpupgrade/unix)
//! → Inbound (handshake → session metadata)
//! → Router (rules, balancers, observatory)
//! → Outbound handler (dial, relay, watchdog)
//! → Transport dialer
//! ```
//!
//! ## Core principles
//!
//! - The relay engine only sees links and connections, never protocol
//!   wire formats
//! - The router only depends on session metadata, no IO
//! - Services (DNS cache, observatory, transport registry) are owned
//!   by the runtime, not hidden in globals
//!
//! ## Module structure
//!
//! ```text
//! src/
//! ├── common/       # Addresses, buffers, links, timer, task composer
//! ├── transport/    # Named dialers and listeners
//! ├── dns/          # Caching resolver over pluggable name servers
//! ├── observatory/  # Outbound health probes
//! ├── inbound/      # Accept-side handshakes
//! ├── outbound/     # Handler registry, freedom, blackhole
//! ├── router/       # Rules and balancers
//! └── app/          # Dispatcher, runtime, metrics
//! ```

// Core types
pub mod common;
pub mod error;

// Layers
pub mod app;
pub mod dns;
pub mod inbound;
pub mod observatory;
pub mod outbound;
pub mod router;
pub mod transport;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{Address, Destination, Link, Metadata, Network, SessionContext};
pub use config::Config;
pub use error::{Error, Result};

pub use app::{Dispatcher, Runtime};
pub use dns::DnsClient;
pub use observatory::Observatory;
pub use outbound::{Manager, OutboundHandler, ProtocolRegistry};
pub use router::Router;
pub use transport::TransportRegistry;
