//! Inbound layer
//!
//! Inbounds own the accepted connection up to the point where it is
//! wrapped into a link: they decode whatever handshake the client
//! speaks and emit routing metadata. Everything after that belongs to
//! the dispatcher.

pub mod forward;
pub mod socks;

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::common::{Metadata, Stream};
use crate::error::Result;
use crate::transport::StreamSettings;

/// Decodes an accepted stream into routing metadata. The stream stays
/// usable for the relay afterwards.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    fn protocol(&self) -> &'static str;

    async fn accept(&self, stream: &mut Stream, source: Option<SocketAddr>) -> Result<Metadata>;
}

/// One configured inbound: where to listen, which wire transport, and
/// the protocol decoding the handshake.
pub struct Inbound {
    pub tag: String,
    pub listen: SocketAddr,
    pub settings: StreamSettings,
    pub handler: std::sync::Arc<dyn InboundHandler>,
    /// Sessions from this inbound are torn down by inactivity only,
    /// never by inbound-side cancellation.
    pub timeout_only: bool,
}
