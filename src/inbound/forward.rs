//! Forward inbound - fixed-destination acceptor
//!
//! No handshake: every accepted connection is a session to the
//! configured target. The smallest possible inbound, and the reference
//! for what an inbound owes the dispatcher.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::common::{Destination, Metadata, Stream};
use crate::error::Result;

use super::InboundHandler;

pub struct ForwardInbound {
    target: Destination,
}

impl ForwardInbound {
    pub fn new(target: Destination) -> Self {
        Self { target }
    }
}

#[async_trait]
impl InboundHandler for ForwardInbound {
    fn protocol(&self) -> &'static str {
        "forward"
    }

    async fn accept(&self, _stream: &mut Stream, source: Option<SocketAddr>) -> Result<Metadata> {
        let mut metadata = Metadata::new(self.target.clone()).with_protocol(self.protocol());
        metadata.source = source;
        Ok(metadata)
    }
}
