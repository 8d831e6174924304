//! Blackhole outbound - swallows everything

use async_trait::async_trait;

use crate::common::{Link, MultiBufferReader, SessionContext};
use crate::error::Result;
use crate::transport::BoundDialer;

use super::OutboundHandler;

/// Discards the request and closes the response immediately. Routing
/// rules use it to drop unwanted traffic.
pub struct BlackholeHandler {
    tag: String,
}

impl BlackholeHandler {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }
}

#[async_trait]
impl OutboundHandler for BlackholeHandler {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn process(&self, _ctx: &SessionContext, link: Link, _dialer: &BoundDialer) -> Result<()> {
        link.writer.close();
        // Drain whatever the inbound sends so its writes never wedge,
        // releasing buffers as they arrive.
        let mut reader = link.reader;
        while let Some(mut mb) = reader.read_multi_buffer().await? {
            mb.release();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{link_pair, Metadata, MultiBuffer, MultiBufferWriter};
    use crate::outbound::testing::test_dialer;

    #[tokio::test]
    async fn test_blackhole_closes_and_drains() {
        let handler = BlackholeHandler::new("block");
        let ctx = SessionContext::new(Metadata::default());
        let (mut inbound, outbound) = link_pair();
        let dialer = test_dialer();
        let session = tokio::spawn(async move { handler.process(&ctx, outbound, &dialer).await });

        // Response side closes without data.
        assert!(inbound.reader.read_multi_buffer().await.unwrap().is_none());
        // Writes are swallowed, not blocked.
        inbound
            .writer
            .write_multi_buffer(MultiBuffer::from_slice(b"into the void"))
            .await
            .unwrap();
        inbound.writer.close();
        assert!(session.await.unwrap().is_ok());
    }
}
