//! Dispatcher - the session relay engine's front half
//!
//! Owns the flow accept → route → outbound process. The inbound
//! connection is bridged onto a link; the routed handler runs the
//! canonical relay pattern on the other side.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::common::{
    copy, link_pair, CounterStream, SessionContext, Stream, StreamReader, StreamWriter,
};
use crate::common::copy::MultiBufferWriter;
use crate::error::{Error, Result};
use crate::outbound::Manager;
use crate::router::Router;

use super::metrics::{
    format_bytes, SessionCounter, BYTES_DOWNLINK, BYTES_UPLINK, SESSIONS_ACTIVE, SESSIONS_FAILED,
    SESSIONS_TOTAL,
};

/// Couples inbound links to routed outbound handlers.
pub struct Dispatcher {
    router: Arc<Router>,
    manager: Arc<Manager>,
}

impl Dispatcher {
    pub fn new(router: Arc<Router>, manager: Arc<Manager>) -> Self {
        Self { router, manager }
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Relay one session to completion.
    pub async fn dispatch(&self, ctx: SessionContext, stream: Stream) -> Result<()> {
        SESSIONS_TOTAL.inc();
        SESSIONS_ACTIVE.inc();
        let result = self.dispatch_inner(ctx, stream).await;
        SESSIONS_ACTIVE.dec();
        if result.is_err() {
            SESSIONS_FAILED.inc();
        }
        result
    }

    async fn dispatch_inner(&self, ctx: SessionContext, stream: Stream) -> Result<()> {
        let started = Instant::now();
        let session_id = ctx.id;
        let inbound_tag = ctx.metadata.inbound_tag.clone();
        let source = ctx.metadata.source;
        let destination = ctx.metadata.destination.clone();

        let tag = self.router.pick_route(&ctx.metadata, &self.manager).await?;
        let (handler, dialer) = self.manager.get(&tag)?;
        debug!(
            "[{}] #{} routing {:?} -> {:?} via [{}]",
            inbound_tag, session_id, source, destination, tag
        );

        let uplink = Arc::new(SessionCounter::new(&BYTES_UPLINK, &tag));
        let downlink = Arc::new(SessionCounter::new(&BYTES_DOWNLINK, &tag));
        let counted = CounterStream::new(
            stream,
            Some(uplink.clone() as Arc<dyn crate::common::Counter>),
            Some(downlink.clone() as Arc<dyn crate::common::Counter>),
        );
        let (read_half, write_half) = tokio::io::split(counted);

        let (inbound_link, outbound_link) = link_pair();
        let session_token = ctx.token.clone();

        // The outbound side: handler errors cancel the session so the
        // bridge below never wedges on a half-open client.
        let error_token = session_token.clone();
        let process = tokio::spawn(async move {
            let result = handler.process(&ctx, outbound_link, &dialer).await;
            if result.is_err() {
                error_token.cancel();
            }
            result
        });

        // Uplink bridge: client bytes into the link. Runs detached so
        // a client that never sends cannot hold up the teardown below;
        // the link close signals EOF to the outbound either way.
        let mut client_reader = StreamReader::new(read_half);
        let link_writer = inbound_link.writer.clone();
        let uplink_token = session_token.clone();
        let uplink_task = tokio::spawn(async move {
            let mut writer = link_writer.clone();
            let result = tokio::select! {
                r = copy(&mut client_reader, &mut writer, None) => r,
                _ = uplink_token.cancelled() => Err(Error::Cancelled),
            };
            link_writer.close();
            result
        });

        // Downlink bridge, inline: drains the link fully before the
        // session unwinds, so no response tail is lost. It terminates
        // once the handler drops its writer (or the client goes away).
        let mut link_reader = inbound_link.reader;
        let mut client_writer = StreamWriter::new(write_half);
        let downlink_result = copy(&mut link_reader, &mut client_writer, None).await;
        let _ = client_writer.close().await;

        // The handler finishes by EOF, error, or its idle watchdog.
        let outbound_result = process.await.unwrap_or(Err(Error::Cancelled));

        // Unblock an uplink still parked on a silent client.
        session_token.cancel();
        let uplink_result = uplink_task.await.unwrap_or(Err(Error::Cancelled));
        let bridge = downlink_result.and(uplink_result);

        info!(
            "[{}] #{} closed: {:?} -> {:?} via [{}] (up {} down {} in {:?})",
            inbound_tag,
            session_id,
            source,
            destination,
            tag,
            format_bytes(uplink.total()),
            format_bytes(downlink.total()),
            started.elapsed()
        );

        match outbound_result {
            Err(e) if !e.is_closed() => {
                warn!("[{}] #{} outbound [{}] failed: {}", inbound_tag, session_id, tag, e);
                Err(e)
            }
            _ => match bridge {
                // Peer-closed bridge errors are the normal end of a
                // relay, not failures.
                Err(e) if !e.is_closed() => Err(e),
                _ => Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, Destination, Metadata, Network};
    use crate::dns::DnsClient;
    use crate::outbound::freedom::{FreedomConfig, FreedomHandler};
    use crate::outbound::testing::test_dialer;
    use crate::router::{Rule, RuleTarget};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn echo_listener() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 128];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
        (addr, handle)
    }

    fn build_dispatcher() -> Dispatcher {
        let dns = Arc::new(DnsClient::new(Vec::new()));
        let mut manager = Manager::new();
        manager.register(
            Arc::new(FreedomHandler::new("direct", FreedomConfig::default(), dns)),
            test_dialer(),
        );
        let router = Router::new(vec![Rule {
            network: vec![Network::Tcp],
            target: Some(RuleTarget::Outbound("direct".to_string())),
            ..Default::default()
        }]);
        Dispatcher::new(Arc::new(router), Arc::new(manager))
    }

    #[tokio::test]
    async fn test_dispatch_relays_both_directions() {
        let (addr, server) = echo_listener();
        let dispatcher = build_dispatcher();

        let (client, proxied) = tokio::io::duplex(4096);
        let ctx = SessionContext::new(
            Metadata::new(Destination::tcp(Address::Ip(addr.ip()), addr.port()))
                .with_inbound_tag("test-in"),
        );

        let session = tokio::spawn(async move {
            dispatcher.dispatch(ctx, Box::new(proxied)).await
        });

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"round trip").await.unwrap();
        let mut buf = [0u8; 10];
        client_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"round trip");

        // Client hangs up; the whole session winds down.
        client_write.shutdown().await.unwrap();
        drop(client_write);
        drop(client_read);
        assert!(session.await.unwrap().is_ok());
        server.abort();
    }

    #[tokio::test]
    async fn test_dispatch_unknown_outbound_fails() {
        let dns = Arc::new(DnsClient::new(Vec::new()));
        let mut manager = Manager::new();
        manager.register(
            Arc::new(FreedomHandler::new("direct", FreedomConfig::default(), dns)),
            test_dialer(),
        );
        let router = Router::new(Vec::new()).with_default_tag("ghost");
        let dispatcher = Dispatcher::new(Arc::new(router), Arc::new(manager));

        let (_client, proxied) = tokio::io::duplex(64);
        let ctx = SessionContext::new(Metadata::new(Destination::tcp(
            Address::parse("127.0.0.1"),
            1,
        )));
        let err = dispatcher.dispatch(ctx, Box::new(proxied)).await.unwrap_err();
        assert!(matches!(err, Error::UnknownOutbound(_)));
    }
}
