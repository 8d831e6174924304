//! Runtime - configuration-driven wiring
//!
//! Builds the services (transport registry, DNS, observatory), the
//! outbound manager, the router, and the inbound listeners from
//! configuration, then supervises them until shutdown. Services are
//! owned here, not by hidden globals; tests construct a fresh runtime.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::common::{Address, Destination, SessionContext};
use crate::config::{BalancerSettings, Config, InboundSettings, RuleSettings, TransportSettings};
use crate::dns::DnsClient;
use crate::error::{Error, Result};
use crate::inbound::{forward::ForwardInbound, socks::SocksInbound, Inbound};
use crate::observatory::{Observatory, ObservatoryConfig};
use crate::outbound::{HandlerFeatures, Manager, ProtocolRegistry};
use crate::router::{
    Balancer, BalancingStrategy, DomainStrategy, LeastLoadStrategy, RandomStrategy,
    RoundRobinStrategy, Router, Rule, RuleTarget,
};
use crate::transport::{
    BoundDialer, ConnHandler, Connection, Listener, StreamSettings, TransportRegistry,
};

use super::dispatcher::Dispatcher;
use super::metrics;

/// The root instance owning every service.
pub struct Runtime {
    inbounds: Vec<Arc<Inbound>>,
    dispatcher: Arc<Dispatcher>,
    registry: Arc<TransportRegistry>,
    observatory: Option<Arc<Observatory>>,
    shutdown: CancellationToken,
}

impl Runtime {
    pub fn from_config(config: Config) -> Result<Self> {
        metrics::init_metrics();

        let registry = Arc::new(TransportRegistry::with_defaults());
        let dns = Arc::new(DnsClient::from_urls(&config.dns.servers)?);

        let observatory = config.observatory.as_ref().map(|settings| {
            Arc::new(Observatory::new(ObservatoryConfig {
                probe_host: settings.probe_host.clone(),
                probe_port: settings.probe_port,
                interval: std::time::Duration::from_secs(settings.interval_secs),
                probe_timeout: std::time::Duration::from_secs(settings.timeout_secs),
                failure_threshold: settings.failure_threshold,
            }))
        });

        // Outbounds
        let protocols = ProtocolRegistry::with_defaults();
        let features = HandlerFeatures { dns: dns.clone() };
        let mut manager = Manager::new();
        for outbound in &config.outbounds {
            let handler = protocols.create(outbound, &features)?;
            let settings = Arc::new(stream_settings(outbound.transport.as_ref()));
            let dialer = BoundDialer::new(registry.dialer(settings.transport_name())?, settings);
            manager.register(handler, dialer);
        }
        if let Some(default_tag) = &config.routing.default_outbound {
            manager.set_default_tag(default_tag.clone());
        }
        let manager = Arc::new(manager);

        // Router
        let rules = config
            .routing
            .rules
            .iter()
            .map(rule_from_settings)
            .collect::<Result<Vec<_>>>()?;
        let mut router = Router::new(rules);
        if let Some(default_tag) = &config.routing.default_outbound {
            router = router.with_default_tag(default_tag.clone());
        }
        match config.routing.domain_strategy.as_deref() {
            None | Some("AsIs") | Some("asis") => {}
            Some("IpIfNonMatch") | Some("ipifnonmatch") => {
                router = router.with_domain_strategy(DomainStrategy::IpIfNonMatch, dns.clone());
            }
            Some(other) => {
                return Err(Error::Config(format!("unknown domain strategy: {}", other)));
            }
        }
        for balancer in &config.routing.balancers {
            router = router.with_balancer(build_balancer(balancer, observatory.clone())?);
        }
        let router = Arc::new(router);

        let dispatcher = Arc::new(Dispatcher::new(router, manager));

        // Inbounds
        let mut inbounds = Vec::new();
        for inbound in &config.inbounds {
            inbounds.push(Arc::new(build_inbound(inbound)?));
        }

        Ok(Self {
            inbounds,
            dispatcher,
            registry,
            observatory,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until ctrl-c or the shutdown token fires.
    pub async fn run(&self) -> Result<()> {
        if let Some(observatory) = &self.observatory {
            observatory
                .clone()
                .start(self.dispatcher.manager().clone(), self.shutdown.clone());
        }

        let mut listeners: Vec<Box<dyn Listener>> = Vec::new();
        for inbound in &self.inbounds {
            let listener = self.start_inbound(inbound.clone()).await?;
            info!(
                "[{}] listening on {} ({} over {})",
                inbound.tag,
                inbound.listen,
                inbound.handler.protocol(),
                inbound.settings.transport_name(),
            );
            listeners.push(listener);
        }
        info!("runtime started with {} inbounds", self.inbounds.len());

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupt received, shutting down"),
            _ = self.shutdown.cancelled() => info!("shutdown requested"),
        }

        self.shutdown.cancel();
        for listener in &listeners {
            listener.close();
        }
        Ok(())
    }

    async fn start_inbound(&self, inbound: Arc<Inbound>) -> Result<Box<dyn Listener>> {
        let builder = self.registry.listener(inbound.settings.transport_name())?;
        let dispatcher = self.dispatcher.clone();

        let callback_inbound = inbound.clone();
        let handler: ConnHandler = Arc::new(move |conn: Connection| {
            let inbound = callback_inbound.clone();
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(inbound, dispatcher, conn).await {
                    if !e.is_closed() {
                        warn!("session error: {}", e);
                    }
                }
            });
        });

        builder
            .listen(inbound.listen, &inbound.settings, handler)
            .await
    }
}

async fn serve_connection(
    inbound: Arc<Inbound>,
    dispatcher: Arc<Dispatcher>,
    conn: Connection,
) -> Result<()> {
    let mut stream_conn = match conn {
        Connection::Stream(c) => c,
        Connection::Packet(_) => {
            error!("[{}] packet connections need a packet-aware inbound", inbound.tag);
            return Ok(());
        }
    };

    let mut metadata = inbound
        .handler
        .accept(&mut stream_conn.stream, stream_conn.remote_addr)
        .await?;
    metadata.inbound_tag = inbound.tag.clone();

    let ctx = SessionContext::new(metadata).with_timeout_only(inbound.timeout_only);
    dispatcher.dispatch(ctx, stream_conn.stream).await
}

fn stream_settings(transport: Option<&TransportSettings>) -> StreamSettings {
    match transport {
        Some(t) => StreamSettings {
            transport: t.transport_type.clone(),
            path: t.path.clone().unwrap_or_default(),
            host: t.host.clone(),
            headers: t.headers.clone().unwrap_or_default(),
            allow_insecure: t.allow_insecure.unwrap_or(false),
            certificate_file: t.certificate_file.clone(),
            key_file: t.key_file.clone(),
            unix_path: t.unix_path.clone(),
        },
        None => StreamSettings::default(),
    }
}

fn build_balancer(
    settings: &BalancerSettings,
    observatory: Option<Arc<Observatory>>,
) -> Result<Balancer> {
    let strategy: Box<dyn BalancingStrategy> = match settings.strategy.as_str() {
        "roundRobin" | "roundrobin" | "" => Box::new(RoundRobinStrategy::new(observatory)),
        "random" => Box::new(RandomStrategy::new(observatory)),
        "leastLoad" | "leastload" => match observatory {
            Some(observatory) => Box::new(LeastLoadStrategy::new(observatory)),
            None => {
                return Err(Error::Config(
                    "leastLoad strategy requires the observatory".into(),
                ));
            }
        },
        other => return Err(Error::Config(format!("unknown balancer strategy: {}", other))),
    };
    Ok(Balancer::new(
        settings.tag.clone(),
        settings.selector.clone(),
        strategy,
        settings.fallback_tag.clone(),
    ))
}

fn rule_from_settings(settings: &RuleSettings) -> Result<Rule> {
    let target = match (&settings.outbound_tag, &settings.balancer_tag) {
        (Some(outbound), None) => Some(RuleTarget::Outbound(outbound.clone())),
        (None, Some(balancer)) => Some(RuleTarget::Balancer(balancer.clone())),
        (None, None) => None,
        (Some(_), Some(_)) => {
            return Err(Error::Config(
                "rule cannot target both an outbound and a balancer".into(),
            ));
        }
    };
    let network = settings
        .network
        .iter()
        .map(|n| match n.as_str() {
            "tcp" => Ok(crate::common::Network::Tcp),
            "udp" => Ok(crate::common::Network::Udp),
            other => Err(Error::Config(format!("unknown network: {}", other))),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Rule {
        inbound_tag: settings.inbound_tag.clone(),
        protocol: settings.protocol.clone(),
        user: settings.user.clone(),
        network,
        source_ip: settings.source_ip.clone(),
        source_port: settings.source_port.clone(),
        domain: settings.domain.clone(),
        ip: settings.ip.clone(),
        port: settings.port.clone(),
        target,
    })
}

fn build_inbound(settings: &InboundSettings) -> Result<Inbound> {
    let listen: SocketAddr = settings
        .listen
        .parse()
        .map_err(|_| Error::Config(format!("invalid listen address: {}", settings.listen)))?;

    let handler: Arc<dyn crate::inbound::InboundHandler> = match settings.protocol.as_str() {
        "forward" => {
            let target = settings.target.as_ref().ok_or_else(|| {
                Error::Config(format!("inbound [{}] needs a target", settings.tag))
            })?;
            Arc::new(ForwardInbound::new(parse_destination(target)?))
        }
        "socks" | "socks5" => Arc::new(SocksInbound::new()),
        other => return Err(Error::Config(format!("unknown inbound protocol: {}", other))),
    };

    Ok(Inbound {
        tag: settings.tag.clone(),
        listen,
        settings: stream_settings(settings.transport.as_ref()),
        handler,
        timeout_only: settings.timeout_only,
    })
}

/// Parse "host:port" into a TCP destination.
fn parse_destination(s: &str) -> Result<Destination> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(Destination::from(addr));
    }
    if let Some((host, port)) = s.rsplit_once(':') {
        let port: u16 = port
            .parse()
            .map_err(|_| Error::Config(format!("invalid port in {}", s)))?;
        return Ok(Destination::tcp(Address::parse(host), port));
    }
    Err(Error::Config(format!("invalid destination: {}", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_parse_destination() {
        let d = parse_destination("example.com:443").unwrap();
        assert_eq!(d.port, 443);
        assert!(d.address.is_domain());

        let d = parse_destination("127.0.0.1:80").unwrap();
        assert!(d.address.is_ip());
        assert!(parse_destination("no-port").is_err());
    }

    #[test]
    fn test_runtime_from_default_config() {
        let runtime = Runtime::from_config(Config::default_client()).unwrap();
        assert_eq!(runtime.inbounds.len(), 2);
    }

    #[test]
    fn test_rule_target_conflict_rejected() {
        let settings = RuleSettings {
            outbound_tag: Some("a".into()),
            balancer_tag: Some("b".into()),
            ..Default::default()
        };
        assert!(rule_from_settings(&settings).is_err());
    }

    #[tokio::test]
    async fn test_forward_inbound_end_to_end() {
        // Echo target.
        let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
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

        let mut config = Config::default_server();
        config.inbounds[0].listen = "127.0.0.1:0".to_string();
        config.inbounds[0].target = Some(echo_addr.to_string());

        let runtime = Runtime::from_config(config).unwrap();
        let inbound = runtime.inbounds[0].clone();
        let listener = runtime.start_inbound(inbound).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client.write_all(b"through the forward").await.unwrap();
        let mut buf = vec![0u8; 19];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"through the forward");

        listener.close();
    }

    #[tokio::test]
    async fn test_socks_inbound_end_to_end() {
        let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_addr = echo.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = echo.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
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

        let mut config = Config::default_client();
        config.inbounds[0].listen = "127.0.0.1:0".to_string();
        let runtime = Runtime::from_config(config).unwrap();
        let inbound = runtime.inbounds[0].clone();
        let listener = runtime.start_inbound(inbound).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        // SOCKS5 handshake: no-auth, CONNECT to the echo server.
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        let ip = match echo_addr.ip() {
            std::net::IpAddr::V4(ip) => ip.octets(),
            _ => unreachable!(),
        };
        let mut connect = vec![0x05, 0x01, 0x00, 0x01];
        connect.extend_from_slice(&ip);
        connect.extend_from_slice(&echo_addr.port().to_be_bytes());
        client.write_all(&connect).await.unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x00);

        client.write_all(b"proxied").await.unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"proxied");

        listener.close();
    }
}
