//! Freedom outbound
//!
//! The canonical relay pattern every outbound follows: validate the
//! target, dial with backoff, couple the link to the connection with
//! an inactivity watchdog, and run both copy directions to completion.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::{
    copy, Address, Buffer, Destination, Link, MultiBuffer, MultiBufferReader, MultiBufferWriter,
    Network, PacketConn, SequentialWriter, SessionContext, StreamReader, StreamWriter,
};
use crate::dns::{DnsClient, IpOption};
use crate::error::{Error, Result};
use crate::transport::{BoundDialer, Connection};
use crate::{common, outbound::fragment::FragmentConfig, outbound::fragment::FragmentWriter};

use super::OutboundHandler;

const DIAL_ATTEMPTS: u32 = 5;
const DIAL_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Whether and how to substitute resolved IPs for domain targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainStrategy {
    #[default]
    AsIs,
    UseIp,
    UseIp4,
    UseIp6,
}

impl DomainStrategy {
    fn use_ip(&self) -> bool {
        !matches!(self, DomainStrategy::AsIs)
    }

    fn ip_option(&self) -> IpOption {
        match self {
            DomainStrategy::UseIp4 => IpOption::ipv4_only(),
            DomainStrategy::UseIp6 => IpOption::ipv6_only(),
            _ => IpOption::both(),
        }
    }
}

/// Watchdog durations for the three relay phases.
#[derive(Debug, Clone, Copy)]
pub struct RelayTimeouts {
    /// Both directions open
    pub connection_idle: Duration,
    /// Request done, response still flowing
    pub downlink_only: Duration,
    /// Response done, request still flowing
    pub uplink_only: Duration,
}

impl Default for RelayTimeouts {
    fn default() -> Self {
        Self {
            connection_idle: Duration::from_secs(300),
            downlink_only: Duration::from_secs(5),
            uplink_only: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct FreedomConfig {
    pub domain_strategy: DomainStrategy,
    /// Replace the target address and/or port before dialing
    pub override_address: Option<Address>,
    pub override_port: Option<u16>,
    pub fragment: Option<FragmentConfig>,
    pub timeouts: RelayTimeouts,
}

impl FreedomConfig {
    /// Build from the configuration file representation.
    pub fn from_settings(s: &crate::config::OutboundSettings) -> Result<Self> {
        let domain_strategy = match s.domain_strategy.as_deref() {
            None | Some("AsIs") | Some("asis") => DomainStrategy::AsIs,
            Some("UseIP") | Some("useip") => DomainStrategy::UseIp,
            Some("UseIPv4") | Some("useip4") => DomainStrategy::UseIp4,
            Some("UseIPv6") | Some("useip6") => DomainStrategy::UseIp6,
            Some(other) => {
                return Err(Error::Config(format!("unknown domain strategy: {}", other)));
            }
        };

        let mut timeouts = RelayTimeouts::default();
        if let Some(idle) = s.connection_idle_secs {
            timeouts.connection_idle = Duration::from_secs(idle);
        }
        if let Some(downlink) = s.downlink_only_secs {
            timeouts.downlink_only = Duration::from_secs(downlink);
        }
        if let Some(uplink) = s.uplink_only_secs {
            timeouts.uplink_only = Duration::from_secs(uplink);
        }

        Ok(FreedomConfig {
            domain_strategy,
            override_address: s.override_address.as_deref().map(Address::parse),
            override_port: s.override_port,
            fragment: s.fragment.as_ref().map(|f| FragmentConfig {
                start_packet: f.start_packet,
                end_packet: f.end_packet,
                min_length: f.min_length,
                max_length: f.max_length,
                min_interval_ms: f.min_interval_ms,
                max_interval_ms: f.max_interval_ms,
            }),
            timeouts,
        })
    }
}

/// Direct relay to the session's target destination.
pub struct FreedomHandler {
    tag: String,
    config: FreedomConfig,
    dns: Arc<DnsClient>,
}

impl FreedomHandler {
    pub fn new(tag: impl Into<String>, config: FreedomConfig, dns: Arc<DnsClient>) -> Self {
        Self {
            tag: tag.into(),
            config,
            dns,
        }
    }

    /// Resolve a domain and pick one answer uniformly at random.
    async fn resolve_ip(&self, domain: &str) -> Option<std::net::IpAddr> {
        let option = self.config.domain_strategy.ip_option();
        match self.dns.lookup_ip(domain, option).await {
            Ok(ips) if !ips.is_empty() => {
                let i = rand::thread_rng().gen_range(0..ips.len());
                Some(ips[i])
            }
            Ok(_) => None,
            Err(e) => {
                debug!("failed to resolve {}: {}", domain, e);
                None
            }
        }
    }

    /// Exponential-backoff dial: 5 attempts, 100 ms base, doubling.
    /// DNS substitution happens per attempt so a flapping answer gets
    /// re-rolled.
    async fn dial_with_retry(
        &self,
        destination: &Destination,
        dialer: &BoundDialer,
    ) -> Result<Connection> {
        let mut last_err: Option<Error> = None;
        for attempt in 0..DIAL_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(DIAL_BACKOFF_BASE * 2u32.pow(attempt - 1)).await;
            }

            let mut dial_dest = destination.clone();
            if self.config.domain_strategy.use_ip() {
                if let Address::Domain(domain) = &dial_dest.address {
                    if let Some(ip) = self.resolve_ip(domain).await {
                        dial_dest = dial_dest.with_ip(ip);
                        debug!("[{}] dialing to {}", self.tag, dial_dest);
                    }
                }
            }

            match dialer.dial(&dial_dest).await {
                Ok(conn) => return Ok(conn),
                Err(e) => last_err = Some(e),
            }
        }
        Err(Error::DialFailed(
            destination.clone(),
            Box::new(last_err.unwrap_or(Error::MissingTarget)),
        ))
    }
}

#[async_trait]
impl OutboundHandler for FreedomHandler {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn process(&self, ctx: &SessionContext, link: Link, dialer: &BoundDialer) -> Result<()> {
        let target = ctx.target().cloned().ok_or(Error::MissingTarget)?;

        let mut destination = target;
        let mut udp_override_addr = None;
        let mut udp_override_port = None;
        if let Some(addr) = &self.config.override_address {
            destination.address = addr.clone();
            udp_override_addr = Some(addr.clone());
        }
        if let Some(port) = self.config.override_port {
            destination.port = port;
            udp_override_port = Some(port);
        }

        let conn = self.dial_with_retry(&destination, dialer).await?;
        info!(
            "[{}] connection opened to {}, local endpoint {:?}, remote endpoint {:?}",
            self.tag,
            destination,
            conn.local_addr(),
            conn.remote_addr()
        );
        let conn = conn.with_counters(
            Some(Arc::new(
                crate::app::metrics::OUTBOUND_BYTES_RECEIVED.with_label_values(&[&self.tag]),
            )),
            Some(Arc::new(
                crate::app::metrics::OUTBOUND_BYTES_SENT.with_label_values(&[&self.tag]),
            )),
        );

        // A timeout-only session detaches the copy phase from the
        // inbound's cancellation; only inactivity ends it.
        let copy_token = if ctx.timeout_only {
            CancellationToken::new()
        } else {
            ctx.token.child_token()
        };

        let timeout_token = copy_token.clone();
        let timer = common::cancel_after_inactivity(
            copy_token.clone(),
            move || timeout_token.cancel(),
            self.config.timeouts.connection_idle,
        );

        let (mut request_writer, mut response_reader) = match conn {
            Connection::Stream(stream_conn) => {
                let (read_half, write_half) = tokio::io::split(stream_conn.stream);
                let writer: Box<dyn MultiBufferWriter> = match (&destination.network, &self.config.fragment) {
                    (Network::Tcp, Some(fragment)) => {
                        debug!("[{}] fragmenting request writes", self.tag);
                        Box::new(FragmentWriter::new(write_half, fragment.clone()))
                    }
                    (Network::Tcp, None) => Box::new(StreamWriter::new(write_half)),
                    // UDP destination carried over a stream transport:
                    // datagram writes must not interleave.
                    (Network::Udp, _) => Box::new(SequentialWriter::new(write_half)),
                };
                let reader: Box<dyn MultiBufferReader> = Box::new(StreamReader::new(read_half));
                (writer, reader)
            }
            Connection::Packet(packet_conn) => {
                let writer: Box<dyn MultiBufferWriter> = Box::new(PacketWriter {
                    socket: packet_conn.socket.clone(),
                    default_target: packet_conn.remote_addr,
                    override_address: udp_override_addr,
                    override_port: udp_override_port,
                    resolver: self
                        .config
                        .domain_strategy
                        .use_ip()
                        .then(|| (self.dns.clone(), self.config.domain_strategy.ip_option())),
                });
                let reader: Box<dyn MultiBufferReader> = Box::new(PacketReader {
                    socket: packet_conn.socket,
                });
                (writer, reader)
            }
        };

        let mut input = link.reader;
        let output = link.writer;

        let request_timer = timer.clone();
        let downlink_only = self.config.timeouts.downlink_only;
        let request_done = async move {
            let tick_timer = request_timer.clone();
            let tick = move || tick_timer.update();
            copy(&mut input, &mut *request_writer, Some(&tick)).await?;
            // Half-close towards the target so it sees our EOF.
            let _ = request_writer.close().await;
            request_timer.set_timeout(downlink_only);
            Ok(())
        };

        let response_timer = timer.clone();
        let uplink_only = self.config.timeouts.uplink_only;
        let mut response_output = output.clone();
        let response_done = async move {
            let tick_timer = response_timer.clone();
            let tick = move || tick_timer.update();
            copy(&mut *response_reader, &mut response_output, Some(&tick)).await?;
            response_timer.set_timeout(uplink_only);
            Ok(())
        };

        let result = common::task::run(
            &copy_token,
            request_done,
            common::task::on_success(response_done, common::task::close(output.clone())),
        )
        .await;

        // Stop the watchdog and drop the connection halves.
        copy_token.cancel();
        output.close();

        match result {
            Ok(()) => Ok(()),
            // The idle watchdog ending the session is a normal close.
            Err(_) if timer.fired() => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Reader producing per-datagram buffers with their UDP source
/// attached.
struct PacketReader {
    socket: Arc<dyn PacketConn>,
}

#[async_trait]
impl MultiBufferReader for PacketReader {
    async fn read_multi_buffer(&mut self) -> Result<Option<MultiBuffer>> {
        let mut buffer = Buffer::new();
        let (n, from) = self.socket.recv_from(buffer.unfilled()).await?;
        buffer.advance_end(n);
        buffer.udp = Some(Destination::udp(Address::Ip(from.ip()), from.port()));
        Ok(Some(MultiBuffer::one(buffer)))
    }
}

/// Writer fanning out datagrams addressed per buffer, applying the
/// configured override and per-datagram resolution.
struct PacketWriter {
    socket: Arc<dyn PacketConn>,
    default_target: Option<SocketAddr>,
    override_address: Option<Address>,
    override_port: Option<u16>,
    resolver: Option<(Arc<DnsClient>, IpOption)>,
}

impl PacketWriter {
    async fn target_for(&self, buffer: &Buffer) -> Option<SocketAddr> {
        let mut dest = match &buffer.udp {
            Some(dest) => dest.clone(),
            None => return self.default_target,
        };
        if let Some(addr) = &self.override_address {
            dest.address = addr.clone();
        }
        if let Some(port) = self.override_port {
            dest.port = port;
        }
        match dest.address {
            Address::Ip(ip) => Some(SocketAddr::new(ip, dest.port)),
            Address::Domain(ref domain) => {
                let (dns, option) = self.resolver.as_ref()?;
                let ips = dns.lookup_ip(domain, *option).await.ok()?;
                let ip = *ips.first()?;
                Some(SocketAddr::new(ip, dest.port))
            }
        }
    }
}

#[async_trait]
impl MultiBufferWriter for PacketWriter {
    async fn write_multi_buffer(&mut self, mb: MultiBuffer) -> Result<()> {
        for mut buffer in mb {
            match self.target_for(&buffer).await {
                Some(addr) => {
                    self.socket.send_to(buffer.bytes(), addr).await?;
                }
                // Unaddressable datagrams are dropped, not fatal.
                None => debug!("dropping datagram without resolvable target"),
            }
            buffer.release();
        }
        Ok(())
    }
}
