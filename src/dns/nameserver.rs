//! Name server backends
//!
//! One trait, five wire flavours: plain UDP, plain TCP, DNS-over-TLS,
//! DNS-over-HTTPS, and the system resolver fallback (`localhost`).
//! Servers are configured by URL.

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::trace;

use crate::error::{Error, Result};

use super::IpOption;

/// A positive answer with the minimum record TTL seen.
#[derive(Debug, Clone, Default)]
pub struct DnsAnswer {
    pub ips: Vec<IpAddr>,
    pub ttl: u32,
}

impl DnsAnswer {
    fn merge(mut self, other: DnsAnswer) -> DnsAnswer {
        if other.ips.is_empty() {
            return self;
        }
        if self.ips.is_empty() {
            return other;
        }
        self.ips.extend(other.ips);
        self.ttl = self.ttl.min(other.ttl);
        self
    }
}

/// One upstream resolver.
#[async_trait]
pub trait NameServer: Send + Sync {
    fn name(&self) -> &str;

    /// Resolve `domain` for the families enabled in `option`.
    /// `client_ip` is advisory (EDNS client subnet); backends may
    /// ignore it.
    async fn query_ip(
        &self,
        domain: &str,
        client_ip: Option<IpAddr>,
        option: IpOption,
    ) -> Result<DnsAnswer>;
}

/// Parse a name server URL into a backend.
///
/// Accepted forms: `udp://host:port`, `tcp://host:port`,
/// `tls://host:port`, `https://host/dns-query`,
/// `https+local://host/dns-query`, and `localhost`.
pub fn name_server_from_url(url: &str) -> Result<Arc<dyn NameServer>> {
    if url == "localhost" {
        return Ok(Arc::new(LocalNameServer));
    }
    if let Some(rest) = url.strip_prefix("udp://") {
        return Ok(Arc::new(UdpNameServer {
            name: url.to_string(),
            addr: parse_host_port(rest, 53)?,
        }));
    }
    if let Some(rest) = url.strip_prefix("tcp://") {
        return Ok(Arc::new(TcpNameServer {
            name: url.to_string(),
            addr: parse_host_port(rest, 53)?,
        }));
    }
    if let Some(rest) = url.strip_prefix("tls://") {
        let (host, addr) = parse_tls_target(rest)?;
        return Ok(Arc::new(DotNameServer {
            name: url.to_string(),
            server_name: host,
            addr,
        }));
    }
    if url.starts_with("https://") || url.starts_with("https+local://") {
        let endpoint = url.replace("https+local://", "https://");
        return Ok(Arc::new(DohNameServer::new(url.to_string(), endpoint)?));
    }
    Err(Error::Config(format!("unsupported DNS server url: {}", url)))
}

fn parse_host_port(s: &str, default_port: u16) -> Result<SocketAddr> {
    if let Ok(addr) = s.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }
    Err(Error::Config(format!("DNS server must be an IP: {}", s)))
}

fn parse_tls_target(s: &str) -> Result<(String, SocketAddr)> {
    match s.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => {
            let port = port.parse::<u16>().unwrap();
            match host.parse::<IpAddr>() {
                Ok(ip) => Ok((host.to_string(), SocketAddr::new(ip, port))),
                Err(_) => Err(Error::Config(format!(
                    "tls:// DNS server must be an IP, got {}",
                    host
                ))),
            }
        }
        _ => {
            let ip = s
                .parse::<IpAddr>()
                .map_err(|_| Error::Config(format!("tls:// DNS server must be an IP, got {}", s)))?;
            Ok((s.to_string(), SocketAddr::new(ip, 853)))
        }
    }
}

fn build_query(domain: &str, rtype: RecordType) -> Result<(u16, Vec<u8>)> {
    let fqdn = if domain.ends_with('.') {
        domain.to_string()
    } else {
        format!("{}.", domain)
    };
    let name = Name::from_str(&fqdn)
        .map_err(|e| Error::LookupFailed(domain.to_string(), format!("bad name: {}", e)))?;
    let id: u16 = rand::random();
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, rtype));
    let bytes = message
        .to_vec()
        .map_err(|e| Error::LookupFailed(domain.to_string(), format!("encode: {}", e)))?;
    Ok((id, bytes))
}

fn parse_answer(domain: &str, expect_id: u16, data: &[u8]) -> Result<DnsAnswer> {
    let message = Message::from_vec(data)
        .map_err(|e| Error::LookupFailed(domain.to_string(), format!("decode: {}", e)))?;
    if message.id() != expect_id {
        return Err(Error::LookupFailed(
            domain.to_string(),
            "response id mismatch".into(),
        ));
    }
    let mut answer = DnsAnswer {
        ips: Vec::new(),
        ttl: u32::MAX,
    };
    for record in message.answers() {
        match record.data() {
            Some(RData::A(a)) => {
                answer.ips.push(IpAddr::V4(a.0));
                answer.ttl = answer.ttl.min(record.ttl());
            }
            Some(RData::AAAA(aaaa)) => {
                answer.ips.push(IpAddr::V6(aaaa.0));
                answer.ttl = answer.ttl.min(record.ttl());
            }
            _ => {}
        }
    }
    if answer.ips.is_empty() {
        return Err(Error::LookupFailed(domain.to_string(), "empty answer".into()));
    }
    if answer.ttl == u32::MAX {
        answer.ttl = 0;
    }
    Ok(answer)
}

fn record_types(option: IpOption) -> Vec<RecordType> {
    let mut types = Vec::with_capacity(2);
    if option.ipv4 {
        types.push(RecordType::A);
    }
    if option.ipv6 {
        types.push(RecordType::AAAA);
    }
    types
}

async fn query_families<F, Fut>(domain: &str, option: IpOption, exchange: F) -> Result<DnsAnswer>
where
    F: Fn(u16, Vec<u8>) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<u8>>>,
{
    let mut merged = DnsAnswer::default();
    let mut last_err = None;
    for rtype in record_types(option) {
        let (id, query) = build_query(domain, rtype)?;
        match exchange(id, query).await.and_then(|data| parse_answer(domain, id, &data)) {
            Ok(answer) => merged = merged.merge(answer),
            Err(e) => last_err = Some(e),
        }
    }
    if merged.ips.is_empty() {
        Err(last_err.unwrap_or_else(|| {
            Error::LookupFailed(domain.to_string(), "no families enabled".into())
        }))
    } else {
        Ok(merged)
    }
}

/// Traditional DNS over UDP
pub struct UdpNameServer {
    name: String,
    addr: SocketAddr,
}

#[async_trait]
impl NameServer for UdpNameServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query_ip(
        &self,
        domain: &str,
        _client_ip: Option<IpAddr>,
        option: IpOption,
    ) -> Result<DnsAnswer> {
        let addr = self.addr;
        query_families(domain, option, move |_, query| async move {
            let bind: SocketAddr = if addr.is_ipv4() {
                "0.0.0.0:0".parse().unwrap()
            } else {
                "[::]:0".parse().unwrap()
            };
            let socket = UdpSocket::bind(bind).await?;
            socket.send_to(&query, addr).await?;
            let mut buf = vec![0u8; 4096];
            let (n, _) = socket.recv_from(&mut buf).await?;
            buf.truncate(n);
            Ok(buf)
        })
        .await
    }
}

/// Traditional DNS over TCP (2-byte length framing)
pub struct TcpNameServer {
    name: String,
    addr: SocketAddr,
}

async fn exchange_framed<S>(stream: &mut S, query: &[u8]) -> Result<Vec<u8>>
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    stream.write_all(&(query.len() as u16).to_be_bytes()).await?;
    stream.write_all(query).await?;
    stream.flush().await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

#[async_trait]
impl NameServer for TcpNameServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query_ip(
        &self,
        domain: &str,
        _client_ip: Option<IpAddr>,
        option: IpOption,
    ) -> Result<DnsAnswer> {
        let addr = self.addr;
        query_families(domain, option, move |_, query| async move {
            let mut stream = TcpStream::connect(addr).await?;
            exchange_framed(&mut stream, &query).await
        })
        .await
    }
}

/// DNS over TLS (RFC 7858)
pub struct DotNameServer {
    name: String,
    server_name: String,
    addr: SocketAddr,
}

fn tls_connector() -> tokio_rustls::TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

#[async_trait]
impl NameServer for DotNameServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query_ip(
        &self,
        domain: &str,
        _client_ip: Option<IpAddr>,
        option: IpOption,
    ) -> Result<DnsAnswer> {
        let addr = self.addr;
        let server_name = self.server_name.clone();
        query_families(domain, option, move |_, query| {
            let server_name = server_name.clone();
            async move {
                let tcp = TcpStream::connect(addr).await?;
                let dns_name = rustls::pki_types::ServerName::try_from(server_name.clone())
                    .map_err(|_| Error::Config(format!("bad DoT server name: {}", server_name)))?;
                let mut tls = tls_connector().connect(dns_name, tcp).await?;
                exchange_framed(&mut tls, &query).await
            }
        })
        .await
    }
}

/// DNS over HTTPS (RFC 8484)
pub struct DohNameServer {
    name: String,
    endpoint: String,
    client: reqwest::Client,
}

impl DohNameServer {
    fn new(name: String, endpoint: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("doh client: {}", e)))?;
        Ok(Self {
            name,
            endpoint,
            client,
        })
    }
}

#[async_trait]
impl NameServer for DohNameServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn query_ip(
        &self,
        domain: &str,
        _client_ip: Option<IpAddr>,
        option: IpOption,
    ) -> Result<DnsAnswer> {
        query_families(domain, option, |_, query| async move {
            let response = self
                .client
                .post(&self.endpoint)
                .header("content-type", "application/dns-message")
                .header("accept", "application/dns-message")
                .body(query)
                .send()
                .await
                .map_err(|e| Error::LookupFailed(domain.to_string(), e.to_string()))?;
            if !response.status().is_success() {
                return Err(Error::LookupFailed(
                    domain.to_string(),
                    format!("doh status {}", response.status()),
                ));
            }
            let body = response
                .bytes()
                .await
                .map_err(|e| Error::LookupFailed(domain.to_string(), e.to_string()))?;
            Ok(body.to_vec())
        })
        .await
    }
}

/// System resolver fallback
pub struct LocalNameServer;

const LOCAL_TTL: u32 = 300;

#[async_trait]
impl NameServer for LocalNameServer {
    fn name(&self) -> &str {
        "localhost"
    }

    async fn query_ip(
        &self,
        domain: &str,
        _client_ip: Option<IpAddr>,
        option: IpOption,
    ) -> Result<DnsAnswer> {
        let addrs = tokio::net::lookup_host((domain, 0u16))
            .await
            .map_err(|e| Error::LookupFailed(domain.to_string(), e.to_string()))?;
        let ips: Vec<IpAddr> = addrs
            .map(|a| a.ip())
            .filter(|ip| match ip {
                IpAddr::V4(_) => option.ipv4,
                IpAddr::V6(_) => option.ipv6,
            })
            .collect();
        trace!("localhost resolver: {} -> {:?}", domain, ips);
        if ips.is_empty() {
            return Err(Error::LookupFailed(
                domain.to_string(),
                "no matching family".into(),
            ));
        }
        Ok(DnsAnswer {
            ips,
            ttl: LOCAL_TTL,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_forms() {
        assert_eq!(name_server_from_url("localhost").unwrap().name(), "localhost");
        assert!(name_server_from_url("udp://8.8.8.8:53").is_ok());
        assert!(name_server_from_url("udp://8.8.8.8").is_ok());
        assert!(name_server_from_url("tcp://1.1.1.1:53").is_ok());
        assert!(name_server_from_url("tls://1.1.1.1:853").is_ok());
        assert!(name_server_from_url("https://cloudflare-dns.com/dns-query").is_ok());
        assert!(name_server_from_url("https+local://dns.google/dns-query").is_ok());
        assert!(name_server_from_url("carrier-pigeon://x").is_err());
    }

    #[test]
    fn test_query_answer_round_trip() {
        let (id, query) = build_query("example.com", RecordType::A).unwrap();
        // Craft the matching response.
        let mut message = Message::from_vec(&query).unwrap();
        message.set_message_type(MessageType::Response);
        let record = hickory_proto::rr::Record::from_rdata(
            Name::from_str("example.com.").unwrap(),
            120,
            RData::A(hickory_proto::rr::rdata::A("93.184.216.34".parse().unwrap())),
        );
        message.add_answer(record);
        let data = message.to_vec().unwrap();

        let answer = parse_answer("example.com", id, &data).unwrap();
        assert_eq!(answer.ips, vec!["93.184.216.34".parse::<IpAddr>().unwrap()]);
        assert_eq!(answer.ttl, 120);
    }

    #[test]
    fn test_id_mismatch_rejected() {
        let (id, query) = build_query("example.com", RecordType::A).unwrap();
        let mut message = Message::from_vec(&query).unwrap();
        message.set_id(id.wrapping_add(1));
        let data = message.to_vec().unwrap();
        assert!(parse_answer("example.com", id, &data).is_err());
    }
}
