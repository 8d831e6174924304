//! SOCKS5 inbound (no-auth, CONNECT only)

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{Address, Destination, Metadata, Stream};
use crate::error::{Error, Result};

use super::InboundHandler;

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Minimal SOCKS5 acceptor: no authentication, CONNECT command only.
pub struct SocksInbound;

impl SocksInbound {
    pub fn new() -> Self {
        Self
    }

    fn reply(rep: u8) -> [u8; 10] {
        [SOCKS5_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0]
    }
}

impl Default for SocksInbound {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InboundHandler for SocksInbound {
    fn protocol(&self) -> &'static str {
        "socks"
    }

    async fn accept(&self, stream: &mut Stream, source: Option<SocketAddr>) -> Result<Metadata> {
        // Greeting: version + offered auth methods.
        let mut head = [0u8; 2];
        stream.read_exact(&mut head).await?;
        if head[0] != SOCKS5_VERSION {
            return Err(Error::HandshakeFailed(format!(
                "unsupported SOCKS version: {}",
                head[0]
            )));
        }
        let mut methods = vec![0u8; head[1] as usize];
        stream.read_exact(&mut methods).await?;

        if !methods.contains(&AUTH_NONE) {
            stream
                .write_all(&[SOCKS5_VERSION, AUTH_NO_ACCEPTABLE])
                .await?;
            return Err(Error::HandshakeFailed("no acceptable auth method".into()));
        }
        stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;

        // Request: VER CMD RSV ATYP ...
        let mut request = [0u8; 4];
        stream.read_exact(&mut request).await?;
        if request[0] != SOCKS5_VERSION {
            return Err(Error::HandshakeFailed("bad request version".into()));
        }
        if request[1] != CMD_CONNECT {
            stream.write_all(&Self::reply(REP_CMD_NOT_SUPPORTED)).await?;
            return Err(Error::HandshakeFailed(format!(
                "unsupported command: {}",
                request[1]
            )));
        }

        let address = match request[3] {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                stream.read_exact(&mut octets).await?;
                Address::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut domain = vec![0u8; len[0] as usize];
                stream.read_exact(&mut domain).await?;
                Address::Domain(String::from_utf8_lossy(&domain).into_owned())
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                stream.read_exact(&mut octets).await?;
                Address::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
            }
            other => {
                stream
                    .write_all(&Self::reply(REP_ATYP_NOT_SUPPORTED))
                    .await?;
                return Err(Error::HandshakeFailed(format!(
                    "unsupported address type: {}",
                    other
                )));
            }
        };
        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await?;
        let port = u16::from_be_bytes(port);

        stream.write_all(&Self::reply(REP_SUCCESS)).await?;

        let mut metadata =
            Metadata::new(Destination::tcp(address, port)).with_protocol(self.protocol());
        metadata.source = source;
        Ok(metadata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::IntoStream;

    async fn run_handshake(request: Vec<u8>) -> (Result<Metadata>, Vec<u8>) {
        let (client, server) = tokio::io::duplex(256);
        let mut server_stream = server.into_stream();

        let driver = tokio::spawn(async move {
            let (mut read, mut write) = tokio::io::split(client);
            write.write_all(&request).await.unwrap();
            let mut replies = vec![0u8; 64];
            let mut total = 0;
            // Drain whatever the server replies until it goes quiet.
            while let Ok(n) =
                tokio::time::timeout(std::time::Duration::from_millis(100), read.read(&mut replies[total..]))
                    .await
                    .unwrap_or(Ok(0))
            {
                if n == 0 {
                    break;
                }
                total += n;
            }
            replies.truncate(total);
            replies
        });

        let result = SocksInbound::new().accept(&mut server_stream, None).await;
        let replies = driver.await.unwrap();
        (result, replies)
    }

    #[tokio::test]
    async fn test_connect_domain() {
        let mut request = vec![0x05, 0x01, 0x00]; // greeting, no-auth
        request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03]); // CONNECT, domain
        request.push(11);
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());

        let (result, replies) = run_handshake(request).await;
        let metadata = result.unwrap();
        let destination = metadata.destination.unwrap();
        assert_eq!(destination.address, Address::domain("example.com"));
        assert_eq!(destination.port, 443);
        // Method selection + success reply.
        assert_eq!(&replies[..2], &[0x05, 0x00]);
        assert_eq!(replies[3], 0x00);
    }

    #[tokio::test]
    async fn test_connect_ipv4() {
        let mut request = vec![0x05, 0x01, 0x00];
        request.extend_from_slice(&[0x05, 0x01, 0x00, 0x01, 192, 0, 2, 10]);
        request.extend_from_slice(&80u16.to_be_bytes());

        let (result, _) = run_handshake(request).await;
        let destination = result.unwrap().destination.unwrap();
        assert_eq!(destination.address, Address::parse("192.0.2.10"));
        assert_eq!(destination.port, 80);
    }

    #[tokio::test]
    async fn test_bind_command_rejected() {
        let mut request = vec![0x05, 0x01, 0x00];
        request.extend_from_slice(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1]);
        request.extend_from_slice(&80u16.to_be_bytes());

        let (result, replies) = run_handshake(request).await;
        assert!(matches!(result, Err(Error::HandshakeFailed(_))));
        // Last reply carries command-not-supported.
        assert!(replies.windows(2).any(|w| w == [0x05, 0x07]));
    }
}
