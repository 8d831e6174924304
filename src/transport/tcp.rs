//! System transport: raw TCP streams and UDP packet sockets
//!
//! The `tcp` registry entry is the system dialer every other transport
//! builds on. TCP destinations produce stream connections; UDP
//! destinations produce packet connections whose writers may
//! re-address each datagram.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::{Destination, Network, PacketConn};
use crate::error::{Error, Result};

use super::{ConnHandler, Connection, Dialer, Listener, ListenerBuilder, StreamSettings};

/// Resolve a destination to socket addresses via the OS resolver.
/// Handlers wanting cache-backed resolution substitute an IP first.
pub async fn resolve_sock_addr(dest: &Destination) -> Result<SocketAddr> {
    if let Some(addr) = dest.as_socket_addr() {
        return Ok(addr);
    }
    tokio::net::lookup_host(dest.host_port())
        .await?
        .next()
        .ok_or_else(|| Error::InvalidAddress(dest.host_port()))
}

/// System dialer: TCP for stream destinations, UDP for packet ones.
pub struct SystemDialer;

#[async_trait]
impl Dialer for SystemDialer {
    async fn dial(&self, dest: &Destination, _settings: &StreamSettings) -> Result<Connection> {
        match dest.network {
            Network::Tcp => {
                let addr = resolve_sock_addr(dest).await?;
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                let local = stream.local_addr().ok();
                Ok(Connection::from_stream(stream, local, Some(addr)))
            }
            Network::Udp => {
                let addr = resolve_sock_addr(dest).await?;
                let bind: SocketAddr = if addr.is_ipv4() {
                    "0.0.0.0:0".parse().unwrap()
                } else {
                    "[::]:0".parse().unwrap()
                };
                let socket = UdpSocket::bind(bind).await?;
                let local = socket.local_addr().ok();
                Ok(Connection::from_packet(
                    Arc::new(UdpPacketConn { socket }),
                    local,
                    Some(addr),
                ))
            }
        }
    }
}

/// `PacketConn` over a plain UDP socket.
pub struct UdpPacketConn {
    socket: UdpSocket,
}

impl UdpPacketConn {
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl PacketConn for UdpPacketConn {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, addr).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// Raw TCP listener
pub struct TcpListenerBuilder;

#[async_trait]
impl ListenerBuilder for TcpListenerBuilder {
    async fn listen(
        &self,
        addr: SocketAddr,
        _settings: &StreamSettings,
        handler: ConnHandler,
    ) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr().ok();
        let token = CancellationToken::new();

        let loop_token = token.clone();
        tokio::spawn(async move {
            accept_loop(listener, handler, loop_token).await;
        });

        Ok(Box::new(TcpListenerHandle { local_addr, token }))
    }
}

async fn accept_loop(listener: TcpListener, handler: ConnHandler, token: CancellationToken) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("nodelay on {}: {}", peer, e);
                    }
                    let local = stream.local_addr().ok();
                    handler(Connection::from_stream(stream, local, Some(peer)));
                }
                Err(e) => {
                    warn!("tcp accept error: {}", e);
                    // Transient accept failures keep the loop alive.
                    continue;
                }
            },
            _ = token.cancelled() => {
                debug!("tcp listener closed");
                return;
            }
        }
    }
}

struct TcpListenerHandle {
    local_addr: Option<SocketAddr>,
    token: CancellationToken,
}

impl Listener for TcpListenerHandle {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn close(&self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_dial_and_accept() {
        let accepted = Arc::new(tokio::sync::Notify::new());
        let notify = accepted.clone();
        let handler: ConnHandler = Arc::new(move |mut conn| {
            let notify = notify.clone();
            tokio::spawn(async move {
                if let Connection::Stream(c) = &mut conn {
                    let mut buf = [0u8; 4];
                    c.stream.read_exact(&mut buf).await.unwrap();
                    assert_eq!(&buf, b"ping");
                    c.stream.write_all(b"pong").await.unwrap();
                }
                notify.notify_one();
            });
        });

        let builder = TcpListenerBuilder;
        let listener = builder
            .listen("127.0.0.1:0".parse().unwrap(), &StreamSettings::default(), handler)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let dest = Destination::tcp(Address::Ip(addr.ip()), addr.port());
        let conn = SystemDialer.dial(&dest, &StreamSettings::default()).await.unwrap();
        match conn {
            Connection::Stream(mut c) => {
                c.stream.write_all(b"ping").await.unwrap();
                let mut buf = [0u8; 4];
                c.stream.read_exact(&mut buf).await.unwrap();
                assert_eq!(&buf, b"pong");
            }
            Connection::Packet(_) => panic!("expected stream connection"),
        }
        accepted.notified().await;
        listener.close();
    }

    #[tokio::test]
    async fn test_udp_destination_yields_packet_conn() {
        let dest = Destination::udp(Address::parse("127.0.0.1"), 5353);
        let conn = SystemDialer.dial(&dest, &StreamSettings::default()).await.unwrap();
        assert!(matches!(conn, Connection::Packet(_)));
    }

    #[tokio::test]
    async fn test_close_while_accepting() {
        let handler: ConnHandler = Arc::new(|_| {});
        let listener = TcpListenerBuilder
            .listen("127.0.0.1:0".parse().unwrap(), &StreamSettings::default(), handler)
            .await
            .unwrap();
        // Close with the accept in flight; the loop must exit rather
        // than wedge.
        listener.close();
        tokio::task::yield_now().await;
    }
}
