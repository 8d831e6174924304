//! HTTP-Upgrade transport
//!
//! One HTTP/1.1 exchange flips the connection into a raw byte stream:
//! the client sends `GET <path>` with `Connection: upgrade` and
//! `Upgrade: websocket`, the server must answer exactly
//! `101 Switching Protocols` with matching headers. Anything else is a
//! failed handshake.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::Destination;
use crate::error::{Error, Result};

use super::tcp::resolve_sock_addr;
use super::{ConnHandler, Connection, Dialer, Listener, ListenerBuilder, StreamSettings};

const MAX_HEAD: usize = 8 * 1024;

/// Read bytes until the blank line ending an HTTP head. Returns the
/// head and any bytes that arrived after it.
async fn read_http_head<S>(stream: &mut S) -> Result<(String, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut data = Vec::with_capacity(512);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(Error::HandshakeFailed("connection closed mid-head".into()));
        }
        data.push(byte[0]);
        if data.len() > MAX_HEAD {
            return Err(Error::HandshakeFailed("oversized http head".into()));
        }
        if data.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let head = String::from_utf8(data)
        .map_err(|_| Error::HandshakeFailed("non-utf8 http head".into()))?;
    Ok((head, Vec::new()))
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim())
        } else {
            None
        }
    })
}

/// HTTP-Upgrade dialer
pub struct HttpUpgradeDialer;

#[async_trait]
impl Dialer for HttpUpgradeDialer {
    async fn dial(&self, dest: &Destination, settings: &StreamSettings) -> Result<Connection> {
        let addr = resolve_sock_addr(dest).await?;
        let mut tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        let local = tcp.local_addr().ok();

        let path = if settings.path.is_empty() { "/" } else { &settings.path };
        let host = settings
            .host
            .clone()
            .unwrap_or_else(|| dest.host_port());

        let mut request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: upgrade\r\nUpgrade: websocket\r\n",
            path, host
        );
        for (k, v) in &settings.headers {
            request.push_str(&format!("{}: {}\r\n", k, v));
        }
        request.push_str("\r\n");
        tcp.write_all(request.as_bytes()).await?;

        let (head, leftover) = read_http_head(&mut tcp).await?;
        let status_line = head.lines().next().unwrap_or_default();
        let upgraded = status_line.contains("101 Switching Protocols")
            && header_value(&head, "upgrade")
                .map(|v| v.eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
            && header_value(&head, "connection")
                .map(|v| v.eq_ignore_ascii_case("upgrade"))
                .unwrap_or(false);
        if !upgraded {
            return Err(Error::HandshakeFailed(format!(
                "unrecognized reply: {}",
                status_line
            )));
        }

        debug!("httpupgrade established to {}", dest);
        Ok(Connection::from_stream(
            PrefixedStream::new(leftover, tcp),
            local,
            Some(addr),
        ))
    }
}

/// HTTP-Upgrade listener
pub struct HttpUpgradeListenerBuilder;

#[async_trait]
impl ListenerBuilder for HttpUpgradeListenerBuilder {
    async fn listen(
        &self,
        addr: SocketAddr,
        settings: &StreamSettings,
        handler: ConnHandler,
    ) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr().ok();
        let token = CancellationToken::new();
        let expected_path = if settings.path.is_empty() {
            "/".to_string()
        } else {
            settings.path.clone()
        };

        let accept_token = token.clone();
        tokio::spawn(async move {
            loop {
                let (tcp, peer) = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("httpupgrade accept error: {}", e);
                            continue;
                        }
                    },
                    _ = accept_token.cancelled() => return,
                };
                let handler = handler.clone();
                let expected_path = expected_path.clone();
                tokio::spawn(async move {
                    match serve_upgrade(tcp, &expected_path).await {
                        Ok(conn) => handler(conn),
                        Err(e) => debug!("httpupgrade from {} rejected: {}", peer, e),
                    }
                });
            }
        });

        Ok(Box::new(HttpUpgradeListenerHandle { local_addr, token }))
    }
}

async fn serve_upgrade(mut tcp: TcpStream, expected_path: &str) -> Result<Connection> {
    let peer = tcp.peer_addr().ok();
    let local = tcp.local_addr().ok();
    let (head, leftover) = read_http_head(&mut tcp).await?;

    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default();
    let path = parts.next().unwrap_or_default();
    if method != "GET" || path != expected_path {
        let _ = tcp.write_all(b"HTTP/1.1 404 Not Found\r\n\r\n").await;
        return Err(Error::HandshakeFailed(format!(
            "bad request line: {}",
            request_line
        )));
    }
    let wants_upgrade = header_value(&head, "upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
        && header_value(&head, "connection")
            .map(|v| v.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false);
    if !wants_upgrade {
        let _ = tcp.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        return Err(Error::HandshakeFailed("missing upgrade headers".into()));
    }

    tcp.write_all(
        b"HTTP/1.1 101 Switching Protocols\r\nConnection: upgrade\r\nUpgrade: websocket\r\n\r\n",
    )
    .await?;

    Ok(Connection::from_stream(
        PrefixedStream::new(leftover, tcp),
        local,
        peer,
    ))
}

struct HttpUpgradeListenerHandle {
    local_addr: Option<SocketAddr>,
    token: CancellationToken,
}

impl Listener for HttpUpgradeListenerHandle {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn close(&self) {
        self.token.cancel();
    }
}

/// Stream with a prefix of already-read bytes served first.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_upgrade_handshake_and_relay() {
        let handler: ConnHandler = Arc::new(|mut conn| {
            tokio::spawn(async move {
                if let Connection::Stream(c) = &mut conn {
                    let mut buf = [0u8; 4];
                    c.stream.read_exact(&mut buf).await.unwrap();
                    c.stream.write_all(&buf).await.unwrap();
                }
            });
        });

        let settings = StreamSettings {
            path: "/push".to_string(),
            ..Default::default()
        };
        let listener = HttpUpgradeListenerBuilder
            .listen("127.0.0.1:0".parse().unwrap(), &settings, handler)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let dest = Destination::tcp(Address::Ip(addr.ip()), addr.port());
        let conn = HttpUpgradeDialer.dial(&dest, &settings).await.unwrap();
        let mut stream = match conn {
            Connection::Stream(c) => c.stream,
            Connection::Packet(_) => panic!("expected stream"),
        };
        stream.write_all(b"data").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");
        listener.close();
    }

    #[tokio::test]
    async fn test_wrong_path_is_handshake_failure() {
        let handler: ConnHandler = Arc::new(|_| {});
        let listener = HttpUpgradeListenerBuilder
            .listen(
                "127.0.0.1:0".parse().unwrap(),
                &StreamSettings {
                    path: "/expected".to_string(),
                    ..Default::default()
                },
                handler,
            )
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let dest = Destination::tcp(Address::Ip(addr.ip()), addr.port());
        let err = HttpUpgradeDialer
            .dial(
                &dest,
                &StreamSettings {
                    path: "/other".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeFailed(_)));
        listener.close();
    }

    #[test]
    fn test_header_value_case_insensitive() {
        let head = "HTTP/1.1 101 Switching Protocols\r\nUpgrade: WebSocket\r\nConnection: upgrade\r\n\r\n";
        assert_eq!(header_value(head, "UPGRADE"), Some("WebSocket"));
        assert_eq!(header_value(head, "missing"), None);
    }
}
