//! WebSocket transport
//!
//! Frames the byte stream into binary WebSocket messages. Text frames
//! are tolerated on read; ping/pong is handled below the relay.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::{Sink, Stream as FuturesStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_async_with_config, client_async_with_config,
    tungstenite::{
        handshake::client::{generate_key, Request},
        protocol::{Message, WebSocketConfig as WsConfig},
    },
    WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::common::Destination;
use crate::error::{Error, Result};

use super::tcp::resolve_sock_addr;
use super::{ConnHandler, Connection, Dialer, Listener, ListenerBuilder, StreamSettings};

fn ws_config() -> WsConfig {
    WsConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    }
}

/// WebSocket dialer
pub struct WebSocketDialer;

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, dest: &Destination, settings: &StreamSettings) -> Result<Connection> {
        let addr = resolve_sock_addr(dest).await?;
        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        let local = tcp.local_addr().ok();

        let host = settings
            .host
            .clone()
            .unwrap_or_else(|| dest.address.to_string());
        let path = if settings.path.is_empty() { "/" } else { &settings.path };
        let uri = format!("ws://{}{}", host, path);

        let mut request = Request::builder()
            .uri(&uri)
            .header("Host", &host)
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Sec-WebSocket-Version", "13")
            .header("Sec-WebSocket-Key", generate_key());
        for (key, value) in &settings.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let request = request
            .body(())
            .map_err(|e| Error::HandshakeFailed(format!("bad websocket request: {}", e)))?;

        let (ws, _response) = client_async_with_config(request, tcp, Some(ws_config()))
            .await
            .map_err(|e| Error::HandshakeFailed(format!("websocket handshake: {}", e)))?;

        Ok(Connection::from_stream(
            WebSocketAdapter::new(ws),
            local,
            Some(addr),
        ))
    }
}

/// WebSocket listener
pub struct WebSocketListenerBuilder;

#[async_trait]
impl ListenerBuilder for WebSocketListenerBuilder {
    async fn listen(
        &self,
        addr: SocketAddr,
        _settings: &StreamSettings,
        handler: ConnHandler,
    ) -> Result<Box<dyn Listener>> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr().ok();
        let token = CancellationToken::new();

        let accept_token = token.clone();
        tokio::spawn(async move {
            loop {
                let (tcp, peer) = tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("websocket accept error: {}", e);
                            continue;
                        }
                    },
                    _ = accept_token.cancelled() => return,
                };
                let handler = handler.clone();
                tokio::spawn(async move {
                    let local = tcp.local_addr().ok();
                    match accept_async_with_config(tcp, Some(ws_config())).await {
                        Ok(ws) => {
                            handler(Connection::from_stream(WebSocketAdapter::new(ws), local, Some(peer)));
                        }
                        Err(e) => debug!("websocket handshake from {} failed: {}", peer, e),
                    }
                });
            }
        });

        Ok(Box::new(WebSocketListenerHandle { local_addr, token }))
    }
}

struct WebSocketListenerHandle {
    local_addr: Option<SocketAddr>,
    token: CancellationToken,
}

impl Listener for WebSocketListenerHandle {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn close(&self) {
        self.token.cancel();
    }
}

/// Converts a message-oriented WebSocket into `AsyncRead + AsyncWrite`.
pub struct WebSocketAdapter<S> {
    inner: WebSocketStream<S>,
    read_buf: Vec<u8>,
    read_pos: usize,
    closed: bool,
}

impl<S> WebSocketAdapter<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
            read_pos: 0,
            closed: false,
        }
    }
}

impl<S> AsyncRead for WebSocketAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // Serve buffered remainder first.
        if self.read_pos < self.read_buf.len() {
            let remaining = &self.read_buf[self.read_pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.read_pos += n;
            if self.read_pos >= self.read_buf.len() {
                self.read_buf.clear();
                self.read_pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        if self.closed {
            return Poll::Ready(Ok(()));
        }

        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(msg))) => {
                    let data = match msg {
                        Message::Binary(data) => data,
                        Message::Text(text) => text.into_bytes(),
                        Message::Ping(_) | Message::Pong(_) => continue,
                        Message::Close(frame) => {
                            trace!("websocket close frame: {:?}", frame);
                            self.closed = true;
                            return Poll::Ready(Ok(()));
                        }
                        Message::Frame(_) => {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::InvalidData,
                                "unexpected raw frame",
                            )));
                        }
                    };
                    let n = data.len().min(buf.remaining());
                    buf.put_slice(&data[..n]);
                    if n < data.len() {
                        self.read_buf = data;
                        self.read_pos = n;
                    }
                    return Poll::Ready(Ok(()));
                }
                Poll::Ready(Some(Err(e))) => {
                    self.closed = true;
                    return Poll::Ready(Err(io::Error::other(e.to_string())));
                }
                Poll::Ready(None) => {
                    self.closed = true;
                    return Poll::Ready(Ok(()));
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl<S> AsyncWrite for WebSocketAdapter<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "websocket closed",
            )));
        }
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => {
                self.closed = true;
                return Poll::Ready(Err(io::Error::other(e.to_string())));
            }
            Poll::Pending => return Poll::Pending,
        }
        match Pin::new(&mut self.inner).start_send(Message::Binary(buf.to_vec())) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => {
                self.closed = true;
                Poll::Ready(Err(io::Error::other(e.to_string())))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| io::Error::other(e.to_string()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // No half-close on WebSocket: flush and let drop close the
        // underlying stream.
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(|e| io::Error::other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_websocket_round_trip() {
        let handler: ConnHandler = Arc::new(|mut conn| {
            tokio::spawn(async move {
                if let Connection::Stream(c) = &mut conn {
                    let mut buf = [0u8; 7];
                    c.stream.read_exact(&mut buf).await.unwrap();
                    c.stream.write_all(&buf).await.unwrap();
                    c.stream.flush().await.unwrap();
                    // Hold the connection until the peer is done reading.
                    let mut rest = [0u8; 1];
                    let _ = c.stream.read(&mut rest).await;
                }
            });
        });

        let listener = WebSocketListenerBuilder
            .listen("127.0.0.1:0".parse().unwrap(), &StreamSettings::default(), handler)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let dest = Destination::tcp(Address::Ip(addr.ip()), addr.port());
        let conn = WebSocketDialer.dial(&dest, &StreamSettings::default()).await.unwrap();
        let mut stream = match conn {
            Connection::Stream(c) => c.stream,
            Connection::Packet(_) => panic!("expected stream"),
        };
        stream.write_all(b"framed!").await.unwrap();
        stream.flush().await.unwrap();
        let mut buf = [0u8; 7];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"framed!");
        listener.close();
    }
}
