//! HTTP/2 tunnel transport (H2C)
//!
//! The dialed session rides the body of a single POST exchange: the
//! request body carries the uplink, the response body the downlink.
//! One TCP connection multiplexes many tunnel streams.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::{Buf, Bytes};
use h2::client::SendRequest;
use h2::{RecvStream, SendStream};
use http::{Request, Response, Uri};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::Destination;
use crate::error::{Error, Result};

use super::tcp::resolve_sock_addr;
use super::{ConnHandler, Connection, Dialer, Listener, ListenerBuilder, StreamSettings};

type H2Pool = Arc<Mutex<HashMap<(String, u16), SendRequest<Bytes>>>>;

/// HTTP/2 dialer with per-(host, port) connection reuse.
pub struct Http2Dialer {
    pool: H2Pool,
}

impl Http2Dialer {
    pub fn new() -> Self {
        Self {
            pool: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn send_request_handle(
        &self,
        dest: &Destination,
        addr: SocketAddr,
    ) -> Result<SendRequest<Bytes>> {
        let key = (dest.address.to_string(), dest.port);
        {
            let pool = self.pool.lock().await;
            if let Some(handle) = pool.get(&key) {
                debug!("reusing http/2 connection for {}", dest);
                return Ok(handle.clone());
            }
        }

        let tcp = TcpStream::connect(addr).await?;
        tcp.set_nodelay(true)?;
        let (handle, connection) = h2::client::handshake(tcp)
            .await
            .map_err(|e| Error::HandshakeFailed(format!("http/2 handshake: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("http/2 connection error: {}", e);
            }
        });

        self.pool.lock().await.insert(key, handle.clone());
        Ok(handle)
    }
}

impl Default for Http2Dialer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialer for Http2Dialer {
    async fn dial(&self, dest: &Destination, settings: &StreamSettings) -> Result<Connection> {
        let addr = resolve_sock_addr(dest).await?;
        let mut handle = self
            .send_request_handle(dest, addr)
            .await?
            .ready()
            .await
            .map_err(|e| Error::Transport(format!("http/2 not ready: {}", e)))?;

        let path = if settings.path.is_empty() { "/" } else { &settings.path };
        let host = settings
            .host
            .clone()
            .unwrap_or_else(|| dest.address.to_string());
        let uri = format!("http://{}:{}{}", host, dest.port, path)
            .parse::<Uri>()
            .map_err(|e| Error::Config(format!("bad http/2 uri: {}", e)))?;

        let mut builder = Request::builder().method("POST").uri(uri);
        for (k, v) in &settings.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        let request = builder
            .body(())
            .map_err(|e| Error::Config(format!("bad http/2 request: {}", e)))?;

        let (response, send_stream) = handle
            .send_request(request, false)
            .map_err(|e| Error::Transport(format!("http/2 send request: {}", e)))?;
        let response = response
            .await
            .map_err(|e| Error::Transport(format!("http/2 response: {}", e)))?;
        if !response.status().is_success() {
            return Err(Error::HandshakeFailed(format!(
                "http/2 status {}",
                response.status()
            )));
        }
        let recv_stream = response.into_body();

        Ok(Connection::from_stream(
            Http2StreamAdapter::new(send_stream, recv_stream),
            None,
            Some(addr),
        ))
    }
}

/// Adapter over an h2 stream pair, handling flow-control windows.
pub struct Http2StreamAdapter {
    send_stream: SendStream<Bytes>,
    recv_stream: RecvStream,
    read_buffer: Bytes,
}

impl Http2StreamAdapter {
    fn new(send_stream: SendStream<Bytes>, recv_stream: RecvStream) -> Self {
        Self {
            send_stream,
            recv_stream,
            read_buffer: Bytes::new(),
        }
    }
}

impl AsyncRead for Http2StreamAdapter {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buffer.is_empty() {
            let n = self.read_buffer.len().min(buf.remaining());
            buf.put_slice(&self.read_buffer[..n]);
            self.read_buffer.advance(n);
            return Poll::Ready(Ok(()));
        }

        match self.recv_stream.poll_data(cx) {
            Poll::Ready(Some(Ok(data))) => {
                let _ = self.recv_stream.flow_control().release_capacity(data.len());
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.read_buffer = data.slice(n..);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(e))) => {
                Poll::Ready(Err(io::Error::other(format!("http/2 read: {}", e))))
            }
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Http2StreamAdapter {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.send_stream.reserve_capacity(buf.len());
        match self.send_stream.poll_capacity(cx) {
            Poll::Ready(Some(Ok(capacity))) => {
                let n = capacity.min(buf.len());
                if n == 0 {
                    return Poll::Pending;
                }
                match self
                    .send_stream
                    .send_data(Bytes::copy_from_slice(&buf[..n]), false)
                {
                    Ok(()) => Poll::Ready(Ok(n)),
                    Err(e) => Poll::Ready(Err(io::Error::other(format!("http/2 write: {}", e)))),
                }
            }
            Poll::Ready(Some(Err(e))) => {
                Poll::Ready(Err(io::Error::other(format!("http/2 capacity: {}", e))))
            }
            Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "http/2 stream closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.send_stream.send_data(Bytes::new(), true) {
            Ok(()) => Poll::Ready(Ok(())),
            // END_STREAM may already be on the wire.
            Err(_) => Poll::Ready(Ok(())),
        }
    }
}

/// HTTP/2 listener (H2C)
pub struct Http2ListenerBuilder;

#[async_trait]
impl ListenerBuilder for Http2ListenerBuilder {
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
                            warn!("http/2 accept error: {}", e);
                            continue;
                        }
                    },
                    _ = accept_token.cancelled() => return,
                };
                let handler = handler.clone();
                let conn_token = accept_token.child_token();
                tokio::spawn(async move {
                    let mut h2 = match h2::server::handshake(tcp).await {
                        Ok(h2) => h2,
                        Err(e) => {
                            debug!("http/2 handshake from {} failed: {}", peer, e);
                            return;
                        }
                    };
                    loop {
                        let (request, mut respond) = tokio::select! {
                            accepted = h2.accept() => match accepted {
                                Some(Ok(pair)) => pair,
                                Some(Err(e)) => {
                                    debug!("http/2 stream error from {}: {}", peer, e);
                                    return;
                                }
                                None => return,
                            },
                            _ = conn_token.cancelled() => return,
                        };
                        let recv_stream = request.into_body();
                        let response = Response::builder().status(200).body(()).unwrap();
                        let send_stream = match respond.send_response(response, false) {
                            Ok(s) => s,
                            Err(e) => {
                                debug!("http/2 respond error: {}", e);
                                continue;
                            }
                        };
                        handler(Connection::from_stream(
                            Http2StreamAdapter::new(send_stream, recv_stream),
                            None,
                            Some(peer),
                        ));
                    }
                });
            }
        });

        Ok(Box::new(Http2ListenerHandle { local_addr, token }))
    }
}

struct Http2ListenerHandle {
    local_addr: Option<SocketAddr>,
    token: CancellationToken,
}

impl Listener for Http2ListenerHandle {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn close(&self) {
        self.token.cancel();
    }
}
