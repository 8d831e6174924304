//! QUIC transport
//!
//! One bidirectional quinn stream per dialed session. The listener
//! accepts QUIC connections and surfaces every incoming bidirectional
//! stream as its own connection.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use quinn::{Endpoint, RecvStream, SendStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::Destination;
use crate::error::{Error, Result};

use super::tcp::resolve_sock_addr;
use super::{ConnHandler, Connection, Dialer, Listener, ListenerBuilder, StreamSettings};

fn client_endpoint(remote: &SocketAddr) -> Result<Endpoint> {
    let bind: SocketAddr = if remote.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    let mut endpoint = Endpoint::client(bind)
        .map_err(|e| Error::Transport(format!("quic endpoint: {}", e)))?;

    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let crypto = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| Error::Transport(format!("quic tls config: {}", e)))?;
    endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(crypto)));
    Ok(endpoint)
}

/// QUIC dialer
pub struct QuicDialer;

#[async_trait]
impl Dialer for QuicDialer {
    async fn dial(&self, dest: &Destination, settings: &StreamSettings) -> Result<Connection> {
        let remote = resolve_sock_addr(dest).await?;
        let endpoint = client_endpoint(&remote)?;

        let server_name = settings
            .host
            .clone()
            .or_else(|| dest.address.as_domain().map(str::to_string))
            .unwrap_or_else(|| remote.ip().to_string());

        debug!("quic dial {} (sni {})", remote, server_name);
        let connection = endpoint
            .connect(remote, &server_name)
            .map_err(|e| Error::Transport(format!("quic connect: {}", e)))?
            .await
            .map_err(|e| Error::Transport(format!("quic handshake: {}", e)))?;

        let (send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| Error::Transport(format!("quic open stream: {}", e)))?;

        let local = endpoint.local_addr().ok();
        // The endpoint and connection live as long as the stream
        // adapter keeps them referenced.
        let stream = QuicStream::new(send, recv, Some(connection), Some(endpoint));
        Ok(Connection::from_stream(stream, local, Some(remote)))
    }
}

/// Adapter exposing a quinn bi-stream as `AsyncRead + AsyncWrite`.
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
    _connection: Option<quinn::Connection>,
    _endpoint: Option<Endpoint>,
}

impl QuicStream {
    fn new(
        send: SendStream,
        recv: RecvStream,
        connection: Option<quinn::Connection>,
        endpoint: Option<Endpoint>,
    ) -> Self {
        Self {
            send,
            recv,
            _connection: connection,
            _endpoint: endpoint,
        }
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.send)
            .poll_write(cx, buf)
            .map_err(io::Error::other)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

/// QUIC listener
pub struct QuicListenerBuilder;

fn load_server_config(settings: &StreamSettings) -> Result<quinn::ServerConfig> {
    let cert_path = settings
        .certificate_file
        .as_ref()
        .ok_or_else(|| Error::Config("quic listener requires certificate_file".into()))?;
    let key_path = settings
        .key_file
        .as_ref()
        .ok_or_else(|| Error::Config("quic listener requires key_file".into()))?;

    let certs = rustls_pemfile::certs(&mut io::BufReader::new(std::fs::File::open(cert_path)?))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("bad certificate {}: {}", cert_path, e)))?;
    let key = rustls_pemfile::private_key(&mut io::BufReader::new(std::fs::File::open(key_path)?))
        .map_err(|e| Error::Config(format!("bad key {}: {}", key_path, e)))?
        .ok_or_else(|| Error::Config(format!("no private key in {}", key_path)))?;

    quinn::ServerConfig::with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("quic server config: {}", e)))
}

#[async_trait]
impl ListenerBuilder for QuicListenerBuilder {
    async fn listen(
        &self,
        addr: SocketAddr,
        settings: &StreamSettings,
        handler: ConnHandler,
    ) -> Result<Box<dyn Listener>> {
        let server_config = load_server_config(settings)?;
        let endpoint = Endpoint::server(server_config, addr)
            .map_err(|e| Error::Transport(format!("quic listen: {}", e)))?;
        let local_addr = endpoint.local_addr().ok();
        let token = CancellationToken::new();

        let accept_endpoint = endpoint.clone();
        let accept_token = token.clone();
        tokio::spawn(async move {
            loop {
                let incoming = tokio::select! {
                    incoming = accept_endpoint.accept() => match incoming {
                        Some(incoming) => incoming,
                        None => return, // endpoint closed
                    },
                    _ = accept_token.cancelled() => {
                        accept_endpoint.close(0u32.into(), b"listener closed");
                        return;
                    }
                };
                let handler = handler.clone();
                let conn_token = accept_token.child_token();
                tokio::spawn(async move {
                    let connection = match incoming.await {
                        Ok(c) => c,
                        Err(e) => {
                            warn!("quic handshake failed: {}", e);
                            return;
                        }
                    };
                    let peer = connection.remote_address();
                    debug!("quic connection from {}", peer);
                    loop {
                        let (send, recv) = tokio::select! {
                            opened = connection.accept_bi() => match opened {
                                Ok(pair) => pair,
                                Err(_) => return, // peer closed the connection
                            },
                            _ = conn_token.cancelled() => return,
                        };
                        let stream = QuicStream::new(send, recv, None, None);
                        handler(Connection::from_stream(stream, None, Some(peer)));
                    }
                });
            }
        });

        Ok(Box::new(QuicListenerHandle { local_addr, token }))
    }
}

struct QuicListenerHandle {
    local_addr: Option<SocketAddr>,
    token: CancellationToken,
}

impl Listener for QuicListenerHandle {
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

    #[test]
    fn test_listener_requires_certificates() {
        let err = load_server_config(&StreamSettings::default()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
