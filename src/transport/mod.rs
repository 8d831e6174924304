//! Transport layer
//!
//! Named dialers and listeners presenting a uniform connection
//! abstraction over diverse wire transports. Registration happens once
//! at startup; lookups at runtime are read-only.

pub mod tcp;
pub mod kcp;
pub mod quic;
pub mod websocket;
pub mod http2;
pub mod httpupgrade;
#[cfg(unix)]
pub mod domainsocket;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::common::{Counter, CounterStream, Destination, PacketConn, Stream};
use crate::error::{Error, Result};

/// Transport-specific knobs carried alongside an outbound or inbound.
#[derive(Debug, Clone, Default)]
pub struct StreamSettings {
    /// Transport name to look up in the registry (defaults to `tcp`)
    pub transport: String,
    /// Request path for websocket / http / httpupgrade
    pub path: String,
    /// Host header / TLS server name
    pub host: Option<String>,
    /// Extra headers for handshaking transports
    pub headers: Vec<(String, String)>,
    /// Skip server certificate verification (quic)
    pub allow_insecure: bool,
    /// Server certificate chain and key, PEM paths (quic listener)
    pub certificate_file: Option<String>,
    pub key_file: Option<String>,
    /// Filesystem path for domain sockets; a leading `@` means an
    /// abstract socket
    pub unix_path: Option<String>,
}

impl StreamSettings {
    pub fn transport_name(&self) -> &str {
        if self.transport.is_empty() {
            "tcp"
        } else {
            &self.transport
        }
    }
}

/// A dialed or accepted connection.
///
/// Stream- and packet-oriented transports share this type but differ
/// in semantics; the relay picks the matching framer instead of
/// duck-typing one over the other.
pub enum Connection {
    Stream(StreamConnection),
    Packet(PacketConnection),
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connection::Stream(_) => f.write_str("Connection::Stream(..)"),
            Connection::Packet(_) => f.write_str("Connection::Packet(..)"),
        }
    }
}

pub struct StreamConnection {
    pub stream: Stream,
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
}

pub struct PacketConnection {
    pub socket: Arc<dyn PacketConn>,
    pub local_addr: Option<SocketAddr>,
    /// Default peer for connected-style use; packet writers may
    /// re-address per datagram.
    pub remote_addr: Option<SocketAddr>,
}

impl Connection {
    pub fn from_stream<S>(stream: S, local: Option<SocketAddr>, remote: Option<SocketAddr>) -> Self
    where
        S: crate::common::IntoStream,
    {
        Connection::Stream(StreamConnection {
            stream: stream.into_stream(),
            local_addr: local,
            remote_addr: remote,
        })
    }

    pub fn from_packet(
        socket: Arc<dyn PacketConn>,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Self {
        Connection::Packet(PacketConnection {
            socket,
            local_addr: local,
            remote_addr: remote,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Connection::Stream(c) => c.local_addr,
            Connection::Packet(c) => c.local_addr,
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self {
            Connection::Stream(c) => c.remote_addr,
            Connection::Packet(c) => c.remote_addr,
        }
    }

    /// Attach byte counters to the stream path. Packet connections are
    /// counted by their packet framers instead.
    pub fn with_counters(
        self,
        read: Option<Arc<dyn Counter>>,
        write: Option<Arc<dyn Counter>>,
    ) -> Self {
        match self {
            Connection::Stream(c) => Connection::Stream(StreamConnection {
                stream: Box::new(CounterStream::new(c.stream, read, write)),
                local_addr: c.local_addr,
                remote_addr: c.remote_addr,
            }),
            packet => packet,
        }
    }

    /// Close the write direction. Idempotent; a second close is a
    /// no-op, and dropping the connection releases everything else.
    pub async fn close(&mut self) {
        if let Connection::Stream(c) = self {
            let _ = c.stream.shutdown().await;
        }
    }
}

/// Connects to a destination over one wire transport.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, dest: &Destination, settings: &StreamSettings) -> Result<Connection>;
}

impl std::fmt::Debug for dyn Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn Dialer")
    }
}

/// Callback receiving accepted connections (push model).
pub type ConnHandler = Arc<dyn Fn(Connection) + Send + Sync>;

/// Running listener handle. `close` is safe while an accept is in
/// flight; the accept loop recognises the shutdown and exits.
pub trait Listener: Send + Sync {
    fn local_addr(&self) -> Option<SocketAddr>;
    fn close(&self);
}

/// Binds a listener for one wire transport.
#[async_trait]
pub trait ListenerBuilder: Send + Sync {
    async fn listen(
        &self,
        addr: SocketAddr,
        settings: &StreamSettings,
        handler: ConnHandler,
    ) -> Result<Box<dyn Listener>>;
}

/// Named dialers and listeners. Built once at startup; lookups are
/// read-only afterwards.
pub struct TransportRegistry {
    dialers: HashMap<String, Arc<dyn Dialer>>,
    listeners: HashMap<String, Arc<dyn ListenerBuilder>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self {
            dialers: HashMap::new(),
            listeners: HashMap::new(),
        }
    }

    /// Registry with every built-in transport registered.
    pub fn with_defaults() -> Self {
        let mut r = Self::new();
        r.register_dialer("tcp", Arc::new(tcp::SystemDialer));
        r.register_listener("tcp", Arc::new(tcp::TcpListenerBuilder));
        r.register_dialer("kcp", Arc::new(kcp::KcpDialer));
        r.register_listener("kcp", Arc::new(kcp::KcpListenerBuilder));
        r.register_dialer("quic", Arc::new(quic::QuicDialer));
        r.register_listener("quic", Arc::new(quic::QuicListenerBuilder));
        r.register_dialer("websocket", Arc::new(websocket::WebSocketDialer));
        r.register_listener("websocket", Arc::new(websocket::WebSocketListenerBuilder));
        r.register_dialer("http", Arc::new(http2::Http2Dialer::new()));
        r.register_listener("http", Arc::new(http2::Http2ListenerBuilder));
        r.register_dialer("httpupgrade", Arc::new(httpupgrade::HttpUpgradeDialer));
        r.register_listener("httpupgrade", Arc::new(httpupgrade::HttpUpgradeListenerBuilder));
        #[cfg(unix)]
        {
            r.register_dialer("domainsocket", Arc::new(domainsocket::DomainSocketDialer));
            r.register_listener("domainsocket", Arc::new(domainsocket::DomainSocketListenerBuilder));
        }
        r
    }

    pub fn register_dialer(&mut self, name: impl Into<String>, dialer: Arc<dyn Dialer>) {
        self.dialers.insert(name.into(), dialer);
    }

    pub fn register_listener(&mut self, name: impl Into<String>, builder: Arc<dyn ListenerBuilder>) {
        self.listeners.insert(name.into(), builder);
    }

    pub fn dialer(&self, name: &str) -> Result<Arc<dyn Dialer>> {
        self.dialers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTransport(name.to_string()))
    }

    pub fn listener(&self, name: &str) -> Result<Arc<dyn ListenerBuilder>> {
        self.listeners
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownTransport(name.to_string()))
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// A dialer bound to its registry entry and stream settings; this is
/// what outbound handlers receive.
#[derive(Clone)]
pub struct BoundDialer {
    dialer: Arc<dyn Dialer>,
    settings: Arc<StreamSettings>,
}

impl BoundDialer {
    pub fn new(dialer: Arc<dyn Dialer>, settings: Arc<StreamSettings>) -> Self {
        Self { dialer, settings }
    }

    pub async fn dial(&self, dest: &Destination) -> Result<Connection> {
        self.dialer.dial(dest, &self.settings).await
    }
}
