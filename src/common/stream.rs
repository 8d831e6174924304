//! Stream abstraction
//!
//! Unified byte-stream type all layers operate on, plus the packet
//! counterpart for datagram transports and the byte-counter hook the
//! relay exposes to statistics collaborators.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// The core stream type used throughout the crate.
pub type Stream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Trait for types that can be converted into a Stream
pub trait IntoStream {
    fn into_stream(self) -> Stream;
}

impl<T> IntoStream for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn into_stream(self) -> Stream {
        Box::new(self)
    }
}

/// Datagram-oriented connection surface. Packet transports expose this
/// instead of faking stream semantics; the relay picks a packet framer
/// for it.
#[async_trait]
pub trait PacketConn: Send + Sync {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Byte counter consumed by relays. Implementations are expected to be
/// cheap and lock-free (e.g. a prometheus counter).
pub trait Counter: Send + Sync {
    fn add(&self, n: u64);
}

/// Stream wrapper feeding read/write byte counts into [`Counter`]s.
pub struct CounterStream {
    inner: Stream,
    read_counter: Option<Arc<dyn Counter>>,
    write_counter: Option<Arc<dyn Counter>>,
}

impl CounterStream {
    pub fn new(
        inner: Stream,
        read_counter: Option<Arc<dyn Counter>>,
        write_counter: Option<Arc<dyn Counter>>,
    ) -> Self {
        Self {
            inner,
            read_counter,
            write_counter,
        }
    }
}

impl AsyncRead for CounterStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = buf.filled().len() - before;
            if n > 0 {
                if let Some(c) = &self.read_counter {
                    c.add(n as u64);
                }
            }
        }
        result
    }
}

impl AsyncWrite for CounterStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            if n > 0 {
                if let Some(c) = &self.write_counter {
                    c.add(n as u64);
                }
            }
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
