//! Multi-buffer copy primitives
//!
//! `copy` pulls multi-buffers from a reader and pushes them to a writer
//! until EOF or error, optionally ticking an activity callback after
//! each successful write so an inactivity watchdog can refresh its
//! deadline.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::{Error, Result};

use super::buffer::{Buffer, MultiBuffer};

/// Source of multi-buffers. `Ok(None)` signals EOF.
#[async_trait]
pub trait MultiBufferReader: Send {
    async fn read_multi_buffer(&mut self) -> Result<Option<MultiBuffer>>;
}

/// Sink of multi-buffers. Takes ownership; the writer releases the
/// buffers once they are on the wire.
#[async_trait]
pub trait MultiBufferWriter: Send {
    async fn write_multi_buffer(&mut self, mb: MultiBuffer) -> Result<()>;

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Half-close: no more writes will follow. Peers should see EOF.
    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Activity callback invoked after each successful write.
pub type Tick<'a> = Option<&'a (dyn Fn() + Send + Sync)>;

/// Copy everything from `reader` to `writer`.
///
/// Read failures surface as *copy-read-error*, write failures as
/// *copy-write-error*, both carrying the original cause.
pub async fn copy<R, W>(reader: &mut R, writer: &mut W, tick: Tick<'_>) -> Result<()>
where
    R: MultiBufferReader + ?Sized,
    W: MultiBufferWriter + ?Sized,
{
    loop {
        let mb = match reader.read_multi_buffer().await {
            Ok(Some(mb)) => mb,
            Ok(None) => break,
            Err(e) => return Err(Error::CopyRead(Box::new(e))),
        };
        if mb.is_empty() {
            continue;
        }
        writer
            .write_multi_buffer(mb)
            .await
            .map_err(|e| Error::CopyWrite(Box::new(e)))?;
        if let Some(tick) = tick {
            tick();
        }
    }
    writer
        .flush()
        .await
        .map_err(|e| Error::CopyWrite(Box::new(e)))?;
    Ok(())
}

/// Reader over any `AsyncRead`, one pooled buffer per read.
pub struct StreamReader<R> {
    inner: R,
}

impl<R> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<R> MultiBufferReader for StreamReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn read_multi_buffer(&mut self) -> Result<Option<MultiBuffer>> {
        let mut buffer = Buffer::new();
        let n = self.inner.read(buffer.unfilled()).await?;
        if n == 0 {
            buffer.release();
            return Ok(None);
        }
        buffer.advance_end(n);
        Ok(Some(MultiBuffer::one(buffer)))
    }
}

/// Writer over any `AsyncWrite`.
pub struct StreamWriter<W> {
    inner: W,
}

impl<W> StreamWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

#[async_trait]
impl<W> MultiBufferWriter for StreamWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_multi_buffer(&mut self, mb: MultiBuffer) -> Result<()> {
        for mut buffer in mb {
            self.inner.write_all(buffer.bytes()).await?;
            buffer.release();
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Serialises concurrent `write_multi_buffer` calls so writes never
/// interleave at the byte level.
pub struct SequentialWriter<W> {
    inner: std::sync::Arc<Mutex<W>>,
}

impl<W> SequentialWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: std::sync::Arc::new(Mutex::new(inner)),
        }
    }
}

impl<W> Clone for SequentialWriter<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[async_trait]
impl<W> MultiBufferWriter for SequentialWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_multi_buffer(&mut self, mb: MultiBuffer) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for mut buffer in mb {
            inner.write_all(buffer.bytes()).await?;
            buffer.release();
        }
        inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.lock().await.shutdown().await?;
        Ok(())
    }
}

/// Coalesces small writes into one transport write until flushed or
/// buffering is toggled off. Toggling off flushes synchronously.
pub struct BufferedWriter<W> {
    inner: W,
    pending: Buffer,
    buffered: bool,
}

impl<W> BufferedWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: Buffer::new(),
            buffered: true,
        }
    }

    pub async fn set_buffered(&mut self, buffered: bool) -> Result<()> {
        self.buffered = buffered;
        if !buffered {
            self.flush_pending().await?;
        }
        Ok(())
    }

    async fn flush_pending(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            self.inner.write_all(self.pending.bytes()).await?;
            self.pending.clear();
        }
        self.inner.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W> MultiBufferWriter for BufferedWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_multi_buffer(&mut self, mb: MultiBuffer) -> Result<()> {
        for mut buffer in mb {
            if !self.buffered {
                self.inner.write_all(buffer.bytes()).await?;
                buffer.release();
                continue;
            }
            let mut data = buffer.bytes();
            while !data.is_empty() {
                let n = self.pending.extend_from_slice(data);
                data = &data[n..];
                if self.pending.available() == 0 {
                    self.inner.write_all(self.pending.bytes()).await?;
                    self.pending.clear();
                }
            }
            buffer.release();
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.flush_pending().await
    }

    async fn close(&mut self) -> Result<()> {
        self.flush_pending().await?;
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_copy_moves_all_bytes() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, _server_write) = tokio::io::split(server);
        let (_client_read, client_write) = tokio::io::split(client);

        let mut writer = StreamWriter::new(client_write);
        writer
            .write_multi_buffer(MultiBuffer::from_slice(b"relay me"))
            .await
            .unwrap();
        drop(writer);

        let mut reader = StreamReader::new(server_read);
        let mb = reader.read_multi_buffer().await.unwrap().unwrap();
        assert_eq!(mb.to_bytes(), b"relay me");
        // Sender gone: EOF.
        assert!(reader.read_multi_buffer().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_copy_ticks_per_write() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let ticks = std::sync::Arc::new(AtomicUsize::new(0));

        let (client, server) = tokio::io::duplex(4096);
        let (server_read, _keep) = tokio::io::split(server);
        let (_keep2, client_write) = tokio::io::split(client);

        let writer_task = tokio::spawn(async move {
            let mut w = StreamWriter::new(client_write);
            for _ in 0..3 {
                w.write_multi_buffer(MultiBuffer::from_slice(b"chunk")).await.unwrap();
            }
        });

        let mut reader = StreamReader::new(server_read);
        let mut sink = StreamWriter::new(tokio::io::sink());
        let t = ticks.clone();
        let tick = move || {
            t.fetch_add(1, Ordering::Relaxed);
        };
        copy(&mut reader, &mut sink, Some(&tick)).await.unwrap();

        writer_task.await.unwrap();
        assert!(ticks.load(Ordering::Relaxed) >= 1);
    }

    #[tokio::test]
    async fn test_buffered_writer_coalesces() {
        let (client, server) = tokio::io::duplex(65536);
        let (mut server_read, _kw) = tokio::io::split(server);
        let (_kr, client_write) = tokio::io::split(client);

        let mut w = BufferedWriter::new(client_write);
        w.write_multi_buffer(MultiBuffer::from_slice(b"aa")).await.unwrap();
        w.write_multi_buffer(MultiBuffer::from_slice(b"bb")).await.unwrap();
        // Nothing on the wire yet; toggling buffering off flushes.
        w.set_buffered(false).await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 4];
        server_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"aabb");
    }
}
