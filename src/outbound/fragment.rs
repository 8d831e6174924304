//! Fragmenting writers (TLS ClientHello obfuscation)
//!
//! Two modes, selected by the packet range:
//! - start=0, end=1: only the first record of type 22 (handshake) is
//!   split into randomly sized fragments, each emitted as its own TLS
//!   record reusing the original version bytes.
//! - any other range: writes numbered start..=end are split into plain
//!   chunks; everything else passes through.
//!
//! Fragment sizes and inter-fragment sleeps are drawn from the OS
//! cryptographic RNG.

use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::Rng;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::common::{MultiBuffer, MultiBufferWriter};
use crate::error::Result;

const TLS_HANDSHAKE: u8 = 22;
const TLS_HEADER_LEN: usize = 5;

#[derive(Debug, Clone)]
pub struct FragmentConfig {
    /// First write (1-based) subject to splitting; 0 selects
    /// ClientHello mode together with `end_packet == 1`.
    pub start_packet: u64,
    pub end_packet: u64,
    pub min_length: u64,
    pub max_length: u64,
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
}

impl FragmentConfig {
    pub fn client_hello_mode(&self) -> bool {
        self.start_packet == 0 && self.end_packet == 1
    }
}

fn rand_between(left: u64, right: u64) -> u64 {
    if left >= right {
        return left;
    }
    OsRng.gen_range(left..=right)
}

async fn jitter(config: &FragmentConfig) {
    let interval = rand_between(config.min_interval_ms, config.max_interval_ms);
    if interval > 0 {
        tokio::time::sleep(Duration::from_millis(interval)).await;
    }
}

/// Multi-buffer writer that fragments stream writes before they reach
/// the transport connection.
pub struct FragmentWriter<W> {
    inner: W,
    config: FragmentConfig,
    packet_count: u64,
}

impl<W> FragmentWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(inner: W, config: FragmentConfig) -> Self {
        Self {
            inner,
            config,
            packet_count: 0,
        }
    }

    async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.packet_count += 1;

        if self.config.client_hello_mode() {
            if self.packet_count == 1 && data.len() >= TLS_HEADER_LEN && data[0] == TLS_HANDSHAKE {
                return self.write_fragmented_client_hello(data).await;
            }
            self.inner.write_all(data).await?;
            return Ok(());
        }

        let in_range = self.packet_count >= self.config.start_packet
            && self.packet_count <= self.config.end_packet;
        if !in_range || data.len() as u64 <= self.config.min_length {
            self.inner.write_all(data).await?;
            return Ok(());
        }

        let mut offset = 0usize;
        while offset < data.len() {
            let step = rand_between(self.config.min_length, self.config.max_length) as usize;
            let end = (offset + step.max(1)).min(data.len());
            self.inner.write_all(&data[offset..end]).await?;
            offset = end;
            if offset < data.len() {
                jitter(&self.config).await;
            }
        }
        Ok(())
    }

    /// Split the first handshake record into records of the same type
    /// and version, each carrying a random slice of the payload.
    async fn write_fragmented_client_hello(&mut self, data: &[u8]) -> Result<()> {
        let record_len = usize::from(u16::from_be_bytes([data[3], data[4]]));
        let payload_end = (TLS_HEADER_LEN + record_len).min(data.len());
        let payload = &data[TLS_HEADER_LEN..payload_end];

        let mut offset = 0usize;
        while offset < payload.len() {
            let step = rand_between(self.config.min_length, self.config.max_length) as usize;
            let end = (offset + step.max(1)).min(payload.len());
            let fragment = &payload[offset..end];
            offset = end;

            let mut record = Vec::with_capacity(TLS_HEADER_LEN + fragment.len());
            record.push(data[0]);
            record.extend_from_slice(&data[1..3]);
            record.extend_from_slice(&(fragment.len() as u16).to_be_bytes());
            record.extend_from_slice(fragment);
            self.inner.write_all(&record).await?;
            jitter(&self.config).await;
        }

        // Anything after the first record in the same write flight
        // passes through untouched.
        if payload_end < data.len() {
            self.inner.write_all(&data[payload_end..]).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<W> MultiBufferWriter for FragmentWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn write_multi_buffer(&mut self, mb: MultiBuffer) -> Result<()> {
        for mut buffer in mb {
            self.write_chunk(buffer.bytes()).await?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex};
    use std::task::{Context, Poll};

    /// Records each poll_write call separately.
    #[derive(Clone, Default)]
    struct WriteRecorder {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl AsyncWrite for WriteRecorder {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.writes.lock().unwrap().push(buf.to_vec());
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn client_hello(payload_len: usize) -> Vec<u8> {
        let mut hello = vec![TLS_HANDSHAKE, 0x03, 0x01];
        hello.extend_from_slice(&(payload_len as u16).to_be_bytes());
        hello.extend((0..payload_len).map(|i| i as u8));
        hello
    }

    fn no_jitter(start: u64, end: u64, min: u64, max: u64) -> FragmentConfig {
        FragmentConfig {
            start_packet: start,
            end_packet: end,
            min_length: min,
            max_length: max,
            min_interval_ms: 0,
            max_interval_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_client_hello_split_into_records() {
        let recorder = WriteRecorder::default();
        let mut writer = FragmentWriter::new(recorder.clone(), no_jitter(0, 1, 10, 20));

        // 100-byte handshake message: 5-byte header + 95-byte payload.
        let hello = client_hello(95);
        writer
            .write_multi_buffer(MultiBuffer::from_slice(&hello))
            .await
            .unwrap();

        let writes = recorder.writes.lock().unwrap();
        assert!(writes.len() >= 5, "expected >=5 records, got {}", writes.len());

        let mut reassembled = Vec::new();
        for record in writes.iter() {
            // Each record reuses the original type and version bytes.
            assert_eq!(record[0], TLS_HANDSHAKE);
            assert_eq!(&record[1..3], &hello[1..3]);
            let len = usize::from(u16::from_be_bytes([record[3], record[4]]));
            assert_eq!(record.len(), TLS_HEADER_LEN + len);
            assert!(len >= 10 && len <= 20 || reassembled.len() + len == 95);
            reassembled.extend_from_slice(&record[TLS_HEADER_LEN..]);
        }
        // Receiver-side reassembly reproduces the original payload.
        assert_eq!(reassembled, &hello[TLS_HEADER_LEN..]);
        let total: usize = writes.iter().map(|w| w.len() - TLS_HEADER_LEN).sum();
        assert_eq!(total, 95);
    }

    #[tokio::test]
    async fn test_client_hello_mode_passes_other_writes() {
        let recorder = WriteRecorder::default();
        let mut writer = FragmentWriter::new(recorder.clone(), no_jitter(0, 1, 10, 20));

        // Not a handshake record: passes through whole.
        writer
            .write_multi_buffer(MultiBuffer::from_slice(&[0x17; 64]))
            .await
            .unwrap();
        // Second write never fragments, even if it looks like one.
        writer
            .write_multi_buffer(MultiBuffer::from_slice(&client_hello(40)))
            .await
            .unwrap();

        assert_eq!(recorder.writes.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_packet_range_mode() {
        let recorder = WriteRecorder::default();
        let mut writer = FragmentWriter::new(recorder.clone(), no_jitter(2, 2, 4, 8));

        writer
            .write_multi_buffer(MultiBuffer::from_slice(&[1u8; 30]))
            .await
            .unwrap();
        writer
            .write_multi_buffer(MultiBuffer::from_slice(&[2u8; 30]))
            .await
            .unwrap();
        writer
            .write_multi_buffer(MultiBuffer::from_slice(&[3u8; 30]))
            .await
            .unwrap();

        let writes = recorder.writes.lock().unwrap();
        // Write #1 and #3 pass through; #2 is split into 4..=8 chunks.
        assert_eq!(writes[0], vec![1u8; 30]);
        assert_eq!(*writes.last().unwrap(), vec![3u8; 30]);
        let middle: Vec<&Vec<u8>> = writes[1..writes.len() - 1].iter().collect();
        assert!(middle.len() >= 4);
        let total: usize = middle.iter().map(|w| w.len()).sum();
        assert_eq!(total, 30);
        assert!(middle.iter().all(|w| w.iter().all(|&b| b == 2)));
    }

    #[test]
    fn test_rand_between_bounds() {
        for _ in 0..100 {
            let v = rand_between(10, 20);
            assert!((10..=20).contains(&v));
        }
        assert_eq!(rand_between(7, 7), 7);
    }
}
