//! Pooled byte buffers for packet-aligned I/O
//!
//! A `Buffer` is a fixed-capacity heap block leased from a process-wide
//! sharded pool. A `MultiBuffer` is an ordered sequence of buffers
//! delivered as one I/O unit; relays must preserve its order.

use lazy_static::lazy_static;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::Destination;

/// Buffer capacity. Sized so one buffer holds a full MTU-aligned
/// datagram with headroom.
pub const BUFFER_SIZE: usize = 8 * 1024;

const POOL_SHARDS: usize = 8;
const SHARD_CAPACITY: usize = 128;

struct Pool {
    shards: Vec<Mutex<Vec<Box<[u8]>>>>,
    next: AtomicUsize,
}

impl Pool {
    fn new() -> Self {
        Self {
            shards: (0..POOL_SHARDS).map(|_| Mutex::new(Vec::new())).collect(),
            next: AtomicUsize::new(0),
        }
    }

    fn get(&self) -> Box<[u8]> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % POOL_SHARDS;
        if let Some(storage) = self.shards[i].lock().pop() {
            return storage;
        }
        vec![0u8; BUFFER_SIZE].into_boxed_slice()
    }

    fn put(&self, storage: Box<[u8]>) {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % POOL_SHARDS;
        let mut shard = self.shards[i].lock();
        if shard.len() < SHARD_CAPACITY {
            shard.push(storage);
        }
    }
}

lazy_static! {
    static ref POOL: Pool = Pool::new();
}

/// An owned byte buffer leased from the pool.
///
/// `udp` carries the per-datagram destination for packet transports
/// that fan out buffers addressed individually.
pub struct Buffer {
    storage: Option<Box<[u8]>>,
    start: usize,
    end: usize,
    pub udp: Option<Destination>,
}

impl Buffer {
    /// Lease an empty buffer from the pool.
    pub fn new() -> Self {
        Self {
            storage: Some(POOL.get()),
            start: 0,
            end: 0,
            udp: None,
        }
    }

    /// A buffer pre-filled with `data` (truncated to capacity).
    pub fn from_slice(data: &[u8]) -> Self {
        let mut b = Buffer::new();
        b.extend_from_slice(data);
        b
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Remaining writable capacity.
    pub fn available(&self) -> usize {
        match &self.storage {
            Some(s) => s.len() - self.end,
            None => 0,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.storage {
            Some(s) => &s[self.start..self.end],
            None => &[],
        }
    }

    /// The unfilled tail, for reads that fill in place; commit the
    /// written length with [`Buffer::advance_end`].
    pub fn unfilled(&mut self) -> &mut [u8] {
        match &mut self.storage {
            Some(s) => &mut s[self.end..],
            None => &mut [],
        }
    }

    pub fn advance_end(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.storage.as_ref().map(|s| s.len()).unwrap_or(0));
        self.end += n;
    }

    /// Consume `n` bytes from the front.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.start + n <= self.end);
        self.start += n;
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.available());
        if let Some(s) = &mut self.storage {
            s[self.end..self.end + n].copy_from_slice(&data[..n]);
        }
        self.end += n;
        n
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Return the storage to the pool. Idempotent: releasing an
    /// already-released buffer is a no-op.
    pub fn release(&mut self) {
        if let Some(storage) = self.storage.take() {
            debug_assert_eq!(storage.len(), BUFFER_SIZE);
            self.start = 0;
            self.end = 0;
            self.udp = None;
            POOL.put(storage);
        }
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.len())
            .field("udp", &self.udp)
            .finish()
    }
}

/// Ordered sequence of buffers moved through the relay as one unit.
#[derive(Default, Debug)]
pub struct MultiBuffer(pub Vec<Buffer>);

impl MultiBuffer {
    pub fn new() -> Self {
        MultiBuffer(Vec::new())
    }

    pub fn one(buffer: Buffer) -> Self {
        MultiBuffer(vec![buffer])
    }

    pub fn from_slice(data: &[u8]) -> Self {
        let mut mb = MultiBuffer::new();
        for chunk in data.chunks(BUFFER_SIZE) {
            mb.push(Buffer::from_slice(chunk));
        }
        mb
    }

    /// Total payload bytes across all buffers.
    pub fn len(&self) -> usize {
        self.0.iter().map(Buffer::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Buffer::is_empty)
    }

    pub fn push(&mut self, buffer: Buffer) {
        self.0.push(buffer);
    }

    /// Detach the first buffer, preserving order of the rest.
    pub fn split_first(&mut self) -> Option<Buffer> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.remove(0))
        }
    }

    /// Copy the full payload out, in order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        for b in &self.0 {
            out.extend_from_slice(b.bytes());
        }
        out
    }

    /// Release every buffer back to the pool.
    pub fn release(&mut self) {
        for b in &mut self.0 {
            b.release();
        }
        self.0.clear();
    }
}

impl From<Vec<Buffer>> for MultiBuffer {
    fn from(v: Vec<Buffer>) -> Self {
        MultiBuffer(v)
    }
}

impl IntoIterator for MultiBuffer {
    type Item = Buffer;
    type IntoIter = std::vec::IntoIter<Buffer>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
