//! Link - the multi-buffer handoff between inbound and outbound
//!
//! A link is a connected pair of halves; what one half writes the
//! other half reads. Each direction is a bounded channel of
//! multi-buffers with an explicit, idempotent close signal.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{Error, Result};

use super::buffer::MultiBuffer;
use super::copy::{MultiBufferReader, MultiBufferWriter};

const LINK_DEPTH: usize = 16;

/// Read half of one link direction.
pub struct LinkReader {
    rx: mpsc::Receiver<MultiBuffer>,
}

/// Write half of one link direction.
///
/// Clones share the close signal: closing any clone closes the
/// direction. Writes are expected from a single producer.
#[derive(Clone)]
pub struct LinkWriter {
    tx: Arc<Mutex<Option<mpsc::Sender<MultiBuffer>>>>,
}

impl LinkWriter {
    /// Signal close. Idempotent; readers drain buffered data then EOF.
    pub fn close(&self) {
        self.tx.lock().take();
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

#[async_trait]
impl MultiBufferReader for LinkReader {
    async fn read_multi_buffer(&mut self) -> Result<Option<MultiBuffer>> {
        Ok(self.rx.recv().await)
    }
}

#[async_trait]
impl MultiBufferWriter for LinkWriter {
    async fn write_multi_buffer(&mut self, mut mb: MultiBuffer) -> Result<()> {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx.send(mb).await.map_err(|mpsc::error::SendError(mut lost)| {
                lost.release();
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "link closed by peer",
                ))
            }),
            None => {
                mb.release();
                Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "link closed",
                )))
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        LinkWriter::close(self);
        Ok(())
    }
}

/// One side of a session handoff: read what the peer wrote, write what
/// the peer will read.
pub struct Link {
    pub reader: LinkReader,
    pub writer: LinkWriter,
}

/// Build a connected pair of link halves.
///
/// The first element is the inbound half (uplink writer, downlink
/// reader); the second is the outbound half handed to a handler's
/// `process`.
pub fn link_pair() -> (Link, Link) {
    let (up_tx, up_rx) = mpsc::channel(LINK_DEPTH);
    let (down_tx, down_rx) = mpsc::channel(LINK_DEPTH);

    let inbound = Link {
        reader: LinkReader { rx: down_rx },
        writer: LinkWriter {
            tx: Arc::new(Mutex::new(Some(up_tx))),
        },
    };
    let outbound = Link {
        reader: LinkReader { rx: up_rx },
        writer: LinkWriter {
            tx: Arc::new(Mutex::new(Some(down_tx))),
        },
    };
    (inbound, outbound)
}
