//! KCP-style reliable datagram transport
//!
//! Stream bytes are carried in conversation-tagged segments over UDP.
//! Every segment carries the 16-bit conversation id, so the server
//! demultiplexes statelessly by (peer, conv) without a handshake.
//!
//! The conversation id comes from a global counter initialised with a
//! random 16-bit seed and truncated to 16 bits per dial. On wrap-around
//! a long-lived peer can collide with a new conversation; this mirrors
//! the historical wire behaviour and is kept as-is.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, trace, warn};

use crate::common::{Destination, Network};
use crate::error::Result;

use super::tcp::resolve_sock_addr;
use super::{ConnHandler, Connection, Dialer, Listener, ListenerBuilder, StreamSettings};

const CMD_PUSH: u8 = 0x51;
const CMD_ACK: u8 = 0x52;
const CMD_FIN: u8 = 0x54;

const HEADER_LEN: usize = 9;
const SEGMENT_MSS: usize = 1200;
const SEND_WINDOW: usize = 256;
const RTO: Duration = Duration::from_millis(300);
const TICK: Duration = Duration::from_millis(100);
const CHANNEL_DEPTH: usize = 64;

lazy_static! {
    static ref GLOBAL_CONV: AtomicU32 = AtomicU32::new(rand::random::<u16>() as u32);
}

/// Allocate the next conversation id. Monotonic modulo 2^16.
pub fn next_conv() -> u16 {
    GLOBAL_CONV.fetch_add(1, Ordering::SeqCst) as u16
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub conv: u16,
    pub cmd: u8,
    pub sn: u32,
    pub payload: Bytes,
}

impl Segment {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.conv.to_be_bytes());
        out.push(self.cmd);
        out.extend_from_slice(&self.sn.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn decode(data: &[u8]) -> Option<Segment> {
        if data.len() < HEADER_LEN {
            return None;
        }
        let conv = u16::from_be_bytes([data[0], data[1]]);
        let cmd = data[2];
        let sn = u32::from_be_bytes([data[3], data[4], data[5], data[6]]);
        let len = u16::from_be_bytes([data[7], data[8]]) as usize;
        if data.len() < HEADER_LEN + len {
            return None;
        }
        Some(Segment {
            conv,
            cmd,
            sn,
            payload: Bytes::copy_from_slice(&data[HEADER_LEN..HEADER_LEN + len]),
        })
    }
}

/// Where a conversation's outgoing segments go.
enum SegmentSink {
    /// Client side: connected socket
    Connected(Arc<UdpSocket>),
    /// Server side: shared listening socket, explicit peer
    Shared {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
}

impl SegmentSink {
    async fn send(&self, seg: &Segment) -> io::Result<()> {
        let data = seg.encode();
        match self {
            SegmentSink::Connected(socket) => {
                socket.send(&data).await?;
            }
            SegmentSink::Shared { socket, peer } => {
                socket.send_to(&data, *peer).await?;
            }
        }
        Ok(())
    }
}

/// Drive one conversation: segment outgoing bytes, retransmit until
/// acked, reorder incoming by sequence number, ack everything.
async fn run_conversation(
    conv: u16,
    sink: SegmentSink,
    mut seg_rx: mpsc::Receiver<Segment>,
    mut out_rx: mpsc::Receiver<Bytes>,
    in_tx: mpsc::Sender<Bytes>,
    token: CancellationToken,
) {
    let mut snd_nxt: u32 = 0;
    let mut unacked: BTreeMap<u32, (Segment, Instant)> = BTreeMap::new();
    let mut rcv_nxt: u32 = 0;
    let mut reorder: BTreeMap<u32, Segment> = BTreeMap::new();
    let mut local_fin = false;
    let mut peer_fin = false;
    let mut delivery = Some(in_tx);
    let mut tick = tokio::time::interval(TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        if local_fin && peer_fin && unacked.is_empty() {
            trace!("kcp conv {} complete", conv);
            return;
        }
        tokio::select! {
            seg = seg_rx.recv() => {
                let seg = match seg {
                    Some(seg) => seg,
                    None => return,
                };
                match seg.cmd {
                    CMD_ACK => {
                        unacked.remove(&seg.sn);
                    }
                    CMD_PUSH | CMD_FIN => {
                        let ack = Segment { conv, cmd: CMD_ACK, sn: seg.sn, payload: Bytes::new() };
                        if sink.send(&ack).await.is_err() {
                            return;
                        }
                        if seg.sn >= rcv_nxt {
                            reorder.insert(seg.sn, seg);
                        }
                        while let Some(next) = reorder.remove(&rcv_nxt) {
                            rcv_nxt = rcv_nxt.wrapping_add(1);
                            match next.cmd {
                                CMD_FIN => {
                                    peer_fin = true;
                                    delivery.take();
                                }
                                _ => {
                                    if let Some(tx) = &delivery {
                                        if tx.send(next.payload).await.is_err() {
                                            // Reader gone; keep acking so the
                                            // peer can finish.
                                            delivery = None;
                                        }
                                    }
                                }
                            }
                        }
                    }
                    other => trace!("kcp conv {}: unknown cmd {:#x}", conv, other),
                }
            }
            chunk = out_rx.recv(), if unacked.len() < SEND_WINDOW && !local_fin => {
                match chunk {
                    Some(data) => {
                        for piece in split_chunks(data) {
                            let seg = Segment { conv, cmd: CMD_PUSH, sn: snd_nxt, payload: piece };
                            snd_nxt = snd_nxt.wrapping_add(1);
                            if sink.send(&seg).await.is_err() {
                                return;
                            }
                            unacked.insert(seg.sn, (seg, Instant::now()));
                        }
                    }
                    None => {
                        local_fin = true;
                        let seg = Segment { conv, cmd: CMD_FIN, sn: snd_nxt, payload: Bytes::new() };
                        snd_nxt = snd_nxt.wrapping_add(1);
                        if sink.send(&seg).await.is_err() {
                            return;
                        }
                        unacked.insert(seg.sn, (seg, Instant::now()));
                    }
                }
            }
            _ = tick.tick() => {
                let now = Instant::now();
                for (_, (seg, last_sent)) in unacked.iter_mut() {
                    if now.duration_since(*last_sent) >= RTO {
                        if sink.send(seg).await.is_err() {
                            return;
                        }
                        *last_sent = now;
                    }
                }
            }
            _ = token.cancelled() => return,
        }
    }
}

fn split_chunks(data: Bytes) -> Vec<Bytes> {
    let mut out = Vec::with_capacity(data.len() / SEGMENT_MSS + 1);
    let mut rest = data;
    while rest.len() > SEGMENT_MSS {
        out.push(rest.split_to(SEGMENT_MSS));
    }
    out.push(rest);
    out
}

/// Byte-stream adapter over one conversation.
pub struct KcpStream {
    write: PollSender<Bytes>,
    read: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl KcpStream {
    fn new(write: PollSender<Bytes>, read: mpsc::Receiver<Bytes>) -> Self {
        Self {
            write,
            read,
            pending: Bytes::new(),
        }
    }
}

impl AsyncRead for KcpStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = self.pending.len().min(buf.remaining());
                buf.put_slice(&self.pending.split_to(n));
                return Poll::Ready(Ok(()));
            }
            match self.read.poll_recv(cx) {
                Poll::Ready(Some(data)) => {
                    self.pending = data;
                }
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for KcpStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.write.poll_reserve(cx) {
            Poll::Ready(Ok(())) => {
                let n = buf.len();
                if self.write.send_item(Bytes::copy_from_slice(buf)).is_err() {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::BrokenPipe,
                        "kcp conversation closed",
                    )));
                }
                Poll::Ready(Ok(n))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "kcp conversation closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Dropping the sender makes the conversation emit FIN.
        self.write.close();
        Poll::Ready(Ok(()))
    }
}

/// KCP dialer: one conversation per dial.
pub struct KcpDialer;

#[async_trait]
impl Dialer for KcpDialer {
    async fn dial(&self, dest: &Destination, _settings: &StreamSettings) -> Result<Connection> {
        // KCP always rides UDP, whatever the logical destination says.
        let mut udp_dest = dest.clone();
        udp_dest.network = Network::Udp;
        let remote = resolve_sock_addr(&udp_dest).await?;

        let bind: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = Arc::new(UdpSocket::bind(bind).await?);
        socket.connect(remote).await?;
        let local = socket.local_addr().ok();

        let conv = next_conv();
        debug!("kcp dial to {} conv {}", remote, conv);

        let (seg_tx, seg_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_DEPTH);
        let token = CancellationToken::new();

        // Datagram pump: everything not matching our conversation is
        // dropped on the floor.
        let recv_socket = socket.clone();
        let pump_token = token.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                tokio::select! {
                    received = recv_socket.recv(&mut buf) => match received {
                        Ok(n) => {
                            if let Some(seg) = Segment::decode(&buf[..n]) {
                                if seg.conv == conv && seg_tx.send(seg).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            debug!("kcp recv error: {}", e);
                            return;
                        }
                    },
                    _ = pump_token.cancelled() => return,
                }
            }
        });

        let conv_token = token.clone();
        tokio::spawn(async move {
            run_conversation(conv, SegmentSink::Connected(socket), seg_rx, out_rx, in_tx, conv_token).await;
            token.cancel();
        });

        let stream = KcpStream::new(PollSender::new(out_tx), in_rx);
        Ok(Connection::from_stream(stream, local, Some(remote)))
    }
}

/// KCP listener: demultiplex one UDP socket into conversations keyed
/// by (peer, conv).
pub struct KcpListenerBuilder;

type SessionMap = Arc<Mutex<HashMap<(SocketAddr, u16), mpsc::Sender<Segment>>>>;

#[async_trait]
impl ListenerBuilder for KcpListenerBuilder {
    async fn listen(
        &self,
        addr: SocketAddr,
        _settings: &StreamSettings,
        handler: ConnHandler,
    ) -> Result<Box<dyn Listener>> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr().ok();
        let token = CancellationToken::new();
        let sessions: SessionMap = Arc::new(Mutex::new(HashMap::new()));

        let demux_socket = socket.clone();
        let demux_token = token.clone();
        let demux_sessions = sessions.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let (n, peer) = tokio::select! {
                    received = demux_socket.recv_from(&mut buf) => match received {
                        Ok(r) => r,
                        Err(e) => {
                            warn!("kcp listener recv error: {}", e);
                            continue;
                        }
                    },
                    _ = demux_token.cancelled() => return,
                };
                let seg = match Segment::decode(&buf[..n]) {
                    Some(seg) => seg,
                    None => continue,
                };
                let key = (peer, seg.conv);

                let existing = demux_sessions.lock().get(&key).cloned();
                let seg_tx = match existing {
                    Some(tx) => tx,
                    None => {
                        // Fresh conversations start with data; strays
                        // (late acks, fins) are ignored.
                        if seg.cmd != CMD_PUSH {
                            continue;
                        }
                        let conv = seg.conv;
                        debug!("kcp accept from {} conv {}", peer, conv);
                        let (seg_tx, seg_rx) = mpsc::channel(CHANNEL_DEPTH);
                        let (out_tx, out_rx) = mpsc::channel(CHANNEL_DEPTH);
                        let (in_tx, in_rx) = mpsc::channel(CHANNEL_DEPTH);
                        demux_sessions.lock().insert(key, seg_tx.clone());

                        let sink = SegmentSink::Shared { socket: demux_socket.clone(), peer };
                        let conv_token = demux_token.child_token();
                        let cleanup = demux_sessions.clone();
                        tokio::spawn(async move {
                            run_conversation(conv, sink, seg_rx, out_rx, in_tx, conv_token).await;
                            cleanup.lock().remove(&key);
                        });

                        let stream = KcpStream::new(PollSender::new(out_tx), in_rx);
                        handler(Connection::from_stream(
                            stream,
                            demux_socket.local_addr().ok(),
                            Some(peer),
                        ));
                        seg_tx
                    }
                };
                if seg_tx.send(seg).await.is_err() {
                    demux_sessions.lock().remove(&key);
                }
            }
        });

        Ok(Box::new(KcpListenerHandle { local_addr, token }))
    }
}

struct KcpListenerHandle {
    local_addr: Option<SocketAddr>,
    token: CancellationToken,
}

impl Listener for KcpListenerHandle {
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
    use crate::common::Address;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_conv_ids_monotonic() {
        let a = next_conv();
        let b = next_conv();
        assert_eq!(b, a.wrapping_add(1));
    }

    #[test]
    fn test_segment_round_trip() {
        let seg = Segment {
            conv: 0xBEEF,
            cmd: CMD_PUSH,
            sn: 42,
            payload: Bytes::from_static(b"payload"),
        };
        let decoded = Segment::decode(&seg.encode()).unwrap();
        assert_eq!(decoded, seg);
    }

    #[test]
    fn test_segment_decode_rejects_truncated() {
        let seg = Segment {
            conv: 1,
            cmd: CMD_PUSH,
            sn: 0,
            payload: Bytes::from_static(b"abcdef"),
        };
        let mut data = seg.encode();
        data.truncate(data.len() - 2);
        assert!(Segment::decode(&data).is_none());
    }

    #[tokio::test]
    async fn test_kcp_end_to_end() {
        let echoed = Arc::new(tokio::sync::Notify::new());
        let notify = echoed.clone();
        let handler: ConnHandler = Arc::new(move |mut conn| {
            let notify = notify.clone();
            tokio::spawn(async move {
                if let Connection::Stream(c) = &mut conn {
                    let mut buf = vec![0u8; 5];
                    c.stream.read_exact(&mut buf).await.unwrap();
                    c.stream.write_all(&buf).await.unwrap();
                }
                notify.notified().await;
            });
        });

        let listener = KcpListenerBuilder
            .listen("127.0.0.1:0".parse().unwrap(), &StreamSettings::default(), handler)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();

        let dest = Destination::udp(Address::Ip(addr.ip()), addr.port());
        let conn = KcpDialer.dial(&dest, &StreamSettings::default()).await.unwrap();
        let mut stream = match conn {
            Connection::Stream(c) => c.stream,
            Connection::Packet(_) => panic!("kcp must present a stream"),
        };

        stream.write_all(b"hello").await.unwrap();
        let mut buf = vec![0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        echoed.notify_one();
        listener.close();
    }
}
