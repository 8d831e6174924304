//! Health observatory
//!
//! Periodically probes each registered outbound tag by running a small
//! HTTP exchange through the handler and measuring success and
//! latency. Results live in an atomically swapped snapshot; readers
//! never block the prober.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::{
    link_pair, Address, Destination, Metadata, MultiBuffer, MultiBufferReader, MultiBufferWriter,
    SessionContext,
};
use crate::outbound::Manager;

/// Health of one outbound tag as of the last probe.
#[derive(Debug, Clone)]
pub struct OutboundStatus {
    pub alive: bool,
    pub latency: Duration,
    pub last_seen: Instant,
}

#[derive(Debug, Clone)]
pub struct ObservatoryConfig {
    /// Host probed through each outbound
    pub probe_host: String,
    pub probe_port: u16,
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive failures before a tag is declared dead
    pub failure_threshold: u32,
}

impl Default for ObservatoryConfig {
    fn default() -> Self {
        Self {
            probe_host: "www.google.com".to_string(),
            probe_port: 80,
            interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

type Snapshot = HashMap<String, OutboundStatus>;

/// Snapshot holder plus the probe loop.
pub struct Observatory {
    snapshot: ArcSwap<Snapshot>,
    config: ObservatoryConfig,
}

impl Observatory {
    pub fn new(config: ObservatoryConfig) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(Snapshot::new()),
            config,
        }
    }

    /// Lock-free snapshot read.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    pub fn status_of(&self, tag: &str) -> Option<OutboundStatus> {
        self.snapshot.load().get(tag).cloned()
    }

    /// Swap one tag's status into a fresh snapshot.
    pub fn set_status(&self, tag: &str, status: OutboundStatus) {
        let mut next: Snapshot = (**self.snapshot.load()).clone();
        next.insert(tag.to_string(), status);
        self.snapshot.store(Arc::new(next));
    }

    /// Start probing every tag currently registered in `manager`.
    /// Stops when `token` is cancelled.
    pub fn start(self: Arc<Self>, manager: Arc<Manager>, token: CancellationToken) {
        let observatory = self;
        tokio::spawn(async move {
            let mut failures: HashMap<String, u32> = HashMap::new();
            let mut ticker = tokio::time::interval(observatory.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = token.cancelled() => return,
                }
                for tag in manager.tags() {
                    let started = Instant::now();
                    let healthy = observatory.probe_tag(&manager, &tag).await;
                    let latency = started.elapsed();

                    let streak = failures.entry(tag.clone()).or_insert(0);
                    if healthy {
                        *streak = 0;
                    } else {
                        *streak += 1;
                    }
                    let alive = *streak < observatory.config.failure_threshold;
                    if !alive {
                        info!("outbound [{}] marked dead after {} failures", tag, streak);
                    }
                    debug!("probe [{}]: healthy={} latency={:?}", tag, healthy, latency);
                    observatory.set_status(
                        &tag,
                        OutboundStatus {
                            alive,
                            latency,
                            last_seen: Instant::now(),
                        },
                    );
                }
            }
        });
    }

    /// One probe: HEAD request relayed through the handler, success is
    /// any response bytes before the timeout.
    async fn probe_tag(&self, manager: &Manager, tag: &str) -> bool {
        let (handler, dialer) = match manager.get(tag) {
            Ok(pair) => pair,
            Err(_) => return false,
        };
        let destination = Destination::tcp(
            Address::parse(&self.config.probe_host),
            self.config.probe_port,
        );
        let ctx = SessionContext::new(
            Metadata::new(destination).with_inbound_tag("observatory"),
        );
        let (mut probe_link, outbound_link) = link_pair();

        let session_token = ctx.token.clone();
        let process = tokio::spawn(async move {
            let result = handler.process(&ctx, outbound_link, &dialer).await;
            session_token.cancel();
            result
        });

        let request = format!(
            "HEAD / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.config.probe_host
        );
        let exchange = async {
            probe_link
                .writer
                .write_multi_buffer(MultiBuffer::from_slice(request.as_bytes()))
                .await?;
            probe_link.writer.close();
            match probe_link.reader.read_multi_buffer().await? {
                Some(mb) => Ok::<bool, crate::error::Error>(!mb.is_empty()),
                None => Ok(false),
            }
        };

        let healthy = match tokio::time::timeout(self.config.probe_timeout, exchange).await {
            Ok(Ok(got_bytes)) => got_bytes,
            Ok(Err(_)) | Err(_) => false,
        };
        process.abort();
        healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_swap_is_visible() {
        let observatory = Observatory::new(ObservatoryConfig::default());
        assert!(observatory.status_of("a").is_none());

        observatory.set_status(
            "a",
            OutboundStatus {
                alive: false,
                latency: Duration::from_millis(12),
                last_seen: Instant::now(),
            },
        );
        let old = observatory.snapshot();
        observatory.set_status(
            "a",
            OutboundStatus {
                alive: true,
                latency: Duration::from_millis(5),
                last_seen: Instant::now(),
            },
        );

        // Readers holding the previous snapshot still see it; new
        // reads see the replacement.
        assert!(!old.get("a").unwrap().alive);
        assert!(observatory.status_of("a").unwrap().alive);
    }
}
