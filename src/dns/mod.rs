//! DNS client with cache
//!
//! Serves the router and outbounds with IPv4/IPv6-selectable,
//! TTL-respecting answers. Multiple upstreams race first-success with
//! a per-server timeout; concurrent lookups for one key join the
//! in-flight query instead of stampeding the upstreams.

pub mod cache;
pub mod nameserver;

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::{Error, Result};

pub use cache::{CacheKey, DnsCache, MAX_TTL, MIN_TTL};
pub use nameserver::{name_server_from_url, DnsAnswer, NameServer};

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(4);

/// Address family selection for a lookup. `fake` is a hint for FakeDNS
/// deployments; the core plumbs it through without acting on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpOption {
    pub ipv4: bool,
    pub ipv6: bool,
    pub fake: bool,
}

impl IpOption {
    pub fn both() -> Self {
        Self {
            ipv4: true,
            ipv6: true,
            fake: false,
        }
    }

    pub fn ipv4_only() -> Self {
        Self {
            ipv4: true,
            ipv6: false,
            fake: false,
        }
    }

    pub fn ipv6_only() -> Self {
        Self {
            ipv4: false,
            ipv6: true,
            fake: false,
        }
    }

    pub fn family_mask(&self) -> u8 {
        (self.ipv4 as u8) | ((self.ipv6 as u8) << 1)
    }
}

impl Default for IpOption {
    fn default() -> Self {
        Self::both()
    }
}

type InflightMap = Mutex<HashMap<CacheKey, broadcast::Sender<Option<Vec<IpAddr>>>>>;

/// Cache-backed resolver multiplexing over configured name servers.
pub struct DnsClient {
    servers: Vec<Arc<dyn NameServer>>,
    cache: DnsCache,
    inflight: InflightMap,
    query_timeout: Duration,
}

impl DnsClient {
    pub fn new(servers: Vec<Arc<dyn NameServer>>) -> Self {
        Self {
            servers,
            cache: DnsCache::new(),
            inflight: Mutex::new(HashMap::new()),
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// Build from name server URLs; an empty list falls back to the
    /// system resolver.
    pub fn from_urls(urls: &[String]) -> Result<Self> {
        let servers = if urls.is_empty() {
            vec![name_server_from_url("localhost")?]
        } else {
            urls.iter()
                .map(|u| name_server_from_url(u))
                .collect::<Result<Vec<_>>>()?
        };
        Ok(Self::new(servers))
    }

    pub fn with_query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Resolve `domain` honoring the cache.
    pub async fn lookup_ip(&self, domain: &str, option: IpOption) -> Result<Vec<IpAddr>> {
        self.lookup_ip_with(domain, option, false).await
    }

    /// Resolve `domain`. `disable_cache` forces a network query but a
    /// successful answer still updates the cache.
    pub async fn lookup_ip_with(
        &self,
        domain: &str,
        option: IpOption,
        disable_cache: bool,
    ) -> Result<Vec<IpAddr>> {
        if domain.is_empty() {
            return Err(Error::LookupFailed(String::new(), "empty domain".into()));
        }
        if let Ok(ip) = domain.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let key = CacheKey::new(domain, option.family_mask());

        if !disable_cache {
            if let Some(ips) = self.cache.get_fresh(&key) {
                return Ok(ips);
            }
        }

        // Join an in-flight query for the same key, or become it.
        let mut rx = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    inflight.insert(key.clone(), tx);
                    None
                }
            }
        };

        if let Some(rx) = rx.as_mut() {
            match rx.recv().await {
                Ok(Some(ips)) => return Ok(ips),
                Ok(None) | Err(_) => return self.serve_stale(domain, &key),
            }
        }

        let outcome = self.query_servers(domain, option).await;

        // Update the cache before releasing the in-flight slot so a
        // late joiner falls through to a fresh hit, not a re-query.
        if let Ok(answer) = &outcome {
            self.cache.insert(key.clone(), answer.ips.clone(), answer.ttl);
        }
        let reply = match &outcome {
            Ok(answer) => Some(answer.ips.clone()),
            Err(_) => None,
        };
        if let Some(tx) = self.inflight.lock().remove(&key) {
            let _ = tx.send(reply);
        }

        match outcome {
            Ok(answer) => Ok(answer.ips),
            Err(e) => {
                debug!("all DNS upstreams failed for {}: {}", domain, e);
                self.serve_stale(domain, &key).map_err(|_| e)
            }
        }
    }

    fn serve_stale(&self, domain: &str, key: &CacheKey) -> Result<Vec<IpAddr>> {
        match self.cache.get_stale(key) {
            Some(ips) => {
                info!("serving stale DNS answer for {}", domain);
                Ok(ips)
            }
            None => Err(Error::LookupFailed(domain.to_string(), "no upstream answered".into())),
        }
    }

    /// First success across all servers, each under its own timeout.
    async fn query_servers(&self, domain: &str, option: IpOption) -> Result<DnsAnswer> {
        if self.servers.is_empty() {
            return Err(Error::LookupFailed(domain.to_string(), "no name servers".into()));
        }
        let mut queries = FuturesUnordered::new();
        for server in &self.servers {
            let server = server.clone();
            let domain = domain.to_string();
            let timeout = self.query_timeout;
            queries.push(async move {
                match tokio::time::timeout(timeout, server.query_ip(&domain, None, option)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::DeadlineExceeded),
                }
            });
        }

        let mut last_err = None;
        while let Some(result) = queries.next().await {
            match result {
                Ok(answer) if !answer.ips.is_empty() => return Ok(answer),
                Ok(_) => last_err = Some(Error::LookupFailed(domain.to_string(), "empty answer".into())),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::LookupFailed(domain.to_string(), "no upstream answered".into())
        }))
    }

    pub fn cache(&self) -> &DnsCache {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedServer {
        calls: AtomicUsize,
        fail_after: usize,
        delay: Duration,
    }

    impl ScriptedServer {
        fn answering() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_after: usize::MAX,
                delay: Duration::ZERO,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_after: 0,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl NameServer for ScriptedServer {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn query_ip(
            &self,
            domain: &str,
            _client_ip: Option<std::net::IpAddr>,
            _option: IpOption,
        ) -> Result<DnsAnswer> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.fail_after {
                return Err(Error::LookupFailed(domain.to_string(), "scripted failure".into()));
            }
            Ok(DnsAnswer {
                ips: vec!["10.0.0.1".parse().unwrap()],
                ttl: 60,
            })
        }
    }

    #[tokio::test]
    async fn test_cache_hit_serves_identical_answer() {
        let server = Arc::new(ScriptedServer::answering());
        let client = DnsClient::new(vec![server.clone()]);

        let first = client.lookup_ip("example.com", IpOption::both()).await.unwrap();
        let second = client.lookup_ip("example.com", IpOption::both()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disable_cache_forces_query_but_updates() {
        let server = Arc::new(ScriptedServer::answering());
        let client = DnsClient::new(vec![server.clone()]);

        client.lookup_ip("example.com", IpOption::both()).await.unwrap();
        client
            .lookup_ip_with("example.com", IpOption::both(), true)
            .await
            .unwrap();
        assert_eq!(server.calls.load(Ordering::SeqCst), 2);

        // The forced query refreshed the cache; this one is a hit.
        client.lookup_ip("example.com", IpOption::both()).await.unwrap();
        assert_eq!(server.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_stale_served_on_upstream_failure() {
        let server = Arc::new(ScriptedServer {
            calls: AtomicUsize::new(0),
            fail_after: 1,
            delay: Duration::ZERO,
        });
        let client = DnsClient::new(vec![server]);

        client.lookup_ip("example.com", IpOption::both()).await.unwrap();
        client
            .cache()
            .expire_now(&CacheKey::new("example.com", IpOption::both().family_mask()));

        // Upstream now fails; the expired entry is still served.
        let ips = client.lookup_ip("example.com", IpOption::both()).await.unwrap();
        assert_eq!(ips, vec!["10.0.0.1".parse::<std::net::IpAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_failure_without_cache_is_lookup_failed() {
        let client = DnsClient::new(vec![Arc::new(ScriptedServer::failing())]);
        let err = client.lookup_ip("missing.example", IpOption::both()).await.unwrap_err();
        assert!(matches!(err, Error::LookupFailed(_, _)));
    }

    #[tokio::test]
    async fn test_race_prefers_first_success() {
        let slow = Arc::new(ScriptedServer {
            calls: AtomicUsize::new(0),
            fail_after: usize::MAX,
            delay: Duration::from_millis(200),
        });
        let fast = Arc::new(ScriptedServer::answering());
        let client = DnsClient::new(vec![slow, fast]);

        let start = std::time::Instant::now();
        client.lookup_ip("example.com", IpOption::both()).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_inflight_dedup_joins_single_query() {
        let server = Arc::new(ScriptedServer {
            calls: AtomicUsize::new(0),
            fail_after: usize::MAX,
            delay: Duration::from_millis(50),
        });
        let client = Arc::new(DnsClient::new(vec![server.clone()]));

        let mut joins = Vec::new();
        for _ in 0..8 {
            let client = client.clone();
            joins.push(tokio::spawn(async move {
                client.lookup_ip("example.com", IpOption::both()).await.unwrap()
            }));
        }
        for join in joins {
            assert_eq!(join.await.unwrap(), vec!["10.0.0.1".parse::<std::net::IpAddr>().unwrap()]);
        }
        assert_eq!(server.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ip_literal_short_circuits() {
        let client = DnsClient::new(vec![Arc::new(ScriptedServer::failing())]);
        let ips = client.lookup_ip("192.0.2.7", IpOption::both()).await.unwrap();
        assert_eq!(ips, vec!["192.0.2.7".parse::<std::net::IpAddr>().unwrap()]);
    }
}
