//! DNS answer cache
//!
//! Positive answers are cached per (domain, family-mask) for their
//! minimum record TTL, floored and capped. Expired entries are kept
//! around so a failing upstream can be papered over with stale data.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// TTL floor: upstreams advertising sub-20s TTLs get coalesced.
pub const MIN_TTL: u32 = 20;
/// TTL cap: one hour.
pub const MAX_TTL: u32 = 3600;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub domain: String,
    /// Bit 0: IPv4, bit 1: IPv6
    pub family_mask: u8,
}

impl CacheKey {
    pub fn new(domain: &str, family_mask: u8) -> Self {
        Self {
            domain: domain.to_ascii_lowercase(),
            family_mask,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    ips: Vec<IpAddr>,
    expires_at: Instant,
}

/// Process-wide, concurrently readable answer cache.
#[derive(Default)]
pub struct DnsCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer still within its wall-clock TTL, if any.
    pub fn get_fresh(&self, key: &CacheKey) -> Option<Vec<IpAddr>> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if Instant::now() < entry.expires_at {
            Some(entry.ips.clone())
        } else {
            None
        }
    }

    /// Any cached answer, expired or not. Serving these is the
    /// stale-if-error path.
    pub fn get_stale(&self, key: &CacheKey) -> Option<Vec<IpAddr>> {
        self.entries.read().get(key).map(|e| e.ips.clone())
    }

    /// Replace the entry for `key` atomically. `ttl` is clamped to
    /// [MIN_TTL, MAX_TTL].
    pub fn insert(&self, key: CacheKey, ips: Vec<IpAddr>, ttl: u32) {
        let ttl = ttl.clamp(MIN_TTL, MAX_TTL);
        let entry = CacheEntry {
            ips,
            expires_at: Instant::now() + Duration::from_secs(u64::from(ttl)),
        };
        self.entries.write().insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[cfg(test)]
    pub fn expire_now(&self, key: &CacheKey) {
        if let Some(entry) = self.entries.write().get_mut(key) {
            entry.expires_at = Instant::now() - Duration::from_secs(1);
        }
    }
}
