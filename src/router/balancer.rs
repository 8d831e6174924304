//! Load-balanced outbound selection
//!
//! A balancer is a virtual outbound: selectors discover the candidate
//! pool, a strategy picks from it, and a runtime override can pin the
//! choice. Strategies consult the observatory's latest snapshot and
//! treat tags it has never seen as alive.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::info;

use crate::error::{Error, Result};
use crate::observatory::Observatory;
use crate::outbound::Manager;

/// Picks one tag from a candidate pool.
pub trait BalancingStrategy: Send + Sync {
    fn pick_outbound(&self, tags: &[String]) -> Option<String>;

    /// Full candidate list for diagnostics, ordered by preference.
    /// `None` when the strategy has no notion of principal targets.
    fn principle_target(&self, tags: Vec<String>) -> Option<Vec<String>>;
}

fn alive_candidates(observatory: Option<&Arc<Observatory>>, tags: &[String]) -> Vec<String> {
    match observatory {
        Some(observatory) => {
            let snapshot = observatory.snapshot();
            tags.iter()
                .filter(|tag| {
                    // Absent from the snapshot means not yet probed,
                    // which counts as alive.
                    snapshot.get(*tag).map(|s| s.alive).unwrap_or(true)
                })
                .cloned()
                .collect()
        }
        None => tags.to_vec(),
    }
}

/// Canonical strategy: skip dead candidates, then rotate through the
/// survivors with a mutex-guarded index.
pub struct RoundRobinStrategy {
    observatory: Option<Arc<Observatory>>,
    index: Mutex<usize>,
}

impl RoundRobinStrategy {
    pub fn new(observatory: Option<Arc<Observatory>>) -> Self {
        Self {
            observatory,
            index: Mutex::new(0),
        }
    }
}

impl BalancingStrategy for RoundRobinStrategy {
    fn pick_outbound(&self, tags: &[String]) -> Option<String> {
        let candidates = alive_candidates(self.observatory.as_ref(), tags);
        let n = candidates.len();
        if n == 0 {
            return None;
        }
        let mut index = self.index.lock();
        let tag = candidates[*index % n].clone();
        *index = (*index + 1) % n;
        Some(tag)
    }

    fn principle_target(&self, tags: Vec<String>) -> Option<Vec<String>> {
        Some(tags)
    }
}

/// Uniform random pick among alive candidates.
pub struct RandomStrategy {
    observatory: Option<Arc<Observatory>>,
}

impl RandomStrategy {
    pub fn new(observatory: Option<Arc<Observatory>>) -> Self {
        Self { observatory }
    }
}

impl BalancingStrategy for RandomStrategy {
    fn pick_outbound(&self, tags: &[String]) -> Option<String> {
        use rand::Rng;
        let candidates = alive_candidates(self.observatory.as_ref(), tags);
        if candidates.is_empty() {
            return None;
        }
        let i = rand::thread_rng().gen_range(0..candidates.len());
        Some(candidates[i].clone())
    }

    fn principle_target(&self, _tags: Vec<String>) -> Option<Vec<String>> {
        None
    }
}

/// Lowest observed latency wins; unprobed tags sort last among the
/// alive.
pub struct LeastLoadStrategy {
    observatory: Arc<Observatory>,
}

impl LeastLoadStrategy {
    pub fn new(observatory: Arc<Observatory>) -> Self {
        Self { observatory }
    }

    fn sorted(&self, tags: Vec<String>) -> Vec<String> {
        let snapshot = self.observatory.snapshot();
        let mut alive: Vec<String> = tags
            .into_iter()
            .filter(|tag| snapshot.get(tag).map(|s| s.alive).unwrap_or(true))
            .collect();
        alive.sort_by_key(|tag| {
            snapshot
                .get(tag)
                .map(|s| s.latency)
                .unwrap_or(std::time::Duration::MAX)
        });
        alive
    }
}

impl BalancingStrategy for LeastLoadStrategy {
    fn pick_outbound(&self, tags: &[String]) -> Option<String> {
        self.sorted(tags.to_vec()).into_iter().next()
    }

    fn principle_target(&self, tags: Vec<String>) -> Option<Vec<String>> {
        Some(self.sorted(tags))
    }
}

/// A virtual outbound dispatching to one of a pool.
pub struct Balancer {
    tag: String,
    selectors: Vec<String>,
    strategy: Box<dyn BalancingStrategy>,
    fallback_tag: Option<String>,
    override_target: ArcSwap<String>,
}

impl Balancer {
    pub fn new(
        tag: impl Into<String>,
        selectors: Vec<String>,
        strategy: Box<dyn BalancingStrategy>,
        fallback_tag: Option<String>,
    ) -> Self {
        Self {
            tag: tag.into(),
            selectors,
            strategy,
            fallback_tag,
            override_target: ArcSwap::from_pointee(String::new()),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Pick the tag of an outbound.
    ///
    /// Order matters: candidates come first (so selector failures can
    /// fall back), then a non-empty override wins verbatim, then the
    /// strategy, then the fallback.
    pub fn pick_outbound(&self, manager: &Manager) -> Result<String> {
        let candidates = manager.select(&self.selectors);

        let overridden = self.override_target.load();
        if !overridden.is_empty() {
            return Ok((**overridden).clone());
        }

        match self.strategy.pick_outbound(&candidates) {
            Some(tag) => Ok(tag),
            None => match &self.fallback_tag {
                Some(fallback) => {
                    info!("balancer [{}]: falling back to [{}]", self.tag, fallback);
                    Ok(fallback.clone())
                }
                None => Err(Error::EmptyTag),
            },
        }
    }

    /// Candidate list as the strategy ranks it.
    pub fn principle_target(&self, manager: &Manager) -> Result<Vec<String>> {
        let candidates = manager.select(&self.selectors);
        self.strategy
            .principle_target(candidates)
            .ok_or(Error::UnsupportedPrincipleTarget)
    }

    /// Set the override slot; empty clears it.
    pub fn set_override(&self, target: impl Into<String>) {
        self.override_target.store(Arc::new(target.into()));
    }

    pub fn get_override(&self) -> String {
        (**self.override_target.load()).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observatory::{ObservatoryConfig, OutboundStatus};
    use crate::outbound::testing::manager_with_tags;
    use std::time::{Duration, Instant};

    fn dead_status() -> OutboundStatus {
        OutboundStatus {
            alive: false,
            latency: Duration::from_millis(1),
            last_seen: Instant::now(),
        }
    }

    fn alive_status(latency_ms: u64) -> OutboundStatus {
        OutboundStatus {
            alive: true,
            latency: Duration::from_millis(latency_ms),
            last_seen: Instant::now(),
        }
    }

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_round_robin_skips_dead_candidate() {
        let observatory = Arc::new(Observatory::new(ObservatoryConfig::default()));
        observatory.set_status("B", dead_status());
        let strategy = RoundRobinStrategy::new(Some(observatory));

        // Nine picks over [A, B, C] with B dead: A,C alternating.
        let candidates = tags(&["A", "B", "C"]);
        let picks: Vec<String> = (0..9)
            .map(|_| strategy.pick_outbound(&candidates).unwrap())
            .collect();
        assert_eq!(picks, vec!["A", "C", "A", "C", "A", "C", "A", "C", "A"]);
    }

    #[test]
    fn test_round_robin_fairness_window() {
        let strategy = RoundRobinStrategy::new(None);
        let candidates = tags(&["x", "y", "z"]);
        let mut counts = std::collections::HashMap::new();
        for _ in 0..10 {
            let pick = strategy.pick_outbound(&candidates).unwrap();
            *counts.entry(pick).or_insert(0u32) += 1;
        }
        // Over k=10 picks of n=3, each candidate shows up 3 or 4 times.
        for tag in ["x", "y", "z"] {
            let c = counts[tag];
            assert!(c == 3 || c == 4, "{} picked {} times", tag, c);
        }
    }

    #[test]
    fn test_round_robin_unknown_tags_count_as_alive() {
        let observatory = Arc::new(Observatory::new(ObservatoryConfig::default()));
        let strategy = RoundRobinStrategy::new(Some(observatory));
        assert_eq!(
            strategy.pick_outbound(&tags(&["never-probed"])),
            Some("never-probed".to_string())
        );
    }

    #[test]
    fn test_round_robin_empty_pool() {
        let strategy = RoundRobinStrategy::new(None);
        assert_eq!(strategy.pick_outbound(&[]), None);
    }

    #[test]
    fn test_least_load_prefers_lowest_latency() {
        let observatory = Arc::new(Observatory::new(ObservatoryConfig::default()));
        observatory.set_status("slow", alive_status(80));
        observatory.set_status("fast", alive_status(5));
        observatory.set_status("dead", dead_status());
        let strategy = LeastLoadStrategy::new(observatory);

        let ordered = strategy
            .principle_target(tags(&["slow", "dead", "fast"]))
            .unwrap();
        assert_eq!(ordered, vec!["fast", "slow"]);
        assert_eq!(
            strategy.pick_outbound(&tags(&["slow", "dead", "fast"])),
            Some("fast".to_string())
        );
    }

    #[test]
    fn test_balancer_override_wins() {
        let manager = manager_with_tags(&["pool-a", "pool-b"]);
        let balancer = Balancer::new(
            "balance",
            vec!["pool-".to_string()],
            Box::new(RoundRobinStrategy::new(None)),
            None,
        );

        balancer.set_override("pool-b");
        assert_eq!(balancer.get_override(), "pool-b");
        for _ in 0..3 {
            assert_eq!(balancer.pick_outbound(&manager).unwrap(), "pool-b");
        }

        // Empty string clears the override.
        balancer.set_override("");
        assert_eq!(balancer.get_override(), "");
        assert_eq!(balancer.pick_outbound(&manager).unwrap(), "pool-a");
    }

    #[test]
    fn test_balancer_fallback_on_empty_pick() {
        let manager = manager_with_tags(&["direct"]);
        let balancer = Balancer::new(
            "balance",
            vec!["pool-".to_string()], // matches nothing
            Box::new(RoundRobinStrategy::new(None)),
            Some("direct".to_string()),
        );
        assert_eq!(balancer.pick_outbound(&manager).unwrap(), "direct");
    }

    #[test]
    fn test_balancer_empty_tag_without_fallback() {
        let manager = manager_with_tags(&["direct"]);
        let balancer = Balancer::new(
            "balance",
            vec!["pool-".to_string()],
            Box::new(RoundRobinStrategy::new(None)),
            None,
        );
        assert!(matches!(
            balancer.pick_outbound(&manager),
            Err(Error::EmptyTag)
        ));
    }

    #[test]
    fn test_random_strategy_has_no_principle_target() {
        let strategy = RandomStrategy::new(None);
        assert!(strategy.principle_target(tags(&["a"])).is_none());
        let pick = strategy.pick_outbound(&tags(&["a", "b"])).unwrap();
        assert!(pick == "a" || pick == "b");
    }
}
