//! Router
//!
//! Evaluates the ordered rule list against session metadata and
//! returns an outbound tag, resolving balancer targets through their
//! strategy. Owns no per-session state; balancer back-references stay
//! string tags resolved through the outbound manager on demand.

pub mod balancer;
pub mod rule;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::common::{Address, Metadata};
use crate::dns::{DnsClient, IpOption};
use crate::error::{Error, Result};
use crate::outbound::Manager;

pub use balancer::{Balancer, BalancingStrategy, LeastLoadStrategy, RandomStrategy, RoundRobinStrategy};
pub use rule::{Rule, RuleTarget};

/// How to treat domain destinations when CIDR rules are in play.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DomainStrategy {
    /// Match domains as-is; never resolve inside the router
    #[default]
    AsIs,
    /// If no rule matched a domain destination, resolve it and re-run
    /// the rules against the IP
    IpIfNonMatch,
}

/// Rule router with balancer support.
pub struct Router {
    rules: Vec<Rule>,
    balancers: HashMap<String, Balancer>,
    domain_strategy: DomainStrategy,
    dns: Option<Arc<DnsClient>>,
    default_tag: Option<String>,
}

impl Router {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            balancers: HashMap::new(),
            domain_strategy: DomainStrategy::AsIs,
            dns: None,
            default_tag: None,
        }
    }

    pub fn with_balancer(mut self, balancer: Balancer) -> Self {
        self.balancers.insert(balancer.tag().to_string(), balancer);
        self
    }

    pub fn with_domain_strategy(mut self, strategy: DomainStrategy, dns: Arc<DnsClient>) -> Self {
        self.domain_strategy = strategy;
        self.dns = Some(dns);
        self
    }

    pub fn with_default_tag(mut self, tag: impl Into<String>) -> Self {
        self.default_tag = Some(tag.into());
        self
    }

    /// Route a session: first matching rule wins, otherwise the
    /// default tag. Balancer targets resolve to a concrete tag here.
    pub async fn pick_route(&self, metadata: &Metadata, manager: &Manager) -> Result<String> {
        if let Some(target) = self.match_rules(metadata, None) {
            return self.resolve_target(target, manager);
        }

        // Optionally retry with the destination resolved, for CIDR
        // rules facing a domain target.
        if self.domain_strategy == DomainStrategy::IpIfNonMatch {
            if let Some(target) = self.match_resolved(metadata).await {
                return self.resolve_target(target, manager);
            }
        }

        match &self.default_tag {
            Some(tag) => Ok(tag.clone()),
            None => Ok(manager.default_tag().to_string()),
        }
    }

    fn match_rules(&self, metadata: &Metadata, resolved_ip: Option<std::net::IpAddr>) -> Option<&RuleTarget> {
        self.rules
            .iter()
            .find(|rule| rule.matches(metadata, resolved_ip))
            .and_then(|rule| rule.target.as_ref())
    }

    async fn match_resolved(&self, metadata: &Metadata) -> Option<&RuleTarget> {
        let dns = self.dns.as_ref()?;
        let domain = match metadata.destination.as_ref().map(|d| &d.address) {
            Some(Address::Domain(domain)) => domain,
            _ => return None,
        };
        if !self.rules.iter().any(|r| r.needs_resolution(metadata)) {
            return None;
        }
        let ips = match dns.lookup_ip(domain, IpOption::both()).await {
            Ok(ips) => ips,
            Err(e) => {
                debug!("router resolution of {} failed: {}", domain, e);
                return None;
            }
        };
        ips.into_iter()
            .find_map(|ip| self.match_rules(metadata, Some(ip)))
    }

    fn resolve_target(&self, target: &RuleTarget, manager: &Manager) -> Result<String> {
        match target {
            RuleTarget::Outbound(tag) => Ok(tag.clone()),
            RuleTarget::Balancer(tag) => {
                let balancer = self
                    .balancers
                    .get(tag)
                    .ok_or_else(|| Error::NoSuchBalancer(tag.clone()))?;
                balancer.pick_outbound(manager)
            }
        }
    }

    /// Candidate list of a balancer, strategy-ordered.
    pub fn get_principle_target(&self, tag: &str, manager: &Manager) -> Result<Vec<String>> {
        self.balancers
            .get(tag)
            .ok_or_else(|| Error::NoSuchBalancer(tag.to_string()))?
            .principle_target(manager)
    }

    /// Pin a balancer's choice; empty target clears the pin.
    pub fn set_override_target(&self, tag: &str, target: &str) -> Result<()> {
        self.balancers
            .get(tag)
            .ok_or_else(|| Error::NoSuchBalancer(tag.to_string()))?
            .set_override(target);
        Ok(())
    }

    pub fn get_override_target(&self, tag: &str) -> Result<String> {
        Ok(self
            .balancers
            .get(tag)
            .ok_or_else(|| Error::NoSuchBalancer(tag.to_string()))?
            .get_override())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Destination, Metadata};
    use crate::outbound::testing::manager_with_tags;

    fn meta(dest: Destination) -> Metadata {
        Metadata::new(dest).with_inbound_tag("in")
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let rules = vec![
            Rule {
                domain: vec!["domain:example.com".to_string()],
                target: Some(RuleTarget::Outbound("proxy".to_string())),
                ..Default::default()
            },
            Rule {
                port: Some("443".to_string()),
                target: Some(RuleTarget::Outbound("other".to_string())),
                ..Default::default()
            },
        ];
        let router = Router::new(rules).with_default_tag("direct");
        let manager = manager_with_tags(&["direct", "proxy", "other"]);

        let tag = router
            .pick_route(&meta(Destination::tcp(Address::domain("www.example.com"), 443)), &manager)
            .await
            .unwrap();
        assert_eq!(tag, "proxy");

        let tag = router
            .pick_route(&meta(Destination::tcp(Address::domain("other.io"), 443)), &manager)
            .await
            .unwrap();
        assert_eq!(tag, "other");

        let tag = router
            .pick_route(&meta(Destination::tcp(Address::domain("other.io"), 80)), &manager)
            .await
            .unwrap();
        assert_eq!(tag, "direct");
    }

    #[tokio::test]
    async fn test_balancer_target_resolves_to_concrete_tag() {
        let rules = vec![Rule {
            target: Some(RuleTarget::Balancer("pool".to_string())),
            ..Default::default()
        }];
        let router = Router::new(rules).with_balancer(Balancer::new(
            "pool",
            vec!["node-".to_string()],
            Box::new(RoundRobinStrategy::new(None)),
            None,
        ));
        let manager = manager_with_tags(&["node-a", "node-b"]);

        let m = meta(Destination::tcp(Address::parse("1.2.3.4"), 80));
        assert_eq!(router.pick_route(&m, &manager).await.unwrap(), "node-a");
        assert_eq!(router.pick_route(&m, &manager).await.unwrap(), "node-b");
        assert_eq!(router.pick_route(&m, &manager).await.unwrap(), "node-a");
    }

    #[tokio::test]
    async fn test_missing_balancer_errors() {
        let rules = vec![Rule {
            target: Some(RuleTarget::Balancer("ghost".to_string())),
            ..Default::default()
        }];
        let router = Router::new(rules);
        let manager = manager_with_tags(&["direct"]);
        let m = meta(Destination::tcp(Address::parse("1.2.3.4"), 80));
        assert!(matches!(
            router.pick_route(&m, &manager).await,
            Err(Error::NoSuchBalancer(_))
        ));
    }

    #[test]
    fn test_override_set_get_clear() {
        let router = Router::new(Vec::new()).with_balancer(Balancer::new(
            "pool",
            vec!["node-".to_string()],
            Box::new(RoundRobinStrategy::new(None)),
            None,
        ));

        router.set_override_target("pool", "node-b").unwrap();
        assert_eq!(router.get_override_target("pool").unwrap(), "node-b");
        router.set_override_target("pool", "").unwrap();
        assert_eq!(router.get_override_target("pool").unwrap(), "");

        assert!(matches!(
            router.set_override_target("ghost", "x"),
            Err(Error::NoSuchBalancer(_))
        ));
    }

    #[test]
    fn test_principle_target() {
        let router = Router::new(Vec::new())
            .with_balancer(Balancer::new(
                "pool",
                vec!["node-".to_string()],
                Box::new(RoundRobinStrategy::new(None)),
                None,
            ))
            .with_balancer(Balancer::new(
                "lucky",
                vec!["node-".to_string()],
                Box::new(RandomStrategy::new(None)),
                None,
            ));
        let manager = manager_with_tags(&["node-a", "node-b", "other"]);

        assert_eq!(
            router.get_principle_target("pool", &manager).unwrap(),
            vec!["node-a", "node-b"]
        );
        assert!(matches!(
            router.get_principle_target("lucky", &manager),
            Err(Error::UnsupportedPrincipleTarget)
        ));
        assert!(matches!(
            router.get_principle_target("ghost", &manager),
            Err(Error::NoSuchBalancer(_))
        ));
    }
}
