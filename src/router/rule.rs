//! Routing rules
//!
//! Predicates AND within a rule; the router ORs across rules by taking
//! the first match in order.

use std::net::IpAddr;

use crate::common::{Address, Metadata, Network};

/// Where a matching rule sends the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleTarget {
    Outbound(String),
    Balancer(String),
}

/// One routing rule. Empty fields match anything.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    /// Match inbound tags
    pub inbound_tag: Vec<String>,
    /// Match protocols reported by the inbound
    pub protocol: Vec<String>,
    /// Match users
    pub user: Vec<String>,
    /// Match networks
    pub network: Vec<Network>,
    /// Match source IPs (literal or CIDR)
    pub source_ip: Vec<String>,
    /// Match source port patterns ("80", "80,443", "1000-2000")
    pub source_port: Option<String>,
    /// Match destination domain patterns
    pub domain: Vec<String>,
    /// Match destination IPs (literal, CIDR, or via resolved domain)
    pub ip: Vec<String>,
    /// Match destination port patterns
    pub port: Option<String>,
    /// Target outbound or balancer
    pub target: Option<RuleTarget>,
}

impl Rule {
    /// Evaluate this rule. `resolved_ip` substitutes for a domain
    /// destination when the router re-runs matching after resolution.
    pub fn matches(&self, metadata: &Metadata, resolved_ip: Option<IpAddr>) -> bool {
        if !self.inbound_tag.is_empty()
            && !self.inbound_tag.iter().any(|t| t == &metadata.inbound_tag)
        {
            return false;
        }

        if !self.protocol.is_empty() && !self.protocol.iter().any(|p| p == &metadata.protocol) {
            return false;
        }

        if !self.user.is_empty() {
            match &metadata.user {
                Some(user) if self.user.iter().any(|u| u == user) => {}
                _ => return false,
            }
        }

        if !self.network.is_empty() && !self.network.contains(&metadata.network) {
            return false;
        }

        if !self.source_ip.is_empty() {
            match metadata.source {
                Some(source) if match_ip(&self.source_ip, source.ip()) => {}
                _ => return false,
            }
        }

        if let Some(pattern) = &self.source_port {
            match metadata.source {
                Some(source) if match_port(pattern, source.port()) => {}
                _ => return false,
            }
        }

        let destination = match &metadata.destination {
            Some(d) => d,
            None => return self.domain.is_empty() && self.ip.is_empty() && self.port.is_none(),
        };

        if let Some(pattern) = &self.port {
            if !match_port(pattern, destination.port) {
                return false;
            }
        }

        let has_domain_rules = !self.domain.is_empty();
        let has_ip_rules = !self.ip.is_empty();
        if !has_domain_rules && !has_ip_rules {
            return true;
        }

        match &destination.address {
            Address::Domain(domain) => {
                if has_domain_rules && match_domain(&self.domain, domain) {
                    return true;
                }
                if has_ip_rules {
                    if let Some(ip) = resolved_ip {
                        return match_ip(&self.ip, ip);
                    }
                }
                false
            }
            Address::Ip(ip) => has_ip_rules && match_ip(&self.ip, *ip),
        }
    }

    /// True when only resolving the destination domain could satisfy
    /// this rule.
    pub fn needs_resolution(&self, metadata: &Metadata) -> bool {
        !self.ip.is_empty()
            && matches!(
                metadata.destination.as_ref().map(|d| &d.address),
                Some(Address::Domain(_))
            )
    }
}

/// Match port patterns: "80", "80,443", "1000-2000", combinations.
pub fn match_port(pattern: &str, port: u16) -> bool {
    for part in pattern.split(',') {
        let part = part.trim();
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.trim().parse::<u16>(), end.trim().parse::<u16>()) {
                if port >= start && port <= end {
                    return true;
                }
            }
        } else if let Ok(p) = part.parse::<u16>() {
            if port == p {
                return true;
            }
        }
    }
    false
}

/// Match domain patterns. Prefixes select the match kind:
/// `domain:` suffix match, `full:` exact, `regexp:` regex,
/// `keyword:` substring; a bare pattern is a substring match.
pub fn match_domain(patterns: &[String], domain: &str) -> bool {
    let domain = domain.to_ascii_lowercase();

    for pattern in patterns {
        if let Some(target) = pattern.strip_prefix("domain:") {
            if domain == target || domain.ends_with(&format!(".{}", target)) {
                return true;
            }
        } else if let Some(target) = pattern.strip_prefix("full:") {
            if domain == target {
                return true;
            }
        } else if let Some(expr) = pattern.strip_prefix("regexp:") {
            if let Ok(re) = regex::Regex::new(expr) {
                if re.is_match(&domain) {
                    return true;
                }
            }
        } else if let Some(keyword) = pattern.strip_prefix("keyword:") {
            if domain.contains(keyword) {
                return true;
            }
        } else if domain.contains(pattern.as_str()) {
            return true;
        }
    }
    false
}

/// Match IP patterns: exact IPs and CIDR ranges.
pub fn match_ip(patterns: &[String], ip: IpAddr) -> bool {
    for pattern in patterns {
        if pattern.contains('/') {
            if let Ok(network) = pattern.parse::<ipnet::IpNet>() {
                if network.contains(&ip) {
                    return true;
                }
            }
        } else if let Ok(target) = pattern.parse::<IpAddr>() {
            if ip == target {
                return true;
            }
        }
    }
    false
}
