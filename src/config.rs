//! Configuration module
//!
//! JSON configuration loaded at startup and converted into runtime
//! wiring by `app::runtime`.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub dns: DnsConfig,

    /// Health probing; absent means balancers treat every tag as alive
    #[serde(default)]
    pub observatory: Option<ObservatorySettings>,

    #[serde(default)]
    pub inbounds: Vec<InboundSettings>,

    #[serde(default)]
    pub outbounds: Vec<OutboundConfig>,

    #[serde(default)]
    pub routing: RoutingConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// A SOCKS client in front of a direct outbound.
    pub fn default_client() -> Self {
        Config {
            log: LogConfig::default(),
            dns: DnsConfig {
                servers: vec!["udp://8.8.8.8:53".to_string(), "localhost".to_string()],
            },
            observatory: None,
            inbounds: vec![
                InboundSettings {
                    tag: "socks-in".to_string(),
                    protocol: "socks".to_string(),
                    listen: "127.0.0.1:1080".to_string(),
                    target: None,
                    transport: None,
                    timeout_only: false,
                },
                InboundSettings {
                    tag: "forward-in".to_string(),
                    protocol: "forward".to_string(),
                    listen: "127.0.0.1:1089".to_string(),
                    target: Some("example.com:80".to_string()),
                    transport: None,
                    timeout_only: false,
                },
            ],
            outbounds: vec![OutboundConfig {
                tag: "direct".to_string(),
                protocol: "freedom".to_string(),
                settings: OutboundSettings::default(),
                transport: None,
            }],
            routing: RoutingConfig::default(),
        }
    }

    /// A forward inbound relaying to a fixed target.
    pub fn default_server() -> Self {
        Config {
            log: LogConfig::default(),
            dns: DnsConfig::default(),
            observatory: None,
            inbounds: vec![InboundSettings {
                tag: "forward-in".to_string(),
                protocol: "forward".to_string(),
                listen: "0.0.0.0:8080".to_string(),
                target: Some("127.0.0.1:80".to_string()),
                transport: None,
                timeout_only: false,
            }],
            outbounds: vec![
                OutboundConfig {
                    tag: "direct".to_string(),
                    protocol: "freedom".to_string(),
                    settings: OutboundSettings::default(),
                    transport: None,
                },
                OutboundConfig {
                    tag: "block".to_string(),
                    protocol: "blackhole".to_string(),
                    settings: OutboundSettings::default(),
                    transport: None,
                },
            ],
            routing: RoutingConfig::default(),
        }
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// DNS configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsConfig {
    /// Name server URLs: udp://, tcp://, tls://, https://,
    /// https+local://, or "localhost". Empty uses the system resolver.
    #[serde(default)]
    pub servers: Vec<String>,
}

/// Health observatory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservatorySettings {
    #[serde(default = "default_probe_host")]
    pub probe_host: String,
    #[serde(default = "default_probe_port")]
    pub probe_port: u16,
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_probe_host() -> String {
    "www.google.com".to_string()
}

fn default_probe_port() -> u16 {
    80
}

fn default_probe_interval() -> u64 {
    60
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_failure_threshold() -> u32 {
    3
}

/// Inbound configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundSettings {
    pub tag: String,

    /// "socks" or "forward"
    pub protocol: String,

    /// Listen address, "ip:port"
    pub listen: String,

    /// Fixed destination for forward inbounds, "host:port"
    #[serde(default)]
    pub target: Option<String>,

    #[serde(default)]
    pub transport: Option<TransportSettings>,

    /// Detach sessions from inbound cancellation; only inactivity
    /// terminates them
    #[serde(default)]
    pub timeout_only: bool,
}

/// Outbound configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundConfig {
    pub tag: String,

    /// "freedom" or "blackhole"
    pub protocol: String,

    #[serde(default)]
    pub settings: OutboundSettings,

    #[serde(default)]
    pub transport: Option<TransportSettings>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundSettings {
    /// AsIs, UseIP, UseIPv4, UseIPv6
    #[serde(default)]
    pub domain_strategy: Option<String>,

    #[serde(default)]
    pub override_address: Option<String>,

    #[serde(default)]
    pub override_port: Option<u16>,

    #[serde(default)]
    pub fragment: Option<FragmentSettings>,

    #[serde(default)]
    pub connection_idle_secs: Option<u64>,

    #[serde(default)]
    pub downlink_only_secs: Option<u64>,

    #[serde(default)]
    pub uplink_only_secs: Option<u64>,
}

/// Fragmentation settings. start=0 end=1 selects ClientHello mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentSettings {
    pub start_packet: u64,
    pub end_packet: u64,
    pub min_length: u64,
    pub max_length: u64,
    #[serde(default)]
    pub min_interval_ms: u64,
    #[serde(default)]
    pub max_interval_ms: u64,
}

/// Wire transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSettings {
    /// tcp, kcp, quic, websocket, http, httpupgrade, domainsocket
    #[serde(rename = "type")]
    pub transport_type: String,

    #[serde(default)]
    pub path: Option<String>,

    #[serde(default)]
    pub host: Option<String>,

    #[serde(default)]
    pub headers: Option<Vec<(String, String)>>,

    #[serde(default)]
    pub allow_insecure: Option<bool>,

    #[serde(default)]
    pub certificate_file: Option<String>,

    #[serde(default)]
    pub key_file: Option<String>,

    #[serde(default)]
    pub unix_path: Option<String>,
}

/// Routing configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// AsIs or IpIfNonMatch
    #[serde(default)]
    pub domain_strategy: Option<String>,

    #[serde(default)]
    pub default_outbound: Option<String>,

    #[serde(default)]
    pub rules: Vec<RuleSettings>,

    #[serde(default)]
    pub balancers: Vec<BalancerSettings>,
}

/// One routing rule
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSettings {
    #[serde(default)]
    pub inbound_tag: Vec<String>,
    #[serde(default)]
    pub protocol: Vec<String>,
    #[serde(default)]
    pub user: Vec<String>,
    #[serde(default)]
    pub network: Vec<String>,
    #[serde(default)]
    pub source_ip: Vec<String>,
    #[serde(default)]
    pub source_port: Option<String>,
    #[serde(default)]
    pub domain: Vec<String>,
    #[serde(default)]
    pub ip: Vec<String>,
    #[serde(default)]
    pub port: Option<String>,
    #[serde(default)]
    pub outbound_tag: Option<String>,
    #[serde(default)]
    pub balancer_tag: Option<String>,
}

/// A balancer over a selector-matched pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerSettings {
    pub tag: String,
    pub selector: Vec<String>,
    /// roundRobin, random, leastLoad
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub fallback_tag: Option<String>,
}
