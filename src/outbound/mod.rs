//! Outbound handler registry
//!
//! Handlers are immutable after registration and addressed by tag.
//! Balancers discover their candidate pools through prefix selection,
//! which preserves registration order.

pub mod blackhole;
pub mod fragment;
pub mod freedom;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::common::{Link, SessionContext};
use crate::config::OutboundConfig;
use crate::dns::DnsClient;
use crate::error::{Error, Result};
use crate::transport::BoundDialer;

/// An outbound processor. `process` consumes `link.reader`, writes
/// `link.writer`, and releases everything it holds on return.
#[async_trait]
pub trait OutboundHandler: Send + Sync {
    fn tag(&self) -> &str;

    async fn process(&self, ctx: &SessionContext, link: Link, dialer: &BoundDialer) -> Result<()>;
}

/// Services available to handler factories at construction time. All
/// required services must be present when the factory runs, or wiring
/// fails.
pub struct HandlerFeatures {
    pub dns: Arc<DnsClient>,
}

/// Builds a handler from its configuration and the feature set.
pub type HandlerFactory =
    Arc<dyn Fn(&OutboundConfig, &HandlerFeatures) -> Result<Arc<dyn OutboundHandler>> + Send + Sync>;

/// Protocol-name → factory registry, populated once at startup.
pub struct ProtocolRegistry {
    factories: HashMap<String, HandlerFactory>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in protocols.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let freedom: HandlerFactory = Arc::new(|config, features| {
            Ok(Arc::new(freedom::FreedomHandler::new(
                config.tag.clone(),
                freedom::FreedomConfig::from_settings(&config.settings)?,
                features.dns.clone(),
            )) as Arc<dyn OutboundHandler>)
        });
        registry.register("freedom", freedom.clone());
        registry.register("direct", freedom);
        registry.register(
            "blackhole",
            Arc::new(|config, _features| {
                Ok(Arc::new(blackhole::BlackholeHandler::new(config.tag.clone()))
                    as Arc<dyn OutboundHandler>)
            }),
        );
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, factory: HandlerFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn create(
        &self,
        config: &OutboundConfig,
        features: &HandlerFeatures,
    ) -> Result<Arc<dyn OutboundHandler>> {
        let factory = self
            .factories
            .get(&config.protocol)
            .ok_or_else(|| Error::Config(format!("unknown outbound protocol: {}", config.protocol)))?;
        factory(config, features)
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

struct Registration {
    tag: String,
    handler: Arc<dyn OutboundHandler>,
    dialer: BoundDialer,
}

/// Tag-addressed handler registry. Registration happens during wiring;
/// lookups afterwards are read-only.
pub struct Manager {
    registrations: Vec<Registration>,
    index: HashMap<String, usize>,
    default_tag: String,
}

impl Manager {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            index: HashMap::new(),
            default_tag: String::new(),
        }
    }

    pub fn register(&mut self, handler: Arc<dyn OutboundHandler>, dialer: BoundDialer) {
        let tag = handler.tag().to_string();
        if self.default_tag.is_empty() {
            self.default_tag = tag.clone();
        }
        self.index.insert(tag.clone(), self.registrations.len());
        self.registrations.push(Registration {
            tag,
            handler,
            dialer,
        });
    }

    pub fn set_default_tag(&mut self, tag: impl Into<String>) {
        self.default_tag = tag.into();
    }

    /// Tag routed to when no rule matches.
    pub fn default_tag(&self) -> &str {
        &self.default_tag
    }

    pub fn get(&self, tag: &str) -> Result<(Arc<dyn OutboundHandler>, BoundDialer)> {
        let i = *self
            .index
            .get(tag)
            .ok_or_else(|| Error::UnknownOutbound(tag.to_string()))?;
        let registration = &self.registrations[i];
        Ok((registration.handler.clone(), registration.dialer.clone()))
    }

    /// All tags whose name starts with any of the given prefixes, in
    /// registration order.
    pub fn select(&self, prefixes: &[String]) -> Vec<String> {
        self.registrations
            .iter()
            .filter(|r| prefixes.iter().any(|p| r.tag.starts_with(p.as_str())))
            .map(|r| r.tag.clone())
            .collect()
    }

    pub fn tags(&self) -> Vec<String> {
        self.registrations.iter().map(|r| r.tag.clone()).collect()
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::transport::{StreamSettings, TransportRegistry};

    pub struct NoopHandler {
        pub tag: String,
    }

    #[async_trait]
    impl OutboundHandler for NoopHandler {
        fn tag(&self) -> &str {
            &self.tag
        }

        async fn process(
            &self,
            _ctx: &SessionContext,
            link: Link,
            _dialer: &BoundDialer,
        ) -> Result<()> {
            link.writer.close();
            Ok(())
        }
    }

    pub fn test_dialer() -> BoundDialer {
        let registry = TransportRegistry::with_defaults();
        BoundDialer::new(
            registry.dialer("tcp").unwrap(),
            Arc::new(StreamSettings::default()),
        )
    }

    pub fn manager_with_tags(tags: &[&str]) -> Manager {
        let mut manager = Manager::new();
        for tag in tags {
            manager.register(
                Arc::new(NoopHandler {
                    tag: tag.to_string(),
                }),
                test_dialer(),
            );
        }
        manager
    }
}

#[cfg(test)]
mod tests {
    use super::testing::manager_with_tags;
    use super::*;

    #[test]
    fn test_select_preserves_registration_order() {
        let manager = manager_with_tags(&["node-us-1", "direct", "node-eu-1", "node-us-2"]);
        let selected = manager.select(&["node-".to_string()]);
        assert_eq!(selected, vec!["node-us-1", "node-eu-1", "node-us-2"]);
    }

    #[test]
    fn test_select_multiple_prefixes() {
        let manager = manager_with_tags(&["a1", "b1", "a2", "c1"]);
        let selected = manager.select(&["a".to_string(), "c".to_string()]);
        assert_eq!(selected, vec!["a1", "a2", "c1"]);
    }

    #[test]
    fn test_unknown_tag_errors() {
        let manager = manager_with_tags(&["direct"]);
        assert!(matches!(
            manager.get("missing"),
            Err(Error::UnknownOutbound(_))
        ));
    }

    #[test]
    fn test_first_registration_is_default() {
        let manager = manager_with_tags(&["first", "second"]);
        assert_eq!(manager.default_tag(), "first");
    }

    #[test]
    fn test_protocol_registry_builds_handlers() {
        let registry = ProtocolRegistry::with_defaults();
        let features = HandlerFeatures {
            dns: Arc::new(DnsClient::new(Vec::new())),
        };

        let config = OutboundConfig {
            tag: "out".to_string(),
            protocol: "freedom".to_string(),
            settings: Default::default(),
            transport: None,
        };
        let handler = registry.create(&config, &features).unwrap();
        assert_eq!(handler.tag(), "out");

        let config = OutboundConfig {
            protocol: "smoke-signals".to_string(),
            ..config
        };
        assert!(registry.create(&config, &features).is_err());
    }
}
