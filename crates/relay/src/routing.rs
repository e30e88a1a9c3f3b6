//! Event-type to sink routing.
//!
//! Loaded once from TOML:
//!
//! ```toml
//! stream_maxlen = 10000
//!
//! [[rules]]
//! event_type = "order.placed"
//! sinks = [
//!   { type = "broker", exchange = "order", routing_key = "order.placed" },
//!   { type = "stream", stream_key = "orders-stream" },
//! ]
//!
//! [[default_sinks]]
//! type = "broker"
//! exchange = "events"
//! ```

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::RoutingError;

/// Where a routed event is sent.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SinkDescriptor {
    /// A topic exchange. The routing key defaults to the event type.
    Broker {
        exchange: String,
        #[serde(default)]
        routing_key: Option<String>,
    },
    /// An append-only stream.
    Stream { stream_key: String },
}

impl SinkDescriptor {
    pub fn broker(exchange: impl Into<String>) -> Self {
        SinkDescriptor::Broker {
            exchange: exchange.into(),
            routing_key: None,
        }
    }

    pub fn stream(stream_key: impl Into<String>) -> Self {
        SinkDescriptor::Stream {
            stream_key: stream_key.into(),
        }
    }

    fn validate(&self, context: &str) -> Result<(), RoutingError> {
        let empty = match self {
            SinkDescriptor::Broker {
                exchange,
                routing_key,
            } => exchange.trim().is_empty() || routing_key.as_deref().is_some_and(str::is_empty),
            SinkDescriptor::Stream { stream_key } => stream_key.trim().is_empty(),
        };
        if empty {
            return Err(RoutingError::Invalid(format!(
                "{context}: sink has an empty destination"
            )));
        }
        Ok(())
    }
}

/// Sinks for one event type.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingRule {
    pub event_type: String,
    pub sinks: Vec<SinkDescriptor>,
}

/// Raw routing configuration as read from disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoutingConfig {
    #[serde(default)]
    pub rules: Vec<RoutingRule>,
    /// Sinks for event types without a rule. May be empty.
    #[serde(default)]
    pub default_sinks: Vec<SinkDescriptor>,
    /// Approximate cap on stream length.
    #[serde(default)]
    pub stream_maxlen: Option<u64>,
}

impl RoutingConfig {
    /// Parses a TOML routing config.
    pub fn from_toml_str(input: &str) -> Result<Self, RoutingError> {
        Ok(toml::from_str(input)?)
    }

    /// Reads and parses a TOML routing config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RoutingError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| RoutingError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    /// Routes every event type to the exchange named by its first word,
    /// e.g. `order.created` to exchange `order`.
    pub fn by_domain<'a>(event_types: impl IntoIterator<Item = &'a str>) -> Self {
        let rules = event_types
            .into_iter()
            .map(|event_type| RoutingRule {
                event_type: event_type.to_string(),
                sinks: vec![SinkDescriptor::broker(
                    event_type.split('.').next().unwrap_or(event_type),
                )],
            })
            .collect();
        Self {
            rules,
            ..Default::default()
        }
    }

    /// Checks the config for empty rules, blank destinations and duplicate
    /// event types.
    pub fn validate(&self) -> Result<(), RoutingError> {
        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.event_type.trim().is_empty() {
                return Err(RoutingError::Invalid(
                    "rule with an empty event_type".to_string(),
                ));
            }
            if !seen.insert(rule.event_type.as_str()) {
                return Err(RoutingError::Invalid(format!(
                    "duplicate rule for event type '{}'",
                    rule.event_type
                )));
            }
            if rule.sinks.is_empty() {
                return Err(RoutingError::Invalid(format!(
                    "rule for '{}' has no sinks",
                    rule.event_type
                )));
            }
            for sink in &rule.sinks {
                sink.validate(&rule.event_type)?;
            }
        }
        for sink in &self.default_sinks {
            sink.validate("default_sinks")?;
        }
        if self.stream_maxlen == Some(0) {
            return Err(RoutingError::Invalid(
                "stream_maxlen must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Validated, immutable routing table.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    rules: HashMap<String, Vec<SinkDescriptor>>,
    default_sinks: Vec<SinkDescriptor>,
    stream_maxlen: Option<u64>,
}

impl RoutingTable {
    pub fn from_config(config: RoutingConfig) -> Result<Self, RoutingError> {
        config.validate()?;
        Ok(Self {
            rules: config
                .rules
                .into_iter()
                .map(|rule| (rule.event_type, rule.sinks))
                .collect(),
            default_sinks: config.default_sinks,
            stream_maxlen: config.stream_maxlen,
        })
    }

    /// Loads and validates a routing file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RoutingError> {
        Self::from_config(RoutingConfig::load(path)?)
    }

    /// Sinks for an event type: its rule, else the default sinks. An empty
    /// slice means the event goes nowhere.
    pub fn resolve(&self, event_type: &str) -> &[SinkDescriptor] {
        self.rules
            .get(event_type)
            .map_or(self.default_sinks.as_slice(), Vec::as_slice)
    }

    pub fn stream_maxlen(&self) -> Option<u64> {
        self.stream_maxlen
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}
