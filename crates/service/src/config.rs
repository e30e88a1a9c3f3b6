//! Process configuration loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use consumer::ConsumerSettings;
use outbox::AdapterKind;
use relay::RelaySettings;

use crate::error::{Result, ServiceError};

/// Fulfillment process configuration.
///
/// Reads from environment variables, after loading `.env` when present:
/// - `DATABASE_URL`: PostgreSQL connection (unset: in-process document store,
///   which is not durable and is logged as a warning at startup)
/// - `OUTBOX_ADAPTER`: `relational` or `document` (default follows `DATABASE_URL`)
/// - `NATS_URL`: NATS server (unset: in-memory broker)
/// - `ROUTING_CONFIG`: routing rules file (default: `config/routing.toml`)
/// - `RELAY_BATCH_SIZE`, `RELAY_POLL_INTERVAL_MS`, `RELAY_PARALLEL_CHUNK`,
///   `RELAY_CLEANUP_EVERY`, `OUTBOX_RETENTION_HOURS`: relay tuning
/// - `CONSUMER_PREFETCH`, `CONSUMER_BATCH_ACK`, `CONSUMER_MAX_RETRIES`:
///   consumer tuning
/// - `METRICS_ADDR`: Prometheus listener (default: `0.0.0.0:9000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: Option<String>,
    pub adapter: AdapterKind,
    pub nats_url: Option<String>,
    pub routing_config: PathBuf,
    pub relay: RelaySettings,
    pub consumer: ConsumerSettings,
    pub max_retries: u32,
    pub metrics_addr: SocketAddr,
    pub log_level: String,
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(ServiceError::Config(format!("failed to read .env: {e}")));
            }
        }
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from any variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let database_url = lookup("DATABASE_URL").filter(|v| !v.trim().is_empty());

        let adapter = match lookup("OUTBOX_ADAPTER") {
            Some(value) => value.parse().map_err(|e: outbox::OutboxError| {
                ServiceError::InvalidVar {
                    name: "OUTBOX_ADAPTER",
                    value,
                    reason: e.to_string(),
                }
            })?,
            None if database_url.is_some() => AdapterKind::Relational,
            None => AdapterKind::Document,
        };
        if adapter == AdapterKind::Relational && database_url.is_none() {
            return Err(ServiceError::Config(
                "OUTBOX_ADAPTER=relational requires DATABASE_URL".to_string(),
            ));
        }

        let relay = RelaySettings {
            batch_size: parse_var(&lookup, "RELAY_BATCH_SIZE", defaults.relay.batch_size)?,
            poll_interval: Duration::from_millis(parse_var(
                &lookup,
                "RELAY_POLL_INTERVAL_MS",
                defaults.relay.poll_interval.as_millis() as u64,
            )?),
            parallel_chunk: parse_var(
                &lookup,
                "RELAY_PARALLEL_CHUNK",
                defaults.relay.parallel_chunk,
            )?,
            cleanup_every: parse_var(&lookup, "RELAY_CLEANUP_EVERY", defaults.relay.cleanup_every)?,
            retention: chrono::Duration::hours(parse_var(
                &lookup,
                "OUTBOX_RETENTION_HOURS",
                defaults.relay.retention.num_hours(),
            )?),
        };
        if relay.batch_size == 0 || relay.parallel_chunk == 0 {
            return Err(ServiceError::Config(
                "RELAY_BATCH_SIZE and RELAY_PARALLEL_CHUNK must be positive".to_string(),
            ));
        }

        let consumer = ConsumerSettings {
            prefetch: parse_var(&lookup, "CONSUMER_PREFETCH", defaults.consumer.prefetch)?,
            batch_ack: parse_var(&lookup, "CONSUMER_BATCH_ACK", defaults.consumer.batch_ack)?,
            ..defaults.consumer
        };

        Ok(Self {
            database_url,
            adapter,
            nats_url: lookup("NATS_URL").filter(|v| !v.trim().is_empty()),
            routing_config: lookup("ROUTING_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.routing_config),
            relay,
            consumer,
            max_retries: parse_var(&lookup, "CONSUMER_MAX_RETRIES", defaults.max_retries)?,
            metrics_addr: parse_var(&lookup, "METRICS_ADDR", defaults.metrics_addr)?,
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
        })
    }
}

impl Config {
    /// Whether outbox records outlive the process.
    pub fn is_durable(&self) -> bool {
        self.adapter == AdapterKind::Relational
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            adapter: AdapterKind::Document,
            nats_url: None,
            routing_config: PathBuf::from("config/routing.toml"),
            relay: RelaySettings::default(),
            consumer: ConsumerSettings::default(),
            max_retries: broker::DEFAULT_MAX_RETRIES,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            log_level: "info".to_string(),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, name: &'static str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ServiceError::InvalidVar {
            name,
            reason: e.to_string(),
            value,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_default_values() {
        let config = load(&[]).unwrap();
        assert_eq!(config.adapter, AdapterKind::Document);
        assert!(config.database_url.is_none());
        assert!(config.nats_url.is_none());
        assert_eq!(config.routing_config, PathBuf::from("config/routing.toml"));
        assert_eq!(config.relay.batch_size, 100);
        assert_eq!(config.relay.poll_interval, Duration::from_millis(1000));
        assert_eq!(config.relay.parallel_chunk, 50);
        assert_eq!(config.relay.cleanup_every, 60);
        assert_eq!(config.relay.retention, chrono::Duration::hours(24));
        assert_eq!(config.consumer.prefetch, 10);
        assert_eq!(config.consumer.batch_ack, 0);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.metrics_addr.to_string(), "0.0.0.0:9000");
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_database_url_selects_relational_adapter() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/orders")]).unwrap();
        assert_eq!(config.adapter, AdapterKind::Relational);

        let config = load(&[
            ("DATABASE_URL", "postgres://localhost/orders"),
            ("OUTBOX_ADAPTER", "document"),
        ])
        .unwrap();
        assert_eq!(config.adapter, AdapterKind::Document);
    }

    #[test]
    fn test_only_relational_adapter_is_durable() {
        assert!(!load(&[]).unwrap().is_durable());
        assert!(
            load(&[("DATABASE_URL", "postgres://localhost/orders")])
                .unwrap()
                .is_durable()
        );
        assert!(
            !load(&[
                ("DATABASE_URL", "postgres://localhost/orders"),
                ("OUTBOX_ADAPTER", "document"),
            ])
            .unwrap()
            .is_durable()
        );
    }

    #[test]
    fn test_relational_adapter_requires_database_url() {
        let err = load(&[("OUTBOX_ADAPTER", "relational")]).unwrap_err();
        assert!(matches!(err, ServiceError::Config(_)));
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("RELAY_BATCH_SIZE", "250"),
            ("RELAY_POLL_INTERVAL_MS", "50"),
            ("CONSUMER_PREFETCH", "32"),
            ("CONSUMER_BATCH_ACK", "8"),
            ("CONSUMER_MAX_RETRIES", "5"),
            ("OUTBOX_RETENTION_HOURS", "48"),
            ("NATS_URL", "nats://localhost:4222"),
            ("METRICS_ADDR", "127.0.0.1:9100"),
        ])
        .unwrap();
        assert_eq!(config.relay.batch_size, 250);
        assert_eq!(config.relay.poll_interval, Duration::from_millis(50));
        assert_eq!(config.relay.retention, chrono::Duration::hours(48));
        assert_eq!(config.consumer.prefetch, 32);
        assert_eq!(config.consumer.batch_ack, 8);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.nats_url.as_deref(), Some("nats://localhost:4222"));
        assert_eq!(config.metrics_addr.port(), 9100);
    }

    #[test]
    fn test_malformed_values_are_rejected() {
        let err = load(&[("RELAY_BATCH_SIZE", "lots")]).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InvalidVar {
                name: "RELAY_BATCH_SIZE",
                ..
            }
        ));

        let err = load(&[("OUTBOX_ADAPTER", "cassandra")]).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidVar { name: "OUTBOX_ADAPTER", .. }));

        assert!(load(&[("RELAY_PARALLEL_CHUNK", "0")]).is_err());
    }
}
