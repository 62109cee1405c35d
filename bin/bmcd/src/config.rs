use std::{path::PathBuf, time::Duration};

use bmc_config::GenericConfiguration;
use bmc_core::{
    broker::{BrokerConfiguration, BrokerError},
    runtime::RestartStrategy,
};
use bmc_error::GenericError;
use snafu::Snafu;

const DEFAULT_SERVICE_NAME: &str = "bmcd";

/// Configuration validation errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ValidationError {
    /// A setting has an invalid value.
    #[snafu(display("Invalid configuration: '{}' {}.", field, reason))]
    InvalidField { field: &'static str, reason: String },

    /// The broker configuration is invalid.
    #[snafu(display("{}", source))]
    Broker { source: BrokerError },
}

/// Identity of the daemon.
#[derive(Clone, Debug)]
pub struct ServiceIdentity {
    pub name: String,
    pub description: String,
    pub version: String,
}

/// Supervisor settings.
#[derive(Clone, Debug)]
pub struct SupervisorConfiguration {
    pub restart_intensity: usize,
    pub restart_period: Duration,
    pub restart_backoff: Duration,
    pub startup_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl SupervisorConfiguration {
    pub fn restart_strategy(&self) -> RestartStrategy {
        RestartStrategy::one_to_one()
            .with_intensity_and_period(self.restart_intensity, self.restart_period)
            .with_backoff(self.restart_backoff)
    }
}

/// Heartbeat service settings.
#[derive(Clone, Debug)]
pub struct HeartbeatConfiguration {
    pub enabled: bool,
    pub interval: Duration,
}

/// Top-level daemon configuration.
#[derive(Clone, Debug)]
pub struct BmcdConfiguration {
    pub service: ServiceIdentity,
    pub supervisor: SupervisorConfiguration,
    pub broker_enabled: bool,
    pub broker: BrokerConfiguration,
    pub heartbeat: HeartbeatConfiguration,
    pub ping_enabled: bool,
}

fn secs(config: &GenericConfiguration, key: &str, default: u64) -> Result<Duration, GenericError> {
    Ok(Duration::from_secs(config.try_get_typed(key)?.unwrap_or(default)))
}

impl BmcdConfiguration {
    /// Creates a new `BmcdConfiguration` instance from the given configuration.
    ///
    /// Every field is read individually so that environment variables use flat names (`BMC_BROKER_STORE_DIR`) rather
    /// than double underscores for nesting.
    ///
    /// # Errors
    ///
    /// If a setting cannot be deserialized, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let broker_defaults = BrokerConfiguration::default();

        Ok(Self {
            service: ServiceIdentity {
                name: config
                    .try_get_typed("service.name")?
                    .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
                description: config.try_get_typed("service.description")?.unwrap_or_default(),
                version: config
                    .try_get_typed("service.version")?
                    .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            },
            supervisor: SupervisorConfiguration {
                restart_intensity: config.try_get_typed("supervisor.restart_intensity")?.unwrap_or(10),
                restart_period: secs(config, "supervisor.restart_period_secs", 60)?,
                restart_backoff: Duration::from_millis(
                    config.try_get_typed("supervisor.restart_backoff_ms")?.unwrap_or(500),
                ),
                startup_timeout: secs(config, "supervisor.startup_timeout_secs", 30)?,
                shutdown_timeout: secs(config, "supervisor.shutdown_timeout_secs", 10)?,
            },
            broker_enabled: config.try_get_typed("broker.enabled")?.unwrap_or(true),
            broker: BrokerConfiguration {
                server_name: config
                    .try_get_typed("broker.server_name")?
                    .unwrap_or(broker_defaults.server_name),
                store_dir: config
                    .try_get_typed("broker.store_dir")?
                    .unwrap_or(broker_defaults.store_dir),
                streaming_enabled: config
                    .try_get_typed("broker.streaming_enabled")?
                    .unwrap_or(broker_defaults.streaming_enabled),
                max_memory: config
                    .try_get_typed("broker.max_memory")?
                    .unwrap_or(broker_defaults.max_memory),
                max_storage: config
                    .try_get_typed("broker.max_storage")?
                    .unwrap_or(broker_defaults.max_storage),
                max_connections: config
                    .try_get_typed("broker.max_connections")?
                    .unwrap_or(broker_defaults.max_connections),
                max_payload: config
                    .try_get_typed("broker.max_payload")?
                    .unwrap_or(broker_defaults.max_payload),
                startup_timeout: secs(config, "broker.startup_timeout_secs", 10)?,
                shutdown_timeout: secs(config, "broker.shutdown_timeout_secs", 5)?,
                keep_alive_interval: secs(config, "broker.keep_alive_interval_secs", 30)?,
                slow_consumer_detection: config
                    .try_get_typed("broker.slow_consumer_detection")?
                    .unwrap_or(broker_defaults.slow_consumer_detection),
                slow_consumer_threshold: config
                    .try_get_typed("broker.slow_consumer_threshold")?
                    .unwrap_or(broker_defaults.slow_consumer_threshold),
                ready_timeout: secs(config, "broker.ready_timeout_secs", 60)?,
            },
            heartbeat: HeartbeatConfiguration {
                enabled: config.try_get_typed("services.heartbeat.enabled")?.unwrap_or(true),
                interval: secs(config, "services.heartbeat.interval_secs", 10)?,
            },
            ping_enabled: config.try_get_typed("services.ping.enabled")?.unwrap_or(true),
        })
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.service.name.trim().is_empty() {
            return invalid("service.name", "must not be empty");
        }
        if self.supervisor.restart_intensity == 0 {
            return invalid("supervisor.restart_intensity", "must be greater than zero");
        }

        let timeouts = [
            ("supervisor.restart_period_secs", self.supervisor.restart_period),
            ("supervisor.startup_timeout_secs", self.supervisor.startup_timeout),
            ("supervisor.shutdown_timeout_secs", self.supervisor.shutdown_timeout),
        ];
        for (field, value) in timeouts {
            if value.is_zero() {
                return invalid(field, "must be greater than zero");
            }
        }

        if self.broker_enabled {
            self.broker.validate().map_err(|source| ValidationError::Broker { source })?;

            // The supervisor must not give up on the broker before the broker gives up on itself.
            if self.supervisor.startup_timeout <= self.broker.startup_timeout {
                return invalid(
                    "supervisor.startup_timeout_secs",
                    format!(
                        "must be greater than broker.startup_timeout_secs ({:?})",
                        self.broker.startup_timeout
                    ),
                );
            }
        }

        if self.heartbeat.enabled && self.heartbeat.interval.is_zero() {
            return invalid("services.heartbeat.interval_secs", "must be greater than zero");
        }

        Ok(())
    }
}

fn invalid<R: Into<String>>(field: &'static str, reason: R) -> Result<(), ValidationError> {
    Err(ValidationError::InvalidField {
        field,
        reason: reason.into(),
    })
}

#[cfg(test)]
mod tests {
    use bmc_config::ConfigurationLoader;

    use super::*;

    fn load(yaml: &str) -> BmcdConfiguration {
        let config = ConfigurationLoader::default()
            .from_yaml_str(yaml)
            .unwrap()
            .into_generic();
        BmcdConfiguration::from_configuration(&config).unwrap()
    }

    fn invalid_field(config: &BmcdConfiguration) -> &'static str {
        match config.validate() {
            Err(ValidationError::InvalidField { field, .. }) => field,
            Err(ValidationError::Broker {
                source: BrokerError::InvalidConfiguration { field, .. },
            }) => field,
            other => panic!("expected a validation error, got: {:?}", other),
        }
    }

    #[test]
    fn defaults() {
        let config = load("{}");
        config.validate().unwrap();

        assert_eq!(config.service.name, "bmcd");
        assert_eq!(config.service.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(config.supervisor.restart_intensity, 10);
        assert_eq!(config.supervisor.restart_period, Duration::from_secs(60));
        assert_eq!(config.supervisor.restart_backoff, Duration::from_millis(500));
        assert_eq!(config.supervisor.startup_timeout, Duration::from_secs(30));
        assert!(config.broker_enabled);
        assert_eq!(config.broker.server_name, "bmc-broker");
        assert_eq!(config.broker.store_dir, PathBuf::from("/var/lib/bmc/broker"));
        assert_eq!(config.broker.max_payload, 1024 * 1024);
        assert_eq!(config.broker.ready_timeout, Duration::from_secs(60));
        assert!(config.heartbeat.enabled);
        assert!(config.ping_enabled);
    }

    #[test]
    fn nested_settings_are_read() {
        let config = load(
            r#"
service:
  name: bmc-main
  description: Chassis management daemon
supervisor:
  restart_intensity: 3
  restart_backoff_ms: 50
broker:
  server_name: chassis-bus
  streaming_enabled: true
  store_dir: /tmp/bmc-streams
  max_connections: 64
  shutdown_timeout_secs: 2
services:
  heartbeat:
    interval_secs: 1
  ping:
    enabled: false
"#,
        );
        config.validate().unwrap();

        assert_eq!(config.service.name, "bmc-main");
        assert_eq!(config.service.description, "Chassis management daemon");
        assert_eq!(config.supervisor.restart_intensity, 3);
        assert_eq!(config.supervisor.restart_backoff, Duration::from_millis(50));
        assert_eq!(config.broker.server_name, "chassis-bus");
        assert!(config.broker.streaming_enabled);
        assert_eq!(config.broker.store_dir, PathBuf::from("/tmp/bmc-streams"));
        assert_eq!(config.broker.max_connections, 64);
        assert_eq!(config.broker.shutdown_timeout, Duration::from_secs(2));
        assert_eq!(config.heartbeat.interval, Duration::from_secs(1));
        assert!(!config.ping_enabled);
    }

    #[test]
    fn first_invalid_field_is_named() {
        assert_eq!(
            invalid_field(&load("supervisor:\n  restart_intensity: 0\n")),
            "supervisor.restart_intensity"
        );
        assert_eq!(
            invalid_field(&load("broker:\n  startup_timeout_secs: 0\n")),
            "startup_timeout"
        );
        assert_eq!(invalid_field(&load("broker:\n  max_storage: -1\n")), "max_storage");
        assert_eq!(
            invalid_field(&load("supervisor:\n  startup_timeout_secs: 5\n")),
            "supervisor.startup_timeout_secs"
        );
        assert_eq!(
            invalid_field(&load("services:\n  heartbeat:\n    interval_secs: 0\n")),
            "services.heartbeat.interval_secs"
        );
    }

    #[test]
    fn broker_settings_are_ignored_when_disabled() {
        let config = load("broker:\n  enabled: false\n  startup_timeout_secs: 0\n");
        config.validate().unwrap();
    }
}
