use std::{path::PathBuf, time::Duration};

use super::BrokerError;

const DEFAULT_SERVER_NAME: &str = "bmc-broker";
const DEFAULT_STORE_DIR: &str = "/var/lib/bmc/broker";
const DEFAULT_MAX_PAYLOAD: i64 = 1024 * 1024;
const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SLOW_CONSUMER_THRESHOLD: i64 = 1024;
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on `slow_consumer_threshold`.
///
/// The threshold sizes every subject's delivery buffer up front, so it has to stay allocatable.
pub const MAX_SLOW_CONSUMER_THRESHOLD: i64 = 1 << 20;

/// Broker configuration.
///
/// Resource limits are signed so that a negative value read from configuration is reported as invalid rather than
/// wrapped. A limit of zero means unlimited.
#[derive(Clone, Debug)]
pub struct BrokerConfiguration {
    /// Name of the broker, used as its process name and in logs.
    pub server_name: String,

    /// Directory holding durable streams.
    pub store_dir: PathBuf,

    /// Whether durable streams are enabled.
    pub streaming_enabled: bool,

    /// Bytes of stream records retained in memory.
    pub max_memory: i64,

    /// Bytes of stream records retained on disk.
    pub max_storage: i64,

    /// Maximum number of concurrently open connections.
    pub max_connections: i64,

    /// Maximum size of a single message payload, in bytes.
    pub max_payload: i64,

    /// How long the bus may take to become ready.
    pub startup_timeout: Duration,

    /// How long in-flight exchanges may take to drain before they are terminated.
    pub shutdown_timeout: Duration,

    /// Interval between housekeeping passes.
    pub keep_alive_interval: Duration,

    /// Whether subscribers that fall behind are told how many messages they missed.
    pub slow_consumer_detection: bool,

    /// Number of undelivered messages a subscriber may fall behind by.
    pub slow_consumer_threshold: i64,

    /// How long connection providers wait for the broker to become ready.
    pub ready_timeout: Duration,
}

impl BrokerConfiguration {
    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidConfiguration`] naming the first invalid field.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.server_name.trim().is_empty() {
            return invalid("server_name", "must not be empty");
        }

        let timeouts = [
            ("startup_timeout", self.startup_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
            ("keep_alive_interval", self.keep_alive_interval),
            ("ready_timeout", self.ready_timeout),
        ];
        for (field, value) in timeouts {
            if value.is_zero() {
                return invalid(field, "must be greater than zero");
            }
        }

        let limits = [
            ("max_memory", self.max_memory),
            ("max_storage", self.max_storage),
            ("max_connections", self.max_connections),
            ("max_payload", self.max_payload),
        ];
        for (field, value) in limits {
            if value < 0 {
                return invalid(field, format!("must not be negative (got {})", value));
            }
        }

        if self.slow_consumer_threshold <= 0 || self.slow_consumer_threshold > MAX_SLOW_CONSUMER_THRESHOLD {
            return invalid(
                "slow_consumer_threshold",
                format!(
                    "must be between 1 and {} (got {})",
                    MAX_SLOW_CONSUMER_THRESHOLD, self.slow_consumer_threshold
                ),
            );
        }

        if self.streaming_enabled && self.store_dir.as_os_str().is_empty() {
            return invalid("store_dir", "is required when streaming is enabled");
        }

        Ok(())
    }

    pub(super) fn slow_consumer_capacity(&self) -> usize {
        let threshold = self.slow_consumer_threshold.clamp(1, MAX_SLOW_CONSUMER_THRESHOLD);
        usize::try_from(threshold).unwrap_or(1)
    }
}

fn invalid<R: Into<String>>(field: &'static str, reason: R) -> Result<(), BrokerError> {
    Err(BrokerError::InvalidConfiguration {
        field,
        reason: reason.into(),
    })
}

/// Converts a non-negative limit into a byte or item count, where zero means unlimited.
pub(super) fn limit(value: i64) -> Option<u64> {
    u64::try_from(value).ok().filter(|value| *value > 0)
}

impl Default for BrokerConfiguration {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            streaming_enabled: false,
            max_memory: 0,
            max_storage: 0,
            max_connections: 0,
            max_payload: DEFAULT_MAX_PAYLOAD,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            slow_consumer_detection: true,
            slow_consumer_threshold: DEFAULT_SLOW_CONSUMER_THRESHOLD,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invalid_field(config: BrokerConfiguration) -> &'static str {
        match config.validate() {
            Err(BrokerError::InvalidConfiguration { field, .. }) => field,
            other => panic!("expected InvalidConfiguration, got: {:?}", other),
        }
    }

    #[test]
    fn defaults_are_valid() {
        BrokerConfiguration::default().validate().unwrap();
    }

    #[test]
    fn first_invalid_field_is_reported() {
        let config = BrokerConfiguration {
            server_name: "  ".to_string(),
            startup_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(invalid_field(config), "server_name");

        let config = BrokerConfiguration {
            startup_timeout: Duration::ZERO,
            max_memory: -1,
            ..Default::default()
        };
        assert_eq!(invalid_field(config), "startup_timeout");
    }

    #[test]
    fn each_rule_names_its_field() {
        let cases: Vec<(BrokerConfiguration, &str)> = vec![
            (
                BrokerConfiguration {
                    shutdown_timeout: Duration::ZERO,
                    ..Default::default()
                },
                "shutdown_timeout",
            ),
            (
                BrokerConfiguration {
                    keep_alive_interval: Duration::ZERO,
                    ..Default::default()
                },
                "keep_alive_interval",
            ),
            (
                BrokerConfiguration {
                    max_storage: -5,
                    ..Default::default()
                },
                "max_storage",
            ),
            (
                BrokerConfiguration {
                    max_connections: -1,
                    ..Default::default()
                },
                "max_connections",
            ),
            (
                BrokerConfiguration {
                    slow_consumer_threshold: 0,
                    ..Default::default()
                },
                "slow_consumer_threshold",
            ),
            (
                BrokerConfiguration {
                    streaming_enabled: true,
                    store_dir: PathBuf::new(),
                    ..Default::default()
                },
                "store_dir",
            ),
        ];

        for (config, field) in cases {
            assert_eq!(invalid_field(config), field);
        }
    }

    #[test]
    fn slow_consumer_threshold_is_bounded() {
        let config = BrokerConfiguration {
            slow_consumer_threshold: 1 << 40,
            ..Default::default()
        };
        assert_eq!(config.slow_consumer_capacity(), 1 << 20);
        assert_eq!(invalid_field(config), "slow_consumer_threshold");

        let config = BrokerConfiguration {
            slow_consumer_threshold: MAX_SLOW_CONSUMER_THRESHOLD,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn store_dir_only_required_with_streaming() {
        let config = BrokerConfiguration {
            streaming_enabled: false,
            store_dir: PathBuf::new(),
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn zero_limits_are_unlimited() {
        assert_eq!(limit(0), None);
        assert_eq!(limit(-3), None);
        assert_eq!(limit(4096), Some(4096));
    }
}
