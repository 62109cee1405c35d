use bmc_config::GenericConfiguration;
use bmc_error::{generic_error, ErrorContext as _, GenericError};
use serde::Deserialize;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

fn default_log_level() -> LogLevel {
    LevelFilter::INFO.into()
}

const fn default_false() -> bool {
    false
}

/// Logging configuration.
#[derive(Deserialize)]
pub struct LoggingConfiguration {
    /// Filtering directives, in `EnvFilter` syntax.
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,

    /// Whether to log as JSON.
    #[serde(default = "default_false")]
    pub log_format_json: bool,
}

impl LoggingConfiguration {
    /// Creates a new `LoggingConfiguration` instance from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized as `LoggingConfiguration`, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let logging_config = config.as_typed()?;
        Ok(logging_config)
    }
}

impl Default for LoggingConfiguration {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format_json: default_false(),
        }
    }
}

/// A validated set of log filtering directives.
#[derive(Deserialize)]
#[serde(try_from = "String")]
pub struct LogLevel(EnvFilter);

impl LogLevel {
    /// Returns the directives as an `EnvFilter`.
    pub fn as_env_filter(&self) -> EnvFilter {
        // `EnvFilter` is not `Clone`, so it is rebuilt from its directives.
        EnvFilter::builder().parse_lossy(self.0.to_string())
    }
}

impl From<LevelFilter> for LogLevel {
    fn from(level: LevelFilter) -> Self {
        Self(EnvFilter::default().add_directive(level.into()))
    }
}

impl TryFrom<String> for LogLevel {
    type Error = GenericError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err(generic_error!("Log level cannot be empty."));
        }

        EnvFilter::builder()
            .parse(value)
            .map(Self)
            .error_context("Failed to parse valid log level.")
    }
}

#[cfg(test)]
mod tests {
    use bmc_config::ConfigurationLoader;

    use super::*;

    fn load(yaml: &str) -> Result<LoggingConfiguration, GenericError> {
        let config = ConfigurationLoader::default().from_yaml_str(yaml)?.into_generic();
        LoggingConfiguration::from_configuration(&config)
    }

    #[test]
    fn defaults_when_unset() {
        let config = load("service:\n  name: bmcd\n").unwrap();
        assert!(!config.log_format_json);
        assert_eq!(config.log_level.as_env_filter().to_string(), "info");
    }

    #[test]
    fn per_target_directives_are_accepted() {
        let config = load("log_level: warn,bmc_core::broker=debug\nlog_format_json: true\n").unwrap();
        assert!(config.log_format_json);

        let directives = config.log_level.as_env_filter().to_string();
        assert!(directives.contains("bmc_core::broker=debug"));
        assert!(directives.contains("warn"));
    }

    #[test]
    fn invalid_levels_are_rejected() {
        assert!(load("log_level: \"\"\n").is_err());
        assert!(load("log_level: bmc_core=loud\n").is_err());
    }
}
