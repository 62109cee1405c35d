//! Logging.

use bmc_error::GenericError;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _, Layer as _};

mod config;
pub use self::config::{LogLevel, LoggingConfiguration};

mod layer;
use self::layer::build_formatting_layer;

/// Logs a message to standard error and exits the process with a non-zero exit code.
pub fn fatal_and_exit(message: String) -> ! {
    eprintln!("FATAL: {}", message);
    std::process::exit(1);
}

/// Initializes the logging subsystem for `tracing`.
///
/// Events are filtered by the configured log level, which accepts the same directives as `RUST_LOG` (for example,
/// `info,bmc_core::broker=debug`), and written to standard output either as JSON or in a compact, pipe-delimited
/// format prefixed with `app_name`.
///
/// # Errors
///
/// If the logging subsystem was already initialized, an error will be returned.
pub fn initialize_logging(app_name: &str, config: &LoggingConfiguration) -> Result<(), GenericError> {
    let layer = build_formatting_layer(app_name, config, std::io::stdout);

    tracing_subscriber::registry()
        .with(layer.with_filter(config.log_level.as_env_filter()))
        .try_init()?;

    Ok(())
}
