use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/bmc/bmcd.yaml";

#[derive(Parser)]
#[command(about, version)]
pub struct Cli {
    /// Path to the configuration file.
    ///
    /// When not given, `/etc/bmc/bmcd.yaml` is used if it exists. Settings can also be provided through environment
    /// variables prefixed with `BMC_`, which take precedence over the file.
    #[arg(global = true, short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Subcommand to run.
    #[command(subcommand)]
    pub action: Option<Action>,
}

#[derive(Subcommand)]
pub enum Action {
    /// Run the broker and every configured service until signalled to stop.
    Run,

    /// Validate the configuration and exit.
    #[command(name = "check-config")]
    CheckConfig,
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory as _;

    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::try_parse_from(["bmcd", "check-config", "--config", "/tmp/bmcd.yaml"]).unwrap();
        assert!(matches!(cli.action, Some(Action::CheckConfig)));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/bmcd.yaml")));

        let cli = Cli::try_parse_from(["bmcd"]).unwrap();
        assert!(cli.action.is_none());
        assert!(cli.config.is_none());
    }
}
