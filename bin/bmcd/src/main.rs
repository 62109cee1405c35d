//! BMC daemon.
//!
//! Runs the embedded message broker and the daemon's services under a single supervisor until it receives SIGINT or
//! SIGTERM.
use std::{path::Path, sync::Arc};

use bmc_app::prelude::*;
use bmc_config::{ConfigurationLoader, GenericConfiguration};
use bmc_core::{
    broker::{Broker, ConnectionProvider},
    orchestrator::Orchestrator,
    runtime::{ProcessShutdown, ShutdownHandle, ShutdownReason, Supervisor},
    service::Service,
    spawn_traced,
};
use bmc_error::{ErrorContext as _, GenericError};
use clap::Parser as _;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};

mod cli;
use self::cli::{Action, Cli, DEFAULT_CONFIG_PATH};

mod config;
use self::config::BmcdConfiguration;

mod services;
use self::services::{Heartbeat, PingResponder};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let raw_config = match load_configuration(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => fatal_and_exit(format!("failed to load configuration: {:?}", e)),
    };

    let logging_config = match LoggingConfiguration::from_configuration(&raw_config) {
        Ok(config) => config,
        Err(e) => fatal_and_exit(format!("invalid logging configuration: {:?}", e)),
    };
    if let Err(e) = initialize_logging("bmcd", &logging_config) {
        fatal_and_exit(format!("failed to initialize logging: {}", e));
    }

    let config = match BmcdConfiguration::from_configuration(&raw_config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to read configuration: {:?}", e);
            std::process::exit(1);
        }
    };

    match cli.action.unwrap_or(Action::Run) {
        Action::CheckConfig => match config.validate() {
            Ok(()) => info!("Configuration is valid."),
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        },
        Action::Run => match run(config).await {
            Ok(reason) => info!(%reason, "bmcd stopped."),
            Err(e) => {
                error!("{:?}", e);
                std::process::exit(1);
            }
        },
    }
}

fn load_configuration(path: Option<&Path>) -> Result<GenericConfiguration, GenericError> {
    let loader = match path {
        Some(path) => ConfigurationLoader::default().from_yaml(path)?,
        None => ConfigurationLoader::default().try_from_yaml(DEFAULT_CONFIG_PATH),
    };

    Ok(loader.from_environment("BMC")?.into_generic())
}

async fn run(config: BmcdConfiguration) -> Result<ShutdownReason, GenericError> {
    config.validate()?;

    info!(
        name = %config.service.name,
        description = %config.service.description,
        version = %config.service.version,
        broker_enabled = config.broker_enabled,
        "Starting bmcd."
    );

    let supervisor = Supervisor::new(config.service.name.clone())?
        .with_restart_strategy(config.supervisor.restart_strategy());

    let mut orchestrator = Orchestrator::new(supervisor)
        .with_startup_timeout(config.supervisor.startup_timeout)
        .with_service_shutdown_timeout(config.supervisor.shutdown_timeout)
        .with_services(configured_services(&config));

    orchestrator = if config.broker_enabled {
        orchestrator.with_broker(Broker::new(config.broker.clone())?)
    } else {
        warn!("Embedded broker is disabled. Services will run without broker connections.");
        orchestrator.with_connection_provider(ConnectionProvider::unavailable())
    };

    let (process_shutdown, shutdown_handle) = ProcessShutdown::paired();
    spawn_signal_handlers(shutdown_handle)?;

    let reason = orchestrator.run(process_shutdown).await?;
    Ok(reason)
}

fn configured_services(config: &BmcdConfiguration) -> Vec<Arc<dyn Service>> {
    let mut services: Vec<Arc<dyn Service>> = Vec::new();
    if config.heartbeat.enabled {
        services.push(Arc::new(Heartbeat::new(
            config.service.name.clone(),
            config.heartbeat.interval,
        )));
    }
    if config.ping_enabled {
        services.push(Arc::new(PingResponder));
    }
    services
}

fn spawn_signal_handlers(shutdown_handle: ShutdownHandle) -> Result<(), GenericError> {
    let mut sigint = signal(SignalKind::interrupt()).error_context("Failed to set up SIGINT handler.")?;
    let mut sigterm = signal(SignalKind::terminate()).error_context("Failed to set up SIGTERM handler.")?;

    spawn_traced(async move {
        let signal = tokio::select! {
            _ = sigint.recv() => "SIGINT",
            _ = sigterm.recv() => "SIGTERM",
        };

        info!(signal, "Received signal. Shutting down.");
        shutdown_handle.trigger_with(ShutdownReason::Signal { signal });
    });

    Ok(())
}
