//! Startup choreography.
//!
//! The orchestrator brings up the broker before anything that depends on it. The broker is registered with the
//! supervisor before the supervisor starts running, while services are registered from a concurrent task once the
//! broker has started, so a service is never admitted before the broker it talks to.
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use snafu::{ResultExt as _, Snafu};
use tokio::{pin, select};
use tracing::{debug, info, warn};

use crate::{
    broker::{Broker, BrokerHandle, ConnectionProvider},
    runtime::{
        ChildSpecification, InitializationError, ProcessShutdown, RestartPolicy, ShutdownReason, Supervisable,
        Supervisor, SupervisorError, SupervisorFuture, SupervisorHandle,
    },
    service::{Service, ServiceProcess},
};

const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_SERVICE_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const BROKER_STARTUP_MARGIN: Duration = Duration::from_secs(1);

/// Orchestrator errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum OrchestratorError {
    /// Neither a broker nor an external connection provider was configured.
    #[snafu(display("No broker or external connection provider was configured."))]
    NoBroker,

    /// A child could not be registered with the supervisor.
    #[snafu(display("Failed to register child: {}", source))]
    Registration {
        /// The underlying supervisor error.
        source: SupervisorError,
    },

    /// The supervisor failed.
    #[snafu(display("Supervisor failed: {}", source))]
    Supervision {
        /// The underlying supervisor error.
        source: SupervisorError,
    },
}

/// Where services get their broker connections from.
enum ConnectionSource {
    Local(BrokerHandle),
    External(ConnectionProvider),
}

/// Holds the broker's name in the supervision tree when an external provider is used instead.
struct BrokerPlaceholder {
    name: String,
}

#[async_trait]
impl Supervisable for BrokerPlaceholder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self, mut process_shutdown: ProcessShutdown) -> Result<SupervisorFuture, InitializationError> {
        Ok(Box::pin(async move {
            process_shutdown.wait_for_shutdown().await;
            Ok(())
        }))
    }
}

/// Brings up the broker and services under a single supervisor.
pub struct Orchestrator {
    supervisor: Supervisor,
    broker: Option<Broker>,
    external_provider: Option<ConnectionProvider>,
    services: Vec<Arc<dyn Service>>,
    ad_hoc_services: Vec<Arc<dyn Service>>,
    startup_timeout: Duration,
    service_shutdown_timeout: Duration,
}

impl Orchestrator {
    /// Creates a new `Orchestrator` that runs everything under `supervisor`.
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            supervisor,
            broker: None,
            external_provider: None,
            services: Vec::new(),
            ad_hoc_services: Vec::new(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            service_shutdown_timeout: DEFAULT_SERVICE_SHUTDOWN_TIMEOUT,
        }
    }

    /// Runs `broker` as the embedded broker.
    pub fn with_broker(mut self, broker: Broker) -> Self {
        self.broker = Some(broker);
        self
    }

    /// Connects services through `provider` instead of an embedded broker.
    ///
    /// If a broker is configured as well, the provider takes precedence and the broker is never started.
    pub fn with_connection_provider(mut self, provider: ConnectionProvider) -> Self {
        self.external_provider = Some(provider);
        self
    }

    /// Adds the configured services, in the order they should be registered.
    pub fn with_services<I>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn Service>>,
    {
        self.services.extend(services);
        self
    }

    /// Adds a service that is not part of the configuration.
    ///
    /// Ad-hoc services are registered after every configured service.
    pub fn with_ad_hoc_service(mut self, service: Arc<dyn Service>) -> Self {
        self.ad_hoc_services.push(service);
        self
    }

    /// Sets how long each child may take to initialize.
    pub fn with_startup_timeout(mut self, startup_timeout: Duration) -> Self {
        self.startup_timeout = startup_timeout;
        self
    }

    /// Sets how long each service is given to exit after shutdown is requested.
    pub fn with_service_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.service_shutdown_timeout = shutdown_timeout;
        self
    }

    /// Returns a handle to the underlying supervisor.
    pub fn supervisor_handle(&self) -> SupervisorHandle {
        self.supervisor.handle()
    }

    /// Runs the broker and every service until `process_shutdown` resolves.
    ///
    /// Returns the reason shutdown was requested once every child has stopped.
    ///
    /// # Errors
    ///
    /// If no connection source is configured, a service cannot be registered, or the supervisor fails, an error is
    /// returned.
    pub async fn run(mut self, process_shutdown: ProcessShutdown) -> Result<ShutdownReason, OrchestratorError> {
        let source = self.register_connection_source()?;

        let registration = register_services(
            self.supervisor.handle(),
            source,
            self.services.drain(..).chain(self.ad_hoc_services.drain(..)).collect(),
            self.startup_timeout,
            self.service_shutdown_timeout,
        );
        pin!(registration);

        let supervision = self.supervisor.run_with_process_shutdown(process_shutdown);
        pin!(supervision);

        let mut registered = false;
        loop {
            select! {
                biased;

                result = &mut supervision => return result.context(Supervision),
                result = &mut registration, if !registered => {
                    result?;
                    registered = true;
                }
            }
        }
    }

    fn register_connection_source(&mut self) -> Result<ConnectionSource, OrchestratorError> {
        match (self.broker.take(), self.external_provider.take()) {
            (None, None) => Err(OrchestratorError::NoBroker),
            (Some(broker), Some(provider)) => {
                let name = broker.config().server_name.clone();
                warn!(
                    broker = %name,
                    "Embedded broker and external provider both configured. Using the external provider."
                );

                let placeholder = ChildSpecification::new(BrokerPlaceholder { name })
                    .with_restart_policy(RestartPolicy::Permanent);
                self.supervisor.add_worker(placeholder).context(Registration)?;
                Ok(ConnectionSource::External(provider))
            }
            (Some(broker), None) => {
                let handle = broker.handle();

                // The broker reports its own startup failure, so the supervisor waits at least that long.
                let startup_timeout = self
                    .startup_timeout
                    .max(broker.config().startup_timeout + BROKER_STARTUP_MARGIN);
                debug!(
                    broker = %broker.config().server_name,
                    startup_timeout = ?startup_timeout,
                    "Registering embedded broker."
                );

                let child = ChildSpecification::new(broker)
                    .with_restart_policy(RestartPolicy::Permanent)
                    .with_startup_timeout(startup_timeout);
                self.supervisor.add_worker(child).context(Registration)?;
                Ok(ConnectionSource::Local(handle))
            }
            (None, Some(provider)) => {
                debug!("Using external connection provider.");
                Ok(ConnectionSource::External(provider))
            }
        }
    }
}

async fn register_services(
    supervisor: SupervisorHandle, source: ConnectionSource, services: Vec<Arc<dyn Service>>, startup_timeout: Duration,
    shutdown_timeout: Duration,
) -> Result<(), OrchestratorError> {
    let provider = match source {
        ConnectionSource::Local(broker) => broker.await_started(broker.startup_timeout()).await,
        ConnectionSource::External(provider) => provider,
    };

    let count = services.len();
    for service in services {
        let name = service.name().to_string();
        let process = ServiceProcess::new(service, Some(provider.clone())).with_shutdown_timeout(shutdown_timeout);
        let child = ChildSpecification::new(process)
            .with_restart_policy(RestartPolicy::Transient)
            .with_startup_timeout(startup_timeout);

        supervisor.add_worker(child).await.context(Registration)?;
        debug!(service = %name, "Registered service.");
    }

    info!(
        supervisor_id = supervisor.supervisor_id(),
        services = count,
        "All services registered."
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};

    use bmc_error::GenericError;

    use super::*;
    use crate::broker::{BrokerConfiguration, BrokerState};

    struct Probe {
        name: &'static str,
        saw_ready_broker: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Service for Probe {
        fn name(&self) -> &str {
            self.name
        }

        async fn run(
            &self, mut process_shutdown: ProcessShutdown, provider: Option<ConnectionProvider>,
        ) -> Result<(), GenericError> {
            if let Some(provider) = provider {
                if provider.get_connection().await.is_ok() {
                    self.saw_ready_broker.fetch_add(1, SeqCst);
                }
            }
            process_shutdown.wait_for_shutdown().await;
            Ok(())
        }
    }

    fn broker() -> Broker {
        Broker::new(BrokerConfiguration {
            server_name: "orchestrated-broker".to_string(),
            startup_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_millis(100),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn services_register_after_the_broker() {
        let saw_ready_broker = Arc::new(AtomicUsize::new(0));
        let orchestrator = Orchestrator::new(Supervisor::new("bmc").unwrap())
            .with_broker(broker())
            .with_services([Arc::new(Probe {
                name: "configured",
                saw_ready_broker: Arc::clone(&saw_ready_broker),
            }) as Arc<dyn Service>])
            .with_ad_hoc_service(Arc::new(Probe {
                name: "ad-hoc",
                saw_ready_broker: Arc::clone(&saw_ready_broker),
            }));
        let handle = orchestrator.supervisor_handle();

        let (process_shutdown, shutdown_handle) = ProcessShutdown::paired();
        let run = tokio::spawn(orchestrator.run(process_shutdown));

        tokio::time::timeout(Duration::from_secs(2), async {
            while saw_ready_broker.load(SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("services should connect to the broker");

        let names: Vec<_> = handle
            .children()
            .await
            .unwrap()
            .into_iter()
            .map(|child| child.name)
            .collect();
        assert_eq!(names, ["orchestrated-broker", "configured", "ad-hoc"]);

        shutdown_handle.trigger();
        assert_eq!(run.await.unwrap().unwrap(), ShutdownReason::Requested);
    }

    #[tokio::test]
    async fn broker_startup_is_not_cut_short_by_a_smaller_timeout() {
        let saw_ready_broker = Arc::new(AtomicUsize::new(0));
        let broker = broker();
        let broker_handle = broker.handle();
        let orchestrator = Orchestrator::new(Supervisor::new("bmc").unwrap())
            .with_broker(broker)
            .with_startup_timeout(Duration::from_millis(1))
            .with_services([Arc::new(Probe {
                name: "early",
                saw_ready_broker: Arc::clone(&saw_ready_broker),
            }) as Arc<dyn Service>]);
        let handle = orchestrator.supervisor_handle();

        let (process_shutdown, shutdown_handle) = ProcessShutdown::paired();
        let run = tokio::spawn(orchestrator.run(process_shutdown));

        tokio::time::timeout(Duration::from_secs(2), async {
            while saw_ready_broker.load(SeqCst) < 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("service should connect to the broker");

        let children = handle.children().await.unwrap();
        assert_eq!(children[0].name, "orchestrated-broker");
        assert_eq!(children[0].restart_count, 0);
        assert!(broker_handle.is_ready());

        shutdown_handle.trigger();
        assert_eq!(run.await.unwrap().unwrap(), ShutdownReason::Requested);
    }

    #[tokio::test]
    async fn no_connection_source_is_an_error() {
        let result = Orchestrator::new(Supervisor::new("bmc").unwrap())
            .run(ProcessShutdown::noop())
            .await;
        assert!(matches!(result, Err(OrchestratorError::NoBroker)));
    }

    #[tokio::test]
    async fn external_provider_takes_precedence() {
        let broker = broker();
        let broker_handle = broker.handle();
        let orchestrator = Orchestrator::new(Supervisor::new("bmc").unwrap())
            .with_broker(broker)
            .with_connection_provider(ConnectionProvider::unavailable());
        let handle = orchestrator.supervisor_handle();

        let (process_shutdown, shutdown_handle) = ProcessShutdown::paired();
        let run = tokio::spawn(orchestrator.run(process_shutdown));

        let children = handle.children().await.unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "orchestrated-broker");
        assert!(children[0].running);
        assert_eq!(broker_handle.state(), BrokerState::NotStarted);

        shutdown_handle.trigger();
        assert!(run.await.unwrap().is_ok());
        assert_eq!(broker_handle.state(), BrokerState::NotStarted);
    }
}
