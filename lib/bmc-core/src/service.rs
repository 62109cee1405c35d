//! Services and their supervised wrapper.
use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use bmc_error::{generic_error, GenericError};
use futures::FutureExt as _;
use tracing::error;

use crate::{
    broker::ConnectionProvider,
    runtime::{InitializationError, ProcessShutdown, ShutdownStrategy, Supervisable, SupervisorFuture},
    task::panic_message,
};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A unit of work hosted by the BMC runtime.
///
/// Services are run under supervision, and are restarted according to the policy they are registered with. A service
/// must return promptly once `process_shutdown` resolves, and may return the
/// [`ShutdownReason`][crate::runtime::ShutdownReason] as its error to mark a clean cancellation.
///
/// `provider` is `None` when the service runs without IPC.
#[async_trait]
pub trait Service: Send + Sync {
    /// Returns the name of the service.
    ///
    /// The name identifies the service under its supervisor, and must be unique there.
    fn name(&self) -> &str;

    /// Runs the service until it completes, fails, or is shut down.
    async fn run(
        &self, process_shutdown: ProcessShutdown, provider: Option<ConnectionProvider>,
    ) -> Result<(), GenericError>;
}

/// Adapts a [`Service`] into a supervisable process.
///
/// A panic inside the service is caught and reported as an error, tagged with the service name, so that it is handled
/// by the service's restart policy like any other failure.
pub struct ServiceProcess {
    service: Arc<dyn Service>,
    provider: Option<ConnectionProvider>,
    shutdown_timeout: Duration,
}

impl ServiceProcess {
    /// Creates a new `ServiceProcess`.
    pub fn new(service: Arc<dyn Service>, provider: Option<ConnectionProvider>) -> Self {
        Self {
            service,
            provider,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Sets how long the service is given to exit after shutdown is requested before it is aborted.
    pub fn with_shutdown_timeout(mut self, shutdown_timeout: Duration) -> Self {
        self.shutdown_timeout = shutdown_timeout;
        self
    }
}

#[async_trait]
impl Supervisable for ServiceProcess {
    fn name(&self) -> &str {
        self.service.name()
    }

    fn shutdown_strategy(&self) -> ShutdownStrategy {
        ShutdownStrategy::Graceful(self.shutdown_timeout)
    }

    async fn initialize(&self, process_shutdown: ProcessShutdown) -> Result<SupervisorFuture, InitializationError> {
        let service = Arc::clone(&self.service);
        let provider = self.provider.clone();

        Ok(Box::pin(async move {
            let outcome = AssertUnwindSafe(service.run(process_shutdown, provider))
                .catch_unwind()
                .await;

            match outcome {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(&*payload);
                    error!(service = service.name(), panic = %message, "Service panicked.");
                    Err(generic_error!("{} panicked: {}", service.name(), message))
                }
            }
        }))
    }
}
