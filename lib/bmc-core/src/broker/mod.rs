//! Embedded message broker.
//!
//! The broker is an in-process publish/subscribe bus that every BMC service talks through. It runs as a supervised
//! process like any other, and services reach it through a [`ConnectionProvider`] rather than holding on to it
//! directly, so that a restarted broker is picked up transparently.
//!
//! Each start of the broker creates a fresh [`Bus`], which moves through the lifecycle described by [`BrokerState`].
//! Only a ready bus hands out connections. On shutdown, the bus drains: in-flight exchanges get until the configured
//! shutdown timeout to finish before they are terminated.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use bmc_error::generic_error;
use snafu::Snafu;
use tokio::{select, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::runtime::{
    InitializationError, ProcessShutdown, ShutdownReason, ShutdownStrategy, Supervisable, SupervisorFuture,
};

mod bus;
pub use self::bus::Bus;

mod config;
pub use self::config::{BrokerConfiguration, MAX_SLOW_CONSUMER_THRESHOLD};

mod connection;
pub use self::connection::{Connection, ConnectionError, Message, Subscription};

mod provider;
pub use self::provider::{ConnectionProvider, ProviderError};

mod state;
pub use self::state::BrokerState;

mod stream;
pub use self::stream::{StreamError, StreamRecord};

const HANDLE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Broker errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum BrokerError {
    /// The broker configuration is invalid.
    #[snafu(display("Invalid broker configuration: '{}' {}.", field, reason))]
    InvalidConfiguration {
        /// Name of the offending field.
        field: &'static str,

        /// Why the value is invalid.
        reason: String,
    },

    /// The requested state transition is not allowed.
    #[snafu(display("Broker cannot move from {} to {}.", from, to))]
    InvalidTransition {
        /// The current state.
        from: BrokerState,

        /// The requested state.
        to: BrokerState,
    },
}

/// State shared between a broker, its handles, and connection providers.
pub(crate) struct BrokerShared {
    current: ArcSwapOption<Bus>,
    startup_timeout: Duration,
    ready_timeout: Duration,
}

/// The embedded broker, as a supervisable process.
///
/// Every time the supervisor initializes the broker, a new [`Bus`] is created and started, and initialization only
/// completes once the bus is ready. If it fails to become ready within the startup timeout, initialization fails.
pub struct Broker {
    config: BrokerConfiguration,
    shared: Arc<BrokerShared>,
}

impl Broker {
    /// Creates a new `Broker`.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, an error is returned.
    pub fn new(config: BrokerConfiguration) -> Result<Self, BrokerError> {
        config.validate()?;

        let shared = Arc::new(BrokerShared {
            current: ArcSwapOption::empty(),
            startup_timeout: config.startup_timeout,
            ready_timeout: config.ready_timeout,
        });

        Ok(Self { config, shared })
    }

    /// Returns a handle to the broker.
    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Returns the broker configuration.
    pub fn config(&self) -> &BrokerConfiguration {
        &self.config
    }
}

#[async_trait]
impl Supervisable for Broker {
    fn name(&self) -> &str {
        &self.config.server_name
    }

    fn shutdown_strategy(&self) -> ShutdownStrategy {
        // Leave room for the drain to finish before the supervisor aborts us.
        ShutdownStrategy::Graceful(self.config.shutdown_timeout + Duration::from_secs(1))
    }

    async fn initialize(&self, mut process_shutdown: ProcessShutdown) -> Result<SupervisorFuture, InitializationError> {
        if let Some(previous) = self.shared.current.load_full() {
            if !previous.state().is_terminal() {
                debug!(broker = %self.config.server_name, "Stopping previous broker incarnation.");
                previous
                    .shutdown(ShutdownReason::Requested, self.config.shutdown_timeout)
                    .await;
            }
        }

        let bus = Bus::new(self.config.clone());
        bus.start().map_err(|e| InitializationError::Failed { source: e.into() })?;
        self.shared.current.store(Some(Arc::clone(&bus)));
        let startup_guard = StartupGuard::new(Arc::clone(&bus));

        let startup_timeout = self.config.startup_timeout;
        let ready = select! {
            ready = bus.await_ready(startup_timeout) => ready,
            reason = process_shutdown.wait_for_shutdown() => {
                bus.shutdown(reason, self.config.shutdown_timeout).await;
                return Err(InitializationError::Failed {
                    source: generic_error!("Broker was shut down while starting."),
                });
            }
        };

        if !ready {
            let state = bus.state();
            bus.shutdown(ShutdownReason::Requested, self.config.shutdown_timeout)
                .await;
            return Err(InitializationError::Failed {
                source: generic_error!(
                    "Broker '{}' did not become ready within {:?} (state: {}).",
                    self.config.server_name,
                    startup_timeout,
                    state
                ),
            });
        }

        startup_guard.disarm();

        let keep_alive_interval = self.config.keep_alive_interval;
        let shutdown_timeout = self.config.shutdown_timeout;

        Ok(Box::pin(async move {
            let mut keep_alive = tokio::time::interval(keep_alive_interval);
            keep_alive.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                select! {
                    reason = process_shutdown.wait_for_shutdown() => {
                        let reason = bus.shutdown(reason, shutdown_timeout).await;
                        debug!(%reason, "Broker shut down.");
                        return Ok(());
                    },
                    _ = keep_alive.tick() => bus.housekeeping(),
                    _ = bus.stopped() => {
                        warn!(broker = %bus.server_name(), "Broker stopped unexpectedly.");
                        return Err(generic_error!("Broker '{}' stopped unexpectedly.", bus.server_name()));
                    },
                }
            }
        }))
    }
}

/// Stops a bus if broker initialization is dropped before the bus was confirmed ready.
///
/// The supervisor drops `initialize` when the child's startup timeout expires, and the bus must not be left running
/// behind its back.
struct StartupGuard {
    bus: Arc<Bus>,
    armed: bool,
}

impl StartupGuard {
    fn new(bus: Arc<Bus>) -> Self {
        Self { bus, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StartupGuard {
    fn drop(&mut self) {
        if self.armed && !self.bus.state().is_terminal() {
            warn!(
                broker = %self.bus.server_name(),
                state = %self.bus.state(),
                "Broker startup was abandoned. Stopping bus."
            );
            self.bus.abandon();
        }
    }
}

/// A handle to a broker.
///
/// Handles observe whichever bus the broker is currently running, across restarts.
#[derive(Clone)]
pub struct BrokerHandle {
    shared: Arc<BrokerShared>,
}

impl BrokerHandle {
    /// Returns the state of the current bus, or [`BrokerState::NotStarted`] if the broker has never been started.
    pub fn state(&self) -> BrokerState {
        self.shared
            .current
            .load()
            .as_ref()
            .map_or(BrokerState::NotStarted, |bus| bus.state())
    }

    /// Returns `true` if the broker is accepting connections.
    pub fn is_ready(&self) -> bool {
        self.state() == BrokerState::Ready
    }

    /// Returns the bus the broker is currently running, if any.
    pub fn current_bus(&self) -> Option<Arc<Bus>> {
        self.shared.current.load_full()
    }

    /// Returns the broker's startup timeout.
    pub fn startup_timeout(&self) -> Duration {
        self.shared.startup_timeout
    }

    /// Returns a connection provider bound to this broker.
    pub fn connection_provider(&self) -> ConnectionProvider {
        ConnectionProvider::new(&self.shared)
    }

    /// Waits for the broker to be started by its supervisor, and returns a connection provider bound to it.
    ///
    /// "Started" means a bus exists, not that it is ready: the provider itself waits for readiness. If no bus appears
    /// within `timeout`, an unbound provider is returned, so that services fail fast instead of waiting on a broker
    /// that never came up.
    pub async fn await_started(&self, timeout: Duration) -> ConnectionProvider {
        let deadline = Instant::now() + timeout;
        loop {
            if self.shared.current.load().is_some() {
                info!("Broker started. Handing out connection provider.");
                return self.connection_provider();
            }

            if Instant::now() >= deadline {
                warn!("Broker was not started within {:?}. Services will run without a broker.", timeout);
                return ConnectionProvider::unavailable();
            }

            tokio::time::sleep(HANDLE_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> BrokerConfiguration {
        BrokerConfiguration {
            server_name: "test-broker".to_string(),
            startup_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_millis(100),
            keep_alive_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[test]
    fn invalid_configuration_is_rejected_eagerly() {
        let result = Broker::new(BrokerConfiguration {
            max_payload: -1,
            ..test_config()
        });
        assert!(matches!(
            result,
            Err(BrokerError::InvalidConfiguration {
                field: "max_payload",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn initialize_waits_for_ready_and_shuts_down_cleanly() {
        let broker = Broker::new(test_config()).unwrap();
        let handle = broker.handle();
        assert_eq!(handle.state(), BrokerState::NotStarted);

        let (process_shutdown, shutdown_handle) = ProcessShutdown::paired();
        let run = broker.initialize(process_shutdown).await.unwrap();
        assert!(handle.is_ready());

        let task = tokio::spawn(run);
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown_handle.trigger_with(ShutdownReason::custom("test"));
        task.await.unwrap().unwrap();
        assert_eq!(handle.state(), BrokerState::Stopped);
    }

    #[tokio::test]
    async fn reinitialize_replaces_the_bus() {
        let broker = Broker::new(test_config()).unwrap();
        let handle = broker.handle();

        let (first_shutdown, _first_handle) = ProcessShutdown::paired();
        let _first_run = broker.initialize(first_shutdown).await.unwrap();
        let first = handle.current_bus().unwrap();

        let (second_shutdown, _second_handle) = ProcessShutdown::paired();
        let _second_run = broker.initialize(second_shutdown).await.unwrap();
        let second = handle.current_bus().unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(first.state(), BrokerState::Stopped);
        assert_eq!(second.state(), BrokerState::Ready);
    }

    #[tokio::test]
    async fn initialize_fails_when_store_is_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let occupied = dir.path().join("occupied");
        std::fs::write(&occupied, b"file").unwrap();

        let broker = Broker::new(BrokerConfiguration {
            streaming_enabled: true,
            store_dir: occupied,
            ..test_config()
        })
        .unwrap();

        let result = broker.initialize(ProcessShutdown::noop()).await;
        assert!(matches!(result, Err(InitializationError::Failed { .. })));
        assert_eq!(broker.handle().state(), BrokerState::Stopped);
    }

    #[tokio::test]
    async fn abandoned_initialization_stops_the_bus() {
        let broker = Broker::new(test_config()).unwrap();
        let handle = broker.handle();

        // Drop `initialize` while it waits for readiness, the same way a startup timeout does.
        select! {
            biased;
            _ = broker.initialize(ProcessShutdown::noop()) => panic!("initialization should still be waiting"),
            _ = std::future::ready(()) => {}
        }

        let bus = handle.current_bus().unwrap();
        assert_eq!(bus.state(), BrokerState::Stopped);

        // Recovery finishing afterwards must not revive the bus.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.state(), BrokerState::Stopped);
        assert!(!handle.is_ready());
    }

    #[tokio::test]
    async fn await_started_gives_up_without_a_bus() {
        let broker = Broker::new(test_config()).unwrap();
        let provider = broker.handle().await_started(Duration::from_millis(30)).await;
        assert!(!provider.is_bound());
    }

    #[tokio::test]
    async fn await_started_returns_bound_provider() {
        let broker = Broker::new(test_config()).unwrap();
        let handle = broker.handle();

        let waiter = tokio::spawn(async move { handle.await_started(Duration::from_secs(1)).await });
        let _run = broker.initialize(ProcessShutdown::noop()).await.unwrap();

        let provider = waiter.await.unwrap();
        assert!(provider.is_bound());
        let conn = provider.get_connection().await.unwrap();
        assert_eq!(conn.server_name(), "test-broker");
    }
}
