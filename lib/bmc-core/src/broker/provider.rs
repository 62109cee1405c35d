use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use snafu::Snafu;
use tokio::time::Instant;
use tracing::debug;

use super::{
    connection::{Connection, ConnectionError},
    BrokerShared,
};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Connection provider errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ProviderError {
    /// The provider is not bound to a broker, or the broker is gone.
    #[snafu(display("No broker is available to connect to."))]
    ConnectionNotAvailable,

    /// The broker did not become ready in time.
    #[snafu(display("Broker did not become ready within {:?}.", waited))]
    ServerNotReady {
        /// How long the provider waited.
        waited: Duration,
    },

    /// The broker refused the in-process connection.
    #[snafu(display("Failed to open in-process connection: {}", source))]
    InProcessConnFailed {
        /// The underlying connection error.
        source: ConnectionError,
    },
}

/// Hands out connections to the embedded broker.
///
/// A provider only holds a weak reference to the broker, so it does not keep the broker alive. When the broker
/// restarts, the provider follows it and connects to the new incarnation.
#[derive(Clone)]
pub struct ConnectionProvider {
    broker: Option<Weak<BrokerShared>>,
    ready_timeout: Duration,
}

impl ConnectionProvider {
    pub(super) fn new(shared: &Arc<BrokerShared>) -> Self {
        Self {
            broker: Some(Arc::downgrade(shared)),
            ready_timeout: shared.ready_timeout,
        }
    }

    /// Creates a provider that is not bound to any broker.
    ///
    /// Every call to [`get_connection`][Self::get_connection] fails immediately.
    pub fn unavailable() -> Self {
        Self {
            broker: None,
            ready_timeout: Duration::ZERO,
        }
    }

    /// Sets how long `get_connection` waits for the broker to become ready.
    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }

    /// Returns `true` if the provider is bound to a broker that still exists.
    pub fn is_bound(&self) -> bool {
        self.broker.as_ref().is_some_and(|broker| broker.strong_count() > 0)
    }

    /// Opens a connection to the broker.
    ///
    /// If the broker is still starting, this waits for it to become ready, up to the provider's ready timeout. A
    /// connection is never returned for a broker that is not ready.
    ///
    /// # Errors
    ///
    /// If the provider is unbound, the broker does not become ready in time, or the broker refuses the connection, an
    /// error is returned.
    pub async fn get_connection(&self) -> Result<Connection, ProviderError> {
        let shared = self
            .broker
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(ProviderError::ConnectionNotAvailable)?;

        let started = Instant::now();
        let deadline = started + self.ready_timeout;
        loop {
            if let Some(bus) = shared.current.load_full() {
                if bus.is_ready() {
                    return bus
                        .connect()
                        .map_err(|source| ProviderError::InProcessConnFailed { source });
                }
            }

            if Instant::now() >= deadline {
                debug!(waited = ?self.ready_timeout, "Broker not ready in time.");
                return Err(ProviderError::ServerNotReady {
                    waited: started.elapsed(),
                });
            }

            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use arc_swap::ArcSwapOption;

    use super::*;
    use crate::broker::{Bus, BrokerConfiguration, BrokerState};

    fn shared_with(bus: Option<Arc<Bus>>) -> Arc<BrokerShared> {
        Arc::new(BrokerShared {
            current: ArcSwapOption::new(bus),
            startup_timeout: Duration::from_secs(1),
            ready_timeout: Duration::from_millis(500),
        })
    }

    #[tokio::test]
    async fn unbound_provider_fails_fast() {
        let provider = ConnectionProvider::unavailable().with_ready_timeout(Duration::from_secs(30));
        assert!(!provider.is_bound());

        let started = Instant::now();
        assert!(matches!(
            provider.get_connection().await,
            Err(ProviderError::ConnectionNotAvailable)
        ));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn dropped_broker_is_not_available() {
        let shared = shared_with(None);
        let provider = ConnectionProvider::new(&shared);
        assert!(provider.is_bound());

        drop(shared);
        assert!(!provider.is_bound());
        assert!(matches!(
            provider.get_connection().await,
            Err(ProviderError::ConnectionNotAvailable)
        ));
    }

    #[tokio::test]
    async fn waits_for_starting_broker() {
        let bus = Bus::new(BrokerConfiguration::default());
        bus.start_without_recovery().unwrap();
        let shared = shared_with(Some(Arc::clone(&bus)));
        let provider = ConnectionProvider::new(&shared);

        let pending = tokio::spawn(async move { provider.get_connection().await });
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!pending.is_finished());

        bus.finish_recovery().unwrap();
        let conn = pending.await.unwrap().unwrap();
        assert_eq!(conn.server_name(), bus.server_name());
        assert_eq!(bus.connection_count(), 1);
    }

    #[tokio::test]
    async fn never_connects_before_ready() {
        let bus = Bus::new(BrokerConfiguration::default());
        bus.start_without_recovery().unwrap();
        let shared = shared_with(Some(Arc::clone(&bus)));
        let provider = ConnectionProvider::new(&shared).with_ready_timeout(Duration::from_millis(80));

        match provider.get_connection().await {
            Err(ProviderError::ServerNotReady { waited }) => assert!(waited >= Duration::from_millis(80)),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("connected to a broker that is not ready"),
        }
        assert_eq!(bus.state(), BrokerState::Starting);
        assert_eq!(bus.connection_count(), 0);
    }
}
