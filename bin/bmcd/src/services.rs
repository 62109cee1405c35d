//! Services hosted by the daemon itself.
use std::time::Duration;

use async_trait::async_trait;
use bmc_core::{
    broker::{Connection, ConnectionError, ConnectionProvider, ProviderError},
    runtime::ProcessShutdown,
    service::Service,
};
use bmc_error::GenericError;
use tokio::{select, time::MissedTickBehavior};
use tracing::{debug, error, warn};

/// Subject heartbeats are published to.
pub const HEARTBEAT_SUBJECT: &str = "bmc.heartbeat";

/// Subject the ping responder answers on.
pub const PING_SUBJECT: &str = "bmc.ping";

/// Connects to the broker.
///
/// Without a broker there is no IPC to serve, so the service idles until shutdown instead of failing and being
/// restarted over and over. Either way, shutdown resolves the wait with the shutdown reason as the error.
async fn connect(
    name: &str, process_shutdown: &mut ProcessShutdown, provider: Option<ConnectionProvider>,
) -> Result<Connection, GenericError> {
    let connected = match provider {
        Some(provider) => select! {
            reason = process_shutdown.wait_for_shutdown() => return Err(reason.into()),
            result = provider.get_connection() => result,
        },
        None => Err(ProviderError::ConnectionNotAvailable),
    };

    match connected {
        Ok(conn) => Ok(conn),
        Err(ProviderError::ConnectionNotAvailable) => {
            warn!(service = name, "No broker is available. Service is idle until shutdown.");
            Err(process_shutdown.wait_for_shutdown().await.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Periodically publishes a liveness message.
pub struct Heartbeat {
    daemon_name: String,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(daemon_name: impl Into<String>, interval: Duration) -> Self {
        Self {
            daemon_name: daemon_name.into(),
            interval,
        }
    }
}

#[async_trait]
impl Service for Heartbeat {
    fn name(&self) -> &str {
        "heartbeat"
    }

    async fn run(
        &self, mut process_shutdown: ProcessShutdown, provider: Option<ConnectionProvider>,
    ) -> Result<(), GenericError> {
        let conn = connect(self.name(), &mut process_shutdown, provider).await?;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut beats = 0u64;
        loop {
            select! {
                reason = process_shutdown.wait_for_shutdown() => return Err(reason.into()),
                _ = ticker.tick() => {
                    beats += 1;
                    let delivered = conn.publish(HEARTBEAT_SUBJECT, format!("{} {}", self.daemon_name, beats))?;
                    debug!(beats, delivered, "Published heartbeat.");
                }
            }
        }
    }
}

/// Answers every request on [`PING_SUBJECT`] with `pong`.
pub struct PingResponder;

#[async_trait]
impl Service for PingResponder {
    fn name(&self) -> &str {
        "ping"
    }

    async fn run(
        &self, mut process_shutdown: ProcessShutdown, provider: Option<ConnectionProvider>,
    ) -> Result<(), GenericError> {
        let conn = connect(self.name(), &mut process_shutdown, provider).await?;
        let mut requests = conn.subscribe(PING_SUBJECT)?;

        loop {
            select! {
                reason = process_shutdown.wait_for_shutdown() => return Err(reason.into()),
                request = requests.next() => match request {
                    Ok(message) => {
                        if let Err(e) = conn.respond(&message, "pong") {
                            warn!(error = %e, "Failed to answer ping.");
                        }
                    }
                    Err(ConnectionError::SlowConsumer { missed }) => {
                        warn!(missed, "Ping responder fell behind.");
                    }
                    Err(e) => {
                        error!(error = %e, "Ping subscription failed.");
                        return Err(e.into());
                    }
                },
            }
        }
    }
}
