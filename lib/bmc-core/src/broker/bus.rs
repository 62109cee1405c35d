use std::{
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering::SeqCst},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use metrics::gauge;
use tokio::{
    select,
    sync::{broadcast, Notify},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    config::limit,
    connection::{Connection, ConnectionError, Message, Subscription},
    state::{BrokerState, StateCell},
    stream::StreamStore,
    BrokerConfiguration, BrokerError,
};
use crate::{collections::FastHashMap, runtime::ShutdownReason, task::spawn_traced};

const INBOX_PREFIX: &str = "_INBOX";

/// Tracks exchanges that a draining bus waits for.
struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlight {
    fn new() -> Self {
        Self {
            count: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    fn count(&self) -> usize {
        self.count.load(SeqCst)
    }

    fn finish(&self) {
        if self.count.fetch_sub(1, SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    async fn wait_drained(&self) {
        loop {
            // Created before the check so a wakeup between the check and the await is not lost.
            let notified = self.drained.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// An exchange in flight on a bus.
pub(super) struct Exchange<'a> {
    bus: &'a Bus,
}

impl Exchange<'_> {
    /// Resolves when the bus force-terminates in-flight exchanges.
    pub async fn terminated(&self) {
        self.bus.terminate.cancelled().await
    }
}

impl Drop for Exchange<'_> {
    fn drop(&mut self) {
        self.bus.in_flight.finish();
    }
}

/// One incarnation of the embedded message bus.
///
/// A bus is created in [`BrokerState::NotStarted`], and moves through its lifecycle exactly once: a restarted broker
/// creates a new bus.
///
/// Subjects are matched exactly. Each subject is backed by a broadcast channel whose capacity is the slow-consumer
/// threshold, so a subscriber that falls further behind than that loses the oldest messages.
pub struct Bus {
    config: BrokerConfiguration,
    state: StateCell,
    subjects: Mutex<FastHashMap<String, broadcast::Sender<Message>>>,
    streams: Option<StreamStore>,
    max_connections: Option<u64>,
    max_payload: Option<u64>,
    connections: AtomicUsize,
    next_connection_id: AtomicU64,
    next_inbox_id: AtomicU64,
    in_flight: InFlight,
    terminate: CancellationToken,
}

impl Bus {
    /// Creates a new bus that has not been started.
    pub fn new(config: BrokerConfiguration) -> Arc<Self> {
        let streams = config.streaming_enabled.then(|| {
            StreamStore::new(
                config.store_dir.clone(),
                limit(config.max_memory),
                limit(config.max_storage),
            )
        });

        Arc::new(Self {
            max_connections: limit(config.max_connections),
            max_payload: limit(config.max_payload),
            config,
            state: StateCell::new(),
            subjects: Mutex::new(FastHashMap::default()),
            streams,
            connections: AtomicUsize::new(0),
            next_connection_id: AtomicU64::new(1),
            next_inbox_id: AtomicU64::new(1),
            in_flight: InFlight::new(),
            terminate: CancellationToken::new(),
        })
    }

    /// Starts the bus.
    ///
    /// The configuration is validated first, and nothing changes if it is invalid. Otherwise, the bus moves to
    /// [`BrokerState::Starting`] and recovers durable streams in the background, after which it becomes
    /// [`BrokerState::Ready`]. If recovery fails, the bus stops instead.
    ///
    /// # Errors
    ///
    /// If the configuration is invalid, or the bus was already started, an error is returned.
    pub fn start(self: &Arc<Self>) -> Result<(), BrokerError> {
        self.config.validate()?;
        self.state.transition(BrokerState::Starting)?;

        info!(
            broker = %self.config.server_name,
            streaming = self.streams.is_some(),
            "Broker starting."
        );

        let bus = Arc::clone(self);
        spawn_traced(async move { bus.recover().await });

        Ok(())
    }

    #[cfg(test)]
    pub(super) fn start_without_recovery(self: &Arc<Self>) -> Result<(), BrokerError> {
        self.config.validate()?;
        self.state.transition(BrokerState::Starting).map(|_| ())
    }

    #[cfg(test)]
    pub(super) fn finish_recovery(&self) -> Result<(), BrokerError> {
        self.state.transition(BrokerState::Ready).map(|_| ())
    }

    async fn recover(&self) {
        let recovered = match &self.streams {
            Some(streams) => select! {
                result = streams.recover() => result,
                _ = self.terminate.cancelled() => return,
            },
            None => Ok(0),
        };

        match recovered {
            Ok(streams) => match self.state.transition(BrokerState::Ready) {
                Ok(_) => info!(broker = %self.config.server_name, streams, "Broker ready."),
                Err(e) => debug!(broker = %self.config.server_name, error = %e, "Broker stopped before becoming ready."),
            },
            Err(e) => {
                error!(broker = %self.config.server_name, error = %e, "Failed to recover durable streams.");
                self.stop();
            }
        }
    }

    /// Returns the name of the broker.
    pub fn server_name(&self) -> &str {
        &self.config.server_name
    }

    /// Returns the current state.
    pub fn state(&self) -> BrokerState {
        self.state.current()
    }

    /// Returns `true` if the bus is accepting connections.
    pub fn is_ready(&self) -> bool {
        self.state() == BrokerState::Ready
    }

    /// Waits until the bus is ready, or `timeout` elapses.
    ///
    /// Returns `true` if the bus is ready. A bus that stops while being waited on is never going to become ready, so
    /// the wait ends early with `false`.
    pub async fn await_ready(&self, timeout: Duration) -> bool {
        let state = self
            .state
            .wait_until(timeout, |state| {
                !matches!(state, BrokerState::NotStarted | BrokerState::Starting)
            })
            .await;
        state == BrokerState::Ready
    }

    /// Waits until the bus has stopped.
    pub async fn stopped(&self) {
        self.state.stopped().await
    }

    /// Shuts the bus down.
    ///
    /// A ready bus first enters lame-duck mode: new connections and exchanges are refused, and exchanges already in
    /// flight are given until `deadline` to finish. Any still running after that are terminated. A bus that is still
    /// starting is stopped right away.
    ///
    /// Returns `reason` unchanged: a drain that misses its deadline is only logged.
    pub async fn shutdown(&self, reason: ShutdownReason, deadline: Duration) -> ShutdownReason {
        match self.state() {
            BrokerState::Ready => {
                if self.state.transition(BrokerState::Draining).is_err() {
                    // Lost a race with a concurrent shutdown.
                    self.stopped().await;
                    return reason;
                }

                info!(
                    broker = %self.config.server_name,
                    %reason,
                    in_flight = self.in_flight.count(),
                    "Broker draining."
                );

                if tokio::time::timeout(deadline, self.in_flight.wait_drained()).await.is_err() {
                    warn!(
                        broker = %self.config.server_name,
                        in_flight = self.in_flight.count(),
                        "Broker did not drain within {:?}. Terminating in-flight exchanges.",
                        deadline
                    );
                }

                self.stop();
            }
            BrokerState::Starting => {
                info!(broker = %self.config.server_name, %reason, "Broker stopped while starting.");
                self.stop();
            }
            BrokerState::Draining => self.stopped().await,
            BrokerState::NotStarted | BrokerState::Stopped => {}
        }

        reason
    }

    /// Stops a bus whose startup was abandoned before its owner saw it become ready.
    ///
    /// In-flight exchanges are terminated immediately.
    pub(super) fn abandon(&self) {
        if self.state() == BrokerState::Ready {
            let _ = self.state.transition(BrokerState::Draining);
        }
        self.stop();
    }

    fn stop(&self) {
        self.terminate.cancel();
        self.lock_subjects().clear();
        if self.state.transition(BrokerState::Stopped).is_ok() {
            info!(broker = %self.config.server_name, "Broker stopped.");
        }
    }

    /// Opens a new connection.
    ///
    /// # Errors
    ///
    /// If the bus is not ready, or the connection limit has been reached, an error is returned.
    pub fn connect(self: &Arc<Self>) -> Result<Connection, ConnectionError> {
        self.ensure_ready()?;

        let max_connections = self.max_connections;
        let reserved = self.connections.fetch_update(SeqCst, SeqCst, |open| match max_connections {
            Some(max) if open as u64 >= max => None,
            _ => Some(open + 1),
        });
        if reserved.is_err() {
            return Err(ConnectionError::TooManyConnections {
                max: max_connections.unwrap_or_default(),
            });
        }

        let id = self.next_connection_id.fetch_add(1, SeqCst);
        debug!(broker = %self.config.server_name, connection_id = id, "Connection opened.");
        Ok(Connection::new(id, Arc::clone(self)))
    }

    /// Returns the number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.load(SeqCst)
    }

    /// Returns the number of exchanges in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.count()
    }

    /// Prunes subjects without subscribers and reports connection and subject gauges.
    pub fn housekeeping(&self) {
        let (subjects, pruned) = {
            let mut subjects = self.lock_subjects();
            let before = subjects.len();
            subjects.retain(|_, tx| tx.receiver_count() > 0);
            (subjects.len(), before - subjects.len())
        };
        let connections = self.connection_count();

        gauge!("broker_connections", "broker" => self.config.server_name.clone()).set(connections as f64);
        gauge!("broker_subjects", "broker" => self.config.server_name.clone()).set(subjects as f64);
        debug!(broker = %self.config.server_name, connections, subjects, pruned, "Broker housekeeping complete.");
    }

    fn lock_subjects(&self) -> MutexGuard<'_, FastHashMap<String, broadcast::Sender<Message>>> {
        self.subjects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn release_connection(&self, id: u64) {
        self.connections.fetch_sub(1, SeqCst);
        debug!(broker = %self.config.server_name, connection_id = id, "Connection closed.");
    }

    /// Fails unless the bus accepts new work.
    pub(super) fn ensure_ready(&self) -> Result<(), ConnectionError> {
        match self.state() {
            BrokerState::Ready => Ok(()),
            BrokerState::Stopped => Err(ConnectionError::Closed),
            state => Err(ConnectionError::NotReady { state }),
        }
    }

    /// Fails unless the bus still delivers messages, which it does while draining.
    pub(super) fn ensure_open(&self) -> Result<(), ConnectionError> {
        match self.state() {
            BrokerState::Ready | BrokerState::Draining => Ok(()),
            BrokerState::Stopped => Err(ConnectionError::Closed),
            state => Err(ConnectionError::NotReady { state }),
        }
    }

    pub(super) fn check_payload(&self, size: usize) -> Result<(), ConnectionError> {
        match self.max_payload {
            Some(max) if size as u64 > max => Err(ConnectionError::PayloadTooLarge { size, max }),
            _ => Ok(()),
        }
    }

    pub(super) fn streams(&self) -> Result<&StreamStore, ConnectionError> {
        self.streams.as_ref().ok_or(ConnectionError::StreamingDisabled)
    }

    /// Registers an exchange as in flight.
    ///
    /// The count is raised before the state is checked, so a drain that starts concurrently either waits for this
    /// exchange or this exchange sees the bus draining.
    pub(super) fn begin_exchange(&self) -> Result<Exchange<'_>, ConnectionError> {
        self.in_flight.count.fetch_add(1, SeqCst);
        let exchange = Exchange { bus: self };
        self.ensure_ready()?;
        Ok(exchange)
    }

    pub(super) fn new_inbox(&self) -> String {
        format!("{}.{}", INBOX_PREFIX, self.next_inbox_id.fetch_add(1, SeqCst))
    }

    pub(super) fn publish_message(&self, message: Message) -> Result<usize, ConnectionError> {
        self.check_payload(message.payload.len())?;

        let subjects = self.lock_subjects();
        let delivered = match subjects.get(&message.subject) {
            Some(tx) => tx.send(message).unwrap_or(0),
            None => 0,
        };
        Ok(delivered)
    }

    pub(super) fn subscribe_subject(&self, subject: &str) -> Subscription {
        let capacity = self.config.slow_consumer_capacity();
        let rx = self
            .lock_subjects()
            .entry(subject.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0)
            .subscribe();

        Subscription::new(subject.to_string(), rx, self.config.slow_consumer_detection)
    }

    pub(super) fn prune_subject(&self, subject: &str) {
        let mut subjects = self.lock_subjects();
        if subjects.get(subject).is_some_and(|tx| tx.receiver_count() == 0) {
            subjects.remove(subject);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use bytes::Bytes;

    use super::*;

    fn test_config() -> BrokerConfiguration {
        BrokerConfiguration {
            server_name: "test-broker".to_string(),
            startup_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    async fn ready_bus(config: BrokerConfiguration) -> Arc<Bus> {
        let bus = Bus::new(config);
        bus.start().unwrap();
        assert!(bus.await_ready(Duration::from_secs(1)).await);
        bus
    }

    #[tokio::test]
    async fn invalid_configuration_never_leaves_not_started() {
        let bus = Bus::new(BrokerConfiguration {
            startup_timeout: Duration::ZERO,
            ..test_config()
        });

        let err = bus.start().unwrap_err();
        assert!(matches!(
            err,
            BrokerError::InvalidConfiguration {
                field: "startup_timeout",
                ..
            }
        ));
        assert_eq!(bus.state(), BrokerState::NotStarted);
        assert!(!bus.await_ready(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let bus = ready_bus(test_config()).await;
        assert!(matches!(
            bus.start(),
            Err(BrokerError::InvalidTransition {
                from: BrokerState::Ready,
                to: BrokerState::Starting
            })
        ));
    }

    #[tokio::test]
    async fn publish_fans_out_to_exact_subject() {
        let bus = ready_bus(test_config()).await;
        let conn = bus.connect().unwrap();

        let mut first = conn.subscribe("chassis.power").unwrap();
        let mut second = conn.subscribe("chassis.power").unwrap();
        let mut other = conn.subscribe("chassis.power.button").unwrap();

        assert_eq!(conn.publish("chassis.power", "on").unwrap(), 2);

        assert_eq!(first.next().await.unwrap().payload, Bytes::from_static(b"on"));
        assert_eq!(second.next().await.unwrap().payload, Bytes::from_static(b"on"));
        assert!(tokio::time::timeout(Duration::from_millis(20), other.next()).await.is_err());
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let bus = ready_bus(test_config()).await;
        let responder = bus.connect().unwrap();
        let requester = bus.connect().unwrap();

        let mut requests = responder.subscribe("sensor.read").unwrap();
        tokio::spawn(async move {
            let request = requests.next().await.unwrap();
            assert_eq!(request.payload, Bytes::from_static(b"cpu0_temp"));
            responder.respond(&request, "42").unwrap();
        });

        let reply = requester
            .request("sensor.read", "cpu0_temp", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.payload, Bytes::from_static(b"42"));
        assert_eq!(bus.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn request_without_responders_fails_fast() {
        let bus = ready_bus(test_config()).await;
        let conn = bus.connect().unwrap();

        let err = conn
            .request("nobody.home", "ping", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::NoResponders { .. }));
        assert_eq!(bus.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn request_times_out_without_reply() {
        let bus = ready_bus(test_config()).await;
        let conn = bus.connect().unwrap();
        let _silent = conn.subscribe("sensor.read").unwrap();

        let err = conn
            .request("sensor.read", "fan0", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectionError::RequestTimedOut { .. }));
    }

    #[tokio::test]
    async fn payload_limit_is_enforced() {
        let bus = ready_bus(BrokerConfiguration {
            max_payload: 4,
            ..test_config()
        })
        .await;
        let conn = bus.connect().unwrap();

        let err = conn.publish("fru.data", vec![0u8; 5]).unwrap_err();
        assert!(matches!(err, ConnectionError::PayloadTooLarge { size: 5, max: 4 }));
        assert!(conn.publish("fru.data", vec![0u8; 4]).is_ok());
    }

    #[tokio::test]
    async fn connection_limit_is_enforced() {
        let bus = ready_bus(BrokerConfiguration {
            max_connections: 1,
            ..test_config()
        })
        .await;

        let first = bus.connect().unwrap();
        assert!(matches!(
            bus.connect(),
            Err(ConnectionError::TooManyConnections { max: 1 })
        ));

        drop(first);
        assert_eq!(bus.connection_count(), 0);
        assert!(bus.connect().is_ok());
    }

    #[tokio::test]
    async fn slow_consumer_is_reported_when_detection_enabled() {
        let bus = ready_bus(BrokerConfiguration {
            slow_consumer_threshold: 4,
            ..test_config()
        })
        .await;
        let conn = bus.connect().unwrap();
        let mut sub = conn.subscribe("sel.events").unwrap();

        for i in 0..64u32 {
            conn.publish("sel.events", i.to_be_bytes().to_vec()).unwrap();
        }

        match sub.next().await {
            Err(ConnectionError::SlowConsumer { missed }) => assert!(missed > 0),
            other => panic!("expected SlowConsumer, got: {:?}", other.map(|m| m.payload)),
        }
        // Delivery resumes after the report.
        assert!(sub.next().await.is_ok());
    }

    #[tokio::test]
    async fn slow_consumer_skips_silently_when_detection_disabled() {
        let bus = ready_bus(BrokerConfiguration {
            slow_consumer_threshold: 4,
            slow_consumer_detection: false,
            ..test_config()
        })
        .await;
        let conn = bus.connect().unwrap();
        let mut sub = conn.subscribe("sel.events").unwrap();

        for i in 0..64u32 {
            conn.publish("sel.events", i.to_be_bytes().to_vec()).unwrap();
        }

        let message = sub.next().await.unwrap();
        assert_ne!(message.payload, Bytes::from(0u32.to_be_bytes().to_vec()));
    }

    #[tokio::test]
    async fn streams_require_streaming_enabled() {
        let bus = ready_bus(test_config()).await;
        let conn = bus.connect().unwrap();

        assert!(matches!(
            conn.append("sel", "entry").await,
            Err(ConnectionError::StreamingDisabled)
        ));
    }

    #[tokio::test]
    async fn streams_survive_bus_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfiguration {
            streaming_enabled: true,
            store_dir: dir.path().to_path_buf(),
            ..test_config()
        };

        let bus = ready_bus(config.clone()).await;
        {
            let conn = bus.connect().unwrap();
            assert_eq!(conn.append("sel", "ac lost").await.unwrap(), 1);
            assert_eq!(conn.append("sel", "ac restored").await.unwrap(), 2);
        }
        bus.shutdown(ShutdownReason::Requested, Duration::from_millis(50)).await;

        let bus = ready_bus(config).await;
        let conn = bus.connect().unwrap();
        let records = conn.read_stream("sel", 1).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].payload, Bytes::from_static(b"ac restored"));
    }

    #[tokio::test]
    async fn unusable_store_dir_stops_the_bus() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("occupied");
        std::fs::write(&not_a_dir, b"file").unwrap();

        let bus = Bus::new(BrokerConfiguration {
            streaming_enabled: true,
            store_dir: not_a_dir,
            ..test_config()
        });
        bus.start().unwrap();

        assert!(!bus.await_ready(Duration::from_secs(1)).await);
        assert_eq!(bus.state(), BrokerState::Stopped);
    }

    #[tokio::test]
    async fn draining_refuses_new_work_but_lets_exchanges_finish() {
        let bus = ready_bus(test_config()).await;
        let responder = bus.connect().unwrap();
        let requester = bus.connect().unwrap();
        let mut requests = responder.subscribe("power.cycle").unwrap();

        let request = tokio::spawn(async move {
            requester
                .request("power.cycle", "host0", Duration::from_secs(5))
                .await
        });
        let pending = requests.next().await.unwrap();

        let shutdown = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move {
                bus.shutdown(ShutdownReason::custom("maintenance"), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(bus.state(), BrokerState::Draining);
        assert!(matches!(
            bus.connect(),
            Err(ConnectionError::NotReady {
                state: BrokerState::Draining
            })
        ));

        // Replies still flow while draining.
        responder.respond(&pending, "done").unwrap();
        let reply = request.await.unwrap().unwrap();
        assert_eq!(reply.payload, Bytes::from_static(b"done"));

        let reason = shutdown.await.unwrap();
        assert_eq!(reason, ShutdownReason::custom("maintenance"));
        assert_eq!(bus.state(), BrokerState::Stopped);
    }

    #[tokio::test]
    async fn drain_past_deadline_terminates_exchanges() {
        let bus = ready_bus(test_config()).await;
        let responder = bus.connect().unwrap();
        let requester = bus.connect().unwrap();
        let _never_answers = responder.subscribe("host.console").unwrap();

        let request = tokio::spawn(async move {
            requester
                .request("host.console", "attach", Duration::from_secs(30))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.in_flight_count(), 1);

        let started = Instant::now();
        let reason = ShutdownReason::Signal { signal: "SIGTERM" };
        let returned = bus.shutdown(reason.clone(), Duration::from_millis(50)).await;

        assert_eq!(returned, reason);
        assert_eq!(bus.state(), BrokerState::Stopped);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(
            request.await.unwrap(),
            Err(ConnectionError::Terminated)
        ));
    }

    #[tokio::test]
    async fn shutdown_while_starting_stops_without_draining() {
        let bus = Bus::new(test_config());
        bus.start_without_recovery().unwrap();

        let reason = bus.shutdown(ShutdownReason::Requested, Duration::from_secs(1)).await;
        assert_eq!(reason, ShutdownReason::Requested);
        assert_eq!(bus.state(), BrokerState::Stopped);
    }

    #[tokio::test]
    async fn subscriptions_close_when_bus_stops() {
        let bus = ready_bus(test_config()).await;
        let conn = bus.connect().unwrap();
        let mut sub = conn.subscribe("chassis.intrusion").unwrap();

        bus.shutdown(ShutdownReason::Requested, Duration::from_millis(50)).await;

        assert!(matches!(sub.next().await, Err(ConnectionError::Closed)));
        assert!(matches!(conn.publish("chassis.intrusion", "x"), Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn housekeeping_prunes_unused_subjects() {
        let bus = ready_bus(test_config()).await;
        let conn = bus.connect().unwrap();

        let kept = conn.subscribe("kept").unwrap();
        drop(conn.subscribe("dropped").unwrap());

        bus.housekeeping();

        let subjects = bus.lock_subjects();
        assert!(subjects.contains_key("kept"));
        assert!(!subjects.contains_key("dropped"));
        drop(kept);
    }
}
