use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use metrics::counter;
use snafu::Snafu;
use tokio::{select, sync::broadcast};
use tracing::{debug, warn};

use super::{
    bus::Bus,
    state::BrokerState,
    stream::{StreamError, StreamRecord},
};

/// A message delivered through the broker.
#[derive(Clone, Debug)]
pub struct Message {
    /// Subject the message was published to.
    pub subject: String,

    /// Subject a reply should be published to, if the sender expects one.
    pub reply_to: Option<String>,

    /// The message payload.
    pub payload: Bytes,
}

/// Connection errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ConnectionError {
    /// The broker is not accepting the operation in its current state.
    #[snafu(display("Broker is {}.", state))]
    NotReady {
        /// State of the broker at the time of the operation.
        state: BrokerState,
    },

    /// The broker has stopped, so the connection or subscription is closed.
    #[snafu(display("Connection to the broker is closed."))]
    Closed,

    /// The broker has no room for another connection.
    #[snafu(display("Broker allows at most {} concurrent connections.", max))]
    TooManyConnections {
        /// The connection limit.
        max: u64,
    },

    /// The subject is empty or contains whitespace.
    #[snafu(display("Invalid subject '{}'.", subject))]
    InvalidSubject {
        /// The rejected subject.
        subject: String,
    },

    /// The payload is larger than the broker allows.
    #[snafu(display("Payload of {} bytes exceeds the maximum of {} bytes.", size, max))]
    PayloadTooLarge {
        /// Size of the payload.
        size: usize,

        /// The payload limit.
        max: u64,
    },

    /// Nobody is subscribed to the subject a request was sent to.
    #[snafu(display("No responders for subject '{}'.", subject))]
    NoResponders {
        /// The request subject.
        subject: String,
    },

    /// No reply arrived before the request timed out.
    #[snafu(display("Request to '{}' timed out after {:?}.", subject, timeout))]
    RequestTimedOut {
        /// The request subject.
        subject: String,

        /// The request timeout.
        timeout: Duration,
    },

    /// The broker terminated the exchange while shutting down.
    #[snafu(display("Exchange was terminated by broker shutdown."))]
    Terminated,

    /// The message being responded to has no reply subject.
    #[snafu(display("Message on '{}' has no reply subject.", subject))]
    NoReplySubject {
        /// Subject of the message.
        subject: String,
    },

    /// The subscriber fell behind and messages were dropped.
    #[snafu(display("Subscriber fell behind and missed {} messages.", missed))]
    SlowConsumer {
        /// Number of messages dropped.
        missed: u64,
    },

    /// Durable streams are not enabled on this broker.
    #[snafu(display("Durable streams are not enabled."))]
    StreamingDisabled,

    /// A durable stream operation failed.
    #[snafu(display("Stream operation failed: {}", source))]
    Stream {
        /// The underlying stream error.
        source: StreamError,
    },
}

pub(super) fn validate_subject(subject: &str) -> Result<(), ConnectionError> {
    if subject.is_empty() || subject.chars().any(char::is_whitespace) {
        return Err(ConnectionError::InvalidSubject {
            subject: subject.to_string(),
        });
    }
    Ok(())
}

/// A connection to the in-process broker.
///
/// A connection belongs to one incarnation of the bus. When the broker restarts, operations on connections to the old
/// incarnation fail with [`ConnectionError::Closed`], and a new connection has to be obtained from the
/// [`ConnectionProvider`][super::ConnectionProvider].
pub struct Connection {
    id: u64,
    bus: Arc<Bus>,
}

impl Connection {
    pub(super) fn new(id: u64, bus: Arc<Bus>) -> Self {
        Self { id, bus }
    }

    /// Returns the identifier of this connection.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the name of the broker this connection belongs to.
    pub fn server_name(&self) -> &str {
        self.bus.server_name()
    }

    /// Publishes `payload` to every current subscriber of `subject`.
    ///
    /// Publishing is allowed while the broker drains, so replies to in-flight requests can still be delivered.
    ///
    /// Returns the number of subscribers the message was delivered to.
    pub fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> Result<usize, ConnectionError> {
        validate_subject(subject)?;
        self.bus.ensure_open()?;
        self.bus.publish_message(Message {
            subject: subject.to_string(),
            reply_to: None,
            payload: payload.into(),
        })
    }

    /// Subscribes to messages published to `subject`.
    pub fn subscribe(&self, subject: &str) -> Result<Subscription, ConnectionError> {
        validate_subject(subject)?;
        self.bus.ensure_ready()?;
        Ok(self.bus.subscribe_subject(subject))
    }

    /// Sends a request to `subject` and waits for the first reply.
    ///
    /// The request counts as an in-flight exchange: a draining broker waits for it to finish, up to its shutdown
    /// timeout.
    pub async fn request(
        &self, subject: &str, payload: impl Into<Bytes>, timeout: Duration,
    ) -> Result<Message, ConnectionError> {
        validate_subject(subject)?;
        let payload = payload.into();
        self.bus.check_payload(payload.len())?;

        let exchange = self.bus.begin_exchange()?;
        let inbox = self.bus.new_inbox();
        let mut replies = self.bus.subscribe_subject(&inbox);

        let result = async {
            let delivered = self.bus.publish_message(Message {
                subject: subject.to_string(),
                reply_to: Some(inbox.clone()),
                payload,
            })?;
            if delivered == 0 {
                return Err(ConnectionError::NoResponders {
                    subject: subject.to_string(),
                });
            }

            select! {
                biased;
                _ = exchange.terminated() => Err(ConnectionError::Terminated),
                reply = replies.next() => reply,
                _ = tokio::time::sleep(timeout) => Err(ConnectionError::RequestTimedOut {
                    subject: subject.to_string(),
                    timeout,
                }),
            }
        }
        .await;

        drop(replies);
        self.bus.prune_subject(&inbox);
        result
    }

    /// Publishes `payload` as the reply to `message`.
    pub fn respond(&self, message: &Message, payload: impl Into<Bytes>) -> Result<(), ConnectionError> {
        let reply_to = message.reply_to.as_deref().ok_or_else(|| ConnectionError::NoReplySubject {
            subject: message.subject.clone(),
        })?;
        self.publish(reply_to, payload).map(|_| ())
    }

    /// Appends `payload` to the durable stream `stream`, returning its sequence number.
    pub async fn append(&self, stream: &str, payload: impl Into<Bytes>) -> Result<u64, ConnectionError> {
        let payload = payload.into();
        self.bus.check_payload(payload.len())?;
        self.bus.ensure_ready()?;
        self.bus
            .streams()?
            .append(stream, payload)
            .await
            .map_err(|source| ConnectionError::Stream { source })
    }

    /// Reads the records of the durable stream `stream`, starting at `from_sequence`.
    pub async fn read_stream(&self, stream: &str, from_sequence: u64) -> Result<Vec<StreamRecord>, ConnectionError> {
        self.bus.ensure_open()?;
        self.bus
            .streams()?
            .read(stream, from_sequence)
            .await
            .map_err(|source| ConnectionError::Stream { source })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.bus.release_connection(self.id);
    }
}

/// A subscription to a subject.
pub struct Subscription {
    subject: String,
    rx: broadcast::Receiver<Message>,
    slow_consumer_detection: bool,
}

impl Subscription {
    pub(super) fn new(subject: String, rx: broadcast::Receiver<Message>, slow_consumer_detection: bool) -> Self {
        Self {
            subject,
            rx,
            slow_consumer_detection,
        }
    }

    /// Returns the subject of this subscription.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Waits for the next message.
    ///
    /// # Errors
    ///
    /// If the subscriber fell behind by more than the broker's slow-consumer threshold and detection is enabled,
    /// [`ConnectionError::SlowConsumer`] is returned once, after which delivery resumes with the oldest message still
    /// buffered. With detection disabled, missed messages are skipped silently.
    ///
    /// If the broker has stopped, [`ConnectionError::Closed`] is returned.
    pub async fn next(&mut self) -> Result<Message, ConnectionError> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Ok(message),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    if self.slow_consumer_detection {
                        counter!("broker_slow_consumers_total", "subject" => self.subject.clone()).increment(1);
                        warn!(subject = %self.subject, missed, "Subscriber fell behind. Messages were dropped.");
                        return Err(ConnectionError::SlowConsumer { missed });
                    }

                    debug!(subject = %self.subject, missed, "Subscriber fell behind. Skipping missed messages.");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(ConnectionError::Closed),
            }
        }
    }
}
