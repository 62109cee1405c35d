use std::{
    future::{pending, Future},
    pin::Pin,
};

use snafu::Snafu;
use tokio::sync::oneshot;

/// Why a process was asked to shut down.
///
/// The reason is handed down unchanged from the root of the supervision tree to every child, so the component that
/// finally stops can report the original cause rather than an artifact of how it was stopped.
///
/// `ShutdownReason` is also an error type: a service may return it (wrapped in a `GenericError`) to signal that it
/// stopped because of a requested shutdown, which supervisors classify as a clean exit.
#[derive(Clone, Debug, Eq, PartialEq, Snafu)]
pub enum ShutdownReason {
    /// Shutdown was explicitly requested.
    #[snafu(display("shutdown requested"))]
    Requested,

    /// The process received an operating system signal.
    #[snafu(display("received {}", signal))]
    Signal {
        /// Name of the signal, such as `SIGTERM`.
        signal: &'static str,
    },

    /// The handle that could trigger shutdown was dropped without being triggered.
    #[snafu(display("shutdown handle dropped"))]
    Orphaned,

    /// Shutdown was requested for a caller-specific reason.
    #[snafu(display("{}", message))]
    Custom {
        /// Description of the reason.
        message: String,
    },
}

impl ShutdownReason {
    /// Creates a custom shutdown reason.
    pub fn custom<M: Into<String>>(message: M) -> Self {
        Self::Custom {
            message: message.into(),
        }
    }
}

type ShutdownFuture = Pin<Box<dyn Future<Output = ShutdownReason> + Send>>;

/// A shutdown signal for a process.
///
/// This struct can be used to wait for a shutdown signal from the supervisor to which the process belongs. Waiting is
/// cancel-safe: dropping a pending [`wait_for_shutdown`][Self::wait_for_shutdown] call (for example, as the losing
/// branch of a `select!`) does not consume the signal.
pub struct ProcessShutdown {
    shutdown: Option<ShutdownFuture>,
    reason: Option<ShutdownReason>,
}

/// A handle to trigger process shutdown.
pub struct ShutdownHandle {
    shutdown_tx: oneshot::Sender<ShutdownReason>,
}

impl ProcessShutdown {
    /// Creates a new `ProcessShutdown` and `ShutdownHandle` pair.
    ///
    /// When `ShutdownHandle` is triggered, `ProcessShutdown` resolves with the given reason. If the handle is dropped
    /// instead, it resolves with [`ShutdownReason::Orphaned`].
    pub fn paired() -> (Self, ShutdownHandle) {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let handle = ShutdownHandle { shutdown_tx };
        let process_shutdown = Self::from_future(async move { shutdown_rx.await.unwrap_or(ShutdownReason::Orphaned) });

        (process_shutdown, handle)
    }

    /// Creates a new `ProcessShutdown` from the given `future`.
    ///
    /// `ProcessShutdown` resolves with [`ShutdownReason::Requested`] once `future` resolves.
    pub fn wrapped<F: Future + Send + 'static>(future: F) -> Self {
        Self::from_future(async move {
            future.await;
            ShutdownReason::Requested
        })
    }

    /// Creates a new `ProcessShutdown` that never resolves.
    ///
    /// This is useful for cases where a `ProcessShutdown` is required, but no shutdown signal is expected.
    pub fn noop() -> Self {
        Self::from_future(pending())
    }

    fn from_future<F>(future: F) -> Self
    where
        F: Future<Output = ShutdownReason> + Send + 'static,
    {
        Self {
            shutdown: Some(Box::pin(future)),
            reason: None,
        }
    }

    /// Waits for the shutdown signal to be received, returning the reason.
    ///
    /// Once the signal has been received, all subsequent calls return the same reason immediately.
    pub async fn wait_for_shutdown(&mut self) -> ShutdownReason {
        if let Some(reason) = &self.reason {
            return reason.clone();
        }

        let reason = match self.shutdown.as_mut() {
            Some(shutdown) => shutdown.await,
            None => pending().await,
        };

        self.shutdown = None;
        self.reason = Some(reason.clone());
        reason
    }

    /// Returns the shutdown reason if the signal has already been observed.
    pub fn reason(&self) -> Option<&ShutdownReason> {
        self.reason.as_ref()
    }
}

impl ShutdownHandle {
    /// Triggers the process to shutdown with [`ShutdownReason::Requested`].
    pub fn trigger(self) {
        self.trigger_with(ShutdownReason::Requested);
    }

    /// Triggers the process to shutdown with the given reason.
    pub fn trigger_with(self, reason: ShutdownReason) {
        let _ = self.shutdown_tx.send(reason);
    }
}
