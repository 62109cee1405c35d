use std::{fmt, time::Duration};

use tokio::sync::watch;

use super::BrokerError;

/// Lifecycle state of a broker.
///
/// ```text
/// NotStarted -> Starting -> Ready -> Draining -> Stopped
///                   |                              ^
///                   +------------------------------+
/// ```
///
/// No transition may be skipped: a bus only stops without draining if it never became ready.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BrokerState {
    /// The bus has been created but not started.
    NotStarted,

    /// The bus is recovering durable state and is not yet accepting connections.
    Starting,

    /// The bus is accepting connections.
    Ready,

    /// The bus refuses new connections and exchanges while in-flight ones finish.
    Draining,

    /// The bus has stopped.
    Stopped,
}

impl BrokerState {
    /// Returns `true` if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: BrokerState) -> bool {
        use BrokerState::*;

        matches!(
            (self, next),
            (NotStarted, Starting) | (Starting, Ready) | (Starting, Stopped) | (Ready, Draining) | (Draining, Stopped)
        )
    }

    /// Returns `true` if the state can never change again.
    pub fn is_terminal(self) -> bool {
        self == BrokerState::Stopped
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Owner of a bus's state, observable by any number of waiters.
pub(super) struct StateCell {
    tx: watch::Sender<BrokerState>,
}

impl StateCell {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(BrokerState::NotStarted);
        Self { tx }
    }

    pub fn current(&self) -> BrokerState {
        *self.tx.borrow()
    }

    /// Moves to `next`, returning the previous state.
    ///
    /// # Errors
    ///
    /// If the transition is not allowed from the current state, an error is returned and the state is unchanged.
    pub fn transition(&self, next: BrokerState) -> Result<BrokerState, BrokerError> {
        let mut outcome = Err(BrokerError::InvalidTransition {
            from: next,
            to: next,
        });

        self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                outcome = Ok(*state);
                *state = next;
                true
            } else {
                outcome = Err(BrokerError::InvalidTransition { from: *state, to: next });
                false
            }
        });

        outcome
    }

    /// Waits until the state satisfies `predicate`, or `timeout` elapses.
    ///
    /// Returns the state that was observed last.
    pub async fn wait_until<F>(&self, timeout: Duration, mut predicate: F) -> BrokerState
    where
        F: FnMut(BrokerState) -> bool,
    {
        let mut rx = self.tx.subscribe();
        let wait = async {
            match rx.wait_for(|state| predicate(*state)).await {
                Ok(state) => *state,
                Err(_) => self.current(),
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or_else(|_| self.current())
    }

    /// Waits until the state becomes terminal.
    pub async fn stopped(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|state| state.is_terminal()).await;
    }
}
