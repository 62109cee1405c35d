use std::{collections::VecDeque, fmt, time::Duration};

use tokio::time::Instant;
use tracing::debug;

/// Restart mode for child processes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestartMode {
    /// Restarts the failed child process only.
    OneForOne,

    /// Restarts all child processes, including the failed one.
    OneForAll,
}

/// Restart policy for a single child.
///
/// The policy is attached when the child is registered and never changes afterwards.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RestartPolicy {
    /// Always restart the child, whether it exited with an error or not.
    #[default]
    Permanent,

    /// Restart the child only if it exited abnormally.
    ///
    /// A child that returns successfully, or returns a [`ShutdownReason`][super::ShutdownReason] as its error, is
    /// considered finished.
    Transient,

    /// Never restart the child.
    Temporary,
}

impl RestartPolicy {
    /// Returns `true` if a child with this policy should be restarted after the given exit.
    pub fn should_restart(self, exit: ChildExit) -> bool {
        match self {
            Self::Permanent => true,
            Self::Transient => exit == ChildExit::Abnormal,
            Self::Temporary => false,
        }
    }
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Permanent => f.write_str("permanent"),
            Self::Transient => f.write_str("transient"),
            Self::Temporary => f.write_str("temporary"),
        }
    }
}

/// How a child process exited.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChildExit {
    /// The child returned successfully, or stopped because it was asked to.
    Normal,

    /// The child failed, panicked, timed out during startup, or was aborted.
    Abnormal,
}

/// Restart strategy for a supervisor.
///
/// Defaults to one-to-one mode (only restart the failed process), a restart intensity of 1 over a period of 5 seconds,
/// and a backoff of 100 milliseconds before each restart.
///
/// # Restarts and permanent failure
///
/// A supervisor will allow up to `intensity` process restarts, across all child processes, over a given `period`. When
/// this limit is exceeded, the supervisor will stop all child processes and return an error itself, indicating that the
/// supervisor has failed overall.
///
/// # Backoff
///
/// Restarted children wait for `backoff` before being initialized again. The wait is interrupted if the supervisor is
/// shut down in the meantime.
#[derive(Clone, Copy, Debug)]
pub struct RestartStrategy {
    mode: RestartMode,
    intensity: usize,
    period: Duration,
    backoff: Duration,
}

impl RestartStrategy {
    /// Creates a new `RestartStrategy` with the given mode, intensity, and period.
    pub const fn new(mode: RestartMode, intensity: usize, period: Duration) -> Self {
        Self {
            mode,
            intensity,
            period,
            backoff: Duration::from_millis(100),
        }
    }

    /// Creates a new `RestartStrategy` with the one-to-one restart mode, and the default intensity/period.
    pub fn one_to_one() -> Self {
        Self {
            mode: RestartMode::OneForOne,
            ..Default::default()
        }
    }

    /// Creates a new `RestartStrategy` with the one-for-all restart mode, and the default intensity/period.
    pub fn one_for_all() -> Self {
        Self {
            mode: RestartMode::OneForAll,
            ..Default::default()
        }
    }

    /// Sets the restart intensity and period for the strategy.
    pub const fn with_intensity_and_period(mut self, intensity: usize, period: Duration) -> Self {
        self.intensity = intensity;
        self.period = period;
        self
    }

    /// Sets how long a child waits before being restarted.
    pub const fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Returns the restart mode.
    pub const fn mode(&self) -> RestartMode {
        self.mode
    }

    /// Returns the restart backoff.
    pub const fn backoff(&self) -> Duration {
        self.backoff
    }
}

impl Default for RestartStrategy {
    fn default() -> Self {
        Self::new(RestartMode::OneForOne, 1, Duration::from_secs(5))
    }
}

pub(super) enum RestartAction {
    /// Execute a restart with the given mode.
    Restart(RestartMode),

    /// Supervisor must shutdown as the maximum number of restarts has been reached.
    Shutdown,
}

pub(super) struct RestartState {
    strategy: RestartStrategy,
    restart_history: VecDeque<Instant>,
}

impl RestartState {
    /// Creates a new `RestartState` with the given strategy.
    pub fn new(strategy: RestartStrategy) -> Self {
        Self {
            strategy,
            restart_history: VecDeque::with_capacity(strategy.intensity),
        }
    }

    /// Evaluates a restart based on the current state and determine the action the supervisor should take in response.
    pub fn evaluate_restart(&mut self) -> RestartAction {
        if self.strategy.intensity == 0 {
            debug!("Restart strategy configured with restart intensity of zero, shutting down.");
            return RestartAction::Shutdown;
        }

        // Only the last `intensity` restarts are tracked, so the limit is exceeded exactly when the history is full and
        // its oldest entry is still within `period`.
        let now = Instant::now();
        if self.restart_history.len() == self.strategy.intensity {
            if let Some(oldest) = self.restart_history.front() {
                if now.saturating_duration_since(*oldest) < self.strategy.period {
                    debug!(
                        "Restart limit exceeded ({} in {:?}), shutting down.",
                        self.strategy.intensity, self.strategy.period
                    );
                    return RestartAction::Shutdown;
                }
            }

            self.restart_history.pop_front();
        }

        self.restart_history.push_back(now);

        debug!("Restart limit not exceeded, restarting worker.");
        RestartAction::Restart(self.strategy.mode)
    }
}
