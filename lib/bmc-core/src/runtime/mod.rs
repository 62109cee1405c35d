//! Runtime system.
//!
//! This module contains the core components of the runtime system: supervisors and the processes they manage. It is
//! directly inspired by [Erlang/OTP](https://www.erlang.org/docs/28/system/design_principles#supervision-trees).
//!
//! # Processes
//!
//! Every unit of work on the BMC (the broker, a sensor poller, the fan controller, and so on) runs as a **process**: a
//! future spawned as an independent asynchronous task on the Tokio runtime. Every process has a unique numerical
//! identifier and a scoped name, which are attached to everything it logs.
//!
//! Processes cannot run by themselves, however. They must be _supervised_.
//!
//! # Supervisors
//!
//! A [`Supervisor`] owns a set of named children. Each child is registered with a [`ChildSpecification`] that carries
//! its [`RestartPolicy`] and startup timeout:
//!
//! - `Permanent` children are always restarted when they exit.
//! - `Transient` children are restarted only when they exit abnormally.
//! - `Temporary` children are never restarted.
//!
//! Restarts are bounded by the supervisor's [`RestartStrategy`]. When children restart more often than the strategy
//! allows, the supervisor stops every child and fails.
//!
//! # Shutdown
//!
//! Shutdown flows top-down. The supervisor is given a [`ProcessShutdown`], and when it resolves every child is handed
//! the same [`ShutdownReason`] through its own `ProcessShutdown`, in the reverse order of registration.

mod process;
pub use self::process::{Id, Process};

mod restart;
pub use self::restart::{ChildExit, RestartMode, RestartPolicy, RestartStrategy};

mod supervisor;
pub use self::supervisor::{
    ChildSnapshot, ChildSpecification, InitializationError, ProcessError, ShutdownStrategy, Supervisable, Supervisor,
    SupervisorError, SupervisorFuture, SupervisorHandle,
};

mod shutdown;
pub use self::shutdown::{ProcessShutdown, ShutdownHandle, ShutdownReason};
