//! Lifecycle supervision for the BMC runtime.
//!
//! Every subsystem of the BMC runs as a supervised process under a single [`Supervisor`][runtime::Supervisor], and
//! talks to the others through an embedded [broker]. The [`Orchestrator`][orchestrator::Orchestrator] ties the two
//! together, making sure the broker is up before any service that depends on it.

pub mod broker;
pub mod collections;
pub mod orchestrator;
pub mod runtime;
pub mod service;
pub mod task;

pub use self::task::spawn_traced;
