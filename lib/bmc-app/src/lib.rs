//! High-level application primitives.
//!
//! This crate provides the common primitives needed to bootstrap a BMC daemon before it runs, such as initializing
//! logging.

#[cfg(feature = "logging")]
pub mod logging;

/// Common imports.
pub mod prelude {
    #[cfg(feature = "logging")]
    pub use super::logging::{fatal_and_exit, initialize_logging, LoggingConfiguration};
}
