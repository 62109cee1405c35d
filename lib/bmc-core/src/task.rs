//! Helpers for working with asynchronous tasks.

use std::{any::Any, future::Future};

use tokio::task::JoinHandle;
use tracing::Instrument as _;

/// Spawns a new asynchronous task, returning a [`JoinHandle`] for it.
///
/// This function is a thin wrapper over [`tokio::spawn`], and provides implicit "tracing" for spawned futures by
/// ensuring that the task is attached to the current `tracing` span.
pub fn spawn_traced<F, T>(f: F) -> JoinHandle<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(f.in_current_span())
}

/// Extracts a human-readable message from a panic payload.
///
/// `panic!` with a literal produces a `&'static str` payload, and with format arguments a `String`. Anything else is
/// reported as an unknown cause.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::catch_unwind;

    use super::*;

    #[test]
    fn panic_message_from_literal_and_format() {
        let literal = catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(&*literal), "boom");

        let formatted = catch_unwind(|| panic!("fan {} stalled", 3)).unwrap_err();
        assert_eq!(panic_message(&*formatted), "fan 3 stalled");

        let other = catch_unwind(|| std::panic::panic_any(42_u32)).unwrap_err();
        assert_eq!(panic_message(&*other), "unknown panic payload");
    }

    #[tokio::test]
    async fn spawn_traced_returns_output() {
        let handle = spawn_traced(async { 7 });
        assert_eq!(handle.await.unwrap(), 7);
    }
}
