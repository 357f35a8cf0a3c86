use std::any::Any;

use thiserror::Error;

/// Errors surfaced by the public [`Engine`](crate::Engine) API.
///
/// Most operations (`subscribe`, `enqueue`, `dequeue`, `unsubscribe`) report
/// their outcome as a plain `bool`/`Option` per the engine's contract; this
/// type only covers operations that can fail for reasons other than the
/// expected, recoverable "already bound" / "queue full" / "unknown key"
/// outcomes.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// `run` or `wait_consume_all` was called after the engine already
    /// completed `stop`. The engine is single-use once stopped.
    #[error("engine has already been stopped")]
    Stopped,
    /// The background dispatch task panicked.
    #[error("dispatch task panicked: {0}")]
    DispatchFault(String),
    /// A bound consumer panicked while processing a value.
    #[error("consumer panicked: {0}")]
    ConsumerFault(String),
}

/// Render a captured panic payload (as returned by `std::thread::JoinHandle::join`)
/// as a human-readable string.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panicked with a non-string payload".to_string()
    }
}
