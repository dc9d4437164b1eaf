//! Reflex reflector: keeps a `Cache` in sync with a `ListWatch` source by
//! listing once, then applying watch events until the stream fails, then
//! starting over.

#![forbid(unsafe_code)]

mod config;
mod reflector;

pub use config::{ExponentialBackoff, FixedDelay, ReflectorConfig, ResumePolicy, RetryPolicy};
pub use reflector::{Reflector, WatchEnd};

use reflex_core::ListWatchError;

#[derive(Debug, thiserror::Error)]
pub enum ReflectorError {
    #[error("list failed: {0}")]
    List(#[source] ListWatchError),
    #[error("watch failed to open: {0}")]
    WatchOpen(#[source] ListWatchError),
    #[error("watch stream failed after {events} events: {source}")]
    Stream {
        events: usize,
        #[source]
        source: ListWatchError,
    },
    #[error("watch stream closed after {events} events")]
    StreamClosed { events: usize },
    #[error("very short watch: closed after {elapsed_ms}ms without events")]
    VeryShortWatch { elapsed_ms: u128 },
    /// Non-fatal: the event is dropped and the watch continues.
    #[error("expected kind {expected}, got {got} for {key}")]
    KindMismatch { expected: String, got: String, key: String },
}
