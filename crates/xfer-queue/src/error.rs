//! crates/xfer-queue/src/error.rs
//!
//! Error type for the bounded queue.

use std::io;

use thiserror::Error;

/// Result type for bounded-queue operations.
pub type QueueResult<T> = Result<T, QueueError>;

/// Errors that can occur while pumping bytes through [`crate::run_queue`].
#[derive(Debug, Error)]
pub enum QueueError {
    /// An I/O error occurred in a raw fd producer or consumer.
    #[error("I/O error: {0}")]
    Io(
        #[from]
        #[source]
        io::Error,
    ),
    /// The producer reported an application-level error.
    #[error("producer error: {0}")]
    Producer(String),
    /// The consumer reported an application-level error.
    #[error("consumer error: {0}")]
    Consumer(String),
}
