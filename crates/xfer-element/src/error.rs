//! Error taxonomy for transfer pipeline elements.

use std::io;

use thiserror::Error;

/// Errors a transfer element's `setup`/`start` path can fail with.
///
/// `ProducerError`/`ConsumerError` from the specification are not separate
/// variants here: a running element reports those by posting an `Error`
/// message and scheduling a cancel (see `xfer_transfer::Transfer`) rather
/// than by returning a `Result`, since by the time data is flowing the
/// failure must reach the controller asynchronously, not through a call
/// stack.
#[derive(Debug, Error)]
pub enum ElementError {
    /// The pipeline is wired incorrectly, or no mechanism chain exists.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A resource (file descriptor, listening socket, subprocess) could not
    /// be acquired.
    #[error("resource error: {0}")]
    Resource(String),
    /// An I/O error occurred while setting up or tearing down an element.
    #[error("I/O error: {0}")]
    Io(
        #[from]
        #[source]
        io::Error,
    ),
}
