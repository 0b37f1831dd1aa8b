//! Error taxonomy for the connection multiplexer.
//!
//! One `thiserror` enum covering every failure kind, so callers can match
//! on kind rather than stringly-typed messages. The CLI boundary
//! (`main.rs`, bootstrap child-process plumbing) still wraps things in
//! `anyhow::Result`; this enum is what flows across the wire and back out
//! of `Receiver::get`/`Context::call`.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the multiplexer core.
pub type Result<T> = std::result::Result<T, Error>;

/// The failure taxonomy shared across the multiplexer.
#[derive(Error, Debug)]
pub enum Error {
    /// Framing or serialization failure on a stream. The originating stream
    /// is disconnected as a side effect of this error being raised.
    #[error("stream error: {0}")]
    Stream(String),

    /// A channel (`Receiver`/`Sender`) observed the remote end close,
    /// either via an explicit `Dead` sentinel or because the owning
    /// `Context`'s stream disconnected.
    #[error("channel closed")]
    Channel,

    /// A remote function call raised an exception-equivalent in the peer;
    /// carries the peer's formatted type name, message and traceback text.
    #[error("remote call failed: {message}")]
    Call {
        /// `"{type}: {message}"`-style summary of the remote failure.
        message: String,
        /// Formatted remote traceback text, if the peer supplied one.
        traceback: Option<String>,
    },

    /// A blocking `get` exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Bootstrap authentication failed and no password was ever supplied.
    #[error("authentication required: {0}")]
    Auth(String),

    /// Bootstrap authentication failed after a password was supplied.
    #[error("bad password")]
    BadPassword,

    /// Source verification or disallowed-class decode failure.
    #[error("security error: {0}")]
    Security(String),

    /// A `GET_MODULE` request could not be served.
    #[error("import error: {0}")]
    Import(String),

    /// Bootstrap did not reach `READY` before its deadline; the half-open
    /// child has been killed.
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// Wraps a lower-level I/O failure (spawning a child, reading a pipe).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a [`Error::Call`] from a peer-supplied failure description.
    #[must_use]
    pub fn call(message: impl Into<String>, traceback: Option<String>) -> Self {
        Error::Call { message: message.into(), traceback }
    }
}
