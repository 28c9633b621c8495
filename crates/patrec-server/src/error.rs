//! Server error types.
//!
//! Three layers, innermost first:
//! - [`SessionError`]: session table bookkeeping
//! - [`AdmissionError`] and [`RouterError`]: the sans-IO router
//! - [`ServerError`]: the production runtime

use patrec_core::{PathError, PoolError};
use thiserror::Error;

/// Errors from [`SessionTable`](crate::SessionTable) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A session with this id already has an executor.
    ///
    /// The router checks before opening, so this is a logic bug.
    #[error("session {0:?} already exists")]
    AlreadyExists(String),

    /// No session with this id.
    ///
    /// May be transient if the executor just disconnected.
    #[error("session {0:?} not found")]
    NotFound(String),
}

/// Why a connection attempt is refused before the handshake completes.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// Every slot of the pool is taken. The client may retry later.
    #[error("the server is full, it can handle only {capacity} connections")]
    PoolFull {
        /// Configured capacity
        capacity: usize,
    },

    /// The path names no task, or carries no session id.
    #[error("no task is served at {0:?}")]
    UnknownTask(String),
}

/// Errors from [`SessionRouter`](crate::SessionRouter) processing.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Admission refused the connection.
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// Pool bookkeeping failed.
    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    /// Session bookkeeping failed.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// Task routes could not be registered. Fatal at startup.
    #[error("path registry error: {0}")]
    Path(#[from] PathError),

    /// The runtime reused a live connection id.
    #[error("connection {0} is already registered")]
    DuplicateConnection(u64),

    /// A server message could not be serialized.
    #[error("encoding error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors that can occur in the production server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error (invalid bind address, overlapping task routes).
    ///
    /// Fatal: fix configuration and restart.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport/network error (bind failure, accept loop failure).
    #[error("transport error: {0}")]
    Transport(String),

    /// Internal error (router task gone, unexpected state).
    ///
    /// Indicates a bug.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<RouterError> for ServerError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::Path(e) => Self::Config(e.to_string()),
            other => Self::Internal(other.to_string()),
        }
    }
}
