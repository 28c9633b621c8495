//! Error types for the protocol core.
//!
//! Strongly-typed errors for the two stateful tables the core owns: the
//! connection pool (admission) and the path registry (task routing).

use thiserror::Error;

/// Errors from [`ConnectionPool`](crate::pool::ConnectionPool) operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool already holds `capacity` connections
    #[error("the pool is full, it can handle only {capacity} connections")]
    CapacityExceeded {
        /// Configured capacity
        capacity: usize,
    },

    /// The connection is not tracked by the pool
    #[error("connection {0} is not in the pool")]
    NotFound(u64),
}

/// Errors from [`PathRegistry`](crate::registry::PathRegistry) registration.
///
/// These are configuration errors: they surface at startup and are fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// Prefix must be absolute and end with `/`
    #[error("invalid task prefix {0:?}: must start and end with '/'")]
    InvalidPrefix(String),

    /// Two prefixes could both match the same URL
    #[error("task prefix {new:?} overlaps already registered {existing:?}")]
    Ambiguous {
        /// Prefix registered first
        existing: String,
        /// Prefix being registered
        new: String,
    },
}
