//! Patrec protocol core.
//!
//! Pure, I/O-free building blocks of the teaching service: every piece here
//! takes inputs and returns values or actions, and the server crate executes
//! them against real sockets.
//!
//! # Components
//!
//! - [`ConnectionPool`]: fixed-capacity admission set
//! - [`ClientListener`]: per-connection lifecycle with an absolute TTL
//! - [`TaskExecutor`]: per-session state machine contract, implemented by
//!   [`Zeroth`], [`First`] and [`Second`]
//! - [`PathRegistry`]: URL prefix to task resolution
//! - [`Envelope`]: the `{success, data | errors}` wire format
//!
//! # Determinism
//!
//! Problem generation takes `&mut dyn RngCore` and lifecycle checks take the
//! current instant as an argument. Tests seed the generator and drive a
//! virtual clock (see [`env::Environment`]), so every run is reproducible.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod env;
pub mod envelope;
pub mod error;
pub mod listener;
pub mod pool;
pub mod registry;
pub mod task;

pub use env::Environment;
pub use envelope::{ClientEnvelope, Envelope, ErrorRecord};
pub use error::{PathError, PoolError};
pub use listener::{ClientListener, CloseCause, ListenerAction, MessageHandler, Observer, Role};
pub use pool::ConnectionPool;
pub use registry::{PathRegistry, Resolved, Route, TaskKind};
pub use task::{First, Outbox, Second, TaskAction, TaskExecutor, Zeroth};
