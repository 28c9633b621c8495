//! Per-connection lifecycle.
//!
//! [`ClientListener`] wraps one connection for its whole life. It owns no I/O:
//! the router feeds it inbound payloads and transport events, and it answers
//! with [`ListenerAction`]s. Business logic is injected as a
//! [`MessageHandler`] (a task executor or an [`Observer`]) rather than by
//! subclassing.
//!
//! # Lifecycle
//!
//! ```text
//! ┌──────┐  transport close / error / TTL / violation  ┌────────┐
//! │ Open │────────────────────────────────────────────>│ Closed │
//! └──────┘                                             └────────┘
//! ```
//!
//! The TTL is a fixed deadline measured from `connected_at`; activity does not
//! renew it. Closing is idempotent: only the first [`ClientListener::close`]
//! runs the handler hooks and reports `true`.

use std::{fmt, ops::Sub, time::Duration};

use rand::RngCore;

use crate::{
    envelope::ErrorRecord,
    registry::TaskKind,
    task::{Outbox, TaskAction},
};

/// Title of the error sent to an observer that tries to talk.
pub const OBSERVER_VIOLATION: &str = "Observers cannot send messages";

/// What a connection is within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Drives the task state machine
    Executor(TaskKind),
    /// Receives a read-only mirror of the executor's traffic
    Observer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executor(kind) => write!(f, "{kind} executor"),
            Self::Observer => f.write_str("observer"),
        }
    }
}

/// Why a listener was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseCause {
    /// Peer closed the transport
    PeerClosed,
    /// Transport reported an error
    TransportError(String),
    /// TTL elapsed
    TtlExpired,
    /// Handler asked to close after a protocol violation or final reply
    Handler(String),
    /// Session executor disconnected, so its observers are evicted
    SessionEnded,
    /// Admission failed after the transport accepted the connection
    Rejected(String),
}

impl CloseCause {
    /// The server, not the peer, decided to close.
    ///
    /// The runtime still has to drop the socket for these.
    pub fn is_server_initiated(&self) -> bool {
        !matches!(self, Self::PeerClosed | Self::TransportError(_))
    }
}

impl fmt::Display for CloseCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("closed by peer"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
            Self::TtlExpired => f.write_str("ttl expired"),
            Self::Handler(reason) => f.write_str(reason),
            Self::SessionEnded => f.write_str("session ended"),
            Self::Rejected(reason) => write!(f, "rejected: {reason}"),
        }
    }
}

/// Business logic injected into a [`ClientListener`].
pub trait MessageHandler: Send {
    /// Role of the wrapped connection.
    fn role(&self) -> Role;

    /// Handle one raw inbound payload.
    fn receive(&mut self, raw: &str, rng: &mut dyn RngCore) -> Vec<TaskAction>;

    /// Called once when the connection closes for any reason but a
    /// transport error.
    fn on_close(&mut self, _cause: &CloseCause) {}

    /// Called once when the connection closes because of a transport error.
    fn on_error(&mut self, _error: &str) {}
}

/// Output-only participant. Any inbound message is a violation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Observer;

impl MessageHandler for Observer {
    fn role(&self) -> Role {
        Role::Observer
    }

    fn receive(&mut self, _raw: &str, _rng: &mut dyn RngCore) -> Vec<TaskAction> {
        let mut out = Outbox::new();
        out.violation(vec![ErrorRecord::new(OBSERVER_VIOLATION)], "observer sent a message");
        out.into_actions()
    }
}

/// Actions returned by [`ClientListener::receive`], in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerAction {
    /// Raw inbound payload, reported before it is interpreted
    BeforeMessage(String),
    /// Serialized envelope to send to this connection
    Send(String),
    /// Close this connection
    Close {
        /// Reason for closing
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Open,
    /// Every further event is ignored
    Closed,
}

/// Connection lifecycle wrapper.
///
/// Generic over `I` (Instant type) to support virtual time in tests.
pub struct ClientListener<I> {
    connected_at: I,
    ttl: Duration,
    state: ListenerState,
    handler: Box<dyn MessageHandler>,
}

impl<I> ClientListener<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Wrap a freshly accepted connection.
    pub fn new(handler: Box<dyn MessageHandler>, now: I, ttl: Duration) -> Self {
        Self { connected_at: now, ttl, state: ListenerState::Open, handler }
    }

    /// Role of the wrapped connection.
    pub fn role(&self) -> Role {
        self.handler.role()
    }

    /// Whether the listener still accepts events.
    pub fn is_open(&self) -> bool {
        self.state == ListenerState::Open
    }

    /// TTL has elapsed at `now`. Always `false` once closed.
    pub fn is_expired(&self, now: I) -> bool {
        self.is_open() && now >= self.connected_at && now - self.connected_at >= self.ttl
    }

    /// Process one inbound payload.
    ///
    /// Emits [`ListenerAction::BeforeMessage`] first, then whatever the handler
    /// replies. Nothing after the first `Close` is emitted.
    pub fn receive(&mut self, raw: &str, rng: &mut dyn RngCore) -> Vec<ListenerAction> {
        if !self.is_open() {
            return Vec::new();
        }

        let mut actions = vec![ListenerAction::BeforeMessage(raw.to_string())];

        for action in self.handler.receive(raw, rng) {
            match action {
                TaskAction::Send(envelope) => match envelope.to_text() {
                    Ok(text) => actions.push(ListenerAction::Send(text)),
                    Err(e) => {
                        actions.push(ListenerAction::Close {
                            reason: format!("failed to encode reply: {e}"),
                        });
                        break;
                    },
                },
                TaskAction::Close { reason } => {
                    actions.push(ListenerAction::Close { reason });
                    break;
                },
            }
        }

        actions
    }

    /// Mark the listener closed and run the handler hook.
    ///
    /// Returns `true` only for the call that performed the transition; the
    /// caller runs its after-close teardown exactly then.
    pub fn close(&mut self, cause: &CloseCause) -> bool {
        if !self.is_open() {
            return false;
        }
        self.state = ListenerState::Closed;

        match cause {
            CloseCause::TransportError(error) => self.handler.on_error(error),
            _ => self.handler.on_close(cause),
        }
        true
    }
}

impl<I: fmt::Debug> fmt::Debug for ClientListener<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientListener")
            .field("role", &self.handler.role())
            .field("connected_at", &self.connected_at)
            .field("ttl", &self.ttl)
            .field("state", &self.state)
            .finish()
    }
}
