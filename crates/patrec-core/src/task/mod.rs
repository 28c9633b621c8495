//! Task executors.
//!
//! A task executor is the business logic behind one session: a finite state
//! machine that generates problems and grades answers. The machine never sees
//! raw bytes. [`MessageHandler::receive`] (implemented once for every
//! [`TaskExecutor`]) parses the envelope, asks the executor to validate `data`
//! against the schema of its *current* state, and only then calls
//! [`TaskExecutor::on_message`]. Malformed input for the current state gets an
//! error reply and a close, and never reaches the state machine.
//!
//! Replies go through [`Outbox`], which only offers `send_message` and
//! `send_errors`, so every reply is envelope-tagged the same way.

pub mod first;
mod schema;
pub mod second;
pub mod zeroth;

use std::fmt;

use rand::RngCore;
use serde::Serialize;
use serde_json::{Map, Value};

pub use self::{first::First, second::Second, zeroth::Zeroth};
use crate::{
    envelope::{ClientEnvelope, Envelope, ErrorRecord},
    listener::{MessageHandler, Role},
    registry::TaskKind,
};

/// Actions a handler asks its listener to perform, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskAction {
    /// Send this envelope to the peer
    Send(Envelope),

    /// Close the connection after everything queued before it
    Close {
        /// Reason for closing the connection
        reason: String,
    },
}

/// Reply buffer handed to [`TaskExecutor::on_message`].
#[derive(Debug, Default)]
pub struct Outbox {
    actions: Vec<TaskAction>,
}

impl Outbox {
    /// Create an empty outbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a `success: true` reply.
    pub fn send_message<T: Serialize + ?Sized>(&mut self, message: &T) {
        match serde_json::to_value(message) {
            Ok(data) => self.actions.push(TaskAction::Send(Envelope::success(data))),
            Err(e) => {
                self.send_errors(vec![ErrorRecord::with_detail("Internal error", e.to_string())]);
                self.close("reply serialization failed");
            },
        }
    }

    /// Queue a `success: false` reply.
    pub fn send_errors(&mut self, errors: Vec<ErrorRecord>) {
        self.actions.push(TaskAction::Send(Envelope::failure(errors)));
    }

    /// Queue a close. Nothing queued after it is delivered.
    pub fn close(&mut self, reason: impl Into<String>) {
        self.actions.push(TaskAction::Close { reason: reason.into() });
    }

    /// Reply with `errors` and close: the peer broke the protocol.
    pub fn violation(&mut self, errors: Vec<ErrorRecord>, reason: impl Into<String>) {
        self.send_errors(errors);
        self.close(reason);
    }

    /// Consume the outbox.
    pub fn into_actions(self) -> Vec<TaskAction> {
        self.actions
    }
}

/// Per-session state machine contract.
///
/// `validate` is the per-state schema: it is selected by [`Self::state`] with
/// an exhaustive match and turns `data` into the typed input of that state.
pub trait TaskExecutor: Send {
    /// Named states. Every task starts in its `Start` state.
    type State: Copy + Eq + fmt::Debug;

    /// Validated input, one variant per state.
    type Input;

    /// Which task this is.
    fn kind(&self) -> TaskKind;

    /// Current state.
    fn state(&self) -> Self::State;

    /// Check `data` against the schema of the current state.
    fn validate(&self, data: Map<String, Value>) -> Result<Self::Input, Vec<ErrorRecord>>;

    /// Advance the state machine. Only reachable with validated input.
    fn on_message(&mut self, input: Self::Input, rng: &mut dyn RngCore, out: &mut Outbox);
}

impl<T: TaskExecutor> MessageHandler for T {
    fn role(&self) -> Role {
        Role::Executor(self.kind())
    }

    fn receive(&mut self, raw: &str, rng: &mut dyn RngCore) -> Vec<TaskAction> {
        let mut out = Outbox::new();

        let envelope = match ClientEnvelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(error) => {
                out.violation(vec![error], "malformed envelope");
                return out.into_actions();
            },
        };

        match self.validate(envelope.data) {
            Ok(input) => self.on_message(input, rng, &mut out),
            Err(errors) => {
                tracing::debug!(task = %self.kind(), state = ?self.state(), "schema violation");
                out.violation(errors, format!("invalid message in state {:?}", self.state()));
            },
        }

        out.into_actions()
    }
}
