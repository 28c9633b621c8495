//! Session table.
//!
//! Maps a session id to its single executor connection and the set of
//! observer connections watching it. A key is present exactly while the
//! executor is connected: the router opens the entry when the first
//! connection for an unseen id arrives and closes it when that executor goes
//! away, so the id becomes reusable immediately.
//!
//! The table is an injected part of [`SessionRouter`](crate::SessionRouter),
//! not a process global, so it can be tested on its own.

use std::collections::{BTreeSet, HashMap};

use patrec_core::TaskKind;

use crate::error::SessionError;

/// One live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Connection driving the task
    pub executor: u64,
    /// Task type of the executor
    pub kind: TaskKind,
    /// Connections mirroring the executor's traffic
    pub observers: BTreeSet<u64>,
}

/// Registry of live sessions.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<String, Session>,
}

impl SessionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session driven by `executor`.
    pub fn open(&mut self, session_id: &str, executor: u64, kind: TaskKind) -> Result<(), SessionError> {
        if self.sessions.contains_key(session_id) {
            return Err(SessionError::AlreadyExists(session_id.to_string()));
        }
        self.sessions.insert(session_id.to_string(), Session { executor, kind, observers: BTreeSet::new() });
        Ok(())
    }

    /// Check if a session is live.
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// Executor connection of a session.
    pub fn executor(&self, session_id: &str) -> Option<u64> {
        self.sessions.get(session_id).map(|s| s.executor)
    }

    /// Attach an observer. Returns the observer count afterwards.
    pub fn attach_observer(&mut self, session_id: &str, observer: u64) -> Result<usize, SessionError> {
        let session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.observers.insert(observer);
        Ok(session.observers.len())
    }

    /// Detach an observer. Returns `false` if it was not attached.
    pub fn detach_observer(&mut self, session_id: &str, observer: u64) -> bool {
        self.sessions.get_mut(session_id).is_some_and(|s| s.observers.remove(&observer))
    }

    /// Observers of a session, ascending. Empty if the session doesn't exist.
    pub fn observers(&self, session_id: &str) -> Vec<u64> {
        self.sessions.get(session_id).map(|s| s.observers.iter().copied().collect()).unwrap_or_default()
    }

    /// Remove a session, returning its last state.
    pub fn close(&mut self, session_id: &str) -> Result<Session, SessionError> {
        self.sessions.remove(session_id).ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// No session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
