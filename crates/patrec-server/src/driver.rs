//! Session router.
//!
//! Ties together the connection pool, the path registry, the session table and
//! one [`ClientListener`] per connection. The router performs no I/O: the
//! runtime feeds it [`ServerEvent`]s and executes the [`ServerAction`]s it
//! returns, in order.
//!
//! # Session lifecycle
//!
//! ```text
//!            first connection               new observer
//! ┌────────┐ ───────────────> ┌────────────┐ ──────┐
//! │ ABSENT │                  │   ACTIVE   │       │
//! └────────┘ <─────────────── └────────────┘ <─────┘
//!            executor closes
//!            (observers evicted)
//! ```
//!
//! Observers leaving never end a session. A session is keyed by its full
//! path, so the same id under two task prefixes names two sessions.

use std::{collections::HashMap, time::Duration};

use patrec_core::{
    ClientListener, CloseCause, ConnectionPool, Envelope, ListenerAction, Observer, PathRegistry,
    PoolError, Role, TaskKind, env::Environment,
};
use rand::{SeedableRng, rngs::StdRng};
use serde_json::json;

use crate::{
    error::{AdmissionError, RouterError},
    sessions::SessionTable,
};

/// Per-task connection TTLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTtls {
    /// TTL of zeroth task connections
    pub zeroth: Duration,
    /// TTL of first task connections
    pub first: Duration,
    /// TTL of second task connections
    pub second: Duration,
}

impl Default for TaskTtls {
    fn default() -> Self {
        Self {
            zeroth: TaskKind::Zeroth.default_ttl(),
            first: TaskKind::First.default_ttl(),
            second: TaskKind::Second.default_ttl(),
        }
    }
}

impl TaskTtls {
    /// TTL for `kind`.
    pub fn get(&self, kind: TaskKind) -> Duration {
        match kind {
            TaskKind::Zeroth => self.zeroth,
            TaskKind::First => self.first,
            TaskKind::Second => self.second,
        }
    }
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Maximum concurrent connections, executors and observers alike
    pub max_connections: usize,
    /// Connection TTL per task type
    pub ttls: TaskTtls,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self { max_connections: 100, ttls: TaskTtls::default() }
    }
}

/// Events that the router processes.
///
/// These are produced by the runtime (production or tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The transport completed the handshake of an admitted connection
    ConnectionAccepted {
        /// Unique connection ID assigned by the runtime
        connection_id: u64,
        /// Request path, `<task-prefix><session-id>`
        path: String,
    },

    /// A text message arrived
    MessageReceived {
        /// Connection that sent the message
        connection_id: u64,
        /// Raw payload
        payload: String,
    },

    /// The peer closed the connection
    ConnectionClosed {
        /// Connection that was closed
        connection_id: u64,
    },

    /// The transport failed
    ConnectionErrored {
        /// Connection that failed
        connection_id: u64,
        /// Transport error description
        error: String,
    },

    /// Periodic tick for TTL expiry
    Tick,
}

/// Actions that the router produces.
///
/// These are executed by runtime-specific code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction<I> {
    /// Send a text message to one connection
    Send {
        /// Target connection
        connection_id: u64,
        /// Serialized message
        payload: String,
    },

    /// Drop a connection without a close handshake
    Close {
        /// Connection to close
        connection_id: u64,
        /// Reason for closure
        reason: String,
    },

    /// Log a message (for debugging/monitoring)
    Log {
        /// Log level
        level: LogLevel,
        /// Message to log
        message: String,
        /// When the event occurred
        timestamp: I,
    },
}

/// Log levels for router actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug information
    Debug,
    /// Informational message
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// A live connection and the session it belongs to.
struct Attached<I> {
    listener: ClientListener<I>,
    session_id: String,
}

/// Action-based session router.
pub struct SessionRouter<E: Environment> {
    /// Live connections (connection_id → listener)
    connections: HashMap<u64, Attached<E::Instant>>,
    /// Admission set
    pool: ConnectionPool,
    /// Task prefixes
    registry: PathRegistry,
    /// Session path → executor and observers
    sessions: SessionTable,
    /// Problem generator shared by every executor
    rng: StdRng,
    /// Environment (time, RNG seed)
    env: E,
    /// Router configuration
    config: RouterConfig,
}

impl<E: Environment> SessionRouter<E> {
    /// Create a router serving every task under its default prefix.
    pub fn new(env: E, config: RouterConfig) -> Result<Self, RouterError> {
        let ttls = config.ttls;
        let registry = PathRegistry::with_defaults(|kind| ttls.get(kind))?;
        Ok(Self::with_registry(env, config, registry, SessionTable::new()))
    }

    /// Create a router with explicit routes and session table.
    pub fn with_registry(env: E, config: RouterConfig, registry: PathRegistry, sessions: SessionTable) -> Self {
        let rng = StdRng::seed_from_u64(env.random_u64());
        Self {
            connections: HashMap::new(),
            pool: ConnectionPool::new(config.max_connections),
            registry,
            sessions,
            rng,
            env,
            config,
        }
    }

    /// Admission check run before the transport handshake completes.
    pub fn verify_client(&self, path: &str) -> Result<TaskKind, AdmissionError> {
        if self.pool.is_full() {
            return Err(AdmissionError::PoolFull { capacity: self.pool.capacity() });
        }
        self.registry
            .resolve(path)
            .map(|resolved| resolved.route.kind)
            .ok_or_else(|| AdmissionError::UnknownTask(path.to_string()))
    }

    /// Process an event and return actions to execute.
    ///
    /// This is the main entry point for the router.
    pub fn process_event(&mut self, event: ServerEvent) -> Result<Vec<ServerAction<E::Instant>>, RouterError> {
        match event {
            ServerEvent::ConnectionAccepted { connection_id, path } => {
                self.handle_connection_accepted(connection_id, &path)
            },
            ServerEvent::MessageReceived { connection_id, payload } => {
                Ok(self.handle_message(connection_id, &payload))
            },
            ServerEvent::ConnectionClosed { connection_id } => {
                Ok(self.teardown(connection_id, &CloseCause::PeerClosed))
            },
            ServerEvent::ConnectionErrored { connection_id, error } => {
                Ok(self.teardown(connection_id, &CloseCause::TransportError(error)))
            },
            ServerEvent::Tick => Ok(self.handle_tick()),
        }
    }

    /// Handle a connection that completed the handshake.
    ///
    /// Admission failures at this point are not errors of the router: the
    /// connection is released and closed.
    fn handle_connection_accepted(
        &mut self,
        connection_id: u64,
        path: &str,
    ) -> Result<Vec<ServerAction<E::Instant>>, RouterError> {
        if self.connections.contains_key(&connection_id) {
            return Err(RouterError::DuplicateConnection(connection_id));
        }

        match self.admit(connection_id, path) {
            Ok(actions) => Ok(actions),
            Err(e) => {
                let mut actions =
                    vec![self.log(LogLevel::Warn, format!("connection {connection_id} to {path} rejected: {e}"))];
                // Admission may have failed before or after the pool slot was taken.
                match self.pool.remove(connection_id) {
                    Ok(()) | Err(PoolError::NotFound(_)) => {},
                    Err(err) => actions.push(self.log(LogLevel::Error, format!("pool out of sync: {err}"))),
                }
                actions.push(ServerAction::Close {
                    connection_id,
                    reason: CloseCause::Rejected(e.to_string()).to_string(),
                });
                Ok(actions)
            },
        }
    }

    fn admit(&mut self, connection_id: u64, path: &str) -> Result<Vec<ServerAction<E::Instant>>, RouterError> {
        let now = self.env.now();

        if self.pool.is_full() {
            return Err(AdmissionError::PoolFull { capacity: self.pool.capacity() }.into());
        }
        let resolved =
            self.registry.resolve(path).ok_or_else(|| AdmissionError::UnknownTask(path.to_string()))?;
        let kind = resolved.route.kind;
        let ttl = resolved.route.ttl;
        let name = resolved.session_id.to_string();
        // Sessions are scoped per task: the key is the whole path.
        let session_id = path.to_string();

        if self.sessions.contains(&session_id) {
            let observers = self.sessions.observers(&session_id).len() + 1;
            let notice = Envelope::success(json!({ "event": "observerConnected", "observers": observers }))
                .to_text()?;

            self.pool.add(connection_id)?;
            self.sessions.attach_observer(&session_id, connection_id)?;
            let listener = ClientListener::new(Box::new(Observer), now, ttl);
            self.connections.insert(connection_id, Attached { listener, session_id: session_id.clone() });

            let mut actions = vec![self.log(
                LogLevel::Info,
                format!("connection {connection_id} observes {kind} session {name:?} ({observers} observers)"),
            )];
            actions.extend(self.broadcast(&session_id, &notice));
            Ok(actions)
        } else {
            self.pool.add(connection_id)?;
            self.sessions.open(&session_id, connection_id, kind)?;
            let listener = ClientListener::new(kind.spawn(), now, ttl);
            self.connections.insert(connection_id, Attached { listener, session_id: session_id.clone() });

            Ok(vec![self.log(
                LogLevel::Info,
                format!("connection {connection_id} opened {kind} session {name:?}"),
            )])
        }
    }

    /// Handle one inbound message.
    fn handle_message(&mut self, connection_id: u64, payload: &str) -> Vec<ServerAction<E::Instant>> {
        let Some(attached) = self.connections.get_mut(&connection_id) else {
            return vec![self.log(LogLevel::Debug, format!("message for unknown connection {connection_id}"))];
        };

        let role = attached.listener.role();
        let session_id = attached.session_id.clone();
        let listener_actions = attached.listener.receive(payload, &mut self.rng);

        let mut actions = Vec::new();
        for action in listener_actions {
            match action {
                ListenerAction::BeforeMessage(raw) => {
                    if role != Role::Observer {
                        actions.extend(self.broadcast(&session_id, &raw));
                    }
                },
                ListenerAction::Send(text) => {
                    if role != Role::Observer {
                        actions.extend(self.broadcast(&session_id, &text));
                    }
                    actions.push(ServerAction::Send { connection_id, payload: text });
                },
                ListenerAction::Close { reason } => {
                    actions.push(self.log(LogLevel::Info, format!("connection {connection_id} violated protocol: {reason}")));
                    actions.extend(self.teardown(connection_id, &CloseCause::Handler(reason)));
                },
            }
        }
        actions
    }

    /// Expire every listener whose TTL has elapsed.
    fn handle_tick(&mut self) -> Vec<ServerAction<E::Instant>> {
        let now = self.env.now();

        let mut expired: Vec<u64> = self
            .connections
            .iter()
            .filter(|(_, attached)| attached.listener.is_expired(now))
            .map(|(&id, _)| id)
            .collect();
        expired.sort_unstable();

        let mut actions = Vec::new();
        for connection_id in expired {
            actions.extend(self.teardown(connection_id, &CloseCause::TtlExpired));
        }
        actions
    }

    /// Close one connection and everything that depends on it.
    ///
    /// The listener entry is removed first, so a second call for the same
    /// connection (late transport close, TTL after eviction) is a no-op.
    fn teardown(&mut self, connection_id: u64, cause: &CloseCause) -> Vec<ServerAction<E::Instant>> {
        let Some(mut attached) = self.connections.remove(&connection_id) else {
            return Vec::new();
        };
        if !attached.listener.close(cause) {
            return Vec::new();
        }

        let role = attached.listener.role();
        let mut actions = vec![self.log(LogLevel::Info, format!("connection {connection_id} ({role}) closed: {cause}"))];

        if let Err(e) = self.pool.remove(connection_id) {
            actions.push(self.log(LogLevel::Error, format!("pool out of sync: {e}")));
        }
        if cause.is_server_initiated() {
            actions.push(ServerAction::Close { connection_id, reason: cause.to_string() });
        }

        match role {
            Role::Executor(_) => {
                if self.sessions.executor(&attached.session_id) == Some(connection_id) {
                    match self.sessions.close(&attached.session_id) {
                        Ok(session) => {
                            for observer in session.observers {
                                actions.extend(self.teardown(observer, &CloseCause::SessionEnded));
                            }
                            actions.push(self.log(
                                LogLevel::Info,
                                format!("{} session {:?} ended", session.kind, attached.session_id),
                            ));
                        },
                        Err(e) => actions.push(self.log(LogLevel::Error, format!("session table out of sync: {e}"))),
                    }
                }
            },
            Role::Observer => {
                self.sessions.detach_observer(&attached.session_id, connection_id);
            },
        }
        actions
    }

    /// Mirror `payload` to every observer of a session.
    ///
    /// Best-effort: each observer gets its own action, so one failed send
    /// does not affect the others.
    fn broadcast(&self, session_id: &str, payload: &str) -> Vec<ServerAction<E::Instant>> {
        self.sessions
            .observers(session_id)
            .into_iter()
            .map(|connection_id| ServerAction::Send { connection_id, payload: payload.to_string() })
            .collect()
    }

    fn log(&self, level: LogLevel, message: String) -> ServerAction<E::Instant> {
        ServerAction::Log { level, message, timestamp: self.env.now() }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.pool.len()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Check if a session is live.
    pub fn has_session(&self, session_id: &str) -> bool {
        self.sessions.contains(session_id)
    }

    /// Executor connection of a session.
    pub fn executor_of(&self, session_id: &str) -> Option<u64> {
        self.sessions.executor(session_id)
    }

    /// Observers of a session, ascending.
    pub fn observers_of(&self, session_id: &str) -> Vec<u64> {
        self.sessions.observers(session_id)
    }

    /// Role of a live connection.
    pub fn role_of(&self, connection_id: u64) -> Option<Role> {
        self.connections.get(&connection_id).map(|attached| attached.listener.role())
    }
}

impl<E: Environment> std::fmt::Debug for SessionRouter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRouter")
            .field("connections", &self.pool.len())
            .field("sessions", &self.sessions.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
