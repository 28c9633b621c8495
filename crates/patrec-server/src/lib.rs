//! Patrec production server.
//!
//! Production server implementation using axum WebSockets for transport,
//! Tokio for the async runtime, and system time with OS randomness.
//!
//! # Architecture
//!
//! [`SessionRouter`] is action-based: it turns [`ServerEvent`]s into
//! [`ServerAction`]s and performs no I/O. [`Server`] runs it inside a single
//! router task that owns every piece of mutable state (pool, sessions,
//! listeners, RNG). Socket tasks talk to it over one command channel, so all
//! state transitions happen on one logical event loop and need no locking.
//!
//! # Components
//!
//! - [`SessionRouter`]: session multiplexing logic (pure, no I/O)
//! - [`SessionTable`]: session id to executor and observers
//! - [`Server`]: production runtime that executes router actions
//! - [`SystemEnv`]: production environment (real time, OS RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod driver;
mod error;
mod sessions;
mod system_env;
mod transport;

use std::{collections::HashMap, net::SocketAddr, time::Duration};

pub use driver::{LogLevel, RouterConfig, ServerAction, ServerEvent, SessionRouter, TaskTtls};
pub use error::{AdmissionError, RouterError, ServerError, SessionError};
pub use sessions::{Session, SessionTable};
pub use system_env::SystemEnv;
use tokio::{
    net::TcpListener,
    sync::mpsc,
    time::{self, MissedTickBehavior},
};
use transport::{Command, Outbound, TransportState};

/// Smallest accepted TTL check period.
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:3000")
    pub bind_address: String,
    /// Largest inbound message the transport accepts
    pub max_payload_bytes: usize,
    /// How often TTLs are checked
    pub tick_interval: Duration,
    /// Router configuration (capacity, TTLs)
    pub router: RouterConfig,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            max_payload_bytes: 16 * 1024,
            tick_interval: Duration::from_millis(250),
            router: RouterConfig::default(),
        }
    }
}

/// Production Patrec server.
///
/// Wraps [`SessionRouter`] with an axum WebSocket transport and the system
/// environment.
pub struct Server {
    /// The action-based session router
    router: SessionRouter<SystemEnv>,
    /// Bound TCP listener
    listener: TcpListener,
    /// Runtime configuration
    config: ServerRuntimeConfig,
}

impl Server {
    /// Create and bind a new server.
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        let router = SessionRouter::new(SystemEnv::new(), config.router.clone())?;
        let listener = TcpListener::bind(&config.bind_address)
            .await
            .map_err(|e| ServerError::Config(format!("cannot bind {}: {e}", config.bind_address)))?;

        Ok(Self { router, listener, config })
    }

    /// Local address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the server, accepting connections and routing messages.
    ///
    /// This method runs until the transport fails.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Server starting on {}", self.local_addr()?);

        let (commands, inbox) = mpsc::unbounded_channel();
        let tick_interval = self.config.tick_interval.max(MIN_TICK_INTERVAL);
        let router_task = tokio::spawn(route(self.router, inbox, tick_interval));

        let app = transport::app(TransportState::new(commands, self.config.max_payload_bytes));
        let served = axum::serve(self.listener, app).await;

        router_task.abort();
        served.map_err(|e| ServerError::Transport(e.to_string()))
    }
}

/// The router task: the only owner of session state.
async fn route(
    mut router: SessionRouter<SystemEnv>,
    mut inbox: mpsc::UnboundedReceiver<Command>,
    tick_interval: Duration,
) {
    let mut outbound: HashMap<u64, mpsc::UnboundedSender<Outbound>> = HashMap::new();
    let mut ticker = time::interval(tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let event = tokio::select! {
            command = inbox.recv() => match command {
                Some(Command::Verify { path, respond_to }) => {
                    let _ = respond_to.send(router.verify_client(&path));
                    continue;
                },
                Some(Command::Accept { connection_id, path, outbound: queue }) => {
                    outbound.insert(connection_id, queue);
                    ServerEvent::ConnectionAccepted { connection_id, path }
                },
                Some(Command::Event(event)) => event,
                None => break,
            },
            _ = ticker.tick() => ServerEvent::Tick,
        };

        let finished = match &event {
            ServerEvent::ConnectionClosed { connection_id }
            | ServerEvent::ConnectionErrored { connection_id, .. } => Some(*connection_id),
            _ => None,
        };

        match router.process_event(event) {
            Ok(actions) => execute_actions(actions, &mut outbound),
            Err(e) => tracing::error!("Event processing error: {}", e),
        }

        if let Some(connection_id) = finished {
            outbound.remove(&connection_id);
        }
    }

    tracing::debug!("Router task stopped");
}

/// Execute router actions.
fn execute_actions<I>(actions: Vec<ServerAction<I>>, outbound: &mut HashMap<u64, mpsc::UnboundedSender<Outbound>>) {
    for action in actions {
        match action {
            ServerAction::Send { connection_id, payload } => {
                let delivered =
                    outbound.get(&connection_id).is_some_and(|queue| queue.send(Outbound::Text(payload)).is_ok());
                if !delivered {
                    tracing::warn!("Send: connection {} not reachable", connection_id);
                }
            },

            ServerAction::Close { connection_id, reason } => {
                tracing::debug!("Closing connection {}: {}", connection_id, reason);
                if let Some(queue) = outbound.remove(&connection_id) {
                    let _ = queue.send(Outbound::Close);
                }
            },

            ServerAction::Log { level, message, .. } => match level {
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_to_dead_queue_does_not_block_others() {
        let mut outbound = HashMap::new();
        let (gone, gone_rx) = mpsc::unbounded_channel();
        drop(gone_rx);
        let (live, mut live_rx) = mpsc::unbounded_channel();
        outbound.insert(1, gone);
        outbound.insert(2, live);

        let actions: Vec<ServerAction<Duration>> = vec![
            ServerAction::Send { connection_id: 1, payload: "mirror".to_string() },
            ServerAction::Send { connection_id: 2, payload: "mirror".to_string() },
        ];
        execute_actions(actions, &mut outbound);

        assert!(matches!(live_rx.try_recv(), Ok(Outbound::Text(text)) if text == "mirror"));
        assert!(outbound.contains_key(&2));
    }

    #[test]
    fn close_drops_the_queue() {
        let mut outbound = HashMap::new();
        let (queue, mut rx) = mpsc::unbounded_channel();
        outbound.insert(7, queue);

        execute_actions::<Duration>(
            vec![ServerAction::Close { connection_id: 7, reason: "ttl expired".to_string() }],
            &mut outbound,
        );

        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        assert!(outbound.is_empty());
        assert!(rx.try_recv().is_err());
    }
}
