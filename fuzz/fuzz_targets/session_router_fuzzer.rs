//! Fuzz target for SessionRouter
//!
//! Drives the router with arbitrary connect, message, close and tick
//! sequences against a virtual clock.
//!
//! # Invariants
//!
//! - Live connections never exceed the pool capacity
//! - Every session has a live executor
//! - Every observer of a session is a live observer
//! - A connection is closed at most once

#![no_main]

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use patrec_core::{Role, env::Environment};
use patrec_server::{RouterConfig, ServerAction, ServerEvent, SessionRouter};

const PATHS: [&str; 6] = ["/zeroth/a", "/zeroth/b", "/first/a", "/second/a", "/second/", "/nope/a"];

#[derive(Clone)]
struct FuzzClock {
    millis: Arc<AtomicU64>,
    seed: u8,
}

impl Environment for FuzzClock {
    type Instant = Duration;

    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        buffer.fill(self.seed);
    }
}

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: u8,
    capacity: u8,
    ops: Vec<Op>,
}

#[derive(Debug, Arbitrary)]
enum Op {
    Connect { id: u8, path: u8 },
    Message { id: u8, payload: String },
    Close { id: u8 },
    Error { id: u8 },
    Advance { secs: u16 },
}

fuzz_target!(|scenario: Scenario| {
    let capacity = usize::from(scenario.capacity % 16) + 1;
    let clock = FuzzClock { millis: Arc::new(AtomicU64::new(0)), seed: scenario.seed };
    let config = RouterConfig { max_connections: capacity, ..Default::default() };
    let Ok(mut router) = SessionRouter::new(clock.clone(), config) else {
        return;
    };
    let mut closed = HashSet::new();
    let mut retired = HashSet::new();

    for op in scenario.ops.into_iter().take(256) {
        let event = match op {
            Op::Connect { id, path } => {
                let id = u64::from(id);
                // Connection ids are never reused by the transport.
                if router.role_of(id).is_some() || retired.contains(&id) {
                    continue;
                }
                let path = PATHS[usize::from(path) % PATHS.len()];
                ServerEvent::ConnectionAccepted { connection_id: id, path: path.to_string() }
            },
            Op::Message { id, payload } => ServerEvent::MessageReceived { connection_id: u64::from(id), payload },
            Op::Close { id } => {
                retired.insert(u64::from(id));
                ServerEvent::ConnectionClosed { connection_id: u64::from(id) }
            },
            Op::Error { id } => {
                retired.insert(u64::from(id));
                ServerEvent::ConnectionErrored { connection_id: u64::from(id), error: "fuzz".to_string() }
            },
            Op::Advance { secs } => {
                clock.millis.fetch_add(u64::from(secs) * 1000, Ordering::SeqCst);
                ServerEvent::Tick
            },
        };

        let Ok(actions) = router.process_event(event) else {
            continue;
        };

        for action in &actions {
            if let ServerAction::Close { connection_id, .. } = action {
                assert!(closed.insert(*connection_id), "connection {connection_id} closed twice");
                retired.insert(*connection_id);
            }
        }

        assert!(router.connection_count() <= capacity, "pool overflow");
        for path in PATHS {
            match router.executor_of(path) {
                Some(executor) => {
                    assert!(matches!(router.role_of(executor), Some(Role::Executor(_))));
                    for observer in router.observers_of(path) {
                        assert_eq!(router.role_of(observer), Some(Role::Observer));
                    }
                },
                None => assert!(router.observers_of(path).is_empty()),
            }
        }
    }
});
