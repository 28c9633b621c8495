//! Session multiplexing scenarios against the sans-IO router.
//!
//! A manual clock stands in for time, so TTL behavior is exact.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use patrec_core::{Role, TaskKind, env::Environment};
use patrec_server::{RouterConfig, ServerAction, ServerEvent, SessionRouter, TaskTtls};
use serde_json::{Value, json};

#[derive(Clone, Default)]
struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Environment for ManualClock {
    type Instant = Duration;

    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        buffer.fill(42);
    }
}

struct Harness {
    clock: ManualClock,
    router: SessionRouter<ManualClock>,
}

impl Harness {
    fn new(config: RouterConfig) -> Self {
        let clock = ManualClock::default();
        let router = SessionRouter::new(clock.clone(), config).unwrap();
        Self { clock, router }
    }

    fn connect(&mut self, id: u64, path: &str) -> Vec<ServerAction<Duration>> {
        self.router
            .process_event(ServerEvent::ConnectionAccepted { connection_id: id, path: path.to_string() })
            .unwrap()
    }

    fn send(&mut self, id: u64, data: Value) -> Vec<ServerAction<Duration>> {
        let payload = json!({ "data": data }).to_string();
        self.router.process_event(ServerEvent::MessageReceived { connection_id: id, payload }).unwrap()
    }

    fn disconnect(&mut self, id: u64) -> Vec<ServerAction<Duration>> {
        self.router.process_event(ServerEvent::ConnectionClosed { connection_id: id }).unwrap()
    }
}

fn messages_to(actions: &[ServerAction<Duration>], target: u64) -> Vec<Value> {
    actions
        .iter()
        .filter_map(|a| match a {
            ServerAction::Send { connection_id, payload } if *connection_id == target => {
                Some(serde_json::from_str(payload).unwrap())
            },
            _ => None,
        })
        .collect()
}

fn closed(actions: &[ServerAction<Duration>]) -> Vec<u64> {
    actions
        .iter()
        .filter_map(|a| match a {
            ServerAction::Close { connection_id, .. } => Some(*connection_id),
            _ => None,
        })
        .collect()
}

#[test]
fn zeroth_session_with_observer() {
    let mut h = Harness::new(RouterConfig::default());

    h.connect(1, "/zeroth/s1");
    let joined = h.connect(2, "/zeroth/s1");
    assert_eq!(messages_to(&joined, 2), vec![json!({"success": true, "data": {"event": "observerConnected", "observers": 1}})]);

    let started = h.send(1, json!({"message": "Let's start"}));
    let problem = messages_to(&started, 1).remove(0);
    assert_eq!(problem["success"], json!(true));
    let [a, b] = [problem["data"]["operands"][0].as_i64().unwrap(), problem["data"]["operands"][1].as_i64().unwrap()];
    assert!((1..=100).contains(&a) && (1..=100).contains(&b));
    let answer = match problem["data"]["operator"].as_str().unwrap() {
        "+" => a + b,
        "-" => a - b,
        "*" => a * b,
        other => panic!("unexpected operator {other}"),
    };

    // Observer sees the raw request, then the reply.
    let mirrored = messages_to(&started, 2);
    assert_eq!(mirrored, vec![json!({"data": {"message": "Let's start"}}), problem.clone()]);

    let solved = h.send(1, json!({"answer": answer}));
    assert_eq!(messages_to(&solved, 1), vec![json!({"success": true, "data": {"answer": "Correct!"}})]);
    assert_eq!(messages_to(&solved, 2).len(), 2);

    let wrong = h.send(1, json!({"answer": answer + 1}));
    let reply = messages_to(&wrong, 1).remove(0);
    assert_eq!(reply["success"], json!(false));
    assert_eq!(reply["errors"][0]["detail"], json!(format!("The right one is {answer}")));
    assert_eq!(closed(&wrong), vec![1, 2]);

    assert!(!h.router.has_session("/zeroth/s1"));
    h.connect(3, "/zeroth/s1");
    assert_eq!(h.router.role_of(3), Some(Role::Executor(TaskKind::Zeroth)));
}

#[test]
fn sessions_are_isolated() {
    let mut h = Harness::new(RouterConfig::default());
    h.connect(1, "/zeroth/a");
    h.connect(2, "/zeroth/b");
    h.connect(3, "/zeroth/a");

    let actions = h.send(2, json!({"message": "Let's start"}));

    assert!(messages_to(&actions, 3).is_empty());
    assert!(messages_to(&actions, 1).is_empty());
    assert_eq!(messages_to(&actions, 2).len(), 1);
}

#[test]
fn same_session_id_under_different_tasks() {
    let mut h = Harness::new(RouterConfig::default());

    h.connect(1, "/zeroth/shared");
    h.connect(2, "/first/shared");

    assert_eq!(h.router.role_of(2), Some(Role::Executor(TaskKind::First)));
    assert_eq!(h.router.session_count(), 2);
    assert!(h.router.observers_of("/zeroth/shared").is_empty());
}

#[test]
fn capacity_plus_one_is_rejected() {
    let capacity = 3;
    let mut h = Harness::new(RouterConfig { max_connections: capacity, ..Default::default() });

    for id in 0..capacity as u64 {
        assert!(h.router.verify_client("/second/s").is_ok());
        h.connect(id, "/second/s");
    }

    assert!(h.router.verify_client("/second/s").is_err());
    let actions = h.connect(99, "/second/s");
    assert_eq!(closed(&actions), vec![99]);
    assert_eq!(h.router.connection_count(), capacity);

    h.disconnect(1);
    assert!(h.router.verify_client("/second/s").is_ok());
}

#[test]
fn ttl_is_per_task_and_absolute() {
    let ttls = TaskTtls {
        zeroth: Duration::from_secs(5),
        first: Duration::from_secs(10),
        second: Duration::from_secs(10),
    };
    let mut h = Harness::new(RouterConfig { ttls, ..Default::default() });
    h.connect(1, "/zeroth/a");
    h.connect(2, "/first/b");

    h.clock.advance(Duration::from_secs(4));
    h.send(1, json!({"message": "Let's start"}));
    h.clock.advance(Duration::from_secs(1));

    let actions = h.router.process_event(ServerEvent::Tick).unwrap();
    assert_eq!(closed(&actions), vec![1]);
    assert!(h.router.has_session("/first/b"));

    h.clock.advance(Duration::from_secs(5));
    let actions = h.router.process_event(ServerEvent::Tick).unwrap();
    assert_eq!(closed(&actions), vec![2]);

    // Late transport close after expiry is a no-op.
    assert!(h.disconnect(2).is_empty());
    assert_eq!(h.router.connection_count(), 0);
}

#[test]
fn first_task_through_router() {
    let mut h = Harness::new(RouterConfig::default());
    h.connect(1, "/first/s");

    let dims = h.send(1, json!({"message": "Let's start"}));
    assert_eq!(messages_to(&dims, 1)[0]["data"], json!({"width": 3, "height": 5, "digits": 10}));

    let catalogue = h.send(
        1,
        json!({"horizontalScale": 1, "verticalScale": 1, "noiseLevel": 0.0, "totalSteps": 1, "shuffle": false}),
    );
    let digits = messages_to(&catalogue, 1)[0]["data"]["digits"].clone();
    assert_eq!(digits["1"], json!([[0, 1, 0], [0, 1, 0], [0, 1, 0], [0, 1, 0], [0, 1, 0]]));

    let round = h.send(1, json!({"message": "Ready"}));
    let matrix = messages_to(&round, 1)[0]["data"]["matrix"].clone();
    let label = (0..10).find(|d| digits[d.to_string()] == matrix).unwrap();

    let solved = h.send(1, json!({"step": 1, "answer": label}));
    assert_eq!(messages_to(&solved, 1)[0]["data"], json!({"step": 1, "solution": label}));

    let score = h.send(1, json!({"message": "Bye"}));
    assert_eq!(messages_to(&score, 1)[0]["data"], json!({"successes": 1, "totalSteps": 1}));
}
