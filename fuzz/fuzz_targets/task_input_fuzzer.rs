//! Fuzz target for task executors
//!
//! Feeds arbitrary and near-valid payloads to each task state machine.
//!
//! # Invariants
//!
//! - No payload panics an executor
//! - Every reply is a well-formed envelope
//! - A close is always the last action of a reply batch

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use patrec_core::{MessageHandler, TaskAction, TaskKind};
use rand::{SeedableRng, rngs::StdRng};

#[derive(Debug, Arbitrary)]
struct Scenario {
    seed: u64,
    kind: u8,
    messages: Vec<Payload>,
}

#[derive(Debug, Arbitrary)]
enum Payload {
    Raw(String),
    Start,
    Ready,
    Bye,
    Answer(i64),
    Guess { step: u64, answer: u8 },
    Guesses { step: u64, guesses: Vec<u16> },
    Settings { horizontal: u8, vertical: u8, noise: f32, steps: u32, shuffle: bool },
    Parameters { bars: u16, radius: Option<u16>, steps: u32, repeats: u16 },
}

impl Payload {
    fn render(&self) -> String {
        match self {
            Self::Raw(raw) => raw.clone(),
            Self::Start => r#"{"data": {"message": "Let's start"}}"#.to_string(),
            Self::Ready => r#"{"data": {"message": "Ready"}}"#.to_string(),
            Self::Bye => r#"{"data": {"message": "Bye"}}"#.to_string(),
            Self::Answer(answer) => format!(r#"{{"data": {{"answer": {answer}}}}}"#),
            Self::Guess { step, answer } => format!(r#"{{"data": {{"step": {step}, "answer": {answer}}}}}"#),
            Self::Guesses { step, guesses } => {
                let guesses: Vec<String> = guesses.iter().map(ToString::to_string).collect();
                format!(r#"{{"data": {{"step": {step}, "guesses": [{}]}}}}"#, guesses.join(","))
            },
            Self::Settings { horizontal, vertical, noise, steps, shuffle } => {
                let noise = if noise.is_finite() { *noise } else { 0.0 };
                format!(
                    r#"{{"data": {{"horizontalScale": {horizontal}, "verticalScale": {vertical}, "noiseLevel": {noise}, "totalSteps": {steps}, "shuffle": {shuffle}}}}}"#
                )
            },
            Self::Parameters { bars, radius, steps, repeats } => {
                let loss = radius.map_or_else(|| r#""L1""#.to_string(), |r| r.to_string());
                format!(
                    r#"{{"data": {{"barsNumber": {bars}, "loss": {loss}, "totalSteps": {steps}, "repeats": {repeats}}}}}"#
                )
            },
        }
    }
}

fuzz_target!(|scenario: Scenario| {
    let kind = TaskKind::ALL[usize::from(scenario.kind) % TaskKind::ALL.len()];
    let mut handler = kind.spawn();
    let mut rng = StdRng::seed_from_u64(scenario.seed);

    for payload in scenario.messages.iter().take(64) {
        let actions = handler.receive(&payload.render(), &mut rng);

        if let Some(position) = actions.iter().position(|a| matches!(a, TaskAction::Close { .. })) {
            assert_eq!(position, actions.len() - 1, "close must end the batch");
        }
        for action in &actions {
            if let TaskAction::Send(envelope) = action {
                assert_eq!(envelope.success, envelope.errors.is_none(), "envelope success flag out of sync");
            }
        }
        if actions.iter().any(|a| matches!(a, TaskAction::Close { .. })) {
            break;
        }
    }
});
