//! Second task: aim at samples drawn from a random histogram.
//!
//! ```text
//! START ──> READY ──> SOLVE ──┬──> READY   (step < totalSteps)
//!                             └──> FINISH  (step == totalSteps)
//! ```
//!
//! Each round the server generates a random-walk histogram ("heatmap") over
//! `barsNumber` bars, shows it, and secretly draws `repeats` bar indices with
//! probability proportional to bar height. The client guesses the indices and
//! accumulates loss under the chosen [`LossFunction`].

use std::{fmt, time::Duration};

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use super::{
    Outbox, TaskExecutor,
    schema::{Checks, expect_message, parse},
};
use crate::{envelope::ErrorRecord, registry::TaskKind};

/// URL prefix owning this task.
pub const PATH: &str = "/second/";

/// Default connection TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Message that requests the next round.
pub const READY_MESSAGE: &str = "Ready";

/// Message that requests the final score.
pub const FINISH_MESSAGE: &str = "Bye";

/// Reply to a valid start message.
pub const READY_PROMPT: &str = "Are you ready?";

/// Maximum accepted number of bars.
pub const MAX_BARS_NUMBER: usize = 1000;

/// Maximum accepted number of draws per round.
pub const MAX_REPEATS: usize = MAX_BARS_NUMBER;

/// Maximum accepted number of rounds.
pub const MAX_TOTAL_STEPS: u64 = 1_000_000;

/// Upper bound of a bar height.
pub const MAX_HISTOGRAM_VALUE: f64 = 255.0;

/// Wire name of the L1 loss.
pub const L1_LOSS_NAME: &str = "L1";

/// How a guess is scored against the drawn index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossFunction {
    /// `|guess - truth|`
    L1,
    /// `0` within the radius, `1` outside
    Radius(u64),
}

impl LossFunction {
    /// Loss of one guess.
    pub fn loss(self, guess: usize, truth: usize) -> u64 {
        let distance = guess.abs_diff(truth) as u64;
        match self {
            Self::L1 => distance,
            Self::Radius(radius) => u64::from(distance > radius),
        }
    }
}

impl fmt::Display for LossFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L1 => f.write_str(L1_LOSS_NAME),
            Self::Radius(radius) => write!(f, "{radius}"),
        }
    }
}

impl Serialize for LossFunction {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::L1 => serializer.serialize_str(L1_LOSS_NAME),
            Self::Radius(radius) => serializer.serialize_u64(*radius),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLoss {
    Name(String),
    Radius(u64),
}

impl TryFrom<RawLoss> for LossFunction {
    type Error = String;

    fn try_from(raw: RawLoss) -> Result<Self, String> {
        match raw {
            RawLoss::Name(name) if name == L1_LOSS_NAME => Ok(Self::L1),
            RawLoss::Name(name) => Err(format!("unknown loss {name:?}")),
            RawLoss::Radius(radius) => Ok(Self::Radius(radius)),
        }
    }
}

impl<'de> Deserialize<'de> for LossFunction {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        RawLoss::deserialize(deserializer)?.try_into().map_err(serde::de::Error::custom)
    }
}

/// Random-walk histogram over `bars` bars.
///
/// Every bar ends up in `1..=255`.
pub fn generate_histogram(bars: usize, rng: &mut dyn RngCore) -> Vec<u32> {
    let step = 2.0 * MAX_HISTOGRAM_VALUE / (bars as f64).sqrt();
    let mut heights = Vec::with_capacity(bars);
    let mut previous = rng.r#gen::<f64>() * MAX_HISTOGRAM_VALUE;
    heights.push(previous);
    for _ in 1..bars {
        previous = (previous + (rng.r#gen::<f64>() - 0.5) * step).clamp(0.0, MAX_HISTOGRAM_VALUE);
        heights.push(previous);
    }
    heights.into_iter().map(|h| if h > 1.0 { h.round() as u32 } else { 1 }).collect()
}

/// Running sums of `histogram`.
pub fn cumulative(histogram: &[u32]) -> Vec<u64> {
    histogram
        .iter()
        .scan(0u64, |sum, &h| {
            *sum += u64::from(h);
            Some(*sum)
        })
        .collect()
}

/// Draw one bar index, weighted by height.
///
/// `cumulative` must be non-empty with a positive total.
pub fn sample_index(cumulative: &[u64], rng: &mut dyn RngCore) -> usize {
    let total = cumulative.last().copied().unwrap_or(0);
    if total == 0 {
        return 0;
    }
    let value = rng.gen_range(1..=total);
    cumulative.partition_point(|&c| c < value)
}

/// Second task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecondState {
    /// Waiting for the parameters
    Start,
    /// Waiting for the client to request a round
    Ready,
    /// Waiting for the guesses of the current round
    Solve,
    /// All rounds played
    Finish,
}

/// Game parameters chosen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Parameters {
    /// Number of histogram bars
    pub bars_number: usize,
    /// Scoring rule
    pub loss: LossFunction,
    /// Number of rounds
    pub total_steps: u64,
    /// Draws per round
    pub repeats: usize,
}

impl Parameters {
    fn check(self) -> Result<Self, Vec<ErrorRecord>> {
        let mut checks = Checks::new();
        checks.require((1..=MAX_BARS_NUMBER).contains(&self.bars_number), || {
            format!("barsNumber must be in 1..={MAX_BARS_NUMBER}")
        });
        if let LossFunction::Radius(radius) = self.loss {
            checks.require(radius < self.bars_number as u64, || {
                "loss radius must be below barsNumber".to_string()
            });
        }
        checks.require((1..=MAX_TOTAL_STEPS).contains(&self.total_steps), || {
            format!("totalSteps must be in 1..={MAX_TOTAL_STEPS}")
        });
        checks.require((1..=MAX_REPEATS).contains(&self.repeats), || {
            format!("repeats must be in 1..={MAX_REPEATS}")
        });
        checks.finish(self)
    }
}

/// Guesses of one round.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Guesses {
    /// Round number
    pub step: u64,
    /// One bar index per draw
    pub guesses: Vec<usize>,
}

/// Validated input of the second task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecondInput {
    /// Game parameters
    Start(Parameters),
    /// `{"message": "Ready"}`
    Ready,
    /// Guesses of the current round
    Solve(Guesses),
    /// `{"message": "Bye"}`
    Finish,
}

#[derive(Debug, Serialize)]
struct Prompt {
    message: &'static str,
}

#[derive(Debug, Serialize)]
struct Heatmap<'a> {
    step: u64,
    heatmap: &'a [u32],
}

#[derive(Debug, Serialize)]
struct Reveal<'a> {
    step: u64,
    loss: LossFunction,
    solutions: &'a [usize],
    guesses: &'a [usize],
    heatmap: &'a [u32],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Score {
    total_loss: u64,
}

/// Second task executor.
#[derive(Debug)]
pub struct Second {
    state: SecondState,
    parameters: Option<Parameters>,
    histogram: Vec<u32>,
    current_step: u64,
    total_loss: u64,
}

impl Default for Second {
    fn default() -> Self {
        Self::new()
    }
}

impl Second {
    /// Create an executor in [`SecondState::Start`].
    pub fn new() -> Self {
        tracing::debug!(task = %TaskKind::Second, "executor created");
        Self {
            state: SecondState::Start,
            parameters: None,
            histogram: Vec::new(),
            current_step: 0,
            total_loss: 0,
        }
    }

    /// Parameters, once `START` is done.
    pub fn parameters(&self) -> Option<Parameters> {
        self.parameters
    }

    /// Histogram of the current round.
    pub fn histogram(&self) -> &[u32] {
        &self.histogram
    }

    /// Rounds issued so far.
    pub fn current_step(&self) -> u64 {
        self.current_step
    }

    /// Loss accumulated over every answered round.
    pub fn total_loss(&self) -> u64 {
        self.total_loss
    }

    fn on_start(&mut self, parameters: Parameters, out: &mut Outbox) {
        self.parameters = Some(parameters);
        self.state = SecondState::Ready;
        out.send_message(&Prompt { message: READY_PROMPT });
    }

    fn on_ready(&mut self, rng: &mut dyn RngCore, out: &mut Outbox) {
        let Some(parameters) = self.parameters else {
            out.violation(vec![ErrorRecord::new("Parameters are missing")], "ready before start");
            return;
        };

        self.current_step += 1;
        self.histogram = generate_histogram(parameters.bars_number, rng);
        self.state = SecondState::Solve;
        out.send_message(&Heatmap { step: self.current_step, heatmap: &self.histogram });
    }

    fn on_solve(&mut self, guesses: Guesses, rng: &mut dyn RngCore, out: &mut Outbox) {
        let Some(parameters) = self.parameters else {
            out.violation(vec![ErrorRecord::new("Parameters are missing")], "solve before start");
            return;
        };

        if guesses.guesses.len() != parameters.repeats {
            out.violation(
                vec![ErrorRecord::with_detail(
                    "Wrong number of guesses",
                    format!("Expected {} guesses", parameters.repeats),
                )],
                "guess count mismatch",
            );
            return;
        }

        if guesses.step != self.current_step {
            out.violation(
                vec![ErrorRecord::with_detail(
                    "Wrong step number",
                    format!("The current step is {}", self.current_step),
                )],
                "step mismatch",
            );
            return;
        }

        if self.current_step < parameters.total_steps {
            self.state = SecondState::Ready;
        } else if self.current_step == parameters.total_steps {
            self.state = SecondState::Finish;
        } else {
            tracing::error!(
                task = %TaskKind::Second,
                step = self.current_step,
                total = parameters.total_steps,
                "step counter overran total"
            );
            out.violation(vec![ErrorRecord::new("Too many steps")], "step overrun");
            return;
        }

        let sums = cumulative(&self.histogram);
        let solutions: Vec<usize> = (0..parameters.repeats).map(|_| sample_index(&sums, rng)).collect();
        self.total_loss += guesses
            .guesses
            .iter()
            .zip(&solutions)
            .map(|(&guess, &truth)| parameters.loss.loss(guess, truth))
            .sum::<u64>();

        out.send_message(&Reveal {
            step: self.current_step,
            loss: parameters.loss,
            solutions: &solutions,
            guesses: &guesses.guesses,
            heatmap: &self.histogram,
        });
    }

    fn on_finish(&mut self, out: &mut Outbox) {
        out.send_message(&Score { total_loss: self.total_loss });
    }
}

impl TaskExecutor for Second {
    type Input = SecondInput;
    type State = SecondState;

    fn kind(&self) -> TaskKind {
        TaskKind::Second
    }

    fn state(&self) -> SecondState {
        self.state
    }

    fn validate(&self, data: Map<String, Value>) -> Result<SecondInput, Vec<ErrorRecord>> {
        match self.state {
            SecondState::Start => parse::<Parameters>(data)?.check().map(SecondInput::Start),
            SecondState::Ready => expect_message(data, READY_MESSAGE).map(|()| SecondInput::Ready),
            SecondState::Solve => {
                let guesses = parse::<Guesses>(data)?;
                let bars = self.histogram.len();
                let mut checks = Checks::new();
                checks.require(guesses.guesses.iter().all(|&g| g < bars), || {
                    format!("every guess must be a bar index in 0..{bars}")
                });
                checks.finish(SecondInput::Solve(guesses))
            },
            SecondState::Finish => expect_message(data, FINISH_MESSAGE).map(|()| SecondInput::Finish),
        }
    }

    fn on_message(&mut self, input: SecondInput, rng: &mut dyn RngCore, out: &mut Outbox) {
        match input {
            SecondInput::Start(parameters) => self.on_start(parameters, out),
            SecondInput::Ready => self.on_ready(rng, out),
            SecondInput::Solve(guesses) => self.on_solve(guesses, rng, out),
            SecondInput::Finish => self.on_finish(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use serde_json::json;

    use super::*;
    use crate::{listener::MessageHandler, task::TaskAction};

    fn send(task: &mut Second, data: Value, rng: &mut ChaCha8Rng) -> Vec<TaskAction> {
        task.receive(&json!({ "data": data }).to_string(), rng)
    }

    fn reply(actions: &[TaskAction]) -> Value {
        match actions {
            [TaskAction::Send(envelope)] if envelope.success => envelope.data.clone().unwrap(),
            _ => panic!("expected one successful reply, got {actions:?}"),
        }
    }

    fn start(task: &mut Second, rng: &mut ChaCha8Rng, loss: Value, total_steps: u64, repeats: usize) {
        let data = reply(&send(
            task,
            json!({"barsNumber": 20, "loss": loss, "totalSteps": total_steps, "repeats": repeats}),
            rng,
        ));
        assert_eq!(data, json!({"message": "Are you ready?"}));
    }

    #[test]
    fn loss_wire_format() {
        let l1: LossFunction = serde_json::from_value(json!("L1")).unwrap();
        let radius: LossFunction = serde_json::from_value(json!(3)).unwrap();

        assert_eq!(l1, LossFunction::L1);
        assert_eq!(radius, LossFunction::Radius(3));
        assert_eq!(serde_json::to_value(radius).unwrap(), json!(3));
        assert_eq!(serde_json::to_value(l1).unwrap(), json!("L1"));
        assert!(serde_json::from_value::<LossFunction>(json!("L2")).is_err());
        assert!(serde_json::from_value::<LossFunction>(json!(-1)).is_err());
    }

    #[test]
    fn loss_values() {
        assert_eq!(LossFunction::L1.loss(3, 7), 4);
        assert_eq!(LossFunction::L1.loss(7, 3), 4);
        assert_eq!(LossFunction::Radius(2).loss(5, 7), 0);
        assert_eq!(LossFunction::Radius(2).loss(5, 8), 1);
        assert_eq!(LossFunction::Radius(0).loss(4, 4), 0);
    }

    #[test]
    fn radius_must_be_below_bar_count() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut task = Second::new();

        let actions = send(
            &mut task,
            json!({"barsNumber": 5, "loss": 5, "totalSteps": 1, "repeats": 1}),
            &mut rng,
        );

        assert!(matches!(actions.last(), Some(TaskAction::Close { .. })));
        assert_eq!(task.state(), SecondState::Start);
    }

    #[test]
    fn full_session_accumulates_loss() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut task = Second::new();
        start(&mut task, &mut rng, json!("L1"), 2, 4);

        for step in 1..=2u64 {
            let round = reply(&send(&mut task, json!({"message": "Ready"}), &mut rng));
            assert_eq!(round["step"], json!(step));
            assert_eq!(round["heatmap"].as_array().unwrap().len(), 20);

            let reveal = reply(&send(&mut task, json!({"step": step, "guesses": [0, 5, 10, 19]}), &mut rng));
            assert_eq!(reveal["loss"], json!("L1"));
            assert_eq!(reveal["guesses"], json!([0, 5, 10, 19]));
            assert_eq!(reveal["heatmap"], round["heatmap"]);
            assert_eq!(reveal["solutions"].as_array().unwrap().len(), 4);
        }

        assert_eq!(task.state(), SecondState::Finish);
        let score = reply(&send(&mut task, json!({"message": "Bye"}), &mut rng));
        assert_eq!(score, json!({"totalLoss": task.total_loss()}));
    }

    #[test]
    fn guess_count_must_match_repeats() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut task = Second::new();
        start(&mut task, &mut rng, json!(1), 3, 2);
        send(&mut task, json!({"message": "Ready"}), &mut rng);

        let actions = send(&mut task, json!({"step": 1, "guesses": [1]}), &mut rng);

        let TaskAction::Send(envelope) = &actions[0] else { panic!("expected errors") };
        assert_eq!(envelope.errors.as_ref().unwrap()[0].title, "Wrong number of guesses");
        assert!(matches!(actions[1], TaskAction::Close { .. }));
    }

    #[test]
    fn out_of_range_guess_is_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut task = Second::new();
        start(&mut task, &mut rng, json!("L1"), 1, 1);
        send(&mut task, json!({"message": "Ready"}), &mut rng);

        let actions = send(&mut task, json!({"step": 1, "guesses": [20]}), &mut rng);

        assert!(matches!(actions.last(), Some(TaskAction::Close { .. })));
        assert_eq!(task.state(), SecondState::Solve);
    }

    #[test]
    fn wrong_step_is_fatal() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut task = Second::new();
        start(&mut task, &mut rng, json!("L1"), 3, 1);
        send(&mut task, json!({"message": "Ready"}), &mut rng);

        let actions = send(&mut task, json!({"step": 7, "guesses": [0]}), &mut rng);

        assert!(matches!(actions.last(), Some(TaskAction::Close { .. })));
        assert_eq!(task.total_loss(), 0);
    }

    #[test]
    fn sampling_follows_cumulative_sums() {
        let sums = cumulative(&[1, 0, 3]);
        assert_eq!(sums, vec![1, 1, 4]);

        let mut rng = ChaCha8Rng::seed_from_u64(6);
        for _ in 0..500 {
            let index = sample_index(&sums, &mut rng);
            assert!(index == 0 || index == 2);
        }
    }

    #[test]
    fn single_bar_histogram() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        let histogram = generate_histogram(1, &mut rng);

        assert_eq!(histogram.len(), 1);
        assert_eq!(sample_index(&cumulative(&histogram), &mut rng), 0);
    }
}
