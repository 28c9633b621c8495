//! First task: recognise noisy digits.
//!
//! ```text
//! START ──> SETUP ──> READY ──> SOLVE ──┬──> READY   (step < totalSteps)
//!                                       └──> FINISH  (step == totalSteps)
//! ```
//!
//! `SETUP` fixes the scale, the noise level, the number of rounds and whether
//! digit labels are shuffled over the templates. Each round draws a label,
//! renders its (remapped) template at the requested scale and flips every cell
//! with probability `noiseLevel`. The client answers with the label.

use std::{collections::BTreeMap, time::Duration};

use rand::{Rng, RngCore, seq::SliceRandom};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    Outbox, TaskExecutor,
    schema::{Checks, expect_message, parse},
};
use crate::{envelope::ErrorRecord, registry::TaskKind};

/// URL prefix owning this task.
pub const PATH: &str = "/first/";

/// Default connection TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// Message that opens the session.
pub const START_MESSAGE: &str = "Let's start";

/// Message that requests the next round.
pub const READY_MESSAGE: &str = "Ready";

/// Message that requests the final score.
pub const FINISH_MESSAGE: &str = "Bye";

/// Template height in cells.
pub const HEIGHT: usize = 5;

/// Template width in cells.
pub const WIDTH: usize = 3;

/// Number of digit labels.
pub const DIGITS: usize = 10;

/// Maximum accepted horizontal scale.
pub const MAX_HORIZONTAL_SCALE: u32 = 100;

/// Maximum accepted vertical scale.
pub const MAX_VERTICAL_SCALE: u32 = 100;

/// Maximum accepted number of rounds.
pub const MAX_TOTAL_STEPS: u64 = 1_000_000;

/// Binary 5x3 template of one digit.
pub type Template = [[u8; WIDTH]; HEIGHT];

/// Rendered matrix, row-major.
pub type Matrix = Vec<Vec<u8>>;

/// Templates of the digits `0` to `9`.
pub const TEMPLATES: [Template; DIGITS] = [
    [[1, 1, 1], [1, 0, 1], [1, 0, 1], [1, 0, 1], [1, 1, 1]],
    [[0, 1, 0], [0, 1, 0], [0, 1, 0], [0, 1, 0], [0, 1, 0]],
    [[1, 1, 1], [0, 0, 1], [1, 1, 1], [1, 0, 0], [1, 1, 1]],
    [[1, 1, 1], [0, 0, 1], [1, 1, 1], [0, 0, 1], [1, 1, 1]],
    [[1, 0, 1], [1, 0, 1], [1, 1, 1], [0, 0, 1], [0, 0, 1]],
    [[1, 1, 1], [1, 0, 0], [1, 1, 1], [0, 0, 1], [1, 1, 1]],
    [[1, 1, 1], [1, 0, 0], [1, 1, 1], [1, 0, 1], [1, 1, 1]],
    [[1, 1, 1], [0, 0, 1], [0, 1, 0], [1, 0, 0], [1, 0, 0]],
    [[1, 1, 1], [1, 0, 1], [1, 1, 1], [1, 0, 1], [1, 1, 1]],
    [[1, 1, 1], [1, 0, 1], [1, 1, 1], [0, 0, 1], [0, 0, 1]],
];

/// Label to template assignment. `remapping[label]` is a template index.
pub type Remapping = [usize; DIGITS];

/// Identity when `shuffle` is off, otherwise a Fisher–Yates permutation.
///
/// Always a bijection over `0..DIGITS`.
pub fn remapping(shuffle: bool, rng: &mut dyn RngCore) -> Remapping {
    let mut mapping: Remapping = std::array::from_fn(|label| label);
    if shuffle {
        mapping.shuffle(rng);
    }
    mapping
}

/// Scale `template` and flip each cell with probability `noise`.
///
/// `noise` must lie in `[0, 1]`.
pub fn render(
    template: &Template,
    horizontal_scale: usize,
    vertical_scale: usize,
    noise: f64,
    rng: &mut dyn RngCore,
) -> Matrix {
    let mut matrix = Vec::with_capacity(HEIGHT * vertical_scale);
    for row in template {
        for _ in 0..vertical_scale {
            let mut line = Vec::with_capacity(WIDTH * horizontal_scale);
            for &cell in row {
                for _ in 0..horizontal_scale {
                    line.push(cell ^ u8::from(rng.gen_bool(noise)));
                }
            }
            matrix.push(line);
        }
    }
    matrix
}

/// First task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstState {
    /// Waiting for the start message
    Start,
    /// Waiting for the settings
    Setup,
    /// Waiting for the client to request a round
    Ready,
    /// Waiting for the answer of the current round
    Solve,
    /// All rounds played
    Finish,
}

/// Round settings chosen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Settings {
    /// Column duplication factor
    pub horizontal_scale: u32,
    /// Row duplication factor
    pub vertical_scale: u32,
    /// Probability of flipping each cell
    pub noise_level: f64,
    /// Number of rounds
    pub total_steps: u64,
    /// Decouple labels from templates
    pub shuffle: bool,
}

impl Settings {
    fn check(self) -> Result<Self, Vec<ErrorRecord>> {
        let mut checks = Checks::new();
        checks.require((1..=MAX_HORIZONTAL_SCALE).contains(&self.horizontal_scale), || {
            format!("horizontalScale must be in 1..={MAX_HORIZONTAL_SCALE}")
        });
        checks.require((1..=MAX_VERTICAL_SCALE).contains(&self.vertical_scale), || {
            format!("verticalScale must be in 1..={MAX_VERTICAL_SCALE}")
        });
        checks.require((0.0..=1.0).contains(&self.noise_level), || {
            "noiseLevel must be in [0, 1]".to_string()
        });
        checks.require((1..=MAX_TOTAL_STEPS).contains(&self.total_steps), || {
            format!("totalSteps must be in 1..={MAX_TOTAL_STEPS}")
        });
        checks.finish(self)
    }
}

/// Answer of one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Guess {
    /// Round number
    pub step: u64,
    /// Digit label
    pub answer: u8,
}

/// Validated input of the first task.
#[derive(Debug, Clone, PartialEq)]
pub enum FirstInput {
    /// `{"message": "Let's start"}`
    Start,
    /// Settings
    Setup(Settings),
    /// `{"message": "Ready"}`
    Ready,
    /// Answer of the current round
    Solve(Guess),
    /// `{"message": "Bye"}`
    Finish,
}

#[derive(Debug, Serialize)]
struct Dimensions {
    width: usize,
    height: usize,
    digits: usize,
}

#[derive(Debug, Serialize)]
struct Catalogue {
    digits: BTreeMap<String, Matrix>,
}

#[derive(Debug, Serialize)]
struct Round<'a> {
    step: u64,
    matrix: &'a Matrix,
}

#[derive(Debug, Serialize)]
struct Solution {
    step: u64,
    solution: u8,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Score {
    successes: u64,
    total_steps: u64,
}

/// First task executor.
#[derive(Debug)]
pub struct First {
    state: FirstState,
    settings: Option<Settings>,
    remapping: Remapping,
    current_step: u64,
    current_label: u8,
    successes: u64,
}

impl Default for First {
    fn default() -> Self {
        Self::new()
    }
}

impl First {
    /// Create an executor in [`FirstState::Start`].
    pub fn new() -> Self {
        tracing::debug!(task = %TaskKind::First, "executor created");
        Self {
            state: FirstState::Start,
            settings: None,
            remapping: std::array::from_fn(|label| label),
            current_step: 0,
            current_label: 0,
            successes: 0,
        }
    }

    /// Settings, once `SETUP` is done.
    pub fn settings(&self) -> Option<Settings> {
        self.settings
    }

    /// Label to template assignment in force.
    pub fn remapping(&self) -> &Remapping {
        &self.remapping
    }

    /// Rounds issued so far.
    pub fn current_step(&self) -> u64 {
        self.current_step
    }

    /// Correctly answered rounds.
    pub fn successes(&self) -> u64 {
        self.successes
    }

    fn template(&self, label: usize) -> &'static Template {
        &TEMPLATES[self.remapping[label]]
    }

    fn on_start(&mut self, out: &mut Outbox) {
        self.state = FirstState::Setup;
        out.send_message(&Dimensions { width: WIDTH, height: HEIGHT, digits: DIGITS });
    }

    fn on_setup(&mut self, settings: Settings, rng: &mut dyn RngCore, out: &mut Outbox) {
        self.remapping = remapping(settings.shuffle, rng);
        self.settings = Some(settings);
        self.state = FirstState::Ready;

        let digits = (0..DIGITS)
            .map(|label| {
                let matrix = render(
                    self.template(label),
                    settings.horizontal_scale as usize,
                    settings.vertical_scale as usize,
                    0.0,
                    rng,
                );
                (label.to_string(), matrix)
            })
            .collect();
        out.send_message(&Catalogue { digits });
    }

    fn on_ready(&mut self, rng: &mut dyn RngCore, out: &mut Outbox) {
        let Some(settings) = self.settings else {
            out.violation(vec![ErrorRecord::new("Setup is missing")], "ready before setup");
            return;
        };

        self.current_step += 1;
        self.current_label = rng.gen_range(0..DIGITS) as u8;
        self.state = FirstState::Solve;

        let matrix = render(
            self.template(self.current_label as usize),
            settings.horizontal_scale as usize,
            settings.vertical_scale as usize,
            settings.noise_level,
            rng,
        );
        out.send_message(&Round { step: self.current_step, matrix: &matrix });
    }

    fn on_solve(&mut self, guess: Guess, out: &mut Outbox) {
        let Some(settings) = self.settings else {
            out.violation(vec![ErrorRecord::new("Setup is missing")], "solve before setup");
            return;
        };

        if guess.step != self.current_step {
            out.violation(
                vec![ErrorRecord::with_detail(
                    "Wrong step number",
                    format!("The current step is {}", self.current_step),
                )],
                "step mismatch",
            );
            return;
        }

        if self.current_step < settings.total_steps {
            self.state = FirstState::Ready;
        } else if self.current_step == settings.total_steps {
            self.state = FirstState::Finish;
        } else {
            tracing::error!(
                task = %TaskKind::First,
                step = self.current_step,
                total = settings.total_steps,
                "step counter overran total"
            );
            out.violation(vec![ErrorRecord::new("Too many steps")], "step overrun");
            return;
        }

        if guess.answer == self.current_label {
            self.successes += 1;
        }
        out.send_message(&Solution { step: self.current_step, solution: self.current_label });
    }

    fn on_finish(&mut self, out: &mut Outbox) {
        let total_steps = self.settings.map_or(0, |s| s.total_steps);
        out.send_message(&Score { successes: self.successes, total_steps });
    }
}

impl TaskExecutor for First {
    type Input = FirstInput;
    type State = FirstState;

    fn kind(&self) -> TaskKind {
        TaskKind::First
    }

    fn state(&self) -> FirstState {
        self.state
    }

    fn validate(&self, data: Map<String, Value>) -> Result<FirstInput, Vec<ErrorRecord>> {
        match self.state {
            FirstState::Start => expect_message(data, START_MESSAGE).map(|()| FirstInput::Start),
            FirstState::Setup => parse::<Settings>(data)?.check().map(FirstInput::Setup),
            FirstState::Ready => expect_message(data, READY_MESSAGE).map(|()| FirstInput::Ready),
            FirstState::Solve => {
                let guess = parse::<Guess>(data)?;
                let mut checks = Checks::new();
                checks.require((guess.answer as usize) < DIGITS, || {
                    format!("answer must be a digit in 0..{DIGITS}")
                });
                checks.finish(FirstInput::Solve(guess))
            },
            FirstState::Finish => expect_message(data, FINISH_MESSAGE).map(|()| FirstInput::Finish),
        }
    }

    fn on_message(&mut self, input: FirstInput, rng: &mut dyn RngCore, out: &mut Outbox) {
        match input {
            FirstInput::Start => self.on_start(out),
            FirstInput::Setup(settings) => self.on_setup(settings, rng, out),
            FirstInput::Ready => self.on_ready(rng, out),
            FirstInput::Solve(guess) => self.on_solve(guess, out),
            FirstInput::Finish => self.on_finish(out),
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

    fn send(task: &mut First, data: Value, rng: &mut ChaCha8Rng) -> Vec<TaskAction> {
        task.receive(&json!({ "data": data }).to_string(), rng)
    }

    fn reply(actions: &[TaskAction]) -> Value {
        match actions {
            [TaskAction::Send(envelope)] if envelope.success => envelope.data.clone().unwrap(),
            _ => panic!("expected one successful reply, got {actions:?}"),
        }
    }

    fn setup(task: &mut First, rng: &mut ChaCha8Rng, total_steps: u64, noise: f64, shuffle: bool) -> Value {
        reply(&send(task, json!({"message": "Let's start"}), rng));
        reply(&send(
            task,
            json!({
                "horizontalScale": 2,
                "verticalScale": 3,
                "noiseLevel": noise,
                "totalSteps": total_steps,
                "shuffle": shuffle,
            }),
            rng,
        ))
    }

    #[test]
    fn start_reports_dimensions() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut task = First::new();

        let data = reply(&send(&mut task, json!({"message": "Let's start"}), &mut rng));

        assert_eq!(data, json!({"width": 3, "height": 5, "digits": 10}));
        assert_eq!(task.state(), FirstState::Setup);
    }

    #[test]
    fn setup_sends_scaled_catalogue() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut task = First::new();

        let data = setup(&mut task, &mut rng, 3, 0.5, false);

        assert_eq!(task.state(), FirstState::Ready);
        let zero = &data["digits"]["0"];
        assert_eq!(zero.as_array().unwrap().len(), HEIGHT * 3);
        assert_eq!(zero[0], json!([1, 1, 1, 1, 1, 1]));
        assert_eq!(zero[3], json!([1, 1, 0, 0, 1, 1]));
    }

    #[test]
    fn setup_out_of_range_is_rejected() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut task = First::new();
        send(&mut task, json!({"message": "Let's start"}), &mut rng);

        let actions = send(
            &mut task,
            json!({
                "horizontalScale": 0,
                "verticalScale": 101,
                "noiseLevel": 1.5,
                "totalSteps": 0,
                "shuffle": true,
            }),
            &mut rng,
        );

        let TaskAction::Send(envelope) = &actions[0] else { panic!("expected errors") };
        assert_eq!(envelope.errors.as_ref().unwrap().len(), 4);
        assert!(matches!(actions[1], TaskAction::Close { .. }));
        assert_eq!(task.state(), FirstState::Setup);
    }

    #[test]
    fn full_session_counts_successes() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut task = First::new();
        setup(&mut task, &mut rng, 3, 0.0, true);

        for step in 1..=3u64 {
            let round = reply(&send(&mut task, json!({"message": "Ready"}), &mut rng));
            assert_eq!(round["step"], json!(step));
            assert_eq!(task.state(), FirstState::Solve);

            // Noise-free rounds can be matched against the catalogue.
            let label = task.current_label;
            let answer = if step == 2 { (label + 1) % 10 } else { label };
            let solved = reply(&send(&mut task, json!({"step": step, "answer": answer}), &mut rng));
            assert_eq!(solved, json!({"step": step, "solution": label}));
        }

        assert_eq!(task.state(), FirstState::Finish);
        let score = reply(&send(&mut task, json!({"message": "Bye"}), &mut rng));
        assert_eq!(score, json!({"successes": 2, "totalSteps": 3}));

        let actions = send(&mut task, json!({"message": "Ready"}), &mut rng);
        assert!(matches!(actions.last(), Some(TaskAction::Close { .. })));
    }

    #[test]
    fn wrong_step_is_fatal() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let mut task = First::new();
        setup(&mut task, &mut rng, 5, 0.1, false);
        send(&mut task, json!({"message": "Ready"}), &mut rng);

        let actions = send(&mut task, json!({"step": 2, "answer": 1}), &mut rng);

        let TaskAction::Send(envelope) = &actions[0] else { panic!("expected errors") };
        assert_eq!(envelope.errors.as_ref().unwrap()[0].title, "Wrong step number");
        assert!(matches!(actions[1], TaskAction::Close { .. }));
        assert_eq!(task.successes(), 0);
    }

    #[test]
    fn answer_must_be_a_digit() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let mut task = First::new();
        setup(&mut task, &mut rng, 1, 0.0, false);
        send(&mut task, json!({"message": "Ready"}), &mut rng);

        let actions = send(&mut task, json!({"step": 1, "answer": 10}), &mut rng);

        assert!(matches!(actions.last(), Some(TaskAction::Close { .. })));
        assert_eq!(task.state(), FirstState::Solve);
    }

    #[test]
    fn identity_remapping_without_shuffle() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);

        assert_eq!(remapping(false, &mut rng), [0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[test]
    fn render_scales_rows_and_columns() {
        let mut rng = ChaCha8Rng::seed_from_u64(8);

        let matrix = render(&TEMPLATES[1], 2, 1, 0.0, &mut rng);

        assert_eq!(matrix.len(), HEIGHT);
        assert!(matrix.iter().all(|row| row == &vec![0, 0, 1, 1, 0, 0]));
    }
}
