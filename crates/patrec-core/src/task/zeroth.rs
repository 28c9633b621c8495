//! Zeroth task: evaluate one arithmetic expression.
//!
//! ```text
//! ┌───────┐ "Let's start" ┌───────┐ answer
//! │ START │──────────────>│ SOLVE │───────┐
//! └───────┘               └───────┘<──────┘
//! ```
//!
//! A correct answer keeps the session in `SOLVE`; a wrong one reveals the
//! result and closes the connection.

use std::{fmt, time::Duration};

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    Outbox, TaskExecutor,
    schema::{expect_message, parse},
};
use crate::{envelope::ErrorRecord, registry::TaskKind};

/// URL prefix owning this task.
pub const PATH: &str = "/zeroth/";

/// Default connection TTL.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Message that opens the session.
pub const START_MESSAGE: &str = "Let's start";

/// Inclusive operand range.
pub const OPERAND_RANGE: std::ops::RangeInclusive<i64> = 1..=100;

/// Zeroth task states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZerothState {
    /// Waiting for the start message
    Start,
    /// Waiting for the answer
    Solve,
}

/// Binary operator of the generated expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    /// Addition
    #[serde(rename = "+")]
    Add,
    /// Subtraction
    #[serde(rename = "-")]
    Sub,
    /// Multiplication
    #[serde(rename = "*")]
    Mul,
}

impl Operator {
    /// All operators, in draw order.
    pub const ALL: [Self; 3] = [Self::Add, Self::Sub, Self::Mul];

    /// Evaluate `lhs op rhs`.
    pub fn apply(self, lhs: i64, rhs: i64) -> i64 {
        match self {
            Self::Add => lhs + rhs,
            Self::Sub => lhs - rhs,
            Self::Mul => lhs * rhs,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
        })
    }
}

/// Generated expression, as sent to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Problem {
    /// Left and right operand
    pub operands: [i64; 2],
    /// Operator between them
    pub operator: Operator,
}

impl Problem {
    /// Draw a fresh problem.
    pub fn generate(rng: &mut dyn RngCore) -> Self {
        let lhs = rng.gen_range(OPERAND_RANGE);
        let rhs = rng.gen_range(OPERAND_RANGE);
        let operator = Operator::ALL[rng.gen_range(0..Operator::ALL.len())];
        Self { operands: [lhs, rhs], operator }
    }

    /// Expected answer.
    pub fn solution(&self) -> i64 {
        self.operator.apply(self.operands[0], self.operands[1])
    }
}

/// Validated input of the zeroth task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ZerothInput {
    /// `{"message": "Let's start"}`
    Start,
    /// `{"answer": n}`
    Solve(i64),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Answer {
    answer: i64,
}

#[derive(Debug, Serialize)]
struct Verdict {
    answer: &'static str,
}

/// Zeroth task executor.
#[derive(Debug)]
pub struct Zeroth {
    state: ZerothState,
    problem: Option<Problem>,
}

impl Default for Zeroth {
    fn default() -> Self {
        Self::new()
    }
}

impl Zeroth {
    /// Create an executor in [`ZerothState::Start`].
    pub fn new() -> Self {
        tracing::debug!(task = %TaskKind::Zeroth, "executor created");
        Self { state: ZerothState::Start, problem: None }
    }

    /// Problem issued on start, if any.
    pub fn problem(&self) -> Option<Problem> {
        self.problem
    }

    fn on_start(&mut self, rng: &mut dyn RngCore, out: &mut Outbox) {
        let problem = Problem::generate(rng);
        self.problem = Some(problem);
        self.state = ZerothState::Solve;
        out.send_message(&problem);
    }

    fn on_solve(&mut self, answer: i64, out: &mut Outbox) {
        let Some(problem) = self.problem else {
            tracing::error!(task = %TaskKind::Zeroth, "solve state without a problem");
            out.violation(vec![ErrorRecord::new("No problem issued")], "missing problem");
            return;
        };

        let solution = problem.solution();
        if answer == solution {
            out.send_message(&Verdict { answer: "Correct!" });
        } else {
            out.violation(
                vec![ErrorRecord::with_detail("Wrong answer", format!("The right one is {solution}"))],
                "wrong answer",
            );
        }
    }
}

impl TaskExecutor for Zeroth {
    type Input = ZerothInput;
    type State = ZerothState;

    fn kind(&self) -> TaskKind {
        TaskKind::Zeroth
    }

    fn state(&self) -> ZerothState {
        self.state
    }

    fn validate(&self, data: Map<String, Value>) -> Result<ZerothInput, Vec<ErrorRecord>> {
        match self.state {
            ZerothState::Start => expect_message(data, START_MESSAGE).map(|()| ZerothInput::Start),
            ZerothState::Solve => parse::<Answer>(data).map(|a| ZerothInput::Solve(a.answer)),
        }
    }

    fn on_message(&mut self, input: ZerothInput, rng: &mut dyn RngCore, out: &mut Outbox) {
        match input {
            ZerothInput::Start => self.on_start(rng, out),
            ZerothInput::Solve(answer) => self.on_solve(answer, out),
        }
    }
}
