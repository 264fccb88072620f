//! Test-case classification, failure reports and session summaries.

use std::fmt;

use ahash::AHashSet;
use serde_json::json;

use crate::{
    ast::{ExprLoc, Id, IdType, SpecKind},
    interval::Interval,
    limits::LimitKind,
    memory::{Memory, StoreKind},
    pos::Pos,
};

/// What a failure means for the run that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A genuine error: a violated assertion or a run-time fault.
    Error,
    /// A violated assumption: the branch is infeasible, not wrong.
    Unreachable,
    /// The semantics outran the interpreter.
    Nonexecutable,
}

/// The cause of a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureSource {
    /// A specification clause evaluated to false. `last_term` is the
    /// short-circuit hint recorded by the expression evaluator.
    SpecViolation {
        kind: SpecKind,
        free: bool,
        clause: ExprLoc,
        last_term: Option<ExprLoc>,
    },
    DivisionByZero,
    UnsupportedConstruct(String),
    /// A quantified variable's inferred domain cannot be enumerated.
    InfiniteDomain { var: Id, interval: Interval },
    LimitExceeded(LimitKind),
}

impl FailureSource {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::SpecViolation { free, .. } => {
                if *free {
                    FailureKind::Unreachable
                } else {
                    FailureKind::Error
                }
            }
            Self::DivisionByZero => FailureKind::Error,
            Self::UnsupportedConstruct(_) | Self::InfiniteDomain { .. } | Self::LimitExceeded(_) => {
                FailureKind::Nonexecutable
            }
        }
    }

    /// The word naming the violated clause in reports.
    fn clause_word(kind: SpecKind, free: bool) -> String {
        if kind == SpecKind::Inline && free {
            "Assumption".to_owned()
        } else {
            kind.to_string()
        }
    }
}

/// One frame of a failure's call stack: the call site and the callee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub position: Pos,
    pub callee: Id,
}

/// A failure with the memory snapshot and call stack at the point it fired.
#[derive(Debug, Clone)]
pub struct Failure {
    pub source: FailureSource,
    pub position: Pos,
    pub memory: Memory,
    pub trace: Vec<StackFrame>,
}

impl Failure {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        self.source.kind()
    }

    /// Renders the multiline failure description; with `debug` the live heap
    /// is appended.
    #[must_use]
    pub fn report(&self, debug: bool) -> String {
        let mut out = String::new();
        match &self.source {
            FailureSource::SpecViolation {
                kind,
                free,
                clause,
                last_term,
            } => {
                let word = FailureSource::clause_word(*kind, *free);
                out.push_str(&format!(
                    "{word} \"{clause}\" violated at {pos}",
                    pos = self.position
                ));
                if let Some(term) = last_term {
                    out.push_str(&format!("\n  (last evaluated term: {term})"));
                }
            }
            FailureSource::DivisionByZero => {
                out.push_str(&format!("Division by zero at {pos}", pos = self.position));
            }
            FailureSource::UnsupportedConstruct(what) => {
                out.push_str(&format!("Unsupported construct: {what} at {pos}", pos = self.position));
            }
            FailureSource::InfiniteDomain { var, interval } => {
                out.push_str(&format!(
                    "Cannot enumerate the domain {interval} of {var} at {pos}",
                    pos = self.position
                ));
            }
            FailureSource::LimitExceeded(kind) => {
                out.push_str(&format!("Exceeded the {kind} at {pos}", pos = self.position));
            }
        }
        if !self.trace.is_empty() {
            out.push_str("\n  call stack:");
            for frame in &self.trace {
                out.push_str(&format!(
                    "\n    {callee} called at {pos}",
                    callee = frame.callee,
                    pos = frame.position
                ));
            }
        }
        if debug {
            out.push_str(&format!("\n  heap: {stats}", stats = self.memory.heap.stats()));
            for id in self.memory.heap.live_ids() {
                out.push_str(&format!(
                    "\n    map@{id} = {value}",
                    value = self.memory.show_value(&crate::value::Value::Ref(id))
                ));
            }
        }
        out
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{report}", report = self.report(false))
    }
}

/// Outcome of a single test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Outcome {
    #[strum(serialize = "passed")]
    Passed,
    #[strum(serialize = "invalid")]
    Invalid,
    #[strum(serialize = "non-executable")]
    Nonexecutable,
    #[strum(serialize = "failed")]
    Failed,
}

/// One terminal state of a run: the procedure signature, the final memory
/// snapshot, and the failure if any.
#[derive(Debug, Clone)]
pub struct TestCase {
    pub procedure: Id,
    pub in_params: Vec<IdType>,
    pub out_params: Vec<IdType>,
    pub memory: Memory,
    pub failure: Option<Failure>,
}

impl TestCase {
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        match &self.failure {
            None => Outcome::Passed,
            Some(failure) => match failure.kind() {
                FailureKind::Error => Outcome::Failed,
                FailureKind::Unreachable => Outcome::Invalid,
                FailureKind::Nonexecutable => Outcome::Nonexecutable,
            },
        }
    }

    /// Materialized input arguments, in signature order.
    #[must_use]
    pub fn inputs(&self) -> Vec<(Id, String)> {
        self.in_params
            .iter()
            .filter_map(|param| {
                self.memory
                    .get(StoreKind::Local, &param.name)
                    .map(|value| (param.name.clone(), self.memory.show_value(value)))
            })
            .collect()
    }

    /// Materialized global inputs (the old store of the entry procedure).
    #[must_use]
    pub fn global_inputs(&self) -> Vec<(Id, String)> {
        self.memory
            .old_globals
            .iter()
            .map(|(name, value)| (name.clone(), self.memory.show_value(value)))
            .collect()
    }

    /// Reads an output or local of the finished run.
    #[must_use]
    pub fn local(&self, name: &str) -> Option<&crate::value::Value> {
        self.memory.get(StoreKind::Local, name)
    }

    /// Renders the full report; with `debug`, failure reports include the heap.
    #[must_use]
    pub fn report(&self, debug: bool) -> String {
        let inputs: Vec<String> = self
            .inputs()
            .into_iter()
            .map(|(name, value)| format!("{name} = {value}"))
            .collect();
        let mut out = format!("{proc}({inputs})", proc = self.procedure, inputs = inputs.join(", "));
        let globals: Vec<String> = self
            .global_inputs()
            .into_iter()
            .map(|(name, value)| format!("{name} = {value}"))
            .collect();
        if !globals.is_empty() {
            out.push_str(&format!(" ({globals})", globals = globals.join(", ")));
        }
        out.push_str(&format!(" {outcome}", outcome = self.outcome()));
        if let Some(failure) = &self.failure {
            for line in failure.report(debug).lines() {
                out.push_str("\n  ");
                out.push_str(line);
            }
        }
        out
    }

    /// Machine-readable report.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let inputs: serde_json::Map<String, serde_json::Value> = self
            .inputs()
            .into_iter()
            .map(|(name, value)| (name, json!(value)))
            .collect();
        let globals: serde_json::Map<String, serde_json::Value> = self
            .global_inputs()
            .into_iter()
            .map(|(name, value)| (name, json!(value)))
            .collect();
        json!({
            "procedure": self.procedure,
            "inputs": inputs,
            "global_inputs": globals,
            "outcome": self.outcome().to_string(),
            "failure": self.failure.as_ref().map(|f| json!({
                "description": f.report(false),
                "line": f.position.line,
                "column": f.position.column,
            })),
        })
    }
}

impl fmt::Display for TestCase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{report}", report = self.report(false))
    }
}

/// Aggregated results of a session. Failures are unique up to procedure and
/// failure position.
#[derive(Debug, Clone, Default)]
pub struct Summary {
    pub passed: usize,
    pub invalid: usize,
    pub nonexecutable: usize,
    pub failed: usize,
    unique_failures: AHashSet<(Id, Pos)>,
}

impl Summary {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, case: &TestCase) {
        match case.outcome() {
            Outcome::Passed => self.passed += 1,
            Outcome::Invalid => self.invalid += 1,
            Outcome::Nonexecutable => self.nonexecutable += 1,
            Outcome::Failed => {
                self.failed += 1;
                if let Some(failure) = &case.failure {
                    self.unique_failures.insert((case.procedure.clone(), failure.position));
                }
            }
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.passed + self.invalid + self.nonexecutable + self.failed
    }

    #[must_use]
    pub fn unique_failures(&self) -> usize {
        self.unique_failures.len()
    }

    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "total": self.total(),
            "passed": self.passed,
            "invalid": self.invalid,
            "non_executable": self.nonexecutable,
            "failed": self.failed,
            "unique_failures": self.unique_failures(),
        })
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{total} test cases: {passed} passed, {invalid} invalid, {nonexec} non-executable, {failed} failed ({unique} unique)",
            total = self.total(),
            passed = self.passed,
            invalid = self.invalid,
            nonexec = self.nonexecutable,
            failed = self.failed,
            unique = self.unique_failures()
        )
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{ast::Type, value::Value};

    fn passed_case() -> TestCase {
        let mut memory = Memory::new();
        memory.set(StoreKind::Local, "n", Value::int(5));
        TestCase {
            procedure: "P".to_owned(),
            in_params: vec![IdType::new("n", Type::Int)],
            out_params: vec![],
            memory,
            failure: None,
        }
    }

    fn failed_case(position: Pos) -> TestCase {
        let memory = Memory::new();
        let failure = Failure {
            source: FailureSource::SpecViolation {
                kind: SpecKind::Inline,
                free: false,
                clause: ExprLoc::int_lit(1).eq(ExprLoc::int_lit(2)),
                last_term: None,
            },
            position,
            memory: Memory::new(),
            trace: vec![],
        };
        TestCase {
            procedure: "P".to_owned(),
            in_params: vec![],
            out_params: vec![],
            memory,
            failure: Some(failure),
        }
    }

    #[test]
    fn report_words_match_outcomes() {
        assert_eq!(passed_case().to_string(), "P(n = 5) passed");
        let failed = failed_case(Pos::new(1, 1));
        assert_eq!(failed.outcome(), Outcome::Failed);
        assert_eq!(
            failed.to_string(),
            "P() failed\n  Assertion \"1 == 2\" violated at 1:1"
        );
    }

    #[test]
    fn assumption_failures_are_invalid() {
        let failure = Failure {
            source: FailureSource::SpecViolation {
                kind: SpecKind::Inline,
                free: true,
                clause: ExprLoc::bool_lit(false),
                last_term: None,
            },
            position: Pos::NONE,
            memory: Memory::new(),
            trace: vec![],
        };
        assert_eq!(failure.kind(), FailureKind::Unreachable);
    }

    #[test]
    fn summary_counts_unique_failures_by_procedure_and_position() {
        let mut summary = Summary::new();
        summary.add(&passed_case());
        summary.add(&failed_case(Pos::new(1, 1)));
        summary.add(&failed_case(Pos::new(1, 1)));
        summary.add(&failed_case(Pos::new(2, 1)));
        assert_eq!(summary.total(), 4);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.unique_failures(), 2);
        assert_eq!(
            summary.to_string(),
            "4 test cases: 1 passed, 0 invalid, 0 non-executable, 3 failed (2 unique)"
        );
    }

    #[test]
    fn stack_trace_appears_in_reports() {
        let mut case = failed_case(Pos::new(3, 5));
        case.failure.as_mut().expect("failure present").trace.push(StackFrame {
            position: Pos::new(10, 3),
            callee: "Q".to_owned(),
        });
        let report = case.report(false);
        assert!(report.contains("call stack:"));
        assert!(report.contains("Q called at 10:3"));
    }
}
