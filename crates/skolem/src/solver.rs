//! Bridge to an external satisfiability solver.
//!
//! The concrete solver binding is an opaque collaborator behind the
//! [`SatBackend`] trait; this module owns the push/pop discipline. The bridge
//! pops its stack down to the caller's frame count before pushing new
//! constraints; finding *fewer* frames than the caller expects is a usage bug
//! and fails loudly. [`NoopBackend`] is the default collaborator for purely
//! concrete execution: it answers `Unknown` and never prunes anything.

use std::fmt;

use indexmap::IndexMap;

use crate::{
    ast::{ExprLoc, Id},
    value::Value,
};

/// Verdict of a satisfiability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatResult {
    Sat,
    Unsat,
    Unknown,
}

/// A model: an assignment of values to the names the solver decided.
pub type Solution = IndexMap<Id, Value>;

/// The opaque solver collaborator.
///
/// Implementations decide satisfiability of the asserted constraints and
/// produce models; `minimize` may shrink a model toward smaller values and
/// defaults to the identity.
pub trait SatBackend {
    fn push(&mut self);
    fn pop(&mut self);
    fn assert(&mut self, constraint: &ExprLoc);
    fn check(&mut self) -> SatResult;
    fn model(&mut self) -> Option<Solution>;
    /// Excludes a produced model from future checks.
    fn block(&mut self, solution: &Solution);
    fn minimize(&mut self, solution: Solution) -> Solution {
        solution
    }
}

/// Errors of the bridge discipline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolverError {
    /// The backend holds fewer frames than the caller believes are in scope.
    FrameUnderflow { bridge: usize, caller: usize },
}

impl fmt::Display for SolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameUnderflow { bridge, caller } => write!(
                f,
                "solver bridge holds {bridge} frames but the caller expects {caller}"
            ),
        }
    }
}

impl std::error::Error for SolverError {}

/// Owns a backend and keeps its backtracking stack aligned with the
/// interpreter's notion of assertion levels.
#[derive(Debug, Clone)]
pub struct SolverBridge<B> {
    backend: B,
    depth: usize,
}

impl<B: SatBackend> SolverBridge<B> {
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self { backend, depth: 0 }
    }

    /// Current number of frames held by the bridge.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Pops down to exactly `frames` frames.
    pub fn pop_to(&mut self, frames: usize) -> Result<(), SolverError> {
        if self.depth < frames {
            return Err(SolverError::FrameUnderflow {
                bridge: self.depth,
                caller: frames,
            });
        }
        while self.depth > frames {
            self.backend.pop();
            self.depth -= 1;
        }
        Ok(())
    }

    fn enter(&mut self, constraints: &[ExprLoc], frames: usize) -> Result<(), SolverError> {
        self.pop_to(frames)?;
        self.backend.push();
        self.depth += 1;
        for constraint in constraints {
            self.backend.assert(constraint);
        }
        Ok(())
    }

    /// Reports satisfiability of `constraints` on top of the caller's
    /// `frames` levels.
    pub fn check(&mut self, constraints: &[ExprLoc], frames: usize) -> Result<SatResult, SolverError> {
        self.enter(constraints, frames)?;
        Ok(self.backend.check())
    }

    /// Enumerates up to `max` solutions (all of them when `None`), blocking
    /// each produced model before asking for the next.
    pub fn solutions(
        &mut self,
        constraints: &[ExprLoc],
        frames: usize,
        max: Option<usize>,
    ) -> Result<Vec<Solution>, SolverError> {
        self.enter(constraints, frames)?;
        let mut out = Vec::new();
        while max.is_none_or(|m| out.len() < m) {
            if self.backend.check() != SatResult::Sat {
                break;
            }
            let Some(model) = self.backend.model() else {
                break;
            };
            let model = self.backend.minimize(model);
            self.backend.block(&model);
            out.push(model);
        }
        Ok(out)
    }
}

/// Backend for purely concrete execution: every check is `Unknown`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackend;

impl SatBackend for NoopBackend {
    fn push(&mut self) {}

    fn pop(&mut self) {}

    fn assert(&mut self, _constraint: &ExprLoc) {}

    fn check(&mut self) -> SatResult {
        SatResult::Unknown
    }

    fn model(&mut self) -> Option<Solution> {
        None
    }

    fn block(&mut self, _solution: &Solution) {}
}
