//! Execution tracing infrastructure.
//!
//! A trait-based hook system for the interpreter with zero-cost abstraction:
//! the engine is parameterized over the tracer type, so with [`NoopTracer`]
//! every hook compiles away. [`StderrTracer`] prints a human-readable
//! execution log; [`RecordingTracer`] captures events for post-mortem
//! inspection in tests.

use crate::{ast::SpecKind, pos::Pos};

/// One recorded execution event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// A basic block was entered.
    Block { procedure: String, label: String },
    /// A procedure call pushed a frame.
    Call { callee: String, depth: usize },
    /// A procedure call popped its frame.
    Return { callee: String, depth: usize },
    /// A specification clause was evaluated.
    Clause { kind: SpecKind, free: bool, holds: bool },
    /// The generator was consulted.
    Draw { what: &'static str },
    /// Garbage collection freed `freed` heap entries.
    Gc { freed: usize },
}

/// Hook points at key execution events.
pub trait ExecTracer {
    fn on_block(&mut self, _procedure: &str, _label: &str) {}
    fn on_statement(&mut self, _position: Pos) {}
    fn on_call(&mut self, _callee: &str, _depth: usize) {}
    fn on_return(&mut self, _callee: &str, _depth: usize) {}
    fn on_clause(&mut self, _kind: SpecKind, _free: bool, _holds: bool) {}
    fn on_draw(&mut self, _what: &'static str) {}
    fn on_gc(&mut self, _freed: usize) {}
}

/// Zero-cost no-op tracer; the production default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl ExecTracer for NoopTracer {}

/// Logs execution events to stderr.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrTracer;

impl ExecTracer for StderrTracer {
    fn on_block(&mut self, procedure: &str, label: &str) {
        eprintln!("[trace] {procedure}: block {label}");
    }

    fn on_call(&mut self, callee: &str, depth: usize) {
        eprintln!("[trace] {pad}call {callee}", pad = "  ".repeat(depth));
    }

    fn on_return(&mut self, callee: &str, depth: usize) {
        eprintln!("[trace] {pad}return from {callee}", pad = "  ".repeat(depth));
    }

    fn on_clause(&mut self, kind: SpecKind, free: bool, holds: bool) {
        let flavor = if free { "assume" } else { "assert" };
        eprintln!("[trace] {flavor} ({kind}) -> {holds}");
    }

    fn on_draw(&mut self, what: &'static str) {
        eprintln!("[trace] draw {what}");
    }

    fn on_gc(&mut self, freed: usize) {
        if freed > 0 {
            eprintln!("[trace] gc freed {freed}");
        }
    }
}

/// Records every event for later inspection.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    pub events: Vec<TraceEvent>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ExecTracer for RecordingTracer {
    fn on_block(&mut self, procedure: &str, label: &str) {
        self.events.push(TraceEvent::Block {
            procedure: procedure.to_owned(),
            label: label.to_owned(),
        });
    }

    fn on_call(&mut self, callee: &str, depth: usize) {
        self.events.push(TraceEvent::Call {
            callee: callee.to_owned(),
            depth,
        });
    }

    fn on_return(&mut self, callee: &str, depth: usize) {
        self.events.push(TraceEvent::Return {
            callee: callee.to_owned(),
            depth,
        });
    }

    fn on_clause(&mut self, kind: SpecKind, free: bool, holds: bool) {
        self.events.push(TraceEvent::Clause { kind, free, holds });
    }

    fn on_draw(&mut self, what: &'static str) {
        self.events.push(TraceEvent::Draw { what });
    }

    fn on_gc(&mut self, freed: usize) {
        self.events.push(TraceEvent::Gc { freed });
    }
}
