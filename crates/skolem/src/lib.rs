#![doc = include_str!("../../../README.md")]

pub mod ast;
mod constraints;
pub mod context;
mod domains;
mod eval;
mod exec;
pub mod flatten;
pub mod generator;
pub mod heap;
pub mod interval;
pub mod limits;
pub mod memory;
pub mod nnf;
pub mod outcome;
mod pos;
mod preprocess;
pub mod solver;
pub mod tracer;
pub mod value;

pub use crate::{
    ast::{
        AssignTarget, BinOp, Block, Body, Contract, Decl, DeclLoc, Expr, ExprLoc, FArg, Guard, Id, IdType,
        IdTypeWhere, LabeledStmt, ParentEdge, Program, QOp, SpecClause, SpecKind, Stmt, StmtLoc, Type, TypeDef, UnOp,
    },
    context::{Context, FSig, NameKind, PSig},
    exec::{TestCases, execute_program, execute_program_det, execute_program_generic},
    generator::{DeterministicGenerator, ExhaustiveGenerator, Generator, RandomGenerator},
    heap::{Heap, HeapId, HeapStats, MapRepr},
    interval::{Endpoint, Interval},
    limits::{LimitKind, Limits},
    memory::{Memory, StoreKind},
    outcome::{Failure, FailureKind, FailureSource, Outcome, StackFrame, Summary, TestCase},
    pos::Pos,
    solver::{NoopBackend, SatBackend, SatResult, Solution, SolverBridge, SolverError},
    tracer::{ExecTracer, NoopTracer, RecordingTracer, StderrTracer, TraceEvent},
    value::{CustomValue, Value},
};
