//! Statement execution, procedure calls, and the public entry points.
//!
//! Blocks dispatch through `goto` terminators: a multi-target `goto` draws
//! the target from the generator. With an enumerating generator the draw is
//! a branch point and an unreachable arm surfaces as its own `invalid` test
//! case; with a single-path generator the dispatcher snapshots the branch
//! state and retries the remaining targets in order. Garbage collection runs
//! after every basic statement.

use ahash::AHashMap;
use indexmap::IndexMap;

use crate::{
    ast::{ExprLoc, Id, IdType, Program, SpecClause, SpecKind, Stmt, StmtLoc},
    constraints::{Constraint, ConstraintStore},
    context::{Context, NameKind, PSig},
    eval::{ExecResult, Interp, RunError},
    flatten::{BlockMap, START_LABEL},
    generator::{DeterministicGenerator, ExhaustiveGenerator, Generator},
    limits::Limits,
    memory::{Memory, Store, StoreKind},
    outcome::{Failure, FailureSource, StackFrame, TestCase},
    pos::Pos,
    preprocess::{Prepared, ProcImpl, preprocess},
    solver::{NoopBackend, SatBackend, SolverBridge},
    tracer::{ExecTracer, NoopTracer},
    value::Value,
};

/// Branch state saved before trying a `goto` alternative that may turn out
/// unreachable.
struct BranchSnapshot {
    mem: Memory,
    store: ConstraintStore,
    ctx: Context,
    assumed: Vec<Vec<ExprLoc>>,
    next_code: u64,
}

impl<G: Generator, Tr: ExecTracer, B: SatBackend> Interp<'_, G, Tr, B> {
    fn snapshot(&self) -> BranchSnapshot {
        BranchSnapshot {
            mem: self.mem.clone(),
            store: self.store.clone(),
            ctx: self.ctx.clone(),
            assumed: self.assumed.clone(),
            next_code: self.next_code,
        }
    }

    fn restore(&mut self, snapshot: BranchSnapshot) {
        self.mem = snapshot.mem;
        self.store = snapshot.store;
        self.ctx = snapshot.ctx;
        self.assumed = snapshot.assumed;
        self.next_code = snapshot.next_code;
    }

    fn collect_garbage(&mut self) {
        let freed = self.mem.heap.collect_garbage();
        for id in &freed {
            self.store.drop_ref(*id);
        }
        self.tracer.on_gc(freed.len());
    }

    // =========================================================================
    // Basic statements
    // =========================================================================

    fn exec_basic(&mut self, stmt: &StmtLoc) -> ExecResult<()> {
        self.tracer.on_statement(stmt.position);
        self.steps += 1;
        if let Some(kind) = self.limits.exceeded(self.steps, self.depth) {
            return Err(self.fail(FailureSource::LimitExceeded(kind), stmt.position));
        }
        match &stmt.stmt {
            Stmt::Predicate(clause) => self.check_clause(clause),
            Stmt::Havoc(names) => {
                for name in names {
                    self.havoc_name(name, stmt.position)?;
                }
                Ok(())
            }
            Stmt::Assign { targets, rhss } => {
                // nested map assignments desugar to update chains
                let effective: Vec<(Id, ExprLoc)> = targets
                    .iter()
                    .zip(rhss)
                    .map(|(target, rhs)| {
                        let base = ExprLoc::var(target.name.clone()).at(stmt.position);
                        (target.name.clone(), nest_updates(base, &target.indexes, rhs.clone()))
                    })
                    .collect();
                let mut values = Vec::with_capacity(effective.len());
                for (_, rhs) in &effective {
                    values.push(self.eval(rhs)?);
                }
                for ((name, _), value) in effective.iter().zip(values) {
                    self.assign_name(name, value, stmt.position)?;
                }
                Ok(())
            }
            Stmt::Call { lhss, callee, args } => self.exec_call(lhss, callee, args, stmt.position),
            Stmt::Skip => Ok(()),
            other => panic!("control statement {other:?} survived flattening"),
        }
    }

    fn havoc_name(&mut self, name: &str, position: Pos) -> ExecResult<()> {
        match self.ctx.resolve_name(name).map(|(kind, _)| kind) {
            Some(NameKind::Local) => {
                self.mem.unset(StoreKind::Local, name);
                Ok(())
            }
            Some(NameKind::Global) => {
                self.mem.unset(StoreKind::Global, name);
                self.mem.mark_modified(name);
                Ok(())
            }
            Some(NameKind::Constant | NameKind::Function) => {
                Err(self.fail(
                    FailureSource::UnsupportedConstruct(format!("havoc of constant {name}")),
                    position,
                ))
            }
            None => Err(self.fail(
                FailureSource::UnsupportedConstruct(format!("havoc of undeclared name {name}")),
                position,
            )),
        }
    }

    fn assign_name(&mut self, name: &str, value: Value, position: Pos) -> ExecResult<()> {
        match self.ctx.resolve_name(name).map(|(kind, _)| kind) {
            Some(NameKind::Local) => {
                self.mem.set(StoreKind::Local, name, value);
                Ok(())
            }
            Some(NameKind::Global) => {
                self.mem.set(StoreKind::Global, name, value);
                self.mem.mark_modified(name);
                Ok(())
            }
            _ => Err(self.fail(
                FailureSource::UnsupportedConstruct(format!("assignment to {name}")),
                position,
            )),
        }
    }

    // =========================================================================
    // Block dispatch
    // =========================================================================

    fn exec_blocks(&mut self, procedure: &str, blocks: &BlockMap) -> ExecResult<Pos> {
        self.exec_from(procedure, blocks, START_LABEL)
    }

    fn exec_from(&mut self, procedure: &str, blocks: &BlockMap, label: &str) -> ExecResult<Pos> {
        let mut label = label.to_owned();
        loop {
            self.tracer.on_block(procedure, &label);
            let block = blocks.get(&label).expect("flattening checks jump targets");
            let (terminator, stmts) = block.split_last().expect("blocks are non-empty");
            for stmt in stmts {
                self.exec_basic(stmt)?;
                self.collect_garbage();
            }
            match &terminator.stmt {
                Stmt::Return => return Ok(terminator.position),
                Stmt::Goto(targets) if targets.len() == 1 => {
                    label.clone_from(&targets[0]);
                }
                Stmt::Goto(targets) => return self.exec_goto(procedure, blocks, targets),
                other => panic!("basic block ends in {other:?}"),
            }
        }
    }

    /// Dispatches a multi-target `goto`. An empty target list is a dead end
    /// and propagates as unreachable.
    fn exec_goto(&mut self, procedure: &str, blocks: &BlockMap, targets: &[Id]) -> ExecResult<Pos> {
        if targets.is_empty() {
            return Err(self.fail(
                FailureSource::SpecViolation {
                    kind: SpecKind::Inline,
                    free: true,
                    clause: ExprLoc::bool_lit(false),
                    last_term: None,
                },
                Pos::NONE,
            ));
        }
        self.tracer.on_draw("goto");
        let first = self.generator.gen_index(targets.len());
        if self.generator.explores_all() {
            // the draw is the branch point; a dead arm is a terminal state
            return self.exec_from(procedure, blocks, &targets[first]);
        }
        for offset in 0..targets.len() {
            let target = &targets[(first + offset) % targets.len()];
            if offset + 1 == targets.len() {
                return self.exec_from(procedure, blocks, target);
            }
            let snapshot = self.snapshot();
            match self.exec_from(procedure, blocks, target) {
                Err(error) if error.is_unreachable() => self.restore(snapshot),
                other => return other,
            }
        }
        unreachable!("the last target either returns or propagates")
    }

    // =========================================================================
    // Procedure calls
    // =========================================================================

    fn exec_call(&mut self, lhss: &[Id], callee: &str, args: &[ExprLoc], position: Pos) -> ExecResult<()> {
        let Some(sig) = self.ctx.procedures.get(callee).cloned() else {
            return Err(self.fail(
                FailureSource::UnsupportedConstruct(format!("call of undeclared procedure {callee}")),
                position,
            ));
        };
        let mut arg_values = Vec::with_capacity(args.len());
        for arg in args {
            arg_values.push(self.eval(arg)?);
        }
        let outs = match self.call_procedure(callee, &sig, arg_values, position) {
            Ok(outs) => outs,
            Err(RunError::Fail(mut failure)) => {
                failure.trace.push(StackFrame {
                    position,
                    callee: callee.to_owned(),
                });
                return Err(RunError::Fail(failure));
            }
            Err(other) => return Err(other),
        };
        for (lhs, value) in lhss.iter().zip(outs) {
            self.assign_name(lhs, value, position)?;
        }
        Ok(())
    }

    /// Runs a procedure in a fresh frame and returns its output values.
    fn call_procedure(
        &mut self,
        callee: &str,
        sig: &PSig,
        arg_values: Vec<Value>,
        position: Pos,
    ) -> ExecResult<Vec<Value>> {
        self.depth += 1;
        self.tracer.on_call(callee, self.depth);
        self.assumed.push(Vec::new());

        let saved_locals = self.mem.swap_locals(Store::new());
        let saved_ctx_locals = self.ctx.swap_locals(IndexMap::new());
        let saved_store_locals = self.store.swap_locals(AHashMap::new());
        let (saved_old, saved_modified) = self.mem.save_old();

        let result = self.call_frame(callee, sig, arg_values, position);

        let callee_locals = self.mem.swap_locals(saved_locals);
        self.mem.drop_frame(callee_locals);
        self.ctx.swap_locals(saved_ctx_locals);
        self.store.swap_locals(saved_store_locals);
        self.mem.restore_old(saved_old, saved_modified);
        self.assumed.pop();
        self.tracer.on_return(callee, self.depth);
        self.depth -= 1;
        result
    }

    fn call_frame(&mut self, callee: &str, sig: &PSig, arg_values: Vec<Value>, position: Pos) -> ExecResult<Vec<Value>> {
        let prepared = self.prepared;
        let imp = match prepared.implementations.get(callee) {
            None => None,
            Some(imps) if imps.is_empty() => None,
            Some(imps) if imps.len() == 1 => Some(&imps[0]),
            Some(imps) => {
                self.tracer.on_draw("implementation");
                Some(&imps[self.generator.gen_index(imps.len())])
            }
        };

        match imp {
            Some(imp) => {
                for (param, value) in imp.ins.iter().zip(arg_values) {
                    self.ctx.set_local(param.name.clone(), param.typ.clone());
                    self.mem.set(StoreKind::Local, param.name.clone(), value);
                }
                for param in &imp.outs {
                    self.ctx.set_local(param.name.clone(), param.typ.clone());
                }
                for local in &imp.locals {
                    self.ctx.set_local(local.name.clone(), local.typ.clone());
                }
                self.install_local_wheres(imp);

                for (free, expr) in &imp.requires {
                    self.check_clause(&SpecClause::new(SpecKind::Precondition, *free, expr.clone()))?;
                }
                self.exec_blocks(callee, &imp.blocks)?;
                for (free, expr) in &imp.ensures {
                    self.check_clause(&SpecClause::new(SpecKind::Postcondition, *free, expr.clone()))?;
                }

                let mut outs = Vec::with_capacity(imp.outs.len());
                for param in &imp.outs {
                    outs.push(self.lookup_name(&param.name, position)?);
                }
                Ok(outs)
            }
            None => {
                // no implementation: check preconditions, havoc the frame
                // condition, and trust the contract
                for (param, value) in sig.ins.iter().zip(arg_values) {
                    self.ctx.set_local(param.name.clone(), param.typ.clone());
                    self.mem.set(StoreKind::Local, param.name.clone(), value);
                    if let Some(clause) = &param.where_clause {
                        self.store.add_local_constraint(
                            param.name.clone(),
                            Constraint::closed(clause.clone(), SpecKind::Where, position),
                        );
                    }
                }
                for param in &sig.outs {
                    self.ctx.set_local(param.name.clone(), param.typ.clone());
                    if let Some(clause) = &param.where_clause {
                        self.store.add_local_constraint(
                            param.name.clone(),
                            Constraint::closed(clause.clone(), SpecKind::Where, position),
                        );
                    }
                }
                for (free, expr) in sig.requires() {
                    self.check_clause(&SpecClause::new(SpecKind::Precondition, free, expr.clone()))?;
                }
                for name in sig.modifies() {
                    self.havoc_name(&name, position)?;
                }
                for (_, expr) in sig.ensures() {
                    self.assume_constraint(expr, SpecKind::Postcondition)?;
                }
                let mut outs = Vec::with_capacity(sig.outs.len());
                for param in &sig.outs {
                    outs.push(self.lookup_name(&param.name, position)?);
                }
                Ok(outs)
            }
        }
    }

    fn install_local_wheres(&mut self, imp: &ProcImpl) {
        for (name, clause) in &imp.param_wheres {
            self.store
                .add_local_constraint(name.clone(), Constraint::closed(clause.clone(), SpecKind::Where, imp.position));
        }
        for local in &imp.locals {
            if let Some(clause) = &local.where_clause {
                self.store.add_local_constraint(
                    local.name.clone(),
                    Constraint::closed(clause.clone(), SpecKind::Where, imp.position),
                );
            }
        }
    }

    // =========================================================================
    // Entry
    // =========================================================================

    /// Runs the entry procedure in the root frame. Entry preconditions are
    /// assumptions: inputs that violate them make the case invalid rather
    /// than failed.
    pub(crate) fn exec_entry(&mut self, entry: &str) -> ExecResult<()> {
        let Some(sig) = self.ctx.procedures.get(entry).cloned() else {
            return Err(self.fail(
                FailureSource::UnsupportedConstruct(format!("no procedure named {entry}")),
                Pos::NONE,
            ));
        };
        self.assumed.push(Vec::new());
        let prepared = self.prepared;
        let imp = match prepared.implementations.get(entry) {
            None => None,
            Some(imps) if imps.is_empty() => None,
            Some(imps) if imps.len() == 1 => Some(&imps[0]),
            Some(imps) => {
                self.tracer.on_draw("implementation");
                Some(&imps[self.generator.gen_index(imps.len())])
            }
        };
        match imp {
            Some(imp) => {
                for param in imp.ins.iter().chain(&imp.outs) {
                    self.ctx.set_local(param.name.clone(), param.typ.clone());
                }
                for local in &imp.locals {
                    self.ctx.set_local(local.name.clone(), local.typ.clone());
                }
                self.install_local_wheres(imp);
                for (_, expr) in &imp.requires {
                    self.assume_constraint(expr, SpecKind::Precondition)?;
                }
                self.exec_blocks(entry, &imp.blocks)?;
                for (free, expr) in &imp.ensures {
                    self.check_clause(&SpecClause::new(SpecKind::Postcondition, *free, expr.clone()))?;
                }
                Ok(())
            }
            None => {
                for param in sig.ins.iter().chain(&sig.outs) {
                    self.ctx.set_local(param.name.clone(), param.typ.clone());
                    if let Some(clause) = &param.where_clause {
                        self.store.add_local_constraint(
                            param.name.clone(),
                            Constraint::closed(clause.clone(), SpecKind::Where, Pos::NONE),
                        );
                    }
                }
                for (_, expr) in sig.requires() {
                    self.assume_constraint(expr, SpecKind::Precondition)?;
                }
                for (_, expr) in sig.ensures() {
                    self.assume_constraint(expr, SpecKind::Postcondition)?;
                }
                Ok(())
            }
        }
    }
}

/// Builds the nested `MapUpdate` chain for an indexed assignment target.
fn nest_updates(base: ExprLoc, indexes: &[Vec<ExprLoc>], rhs: ExprLoc) -> ExprLoc {
    match indexes.split_first() {
        None => rhs,
        Some((first, rest)) => {
            let inner_base = base.clone().select(first.clone());
            let inner = nest_updates(inner_base, rest, rhs);
            base.update(first.clone(), inner)
        }
    }
}

/// Runs one test case against a prepared program.
fn run_case<G: Generator, Tr: ExecTracer, B: SatBackend>(
    prepared: &Prepared,
    generator: &mut G,
    tracer: &mut Tr,
    solver: Option<&mut SolverBridge<B>>,
    limits: Limits,
    qbound: Option<usize>,
    entry: &str,
) -> TestCase {
    let mut interp = Interp {
        prepared,
        ctx: prepared.context.clone(),
        mem: Memory::new(),
        store: prepared.store.clone(),
        generator,
        tracer,
        solver,
        limits,
        qbound,
        last_term: None,
        next_code: 0,
        steps: 0,
        depth: 0,
        assumed: Vec::new(),
    };
    let result = interp.exec_entry(entry);
    let failure = match result {
        Ok(()) => None,
        Err(RunError::Fail(failure)) => Some(*failure),
        Err(RunError::Cycle(_)) => Some(Failure {
            source: FailureSource::UnsupportedConstruct("unresolved definition cycle".to_owned()),
            position: Pos::NONE,
            memory: interp.mem.clone(),
            trace: Vec::new(),
        }),
    };
    let (in_params, out_params) = signature_of(prepared, entry);
    TestCase {
        procedure: entry.to_owned(),
        in_params,
        out_params,
        memory: interp.mem,
        failure,
    }
}

/// Parameter names of the entry as the test case reports them: the first
/// implementation's when present (implementations may rename), otherwise the
/// declared signature's.
fn signature_of(prepared: &Prepared, entry: &str) -> (Vec<IdType>, Vec<IdType>) {
    if let Some(imps) = prepared.implementations.get(entry)
        && let Some(imp) = imps.first()
    {
        return (imp.ins.clone(), imp.outs.clone());
    }
    match prepared.context.procedures.get(entry) {
        Some(sig) => (
            sig.ins.iter().map(crate::ast::IdTypeWhere::id_type).collect(),
            sig.outs.iter().map(crate::ast::IdTypeWhere::id_type).collect(),
        ),
        None => (Vec::new(), Vec::new()),
    }
}

/// State of the lazy test-case iterator.
enum IterState {
    Fresh,
    Running,
    Done,
}

/// Lazy stream of test cases; branches are explored depth-first, so the
/// order is reproducible.
pub struct TestCases<G: Generator> {
    prepared: Prepared,
    entry: Id,
    qbound: Option<usize>,
    limits: Limits,
    generator: G,
    state: IterState,
}

impl<G: Generator> TestCases<G> {
    /// Bounds execution; unreached by default.
    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Produces the next test case with explicit collaborators: a tracer and
    /// an optional solver bridge. The `Iterator` implementation passes the
    /// no-op versions.
    pub fn next_case<Tr: ExecTracer, B: SatBackend>(
        &mut self,
        tracer: &mut Tr,
        mut solver: Option<&mut SolverBridge<B>>,
    ) -> Option<TestCase> {
        match self.state {
            IterState::Done => return None,
            IterState::Fresh => self.state = IterState::Running,
            IterState::Running => {
                if !self.generator.next_path() {
                    self.state = IterState::Done;
                    return None;
                }
            }
        }
        if let Some(bridge) = solver.as_deref_mut() {
            bridge.pop_to(0).expect("solver bridge out of sync at run start");
        }
        Some(run_case(
            &self.prepared,
            &mut self.generator,
            tracer,
            solver,
            self.limits,
            self.qbound,
            &self.entry,
        ))
    }
}

impl<G: Generator> Iterator for TestCases<G> {
    type Item = TestCase;

    fn next(&mut self) -> Option<TestCase> {
        self.next_case::<NoopTracer, NoopBackend>(&mut NoopTracer, None)
    }
}

/// Executes `entry` with the given generator, returning the lazy test-case
/// stream.
pub fn execute_program_generic<G: Generator>(
    program: &Program,
    context: &Context,
    generator: G,
    qbound: Option<usize>,
    entry: &str,
) -> TestCases<G> {
    TestCases {
        prepared: preprocess(program, context.clone()),
        entry: entry.to_owned(),
        qbound,
        limits: Limits::none(),
        generator,
        state: IterState::Fresh,
    }
}

/// Executes `entry` exhaustively, enumerating every generator choice
/// depth-first.
pub fn execute_program(
    program: &Program,
    context: &Context,
    qbound: Option<usize>,
    entry: &str,
) -> TestCases<ExhaustiveGenerator> {
    execute_program_generic(program, context, ExhaustiveGenerator::default(), qbound, entry)
}

/// Executes `entry` deterministically: default values fill every unspecified
/// choice, yielding exactly one test case.
pub fn execute_program_det(program: &Program, context: &Context, qbound: Option<usize>, entry: &str) -> TestCase {
    execute_program_generic(program, context, DeterministicGenerator, qbound, entry)
        .next()
        .expect("a deterministic run yields exactly one test case")
}
