//! The expression evaluator.
//!
//! Evaluation is lazy: the first read of a variable or map index consults
//! definitions from the constraint store, falls back to drawing a value from
//! the generator, and then assumes the entity's constraints and where-clauses.
//! Failures travel as `Err`; the internal cycle signal of the
//! under-construction protocol is caught by `apply_definitions` and never
//! escapes the crate.

use ahash::AHashSet;
use num_bigint::BigInt;
use num_traits::Zero;

use crate::{
    ast::{BinOp, Expr, ExprLoc, Id, IdType, QOp, SpecClause, SpecKind, Type, UnOp},
    constraints::{Constraint, ConstraintStore, Definition},
    context::Context,
    domains,
    generator::Generator,
    heap::HeapId,
    limits::Limits,
    memory::{Memory, StoreKind},
    nnf,
    outcome::{Failure, FailureKind, FailureSource},
    pos::Pos,
    preprocess::Prepared,
    solver::{SatBackend, SatResult, SolverBridge},
    tracer::ExecTracer,
    value::{CustomValue, Value, euclidean_div_rem},
};

/// Type name of the synthesized values used to keep two distinguished map
/// sources permanently apart. Not expressible in source programs.
const DISTINCT_TYPE: &str = "%distinct";

/// The failure channel of one execution branch.
#[derive(Debug)]
pub(crate) enum RunError {
    /// A user-visible failure; classified by [`FailureKind`].
    Fail(Box<Failure>),
    /// Internal cycle signal of the under-construction protocol, carrying
    /// the sentinel code that was read. Caught by `apply_definitions`.
    Cycle(u64),
}

impl RunError {
    pub(crate) fn is_unreachable(&self) -> bool {
        matches!(self, Self::Fail(failure) if failure.kind() == FailureKind::Unreachable)
    }
}

pub(crate) type ExecResult<T> = Result<T, RunError>;

/// One execution branch: evaluator state plus its collaborators.
pub(crate) struct Interp<'a, G: Generator, Tr: ExecTracer, B: SatBackend> {
    pub prepared: &'a Prepared,
    pub ctx: Context,
    pub mem: Memory,
    pub store: ConstraintStore,
    pub generator: &'a mut G,
    pub tracer: &'a mut Tr,
    pub solver: Option<&'a mut SolverBridge<B>>,
    pub limits: Limits,
    pub qbound: Option<usize>,
    /// Short-circuit hint: the subexpression whose value forced the last
    /// logical connective.
    pub last_term: Option<ExprLoc>,
    /// Fresh codes for under-construction sentinels.
    pub next_code: u64,
    pub steps: u64,
    /// Call depth; also the solver bridge's notion of assertion levels.
    pub depth: usize,
    /// Constraints assumed per assertion level, mirrored to the solver.
    pub assumed: Vec<Vec<ExprLoc>>,
}

impl<G: Generator, Tr: ExecTracer, B: SatBackend> Interp<'_, G, Tr, B> {
    /// Builds a failure carrying the current memory snapshot.
    pub(crate) fn fail(&self, source: FailureSource, position: Pos) -> RunError {
        RunError::Fail(Box::new(Failure {
            source,
            position,
            memory: self.mem.clone(),
            trace: Vec::new(),
        }))
    }

    fn unsupported(&self, what: impl Into<String>, position: Pos) -> RunError {
        self.fail(FailureSource::UnsupportedConstruct(what.into()), position)
    }

    /// Rejects under-construction sentinels on any read.
    fn check_well_defined(&self, value: &Value) -> ExecResult<()> {
        if let Value::UnderConstruction(code) = value {
            Err(RunError::Cycle(*code))
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Expression dispatch
    // =========================================================================

    pub(crate) fn eval(&mut self, e: &ExprLoc) -> ExecResult<Value> {
        match &e.expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Var(name) => self.lookup_name(name, e.position),
            Expr::Application(name, args) => self.eval_application(name, args, e.position),
            Expr::MapSelection(map, args) => self.eval_selection(map, args, e.position),
            Expr::MapUpdate(map, args, value) => self.eval_update(map, args, value),
            Expr::Old(inner) => {
                if self.mem.in_old() {
                    self.eval(inner)
                } else {
                    let previous = self.mem.enter_old();
                    let result = self.eval(inner);
                    self.mem.exit_old(previous);
                    result
                }
            }
            Expr::IfExpr { cond, then, els } => {
                if self.eval(cond)?.as_bool() {
                    self.eval(then)
                } else {
                    self.eval(els)
                }
            }
            Expr::Coercion(inner, _) => self.eval(inner),
            Expr::Unary(op, inner) => {
                let value = self.eval(inner)?;
                Ok(match op {
                    UnOp::Neg => Value::Int(-value.as_int()),
                    UnOp::Not => Value::Bool(!value.as_bool()),
                })
            }
            Expr::Binary(op, l, r) => self.eval_binary(*op, l, r, e.position),
            Expr::Quantified {
                op,
                type_vars,
                bound,
                body,
            } => match op {
                QOp::Lambda => Err(self.unsupported("lambda expression", e.position)),
                QOp::Exists => Ok(Value::Bool(self.eval_exists(e)?)),
                QOp::Forall => {
                    let negated =
                        ExprLoc::quantified(QOp::Exists, type_vars.clone(), bound.clone(), nnf::negate(body))
                            .at(e.position);
                    Ok(Value::Bool(!self.eval_exists(&negated)?))
                }
            },
        }
    }

    fn eval_binary(&mut self, op: BinOp, l: &ExprLoc, r: &ExprLoc, position: Pos) -> ExecResult<Value> {
        match op {
            BinOp::And => {
                if self.eval(l)?.as_bool() {
                    let rv = self.eval(r)?.as_bool();
                    self.last_term = Some(r.clone());
                    Ok(Value::Bool(rv))
                } else {
                    self.last_term = Some(l.clone());
                    Ok(Value::Bool(false))
                }
            }
            BinOp::Or => {
                if self.eval(l)?.as_bool() {
                    self.last_term = Some(l.clone());
                    Ok(Value::Bool(true))
                } else {
                    let rv = self.eval(r)?.as_bool();
                    self.last_term = Some(r.clone());
                    Ok(Value::Bool(rv))
                }
            }
            BinOp::Implies => {
                if self.eval(l)?.as_bool() {
                    let rv = self.eval(r)?.as_bool();
                    self.last_term = Some(r.clone());
                    Ok(Value::Bool(rv))
                } else {
                    self.last_term = Some(l.clone());
                    Ok(Value::Bool(true))
                }
            }
            BinOp::Explies => {
                if self.eval(l)?.as_bool() {
                    self.last_term = Some(l.clone());
                    Ok(Value::Bool(true))
                } else {
                    let rv = self.eval(r)?.as_bool();
                    self.last_term = Some(r.clone());
                    Ok(Value::Bool(!rv))
                }
            }
            BinOp::Equiv => {
                let lv = self.eval(l)?.as_bool();
                let rv = self.eval(r)?.as_bool();
                Ok(Value::Bool(lv == rv))
            }
            BinOp::Plus | BinOp::Minus | BinOp::Times => {
                let lv = self.eval(l)?;
                let rv = self.eval(r)?;
                let (a, b) = (lv.as_int(), rv.as_int());
                Ok(Value::Int(match op {
                    BinOp::Plus => a + b,
                    BinOp::Minus => a - b,
                    _ => a * b,
                }))
            }
            BinOp::Div | BinOp::Mod => {
                let lv = self.eval(l)?;
                let rv = self.eval(r)?;
                if rv.as_int().is_zero() {
                    return Err(self.fail(FailureSource::DivisionByZero, position));
                }
                let (q, rem) = euclidean_div_rem(lv.as_int(), rv.as_int());
                Ok(Value::Int(if op == BinOp::Div { q } else { rem }))
            }
            BinOp::Lt | BinOp::Leq | BinOp::Gt | BinOp::Geq => {
                let lv = self.eval(l)?;
                let rv = self.eval(r)?;
                let (a, b) = (lv.as_int(), rv.as_int());
                Ok(Value::Bool(match op {
                    BinOp::Lt => a < b,
                    BinOp::Leq => a <= b,
                    BinOp::Gt => a > b,
                    _ => a >= b,
                }))
            }
            BinOp::Eq => {
                let lv = self.eval(l)?;
                let rv = self.eval(r)?;
                let map_type = self.ctx.type_of(l);
                let eq = self.value_eq(&lv, &rv, map_type.as_ref(), position)?;
                Ok(Value::Bool(eq))
            }
            BinOp::Neq => {
                let lv = self.eval(l)?;
                let rv = self.eval(r)?;
                let map_type = self.ctx.type_of(l);
                let eq = self.value_eq(&lv, &rv, map_type.as_ref(), position)?;
                Ok(Value::Bool(!eq))
            }
            BinOp::Lc => Err(self.unsupported("partial order", position)),
        }
    }

    /// Value equality; delegates to map-equality resolution on references.
    pub(crate) fn value_eq(
        &mut self,
        v1: &Value,
        v2: &Value,
        static_type: Option<&Type>,
        position: Pos,
    ) -> ExecResult<bool> {
        match (v1, v2) {
            (Value::Ref(r1), Value::Ref(r2)) => {
                let (domains, range) = self.map_components(static_type, position)?;
                self.map_equality(*r1, *r2, &domains, &range, position)
            }
            _ => Ok(v1 == v2),
        }
    }

    /// Resolves the domain and range types of a map-typed operand.
    fn map_components(&self, static_type: Option<&Type>, position: Pos) -> ExecResult<(Vec<Type>, Type)> {
        let resolved = static_type.map(|t| self.ctx.resolve(t));
        match resolved {
            Some(Type::Map { domains, range, .. }) => Ok((domains, *range)),
            _ => Err(self.unsupported("map comparison without a static map type", position)),
        }
    }

    // =========================================================================
    // Lazy variable access
    // =========================================================================

    fn store_kind_for(&self, kind: crate::context::NameKind) -> StoreKind {
        match kind {
            crate::context::NameKind::Local => StoreKind::Local,
            crate::context::NameKind::Global => {
                if self.mem.in_old() {
                    StoreKind::OldGlobal
                } else {
                    StoreKind::Global
                }
            }
            crate::context::NameKind::Constant | crate::context::NameKind::Function => StoreKind::Constant,
        }
    }

    /// Reads a name, materializing it on first access.
    pub(crate) fn lookup_name(&mut self, name: &str, position: Pos) -> ExecResult<Value> {
        let Some((kind, typ)) = self.ctx.resolve_name(name) else {
            return Err(self.unsupported(format!("undeclared name {name}"), position));
        };
        let store_kind = self.store_kind_for(kind);
        if let Some(value) = self.mem.get(store_kind, name) {
            self.check_well_defined(value)?;
            return Ok(value.clone());
        }
        self.materialize(name, kind, store_kind, &typ, position)
    }

    fn materialize(
        &mut self,
        name: &str,
        kind: crate::context::NameKind,
        store_kind: StoreKind,
        typ: &Type,
        position: Pos,
    ) -> ExecResult<Value> {
        // (1) definitions without formals can produce the value outright
        let defs: Vec<Definition> = self
            .store
            .name_definitions(name)
            .into_iter()
            .filter(|d| d.formals.is_empty())
            .collect();
        let mut value = None;
        if !defs.is_empty() {
            let code = self.next_code;
            self.next_code += 1;
            self.mem.set(store_kind, name, Value::UnderConstruction(code));
            let applied = self.apply_definitions(&defs, &[], &[], code);
            self.mem.unset(store_kind, name);
            value = applied?;
        }
        // (2) otherwise draw from the generator
        let value = match value {
            Some(v) => v,
            None => self.generate_value(typ, position)?,
        };
        self.mem.set(store_kind, name, value.clone());

        // globals mirror their first value into the other store while
        // unmodified, so that old and current state agree on inputs
        if kind == crate::context::NameKind::Global && !self.mem.modified.contains(name) {
            let mirror = match store_kind {
                StoreKind::OldGlobal => StoreKind::Global,
                _ => StoreKind::OldGlobal,
            };
            self.mem.set(mirror, name, value.clone());
        }

        // (3) a fresh map inherits the name's definitions and deferred
        // constraints on its source
        if let Value::Ref(id) = &value {
            let set = self.store.name_set(name);
            self.store.attach_to_ref(self.mem.heap.source_of(*id), set);
        }

        // (4) constraints and where-clauses
        for constraint in self.store.name_constraints(name) {
            self.apply_name_constraint(&constraint)?;
        }
        Ok(value)
    }

    /// Draws a fresh value of the given type.
    pub(crate) fn generate_value(&mut self, typ: &Type, position: Pos) -> ExecResult<Value> {
        match self.ctx.resolve(typ) {
            Type::Bool => {
                self.tracer.on_draw("bool");
                Ok(Value::Bool(self.generator.gen_bool()))
            }
            Type::Int => {
                self.tracer.on_draw("int");
                Ok(Value::Int(self.generator.gen_int()))
            }
            Type::Map { .. } => Ok(Value::Ref(self.mem.heap.alloc_empty_source())),
            Type::Ident { name, .. } => {
                if self.ctx.type_constructors.contains_key(&name) {
                    self.tracer.on_draw("custom");
                    Ok(Value::Custom(CustomValue {
                        type_name: name,
                        tag: self.generator.gen_int(),
                    }))
                } else {
                    Err(self.unsupported(format!("value generation for type variable {name}"), position))
                }
            }
        }
    }

    // =========================================================================
    // Definitions and constraints
    // =========================================================================

    /// Tries each definition in order; a definition that cycles through its
    /// own construction (the sentinel code matches) is not applicable.
    fn apply_definitions(
        &mut self,
        defs: &[Definition],
        args: &[Value],
        arg_types: &[Type],
        code: u64,
    ) -> ExecResult<Option<Value>> {
        for def in defs {
            match self.apply_definition(def, args, arg_types) {
                Ok(Some(value)) => return Ok(Some(value)),
                Ok(None) => {}
                Err(RunError::Cycle(c)) if c == code => {}
                Err(other) => return Err(other),
            }
        }
        Ok(None)
    }

    /// Applies one definition: unify formal types, bind formals, check the
    /// guard, evaluate the body.
    fn apply_definition(&mut self, def: &Definition, args: &[Value], arg_types: &[Type]) -> ExecResult<Option<Value>> {
        if def.formals.len() != args.len() {
            return Ok(None);
        }
        if !def.type_vars.is_empty() || !arg_types.is_empty() {
            let formal_types: Vec<Type> = def.formals.iter().map(|f| f.typ.clone()).collect();
            if self.ctx.match_all(&def.type_vars, &formal_types, arg_types).is_none() {
                return Ok(None);
            }
        }
        let saved = self.bind_values(&def.formals, args);
        let result = self.apply_definition_bound(def);
        self.unbind_values(saved);
        result
    }

    fn apply_definition_bound(&mut self, def: &Definition) -> ExecResult<Option<Value>> {
        if let Some(guard) = &def.guard
            && !self.eval(guard)?.as_bool()
        {
            return Ok(None);
        }
        self.eval(&def.body).map(Some)
    }

    /// Shadows formals with concrete values in the local store and the type
    /// context; returns what to restore.
    fn bind_values(&mut self, formals: &[IdType], args: &[Value]) -> Vec<(Id, Option<Value>, Option<Type>)> {
        formals
            .iter()
            .zip(args)
            .map(|(formal, value)| {
                let prior_value = self.mem.get(StoreKind::Local, &formal.name).cloned();
                self.mem.set(StoreKind::Local, formal.name.clone(), value.clone());
                let prior_type = self.ctx.shadow_local(&formal.name, formal.typ.clone());
                (formal.name.clone(), prior_value, prior_type)
            })
            .collect()
    }

    fn unbind_values(&mut self, saved: Vec<(Id, Option<Value>, Option<Type>)>) {
        for (name, prior_value, prior_type) in saved.into_iter().rev() {
            match prior_value {
                Some(value) => self.mem.set(StoreKind::Local, name.clone(), value),
                None => self.mem.unset(StoreKind::Local, &name),
            }
            self.ctx.restore_local(&name, prior_type);
        }
    }

    /// Assumes a closed or wrapped name constraint at materialization.
    fn apply_name_constraint(&mut self, constraint: &Constraint) -> ExecResult<()> {
        if !constraint.pattern.is_empty() {
            // applies key by key at map selection
            return Ok(());
        }
        let body = if constraint.bound.is_empty() {
            constraint.body.clone()
        } else {
            ExprLoc::quantified(
                QOp::Forall,
                constraint.type_vars.clone(),
                constraint.bound.clone(),
                constraint.body.clone(),
            )
            .at(constraint.position)
        };
        self.assume_constraint(&body, constraint.kind)
    }

    /// Assumes `expr`; a false result aborts the branch as unreachable.
    pub(crate) fn assume_constraint(&mut self, expr: &ExprLoc, kind: SpecKind) -> ExecResult<()> {
        let clause = SpecClause::new(kind, true, expr.clone());
        self.check_clause(&clause)
    }

    /// Evaluates a specification clause; free clauses that fail are
    /// unreachable, checked ones are errors. Records the constraint for the
    /// solver bridge on success.
    pub(crate) fn check_clause(&mut self, clause: &SpecClause) -> ExecResult<()> {
        self.last_term = None;
        let value = self.eval(&clause.expr)?;
        let holds = value.as_bool();
        self.tracer.on_clause(clause.kind, clause.free, holds);
        if holds {
            self.record_assumption(&clause.expr)?;
            Ok(())
        } else {
            let last_term = self.last_term.take();
            Err(self.fail(
                FailureSource::SpecViolation {
                    kind: clause.kind,
                    free: clause.free,
                    clause: clause.expr.clone(),
                    last_term,
                },
                clause.expr.position,
            ))
        }
    }

    /// Pushes an assumed constraint into the current assertion level and asks
    /// the solver bridge (if any) whether the level is still satisfiable.
    ///
    /// # Panics
    /// Panics if the bridge holds fewer frames than the interpreter, which is
    /// a usage bug in the embedding.
    fn record_assumption(&mut self, expr: &ExprLoc) -> ExecResult<()> {
        if let Some(frame) = self.assumed.last_mut() {
            frame.push(expr.clone());
        }
        if let Some(bridge) = self.solver.as_deref_mut() {
            let frame = self.assumed.last().cloned().unwrap_or_default();
            let verdict = bridge
                .check(&frame, self.depth)
                .expect("solver bridge out of sync with the interpreter");
            if verdict == SatResult::Unsat {
                let clause = SpecClause::new(SpecKind::Inline, true, expr.clone());
                return Err(self.fail(
                    FailureSource::SpecViolation {
                        kind: clause.kind,
                        free: true,
                        clause: clause.expr,
                        last_term: None,
                    },
                    expr.position,
                ));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Maps
    // =========================================================================

    fn eval_application(&mut self, name: &str, args: &[ExprLoc], position: Pos) -> ExecResult<Value> {
        let Some(sig) = self.ctx.functions.get(name) else {
            return Err(self.unsupported(format!("application of undeclared function {name}"), position));
        };
        let (type_vars, declared, ret) = (sig.type_vars.clone(), sig.args.clone(), sig.ret.clone());
        let fref = self.lookup_name(name, position)?.as_ref_id();
        let mut key = Vec::with_capacity(args.len());
        for arg in args {
            let value = self.eval(arg)?;
            if value.is_ref() {
                return Err(self.unsupported("map value used as a map index", arg.position));
            }
            key.push(value);
        }
        let (domains, range) = self.instantiate(&type_vars, &declared, &ret, args, position)?;
        self.select(fref, key, &domains, &range, position)
    }

    fn eval_selection(&mut self, map: &ExprLoc, args: &[ExprLoc], position: Pos) -> ExecResult<Value> {
        let map_type = self
            .ctx
            .type_of(map)
            .map(|t| self.ctx.resolve(&t))
            .ok_or_else(|| self.unsupported("selection on an untypeable map expression", position))?;
        let Type::Map {
            type_vars,
            domains,
            range,
        } = map_type
        else {
            return Err(self.unsupported("selection on a non-map expression", position));
        };
        let mref = self.eval(map)?.as_ref_id();
        let mut key = Vec::with_capacity(args.len());
        for arg in args {
            let value = self.eval(arg)?;
            if value.is_ref() {
                return Err(self.unsupported("map value used as a map index", arg.position));
            }
            key.push(value);
        }
        let (domains, range) = self.instantiate(&type_vars, &domains, &range, args, position)?;
        self.select(mref, key, &domains, &range, position)
    }

    /// Instantiates a polymorphic map signature from the static types of the
    /// argument expressions.
    fn instantiate(
        &self,
        type_vars: &[Id],
        domains: &[Type],
        range: &Type,
        args: &[ExprLoc],
        position: Pos,
    ) -> ExecResult<(Vec<Type>, Type)> {
        if type_vars.is_empty() {
            return Ok((domains.to_vec(), range.clone()));
        }
        let arg_types: Option<Vec<Type>> = args.iter().map(|a| self.ctx.type_of(a)).collect();
        let subst = arg_types
            .and_then(|ts| self.ctx.match_all(type_vars, domains, &ts))
            .ok_or_else(|| self.unsupported("cannot instantiate a polymorphic map type", position))?;
        let domains = domains.iter().map(|d| crate::context::substitute(&subst, d)).collect();
        let range = crate::context::substitute(&subst, range);
        Ok((domains, range))
    }

    /// Lazy map selection at a concrete key.
    pub(crate) fn select(
        &mut self,
        mref: HeapId,
        key: Vec<Value>,
        domains: &[Type],
        range: &Type,
        position: Pos,
    ) -> ExecResult<Value> {
        let (source, cache) = self.mem.heap.flatten(mref);
        if let Some(value) = cache.get(&key) {
            self.check_well_defined(value)?;
            return Ok(value.clone());
        }
        // definitions attached to the source
        let defs: Vec<Definition> = self
            .store
            .ref_definitions(source)
            .into_iter()
            .filter(|d| d.formals.len() == key.len())
            .collect();
        if !defs.is_empty() {
            let code = self.next_code;
            self.next_code += 1;
            self.mem
                .heap
                .store_at_source(source, key.clone(), Value::UnderConstruction(code));
            let applied = self.apply_definitions(&defs, &key, domains, code);
            self.mem.heap.remove_at_source(source, &key);
            if let Some(value) = applied? {
                self.mem.heap.store_at_source(source, key.clone(), value.clone());
                self.apply_ref_constraints(source, &key, position)?;
                return Ok(value);
            }
        }
        // generate a fresh value at the source payload (not the override)
        let value = self.generate_value(range, position)?;
        self.mem.heap.store_at_source(source, key.clone(), value.clone());
        self.apply_ref_constraints(source, &key, position)?;
        Ok(value)
    }

    /// Applies the deferred constraints of a source at a freshly
    /// materialized key: pattern positions holding bound variables bind to
    /// the key, remaining bound variables are re-quantified.
    fn apply_ref_constraints(&mut self, source: HeapId, key: &[Value], _position: Pos) -> ExecResult<()> {
        for constraint in self.store.ref_constraints(source) {
            if constraint.pattern.is_empty() || constraint.pattern.len() != key.len() {
                continue;
            }
            let bound_names: AHashSet<&str> = constraint.bound.iter().map(|b| b.name.as_str()).collect();
            let mut bindings: Vec<(IdType, Value)> = Vec::new();
            let mut applicable = true;
            for (pattern, actual) in constraint.pattern.iter().zip(key) {
                match &pattern.expr {
                    Expr::Var(v) if bound_names.contains(v.as_str()) => {
                        match bindings.iter().find(|(b, _)| &b.name == v) {
                            Some((_, bound_value)) if bound_value == actual => {}
                            Some(_) => {
                                applicable = false;
                                break;
                            }
                            None => {
                                let typ = constraint
                                    .bound
                                    .iter()
                                    .find(|b| &b.name == v)
                                    .map(|b| b.typ.clone())
                                    .expect("bound variable has a binder");
                                bindings.push((IdType::new(v.clone(), typ), actual.clone()));
                            }
                        }
                    }
                    _ => {
                        let free = pattern.free_vars();
                        if free.iter().any(|v| bound_names.contains(v.as_str())) {
                            applicable = false;
                            break;
                        }
                        let evaluated = self.eval(pattern)?;
                        if &evaluated != actual {
                            applicable = false;
                            break;
                        }
                    }
                }
            }
            if !applicable {
                continue;
            }
            let remaining: Vec<IdType> = constraint
                .bound
                .iter()
                .filter(|b| !bindings.iter().any(|(bd, _)| bd.name == b.name))
                .cloned()
                .collect();
            let body = if remaining.is_empty() {
                constraint.body.clone()
            } else {
                ExprLoc::quantified(
                    QOp::Forall,
                    constraint.type_vars.clone(),
                    remaining,
                    constraint.body.clone(),
                )
                .at(constraint.position)
            };
            let (formals, values): (Vec<IdType>, Vec<Value>) = bindings.into_iter().unzip();
            let saved = self.bind_values(&formals, &values);
            let result = self.assume_constraint(&body, constraint.kind);
            self.unbind_values(saved);
            result?;
        }
        Ok(())
    }

    fn eval_update(&mut self, map: &ExprLoc, args: &[ExprLoc], value: &ExprLoc) -> ExecResult<Value> {
        let base = self.eval(map)?.as_ref_id();
        let mut key = Vec::with_capacity(args.len());
        for arg in args {
            let k = self.eval(arg)?;
            if k.is_ref() {
                return Err(self.unsupported("map value used as a map index", arg.position));
            }
            key.push(k);
        }
        let new_value = self.eval(value)?;
        Ok(Value::Ref(self.mem.heap.derive_with(base, key, new_value)))
    }

    // =========================================================================
    // Map equality (non-deterministic resolution)
    // =========================================================================

    /// Decides equality of two map references, possibly committing the state
    /// to the chosen answer.
    pub(crate) fn map_equality(
        &mut self,
        r1: HeapId,
        r2: HeapId,
        domains: &[Type],
        range: &Type,
        position: Pos,
    ) -> ExecResult<bool> {
        if r1 == r2 {
            return Ok(true);
        }
        let (s1, c1) = self.mem.heap.flatten(r1);
        let (s2, c2) = self.mem.heap.flatten(r2);
        // direct evidence: a shared key with definitely different values
        for (key, v1) in &c1 {
            if let Some(v2) = c2.get(key)
                && definitely_unequal(v1, v2)
            {
                return Ok(false);
            }
        }
        self.tracer.on_draw("map-equality");
        if self.generator.gen_bool() {
            self.force_equal(r1, r2, range, position)?;
            return Ok(true);
        }
        if s1 == s2 {
            return self.distinguish_by_key(r1, r2, domains, range, position);
        }
        self.tracer.on_draw("map-equality");
        if self.generator.gen_bool() {
            self.distinguish_by_key(r1, r2, domains, range, position)
        } else {
            self.install_distinguisher(s1, s2, domains);
            Ok(false)
        }
    }

    /// Searches for a key at which the two maps differ, generating missing
    /// values as needed. Keys that turn out equal are settled and excluded;
    /// running out of candidates means the maps cannot differ.
    fn distinguish_by_key(
        &mut self,
        r1: HeapId,
        r2: HeapId,
        domains: &[Type],
        range: &Type,
        position: Pos,
    ) -> ExecResult<bool> {
        let mut settled: AHashSet<Vec<Value>> = AHashSet::new();
        loop {
            let (_, c1) = self.mem.heap.flatten(r1);
            let (_, c2) = self.mem.heap.flatten(r2);
            let mut candidates: Vec<Vec<Value>> = Vec::new();
            for key in c1.keys().chain(c2.keys()) {
                if settled.contains(key) || candidates.contains(key) {
                    continue;
                }
                let known_equal = match (c1.get(key), c2.get(key)) {
                    (Some(a), Some(b)) => a == b,
                    _ => false,
                };
                if !known_equal {
                    candidates.push(key.clone());
                }
            }
            if candidates.is_empty() {
                return Ok(true);
            }
            self.tracer.on_draw("map-difference-key");
            let key = candidates.swap_remove(self.generator.gen_index(candidates.len()));
            let v1 = self.select(r1, key.clone(), domains, range, position)?;
            let v2 = self.select(r2, key.clone(), domains, range, position)?;
            if !self.value_eq(&v1, &v2, Some(range).filter(|t| t.is_map()), position)? {
                return Ok(false);
            }
            settled.insert(key);
        }
    }

    /// Installs a synthesized distinguishing pair in two incompatible
    /// sources so the difference persists.
    fn install_distinguisher(&mut self, s1: HeapId, s2: HeapId, domains: &[Type]) {
        let pair_code = BigInt::from(s1.index()) * BigInt::from(1u64 << 32) + BigInt::from(s2.index());
        let key: Vec<Value> = domains
            .iter()
            .map(|_| {
                Value::Custom(CustomValue {
                    type_name: DISTINCT_TYPE.to_owned(),
                    tag: pair_code.clone(),
                })
            })
            .collect();
        for source in [s1, s2] {
            let marker = Value::Custom(CustomValue {
                type_name: DISTINCT_TYPE.to_owned(),
                tag: BigInt::from(source.index()),
            });
            self.mem.heap.store_at_source(source, key.clone(), marker);
        }
    }

    /// Forces two references to denote the same map.
    fn force_equal(&mut self, r1: HeapId, r2: HeapId, range: &Type, position: Pos) -> ExecResult<()> {
        let (s1, c1) = self.mem.heap.flatten(r1);
        let (s2, c2) = self.mem.heap.flatten(r2);
        // (a) values already known on both sides must agree
        for (key, v1) in &c1 {
            if let Some(v2) = c2.get(key) {
                let nested = Some(range).filter(|t| t.is_map());
                if !self.value_eq(v1, v2, nested, position)? {
                    let clause = ExprLoc::literal(Value::Ref(r1)).eq(ExprLoc::literal(Value::Ref(r2)));
                    return Err(self.fail(
                        FailureSource::SpecViolation {
                            kind: SpecKind::Inline,
                            free: true,
                            clause,
                            last_term: None,
                        },
                        position,
                    ));
                }
            }
        }
        if s1 == s2 {
            // (b) overrides merge into the shared source
            for (key, value) in c1.iter().chain(&c2) {
                let already = match self.mem.heap.payload(s1) {
                    crate::heap::MapRepr::Source(store) => store.contains_key(key),
                    crate::heap::MapRepr::Derived { .. } => unreachable!("flatten returns a source"),
                };
                if !already {
                    self.mem.heap.store_at_source(s1, key.clone(), value.clone());
                }
            }
        } else {
            // (c) a fresh shared source takes over both histories
            let mut merged = c1.clone();
            for (key, value) in &c2 {
                merged.entry(key.clone()).or_insert_with(|| value.clone());
            }
            let fresh = self.mem.heap.unify_sources(s1, s2, merged);
            self.store.merge_refs(s1, s2, fresh);
        }
        Ok(())
    }

    // =========================================================================
    // Quantifiers
    // =========================================================================

    /// Evaluates an existential quantifier by normalization, domain
    /// inference and enumeration. `Forall` is routed through `not exists
    /// not`.
    fn eval_exists(&mut self, quantifier: &ExprLoc) -> ExecResult<bool> {
        let position = quantifier.position;
        let normalized = nnf::normalize(quantifier);
        match normalized.expr {
            Expr::Quantified {
                op: QOp::Exists,
                type_vars,
                bound,
                body,
            } => {
                let tv_depth = self.ctx.push_type_vars(&type_vars);
                let result = self.eval_exists_over(&bound, &body, position);
                self.ctx.pop_type_vars(tv_depth);
                result
            }
            // normalization kept no quantifier at the root
            expr => {
                let rebuilt = ExprLoc::new(normalized.position, expr);
                Ok(self.eval(&rebuilt)?.as_bool())
            }
        }
    }

    fn eval_exists_over(&mut self, bound: &[IdType], body: &ExprLoc, position: Pos) -> ExecResult<bool> {
        // reject unenumerable binder types first
        for var in bound {
            match self.ctx.resolve(&var.typ) {
                Type::Map { .. } => {
                    return Err(self.unsupported("quantification over a map type", position));
                }
                Type::Ident { name, .. } if !self.ctx.type_constructors.contains_key(&name) => {
                    return Err(self.unsupported(format!("quantification over type variable {name}"), position));
                }
                _ => {}
            }
        }

        // bound variables shadow program names for the body's typing
        let saved_types: Vec<(Id, Option<Type>)> = bound
            .iter()
            .map(|b| (b.name.clone(), self.ctx.shadow_local(&b.name, b.typ.clone())))
            .collect();
        let saved_values: Vec<(Id, Option<Value>)> = bound
            .iter()
            .map(|b| (b.name.clone(), self.mem.get(StoreKind::Local, &b.name).cloned()))
            .collect();

        let result = self.enumerate_exists(bound, body, position);

        for (name, prior) in saved_values.into_iter().rev() {
            match prior {
                Some(value) => self.mem.set(StoreKind::Local, name, value),
                None => self.mem.unset(StoreKind::Local, &name),
            }
        }
        for (name, prior) in saved_types.into_iter().rev() {
            self.ctx.restore_local(&name, prior);
        }
        result
    }

    fn enumerate_exists(&mut self, bound: &[IdType], body: &ExprLoc, position: Pos) -> ExecResult<bool> {
        let int_vars: Vec<Id> = bound
            .iter()
            .filter(|b| self.ctx.resolve(&b.typ) == Type::Int)
            .map(|b| b.name.clone())
            .collect();
        let bound_names: Vec<Id> = bound.iter().map(|b| b.name.clone()).collect();
        let env = {
            let mut closed_eval = |e: &ExprLoc| -> Option<BigInt> {
                if e.free_vars().iter().any(|v| bound_names.contains(v)) {
                    return None;
                }
                match self.eval(e) {
                    Ok(Value::Int(i)) => Some(i),
                    _ => None,
                }
            };
            domains::infer_int_domains(body, &int_vars, &mut closed_eval)
        };

        let mut domains_per_var: Vec<(Id, Vec<Value>)> = Vec::with_capacity(bound.len());
        for var in bound {
            let values = match self.ctx.resolve(&var.typ) {
                Type::Bool => vec![Value::Bool(false), Value::Bool(true)],
                Type::Int => {
                    let interval = env.get(&var.name).cloned().unwrap_or(crate::interval::Interval::TOP);
                    let size = interval.size();
                    let within_bound = match (&size, self.qbound) {
                        (None, _) => false,
                        (Some(_), None) => true,
                        (Some(s), Some(q)) => *s <= BigInt::from(q),
                    };
                    if !within_bound {
                        return Err(self.fail(
                            FailureSource::InfiniteDomain {
                                var: var.name.clone(),
                                interval,
                            },
                            position,
                        ));
                    }
                    interval.iter_values().map(Value::Int).collect()
                }
                Type::Ident { name, .. } => {
                    let Some(q) = self.qbound else {
                        return Err(self.fail(
                            FailureSource::InfiniteDomain {
                                var: var.name.clone(),
                                interval: crate::interval::Interval::TOP,
                            },
                            position,
                        ));
                    };
                    (0..q)
                        .map(|tag| {
                            Value::Custom(CustomValue {
                                type_name: name.clone(),
                                tag: BigInt::from(tag),
                            })
                        })
                        .collect()
                }
                Type::Map { .. } => unreachable!("rejected before enumeration"),
            };
            domains_per_var.push((var.name.clone(), values));
        }

        self.enumerate_product(&domains_per_var, 0, body)
    }

    fn enumerate_product(&mut self, domains: &[(Id, Vec<Value>)], index: usize, body: &ExprLoc) -> ExecResult<bool> {
        if index == domains.len() {
            return Ok(self.eval(body)?.as_bool());
        }
        let (name, values) = &domains[index];
        for value in values {
            self.mem.set(StoreKind::Local, name.clone(), value.clone());
            if self.enumerate_product(domains, index + 1, body)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// True when two values cannot be equal under any resolution: identical
/// references are equal, distinct references stay undecided here.
fn definitely_unequal(v1: &Value, v2: &Value) -> bool {
    match (v1, v2) {
        (Value::Ref(_), Value::Ref(_)) => false,
        _ => v1 != v2,
    }
}
