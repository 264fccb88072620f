//! Program preprocessing: procedure implementations, function definitions
//! and the axiom-derived constraint store.
//!
//! Runs once per program; every test case clones the resulting store and
//! context, so branches never observe each other's constraint state.

use ahash::{AHashMap, AHashSet};
use indexmap::IndexSet;

use crate::{
    ast::{Body, Decl, Expr, ExprLoc, FArg, Id, IdType, IdTypeWhere, Program, QOp, SpecKind, Type},
    constraints::{Constraint, ConstraintStore, Definition},
    context::Context,
    flatten::{BlockMap, flatten_body},
    nnf,
    pos::Pos,
};

/// One executable implementation of a procedure, with contracts and
/// parameter where-clauses substituted into its own parameter names.
#[derive(Debug, Clone)]
pub(crate) struct ProcImpl {
    pub name: Id,
    pub ins: Vec<IdType>,
    pub outs: Vec<IdType>,
    /// True for `implementation` declarations, whose parameter names replace
    /// the procedure's.
    pub params_renamed: bool,
    pub locals: Vec<IdTypeWhere>,
    pub blocks: BlockMap,
    /// Where-clauses of parameters, installed as local constraints on entry.
    pub param_wheres: Vec<(Id, ExprLoc)>,
    pub requires: Vec<(bool, ExprLoc)>,
    pub ensures: Vec<(bool, ExprLoc)>,
    pub modifies: Vec<Id>,
    pub position: Pos,
}

/// The executable index of a program.
#[derive(Debug, Clone)]
pub(crate) struct Prepared {
    pub context: Context,
    pub implementations: AHashMap<Id, Vec<ProcImpl>>,
    pub store: ConstraintStore,
}

/// Builds the executable index: flattened implementations, function
/// definitions, axiom-derived definitions and constraints, global
/// where-clauses and unique-constant distinctness.
pub(crate) fn preprocess(program: &Program, context: Context) -> Prepared {
    let mut store = ConstraintStore::new();
    let mut implementations: AHashMap<Id, Vec<ProcImpl>> = AHashMap::new();
    let mut unique_groups: Vec<(Type, Vec<Id>)> = Vec::new();

    for decl in &program.decls {
        match &decl.decl {
            Decl::FunctionDecl {
                name,
                type_args,
                args,
                body: Some(body),
                ..
            } => {
                store.add_name_definition(
                    name.clone(),
                    Definition {
                        type_vars: type_args.clone(),
                        formals: function_formals(name, args),
                        guard: None,
                        body: body.clone(),
                        position: decl.position,
                    },
                );
            }
            Decl::AxiomDecl(expr) => {
                let mut extractor = Extractor {
                    store: &mut store,
                    context: &context,
                    position: decl.position,
                };
                extractor.extract(&[], &[], &[], expr);
            }
            Decl::VarDecl(vars) => {
                for var in vars {
                    if let Some(clause) = &var.where_clause {
                        store.add_name_constraint(
                            var.name.clone(),
                            Constraint::closed(clause.clone(), SpecKind::Where, decl.position),
                        );
                    }
                }
            }
            Decl::ConstantDecl {
                unique: true,
                names,
                typ,
                ..
            } => match unique_groups.iter_mut().find(|(t, _)| t == typ) {
                Some((_, group)) => group.extend(names.iter().cloned()),
                None => unique_groups.push((typ.clone(), names.clone())),
            },
            Decl::ProcedureDecl {
                name,
                in_params,
                out_params,
                body: Some(body),
                ..
            } => {
                let sig = context.procedures.get(name).expect("procedure in context");
                let proc_impl = ProcImpl {
                    name: name.clone(),
                    ins: in_params.iter().map(IdTypeWhere::id_type).collect(),
                    outs: out_params.iter().map(IdTypeWhere::id_type).collect(),
                    params_renamed: false,
                    locals: body.locals.clone(),
                    blocks: flatten_body(&body.block),
                    param_wheres: param_wheres(in_params.iter().chain(out_params), &AHashMap::new()),
                    requires: sig.requires().map(|(free, e)| (free, e.clone())).collect(),
                    ensures: sig.ensures().map(|(free, e)| (free, e.clone())).collect(),
                    modifies: sig.modifies(),
                    position: decl.position,
                };
                implementations.entry(name.clone()).or_default().push(proc_impl);
            }
            Decl::ImplementationDecl {
                name,
                in_params,
                out_params,
                bodies,
                ..
            } => {
                let sig = context.procedures.get(name).expect("procedure in context");
                // implementation parameter names replace the procedure's in
                // contracts and where-clauses
                let mut renaming: AHashMap<Id, Id> = AHashMap::new();
                for (from, to) in sig.ins.iter().zip(in_params) {
                    renaming.insert(from.name.clone(), to.name.clone());
                }
                for (from, to) in sig.outs.iter().zip(out_params) {
                    renaming.insert(from.name.clone(), to.name.clone());
                }
                for body in bodies {
                    let proc_impl = ProcImpl {
                        name: name.clone(),
                        ins: in_params.clone(),
                        outs: out_params.clone(),
                        params_renamed: true,
                        locals: body.locals.clone(),
                        blocks: flatten_body(&body.block),
                        param_wheres: param_wheres(sig.ins.iter().chain(&sig.outs), &renaming),
                        requires: sig
                            .requires()
                            .map(|(free, e)| (free, e.rename_vars(&renaming)))
                            .collect(),
                        ensures: sig
                            .ensures()
                            .map(|(free, e)| (free, e.rename_vars(&renaming)))
                            .collect(),
                        modifies: sig.modifies(),
                        position: decl.position,
                    };
                    implementations.entry(name.clone()).or_default().push(proc_impl);
                }
            }
            _ => {}
        }
    }

    // unique constants of the same type are pairwise distinct; each constant
    // carries the inequalities against its predecessors
    for (_, names) in unique_groups {
        for (index, name) in names.iter().enumerate().skip(1) {
            let mut body: Option<ExprLoc> = None;
            for earlier in &names[..index] {
                let diff = ExprLoc::var(name.clone()).neq(ExprLoc::var(earlier.clone()));
                body = Some(match body {
                    None => diff,
                    Some(acc) => acc.and(diff),
                });
            }
            if let Some(body) = body {
                store.add_name_constraint(name.clone(), Constraint::closed(body, SpecKind::Axiom, Pos::NONE));
            }
        }
    }

    Prepared {
        context,
        implementations,
        store,
    }
}

/// Formal parameters of a function definition; unnamed arguments get
/// positional placeholders (they cannot be referenced by the body).
fn function_formals(name: &str, args: &[FArg]) -> Vec<IdType> {
    args.iter()
        .enumerate()
        .map(|(index, arg)| match &arg.name {
            Some(n) => IdType::new(n.clone(), arg.typ.clone()),
            None => IdType::new(format!("{name}#arg{index}"), arg.typ.clone()),
        })
        .collect()
}

fn param_wheres<'a>(
    params: impl Iterator<Item = &'a IdTypeWhere>,
    renaming: &AHashMap<Id, Id>,
) -> Vec<(Id, ExprLoc)> {
    params
        .filter_map(|param| {
            param.where_clause.as_ref().map(|clause| {
                let name = renaming.get(&param.name).cloned().unwrap_or_else(|| param.name.clone());
                (name, clause.rename_vars(renaming))
            })
        })
        .collect()
}

/// Translates one axiom into store entries.
struct Extractor<'a> {
    store: &'a mut ConstraintStore,
    context: &'a Context,
    position: Pos,
}

impl Extractor<'_> {
    /// Recursively decomposes `e` under accumulated `guards` and the
    /// quantifier context `(type_vars, bound)`.
    fn extract(&mut self, guards: &[ExprLoc], type_vars: &[Id], bound: &[IdType], e: &ExprLoc) {
        match &e.expr {
            Expr::Binary(crate::ast::BinOp::And, l, r) => {
                self.extract(guards, type_vars, bound, l);
                self.extract(guards, type_vars, bound, r);
            }
            Expr::Binary(crate::ast::BinOp::Or, l, r) => {
                let mut left_guards = guards.to_vec();
                left_guards.push(nnf::negate(r));
                self.extract(&left_guards, type_vars, bound, l);
                let mut right_guards = guards.to_vec();
                right_guards.push(nnf::negate(l));
                self.extract(&right_guards, type_vars, bound, r);
            }
            Expr::Binary(crate::ast::BinOp::Implies, l, r) => {
                let mut then_guards = guards.to_vec();
                then_guards.push((**l).clone());
                self.extract(&then_guards, type_vars, bound, r);
                let mut contra_guards = guards.to_vec();
                contra_guards.push(nnf::negate(r));
                self.extract(&contra_guards, type_vars, bound, &nnf::negate(l));
            }
            Expr::Quantified {
                op: QOp::Forall,
                type_vars: inner_tvs,
                bound: inner_bound,
                body,
            } => {
                let mut tvs = type_vars.to_vec();
                tvs.extend(inner_tvs.iter().cloned());
                let mut all_bound = bound.to_vec();
                all_bound.extend(inner_bound.iter().cloned());
                self.extract(guards, &tvs, &all_bound, body);
            }
            Expr::Quantified { .. } => {} // existentials contribute nothing
            Expr::Binary(crate::ast::BinOp::Eq | crate::ast::BinOp::Equiv, l, r) => {
                if !self.try_definition(guards, type_vars, bound, l, r) {
                    self.add_constraints(guards, type_vars, bound, e);
                }
            }
            _ => self.add_constraints(guards, type_vars, bound, e),
        }
    }

    /// Attempts to read `lhs == rhs` as a guarded definition of the entity
    /// named by `lhs`. Returns false when the shape is not definitional.
    fn try_definition(
        &mut self,
        guards: &[ExprLoc],
        type_vars: &[Id],
        bound: &[IdType],
        lhs: &ExprLoc,
        rhs: &ExprLoc,
    ) -> bool {
        let bound_names: AHashSet<&str> = bound.iter().map(|b| b.name.as_str()).collect();
        let (entity, args) = match &lhs.expr {
            Expr::Var(name) if !bound_names.contains(name.as_str()) => (name.clone(), Vec::new()),
            Expr::MapSelection(map, args) => match &map.expr {
                Expr::Var(name) if !bound_names.contains(name.as_str()) => (name.clone(), args.clone()),
                _ => return false,
            },
            Expr::Application(name, args) => (name.clone(), args.clone()),
            _ => return false,
        };

        // formalize the arguments: bound variables stay, closed arguments
        // become fresh formals equated to the argument expression
        let mut formals = Vec::new();
        let mut extra_guards = Vec::new();
        let mut used: AHashSet<Id> = AHashSet::new();
        for (index, arg) in args.iter().enumerate() {
            match &arg.expr {
                Expr::Var(v) if bound_names.contains(v.as_str()) && !used.contains(v) => {
                    used.insert(v.clone());
                    let typ = bound
                        .iter()
                        .find(|b| &b.name == v)
                        .map(|b| b.typ.clone())
                        .expect("bound variable has a binder");
                    formals.push(IdType::new(v.clone(), typ));
                }
                _ => {
                    let free = arg.free_vars();
                    if free.iter().any(|v| bound_names.contains(v.as_str())) {
                        return false;
                    }
                    let Some(typ) = self.context.type_of(arg) else {
                        return false;
                    };
                    let fresh = format!("{entity}#arg{index}");
                    extra_guards.push(ExprLoc::var(fresh.clone()).eq(arg.clone()));
                    formals.push(IdType::new(fresh, typ));
                }
            }
        }

        let formal_names: AHashSet<&str> = formals.iter().map(|f| f.name.as_str()).collect();
        let introduces_new = |e: &ExprLoc| {
            e.free_vars()
                .iter()
                .any(|v| bound_names.contains(v.as_str()) && !formal_names.contains(v.as_str()))
        };
        if introduces_new(rhs) || guards.iter().any(introduces_new) {
            return false;
        }

        let mut guard: Option<ExprLoc> = None;
        for g in guards.iter().cloned().chain(extra_guards) {
            guard = Some(match guard {
                None => g,
                Some(acc) => acc.and(g),
            });
        }
        self.store.add_name_definition(
            entity,
            Definition {
                type_vars: type_vars.to_vec(),
                formals,
                guard,
                body: rhs.clone(),
                position: self.position,
            },
        );
        true
    }

    /// Fallback: the expression constrains its free entities.
    fn add_constraints(&mut self, guards: &[ExprLoc], type_vars: &[Id], bound: &[IdType], e: &ExprLoc) {
        let bound_names: AHashSet<&str> = bound.iter().map(|b| b.name.as_str()).collect();
        let mut body = e.clone();
        if !guards.is_empty() {
            let mut acc: Option<ExprLoc> = None;
            for g in guards.iter().cloned() {
                acc = Some(match acc {
                    None => g,
                    Some(prev) => prev.and(g),
                });
            }
            body = acc.expect("guards non-empty").implies(body);
        }
        let free: Vec<Id> = body
            .free_vars()
            .into_iter()
            .filter(|v| !bound_names.contains(v.as_str()))
            .collect();
        let mentions_bound = body.free_vars().iter().any(|v| bound_names.contains(v.as_str()));

        if !mentions_bound {
            for name in free {
                self.store
                    .add_name_constraint(name, Constraint::closed(body.clone(), SpecKind::Axiom, self.position));
            }
            return;
        }

        // deferred constraints: attach to every selection and application the
        // expression contains, keyed by its argument pattern
        let mut covered: IndexSet<Id> = IndexSet::new();
        let mut occurrences = Vec::new();
        collect_occurrences(&body, &bound_names, &mut occurrences);
        for (name, pattern) in occurrences {
            covered.insert(name.clone());
            self.store.add_name_constraint(
                name,
                Constraint {
                    type_vars: type_vars.to_vec(),
                    bound: bound.to_vec(),
                    pattern,
                    body: body.clone(),
                    kind: SpecKind::Axiom,
                    position: self.position,
                },
            );
        }
        // free names with no attachable occurrence get the whole quantified
        // fact at materialization time
        for name in free {
            if !covered.contains(&name) {
                self.store.add_name_constraint(
                    name,
                    Constraint {
                        type_vars: type_vars.to_vec(),
                        bound: bound.to_vec(),
                        pattern: Vec::new(),
                        body: body.clone(),
                        kind: SpecKind::Axiom,
                        position: self.position,
                    },
                );
            }
        }
    }
}

/// Collects `name(args)` applications and `name[args]` selections whose head
/// is not a bound variable.
fn collect_occurrences(e: &ExprLoc, bound_names: &AHashSet<&str>, out: &mut Vec<(Id, Vec<ExprLoc>)>) {
    match &e.expr {
        Expr::Literal(_) | Expr::Var(_) => {}
        Expr::Application(name, args) => {
            out.push((name.clone(), args.clone()));
            for arg in args {
                collect_occurrences(arg, bound_names, out);
            }
        }
        Expr::MapSelection(map, args) => {
            if let Expr::Var(name) = &map.expr {
                if !bound_names.contains(name.as_str()) {
                    out.push((name.clone(), args.clone()));
                }
            } else {
                collect_occurrences(map, bound_names, out);
            }
            for arg in args {
                collect_occurrences(arg, bound_names, out);
            }
        }
        Expr::MapUpdate(map, args, value) => {
            collect_occurrences(map, bound_names, out);
            for arg in args {
                collect_occurrences(arg, bound_names, out);
            }
            collect_occurrences(value, bound_names, out);
        }
        Expr::Old(inner) | Expr::Coercion(inner, _) | Expr::Unary(_, inner) => {
            collect_occurrences(inner, bound_names, out);
        }
        Expr::IfExpr { cond, then, els } => {
            collect_occurrences(cond, bound_names, out);
            collect_occurrences(then, bound_names, out);
            collect_occurrences(els, bound_names, out);
        }
        Expr::Binary(_, l, r) => {
            collect_occurrences(l, bound_names, out);
            collect_occurrences(r, bound_names, out);
        }
        Expr::Quantified { body, .. } => collect_occurrences(body, bound_names, out),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ast::Guard;

    fn prepare(decls: Vec<Decl>) -> Prepared {
        let program = Program::new(decls);
        let context = Context::from_program(&program);
        preprocess(&program, context)
    }

    #[test]
    fn constant_axiom_becomes_a_definition() {
        let prepared = prepare(vec![
            Decl::ConstantDecl {
                unique: false,
                names: vec!["K".to_owned()],
                typ: Type::Int,
                order_spec: None,
                complete: false,
            },
            Decl::AxiomDecl(ExprLoc::var("K").eq(ExprLoc::int_lit(42))),
        ]);
        let defs = prepared.store.name_definitions("K");
        assert_eq!(defs.len(), 1);
        assert!(defs[0].formals.is_empty());
        assert_eq!(defs[0].body, ExprLoc::int_lit(42));
    }

    #[test]
    fn guarded_function_axiom_keeps_its_guard() {
        let prepared = prepare(vec![
            Decl::FunctionDecl {
                name: "f".to_owned(),
                type_args: vec![],
                args: vec![FArg::named("x", Type::Int)],
                ret: FArg::anon(Type::Int),
                body: None,
            },
            Decl::AxiomDecl(ExprLoc::forall(
                vec![IdType::new("x", Type::Int)],
                ExprLoc::var("x")
                    .gt(ExprLoc::int_lit(0))
                    .implies(ExprLoc::apply("f", vec![ExprLoc::var("x")]).eq(ExprLoc::var("x").plus(ExprLoc::int_lit(1)))),
            )),
        ]);
        let defs = prepared.store.name_definitions("f");
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].formals, vec![IdType::new("x", Type::Int)]);
        assert!(defs[0].guard.is_some());
    }

    #[test]
    fn function_body_becomes_a_definition() {
        let prepared = prepare(vec![Decl::FunctionDecl {
            name: "inc".to_owned(),
            type_args: vec![],
            args: vec![FArg::named("x", Type::Int)],
            ret: FArg::anon(Type::Int),
            body: Some(ExprLoc::var("x").plus(ExprLoc::int_lit(1))),
        }]);
        assert_eq!(prepared.store.name_definitions("inc").len(), 1);
    }

    #[test]
    fn non_definitional_axiom_constrains_free_names() {
        let prepared = prepare(vec![
            Decl::ConstantDecl {
                unique: false,
                names: vec!["K".to_owned()],
                typ: Type::Int,
                order_spec: None,
                complete: false,
            },
            Decl::AxiomDecl(ExprLoc::var("K").gt(ExprLoc::int_lit(10))),
        ]);
        let constraints = prepared.store.name_constraints("K");
        assert_eq!(constraints.len(), 1);
        assert!(constraints[0].bound.is_empty());
    }

    #[test]
    fn quantified_map_fact_defers_on_the_selection_pattern() {
        let prepared = prepare(vec![
            Decl::VarDecl(vec![IdTypeWhere::new("a", Type::map(vec![Type::Int], Type::Int))]),
            Decl::AxiomDecl(ExprLoc::forall(
                vec![IdType::new("i", Type::Int)],
                ExprLoc::var("a").select(vec![ExprLoc::var("i")]).gt(ExprLoc::int_lit(0)),
            )),
        ]);
        let constraints = prepared.store.name_constraints("a");
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].pattern.len(), 1);
        assert_eq!(constraints[0].bound, vec![IdType::new("i", Type::Int)]);
    }

    #[test]
    fn unique_constants_are_pairwise_distinct() {
        let prepared = prepare(vec![Decl::ConstantDecl {
            unique: true,
            names: vec!["red".to_owned(), "green".to_owned(), "blue".to_owned()],
            typ: Type::ident("Color"),
            order_spec: None,
            complete: false,
        }]);
        assert!(prepared.store.name_constraints("red").is_empty());
        assert_eq!(prepared.store.name_constraints("green").len(), 1);
        let blue = prepared.store.name_constraints("blue");
        assert_eq!(blue.len(), 1);
        assert_eq!(blue[0].body.to_string(), "blue != red && blue != green");
    }

    #[test]
    fn procedure_bodies_are_flattened() {
        let prepared = prepare(vec![Decl::ProcedureDecl {
            name: "P".to_owned(),
            type_args: vec![],
            in_params: vec![],
            out_params: vec![],
            contracts: vec![],
            body: Some(Body {
                locals: vec![],
                block: vec![crate::ast::LabeledStmt::plain(crate::ast::StmtLoc::if_stmt(
                    Guard::Wildcard,
                    vec![],
                    None,
                ))],
            }),
        }]);
        let impls = &prepared.implementations["P"];
        assert_eq!(impls.len(), 1);
        assert!(!impls[0].params_renamed);
        assert!(impls[0].blocks.contains_key(crate::flatten::START_LABEL));
    }

    #[test]
    fn implementation_contracts_are_renamed() {
        let prepared = prepare(vec![
            Decl::ProcedureDecl {
                name: "P".to_owned(),
                type_args: vec![],
                in_params: vec![IdTypeWhere::new("x", Type::Int)],
                out_params: vec![],
                contracts: vec![crate::ast::Contract::Requires {
                    free: false,
                    expr: ExprLoc::var("x").geq(ExprLoc::int_lit(0)),
                }],
                body: None,
            },
            Decl::ImplementationDecl {
                name: "P".to_owned(),
                type_args: vec![],
                in_params: vec![IdType::new("y", Type::Int)],
                out_params: vec![],
                bodies: vec![Body {
                    locals: vec![],
                    block: vec![],
                }],
            },
        ]);
        let impls = &prepared.implementations["P"];
        assert!(impls[0].params_renamed);
        assert_eq!(impls[0].requires[0].1.to_string(), "y >= 0");
    }
}
