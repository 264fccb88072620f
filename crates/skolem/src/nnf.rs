//! Rewriting of boolean expressions into negation-prenex normal form.
//!
//! Negations are pushed down to atoms (dualizing quantifiers on the way),
//! `==>`/`<==`/`<==>` are expanded, and quantifiers are hoisted out of
//! conjunctions and disjunctions with capture-avoiding renaming. Negated
//! comparisons stay negation atoms. The quantifier engine requires this form
//! before inferring variable domains.

use ahash::AHashMap;

use crate::ast::{BinOp, Expr, ExprLoc, Id, IdType, QOp, UnOp};

/// Rewrites an expression to negation-prenex normal form, merging adjacent
/// binders of the same kind.
#[must_use]
pub fn normalize(e: &ExprLoc) -> ExprLoc {
    let mut counter = 0u64;
    merge_binders(prenex(negation_nf(e), &mut counter))
}

/// Pushes negations down to atoms, expanding implications and equivalences.
#[must_use]
pub fn negation_nf(e: &ExprLoc) -> ExprLoc {
    let position = e.position;
    let expr = match &e.expr {
        Expr::Unary(UnOp::Not, inner) => return negate(inner),
        Expr::Binary(BinOp::And, l, r) => Expr::Binary(BinOp::And, Box::new(negation_nf(l)), Box::new(negation_nf(r))),
        Expr::Binary(BinOp::Or, l, r) => Expr::Binary(BinOp::Or, Box::new(negation_nf(l)), Box::new(negation_nf(r))),
        Expr::Binary(BinOp::Implies, l, r) => {
            Expr::Binary(BinOp::Or, Box::new(negate(l)), Box::new(negation_nf(r)))
        }
        Expr::Binary(BinOp::Explies, l, r) => {
            Expr::Binary(BinOp::Or, Box::new(negation_nf(l)), Box::new(negate(r)))
        }
        Expr::Binary(BinOp::Equiv, l, r) => {
            // (l ==> r) && (r ==> l)
            let forward = ExprLoc::new(
                position,
                Expr::Binary(BinOp::Or, Box::new(negate(l)), Box::new(negation_nf(r))),
            );
            let backward = ExprLoc::new(
                position,
                Expr::Binary(BinOp::Or, Box::new(negate(r)), Box::new(negation_nf(l))),
            );
            Expr::Binary(BinOp::And, Box::new(forward), Box::new(backward))
        }
        Expr::Quantified {
            op: op @ (QOp::Forall | QOp::Exists),
            type_vars,
            bound,
            body,
        } => Expr::Quantified {
            op: *op,
            type_vars: type_vars.clone(),
            bound: bound.clone(),
            body: Box::new(negation_nf(body)),
        },
        _ => return e.clone(),
    };
    ExprLoc::new(position, expr)
}

/// Produces the negation of `e` in negation normal form.
#[must_use]
pub fn negate(e: &ExprLoc) -> ExprLoc {
    let position = e.position;
    let expr = match &e.expr {
        Expr::Literal(crate::value::Value::Bool(b)) => Expr::Literal(crate::value::Value::Bool(!*b)),
        Expr::Unary(UnOp::Not, inner) => return negation_nf(inner),
        Expr::Binary(BinOp::And, l, r) => Expr::Binary(BinOp::Or, Box::new(negate(l)), Box::new(negate(r))),
        Expr::Binary(BinOp::Or, l, r) => Expr::Binary(BinOp::And, Box::new(negate(l)), Box::new(negate(r))),
        Expr::Binary(BinOp::Implies, l, r) => {
            Expr::Binary(BinOp::And, Box::new(negation_nf(l)), Box::new(negate(r)))
        }
        Expr::Binary(BinOp::Explies, l, r) => {
            Expr::Binary(BinOp::And, Box::new(negate(l)), Box::new(negation_nf(r)))
        }
        Expr::Binary(BinOp::Equiv, l, r) => {
            // exactly one side holds
            let either = ExprLoc::new(
                position,
                Expr::Binary(BinOp::Or, Box::new(negation_nf(l)), Box::new(negation_nf(r))),
            );
            let not_both = ExprLoc::new(
                position,
                Expr::Binary(BinOp::Or, Box::new(negate(l)), Box::new(negate(r))),
            );
            Expr::Binary(BinOp::And, Box::new(either), Box::new(not_both))
        }
        Expr::Quantified {
            op: QOp::Forall,
            type_vars,
            bound,
            body,
        } => Expr::Quantified {
            op: QOp::Exists,
            type_vars: type_vars.clone(),
            bound: bound.clone(),
            body: Box::new(negate(body)),
        },
        Expr::Quantified {
            op: QOp::Exists,
            type_vars,
            bound,
            body,
        } => Expr::Quantified {
            op: QOp::Forall,
            type_vars: type_vars.clone(),
            bound: bound.clone(),
            body: Box::new(negate(body)),
        },
        // remaining atoms (comparisons included) keep an explicit negation
        _ => Expr::Unary(UnOp::Not, Box::new(e.clone())),
    };
    ExprLoc::new(position, expr)
}

struct Binder {
    op: QOp,
    type_vars: Vec<Id>,
    bound: Vec<IdType>,
}

fn split(e: ExprLoc) -> (Vec<Binder>, ExprLoc) {
    let mut binders = Vec::new();
    let mut cur = e;
    loop {
        match cur.expr {
            Expr::Quantified {
                op: op @ (QOp::Forall | QOp::Exists),
                type_vars,
                bound,
                body,
            } => {
                binders.push(Binder {
                    op,
                    type_vars,
                    bound,
                });
                cur = *body;
            }
            _ => return (binders, cur),
        }
    }
}

fn rebuild(binders: Vec<Binder>, matrix: ExprLoc) -> ExprLoc {
    binders.into_iter().rev().fold(matrix, |body, binder| {
        ExprLoc::quantified(binder.op, binder.type_vars, binder.bound, body)
    })
}

/// Renames every variable bound by `binders` to a fresh name, both in the
/// binder list and in the matrix.
fn freshen(binders: &mut [Binder], matrix: ExprLoc, counter: &mut u64) -> ExprLoc {
    let mut renaming: AHashMap<Id, Id> = AHashMap::new();
    for binder in binders.iter_mut() {
        for var in &mut binder.bound {
            let fresh = format!("{name}#{n}", name = var.name, n = *counter);
            *counter += 1;
            renaming.insert(var.name.clone(), fresh.clone());
            var.name = fresh;
        }
    }
    if renaming.is_empty() {
        matrix
    } else {
        matrix.rename_vars(&renaming)
    }
}

/// Hoists quantifiers out of conjunctions and disjunctions. Expects input in
/// negation normal form.
fn prenex(e: ExprLoc, counter: &mut u64) -> ExprLoc {
    let position = e.position;
    match e.expr {
        Expr::Binary(op @ (BinOp::And | BinOp::Or), l, r) => {
            let (mut left_binders, left_matrix) = split(prenex(*l, counter));
            let (mut right_binders, right_matrix) = split(prenex(*r, counter));
            if left_binders.is_empty() && right_binders.is_empty() {
                return ExprLoc::new(position, Expr::Binary(op, Box::new(left_matrix), Box::new(right_matrix)));
            }
            let left_matrix = freshen(&mut left_binders, left_matrix, counter);
            let right_matrix = freshen(&mut right_binders, right_matrix, counter);
            let matrix = ExprLoc::new(position, Expr::Binary(op, Box::new(left_matrix), Box::new(right_matrix)));
            let mut binders = left_binders;
            binders.extend(right_binders);
            rebuild(binders, matrix)
        }
        Expr::Quantified {
            op: op @ (QOp::Forall | QOp::Exists),
            type_vars,
            bound,
            body,
        } => {
            let inner = prenex(*body, counter);
            ExprLoc::new(
                position,
                Expr::Quantified {
                    op,
                    type_vars,
                    bound,
                    body: Box::new(inner),
                },
            )
        }
        expr => ExprLoc::new(position, expr),
    }
}

/// Merges directly nested binders of the same kind, renaming inner variables
/// that would collide with outer ones.
fn merge_binders(e: ExprLoc) -> ExprLoc {
    let position = e.position;
    match e.expr {
        Expr::Quantified {
            op: op @ (QOp::Forall | QOp::Exists),
            mut type_vars,
            mut bound,
            body,
        } => {
            let mut body = merge_binders(*body);
            let mut collision_counter = 0u64;
            loop {
                let inner_position = body.position;
                match body.expr {
                    Expr::Quantified {
                        op: inner_op,
                        type_vars: inner_tvs,
                        bound: mut inner_bound,
                        body: inner_body,
                    } if inner_op == op => {
                        let mut renaming: AHashMap<Id, Id> = AHashMap::new();
                        for var in &mut inner_bound {
                            if bound.iter().any(|outer| outer.name == var.name) {
                                let fresh = format!("{name}##{n}", name = var.name, n = collision_counter);
                                collision_counter += 1;
                                renaming.insert(var.name.clone(), fresh.clone());
                                var.name = fresh;
                            }
                        }
                        let mut inner_body = *inner_body;
                        if !renaming.is_empty() {
                            inner_body = inner_body.rename_vars(&renaming);
                        }
                        type_vars.extend(inner_tvs);
                        bound.extend(inner_bound);
                        body = inner_body;
                    }
                    expr => {
                        body = ExprLoc::new(inner_position, expr);
                        break;
                    }
                }
            }
            ExprLoc::new(
                position,
                Expr::Quantified {
                    op,
                    type_vars,
                    bound,
                    body: Box::new(body),
                },
            )
        }
        expr => ExprLoc::new(position, expr),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ast::Type;

    fn ivar(name: &str) -> ExprLoc {
        ExprLoc::var(name)
    }

    #[test]
    fn implication_becomes_disjunction() {
        let e = ivar("p").implies(ivar("q"));
        assert_eq!(negation_nf(&e).to_string(), "!p || q");
    }

    #[test]
    fn negated_comparison_stays_an_atom() {
        let e = ivar("x").lt(ivar("y")).not();
        assert_eq!(negation_nf(&e).to_string(), "!(x < y)");
    }

    #[test]
    fn double_negation_cancels() {
        let e = ivar("p").not().not();
        assert_eq!(negation_nf(&e).to_string(), "p");
    }

    #[test]
    fn negation_dualizes_quantifiers() {
        let q = ExprLoc::forall(vec![IdType::new("i", Type::Int)], ivar("i").geq(ExprLoc::int_lit(0)));
        let negated = negate(&q);
        assert_eq!(negated.to_string(), "(exists i: int :: !(i >= 0))");
    }

    #[test]
    fn de_morgan() {
        let e = ivar("p").and(ivar("q")).not();
        assert_eq!(negation_nf(&e).to_string(), "!p || !q");
    }

    #[test]
    fn prenex_hoists_and_merges() {
        // (exists i :: p(i)) && (exists j :: q(j))  ~~>  one exists with two binders
        let e = ExprLoc::exists(vec![IdType::new("i", Type::Int)], ExprLoc::apply("p", vec![ivar("i")]))
            .and(ExprLoc::exists(vec![IdType::new("j", Type::Int)], ExprLoc::apply("q", vec![ivar("j")])));
        let normalized = normalize(&e);
        match &normalized.expr {
            Expr::Quantified { op, bound, body, .. } => {
                assert_eq!(*op, QOp::Exists);
                assert_eq!(bound.len(), 2);
                assert!(matches!(body.expr, Expr::Binary(BinOp::And, _, _)));
            }
            other => panic!("expected a quantifier at the root, got {other:?}"),
        }
    }

    #[test]
    fn hoisting_avoids_capture() {
        // (exists i :: p(i)) && r(i)  -- the free `i` on the right must not be captured
        let e = ExprLoc::exists(vec![IdType::new("i", Type::Int)], ExprLoc::apply("p", vec![ivar("i")]))
            .and(ExprLoc::apply("r", vec![ivar("i")]));
        let normalized = normalize(&e);
        match &normalized.expr {
            Expr::Quantified { bound, body, .. } => {
                assert_ne!(bound[0].name, "i");
                let free = body.free_vars();
                assert!(free.contains("i"), "free i must survive: {body}");
            }
            other => panic!("expected a quantifier at the root, got {other:?}"),
        }
    }

    #[test]
    fn forall_equals_negated_exists_negated() {
        // nnf(!(exists i :: !(i >= 0))) == forall i :: i >= 0
        let body = ivar("i").geq(ExprLoc::int_lit(0));
        let via_exists = ExprLoc::exists(vec![IdType::new("i", Type::Int)], body.clone().not()).not();
        let direct = ExprLoc::forall(vec![IdType::new("i", Type::Int)], body);
        assert_eq!(negation_nf(&via_exists), negation_nf(&direct));
    }
}
