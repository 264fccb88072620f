//! Interval inference of quantifier domains.
//!
//! Bound integer variables get a finite domain by abstract interpretation of
//! the quantifier body (in negation-prenex normal form): comparisons are
//! linearized into `a*x + b` forms over intervals and solved by interval
//! division; conjunction meets, disjunction joins, and a round-robin
//! fix-point refines all variables until nothing shrinks. Shapes that cannot
//! be linearized leave the variable unconstrained.

use indexmap::IndexMap;
use num_bigint::BigInt;

use crate::{
    ast::{BinOp, Expr, ExprLoc, Id, UnOp},
    interval::{Endpoint, Interval},
    value::Value,
};

/// Internal signal: an expression has no linear form in the variable under
/// refinement. Never escapes domain inference.
struct NotLinear;

/// A linear form `a*x + b` with interval-valued coefficients.
struct LinearForm {
    a: Interval,
    b: Interval,
}

impl LinearForm {
    fn constant(b: Interval) -> Self {
        Self {
            a: Interval::singleton(BigInt::from(0)),
            b,
        }
    }

    fn add(&self, other: &Self) -> Self {
        Self {
            a: self.a.add(&other.a),
            b: self.b.add(&other.b),
        }
    }

    fn negate(&self) -> Self {
        Self {
            a: self.a.negate(),
            b: self.b.negate(),
        }
    }

    fn scale(&self, factor: &Interval) -> Self {
        Self {
            a: self.a.mul(factor),
            b: self.b.mul(factor),
        }
    }
}

/// Current intervals of the bound integer variables.
pub(crate) type IntervalEnv = IndexMap<Id, Interval>;

const MAX_ROUNDS: usize = 100;

/// Refines the domains of `vars` against `body` to a fix-point.
///
/// `eval` evaluates subexpressions that contain no bound variable to a
/// concrete integer (returning `None` when it cannot); evaluation may
/// lazily materialize program variables, exactly as the surrounding
/// quantifier evaluation would.
pub(crate) fn infer_int_domains<F>(body: &ExprLoc, vars: &[Id], eval: &mut F) -> IntervalEnv
where
    F: FnMut(&ExprLoc) -> Option<BigInt>,
{
    let mut env: IntervalEnv = vars.iter().map(|v| (v.clone(), Interval::TOP)).collect();
    for _ in 0..MAX_ROUNDS {
        let mut changed = false;
        for var in vars {
            let refined = refine_var(body, var, &env, eval);
            let current = env.get(var).expect("var seeded").clone();
            let next = current.meet(&refined);
            if next.is_bottom() {
                // one empty domain empties the whole product
                for value in env.values_mut() {
                    *value = Interval::BOTTOM;
                }
                return env;
            }
            if next != current {
                env.insert(var.clone(), next);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    env
}

/// Interval of values of `var` compatible with `body` under `env`.
pub(crate) fn refine_var<F>(body: &ExprLoc, var: &str, env: &IntervalEnv, eval: &mut F) -> Interval
where
    F: FnMut(&ExprLoc) -> Option<BigInt>,
{
    match &body.expr {
        Expr::Literal(Value::Bool(false)) => Interval::BOTTOM,
        Expr::Literal(Value::Bool(true)) => Interval::TOP,
        Expr::Binary(BinOp::And, l, r) => refine_var(l, var, env, eval).meet(&refine_var(r, var, env, eval)),
        Expr::Binary(BinOp::Or, l, r) => refine_var(l, var, env, eval).join(&refine_var(r, var, env, eval)),
        Expr::Binary(op, l, r) => refine_comparison(*op, l, r, var, env, eval),
        _ => Interval::TOP,
    }
}

/// Solves a comparison for `var` via its linear form.
fn refine_comparison<F>(
    op: BinOp,
    lhs: &ExprLoc,
    rhs: &ExprLoc,
    var: &str,
    env: &IntervalEnv,
    eval: &mut F,
) -> Interval
where
    F: FnMut(&ExprLoc) -> Option<BigInt>,
{
    let one = LinearForm::constant(Interval::singleton(BigInt::from(1)));
    // rewrite as `difference <= 0` or `difference == 0`
    let (difference, equality) = match op {
        BinOp::Leq => (linear_sub(lhs, rhs, var, env, eval), false),
        BinOp::Lt => (linear_sub(lhs, rhs, var, env, eval).map(|d| d.add(&one)), false),
        BinOp::Geq => (linear_sub(rhs, lhs, var, env, eval), false),
        BinOp::Gt => (linear_sub(rhs, lhs, var, env, eval).map(|d| d.add(&one)), false),
        BinOp::Eq => (linear_sub(lhs, rhs, var, env, eval), true),
        _ => return Interval::TOP,
    };
    let Ok(form) = difference else {
        return Interval::TOP;
    };
    solve(&form, equality)
}

fn linear_sub<F>(
    lhs: &ExprLoc,
    rhs: &ExprLoc,
    var: &str,
    env: &IntervalEnv,
    eval: &mut F,
) -> Result<LinearForm, NotLinear>
where
    F: FnMut(&ExprLoc) -> Option<BigInt>,
{
    let l = linearize(lhs, var, env, eval)?;
    let r = linearize(rhs, var, env, eval)?;
    Ok(l.add(&r.negate()))
}

/// Solves `a*x + b <= 0` (or `== 0`) for `x`.
fn solve(form: &LinearForm, equality: bool) -> Interval {
    let zero = Endpoint::Fin(BigInt::from(0));
    if form.a.lower == zero && form.a.upper == zero {
        // the variable vanished; the atom is either vacuous or unsatisfiable
        let unsatisfiable = if equality {
            form.b.lower > zero || form.b.upper < zero
        } else {
            form.b.lower > zero
        };
        return if unsatisfiable { Interval::BOTTOM } else { Interval::TOP };
    }
    if form.a.lower <= zero && form.a.upper >= zero {
        return Interval::TOP;
    }
    let quotient = form.b.negate().div_outward(&form.a);
    if equality {
        return quotient;
    }
    if form.a.lower > zero {
        // positive coefficient: x <= (-b)/a
        Interval::new(Endpoint::NegInf, quotient.upper)
    } else {
        // negative coefficient: dividing flips the inequality
        Interval::new(quotient.lower, Endpoint::PosInf)
    }
}

fn linearize<F>(e: &ExprLoc, var: &str, env: &IntervalEnv, eval: &mut F) -> Result<LinearForm, NotLinear>
where
    F: FnMut(&ExprLoc) -> Option<BigInt>,
{
    if !e.mentions(var) {
        return Ok(LinearForm::constant(interval_of(e, env, eval)?));
    }
    match &e.expr {
        Expr::Var(name) if name == var => Ok(LinearForm {
            a: Interval::singleton(BigInt::from(1)),
            b: Interval::singleton(BigInt::from(0)),
        }),
        Expr::Unary(UnOp::Neg, inner) => Ok(linearize(inner, var, env, eval)?.negate()),
        Expr::Binary(BinOp::Plus, l, r) => {
            Ok(linearize(l, var, env, eval)?.add(&linearize(r, var, env, eval)?))
        }
        Expr::Binary(BinOp::Minus, l, r) => {
            Ok(linearize(l, var, env, eval)?.add(&linearize(r, var, env, eval)?.negate()))
        }
        Expr::Binary(BinOp::Times, l, r) => {
            if !l.mentions(var) {
                let factor = interval_of(l, env, eval)?;
                Ok(linearize(r, var, env, eval)?.scale(&factor))
            } else if !r.mentions(var) {
                let factor = interval_of(r, env, eval)?;
                Ok(linearize(l, var, env, eval)?.scale(&factor))
            } else {
                Err(NotLinear)
            }
        }
        _ => Err(NotLinear),
    }
}

/// Interval of an expression not mentioning the variable under refinement:
/// other bound variables contribute their current interval, and closed
/// subexpressions are evaluated outright.
fn interval_of<F>(e: &ExprLoc, env: &IntervalEnv, eval: &mut F) -> Result<Interval, NotLinear>
where
    F: FnMut(&ExprLoc) -> Option<BigInt>,
{
    match &e.expr {
        Expr::Literal(Value::Int(i)) => Ok(Interval::singleton(i.clone())),
        Expr::Var(name) => {
            if let Some(interval) = env.get(name) {
                Ok(interval.clone())
            } else {
                eval(e).map(Interval::singleton).ok_or(NotLinear)
            }
        }
        Expr::Unary(UnOp::Neg, inner) => Ok(interval_of(inner, env, eval)?.negate()),
        Expr::Binary(BinOp::Plus, l, r) => Ok(interval_of(l, env, eval)?.add(&interval_of(r, env, eval)?)),
        Expr::Binary(BinOp::Minus, l, r) => Ok(interval_of(l, env, eval)?.sub(&interval_of(r, env, eval)?)),
        Expr::Binary(BinOp::Times, l, r) => Ok(interval_of(l, env, eval)?.mul(&interval_of(r, env, eval)?)),
        _ => eval(e).map(Interval::singleton).ok_or(NotLinear),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Evaluates closed expressions over literals only.
    fn literal_eval(e: &ExprLoc) -> Option<BigInt> {
        match &e.expr {
            Expr::Literal(Value::Int(i)) => Some(i.clone()),
            Expr::Binary(BinOp::Plus, l, r) => Some(literal_eval(l)? + literal_eval(r)?),
            Expr::Binary(BinOp::Minus, l, r) => Some(literal_eval(l)? - literal_eval(r)?),
            Expr::Binary(BinOp::Times, l, r) => Some(literal_eval(l)? * literal_eval(r)?),
            _ => None,
        }
    }

    fn infer(body: &ExprLoc, vars: &[&str]) -> IntervalEnv {
        let names: Vec<Id> = vars.iter().map(|v| (*v).to_owned()).collect();
        infer_int_domains(body, &names, &mut literal_eval)
    }

    #[test]
    fn bounded_conjunction_yields_exact_interval() {
        // 0 <= i && i < 3  ~~>  i in [0, 2]
        let body = ExprLoc::int_lit(0)
            .leq(ExprLoc::var("i"))
            .and(ExprLoc::var("i").lt(ExprLoc::int_lit(3)));
        let env = infer(&body, &["i"]);
        assert_eq!(env["i"], Interval::bounded(0, 2));
    }

    #[test]
    fn disjunction_joins() {
        // i == 0 || i == 5  ~~>  hull [0, 5]
        let body = ExprLoc::var("i")
            .eq(ExprLoc::int_lit(0))
            .or(ExprLoc::var("i").eq(ExprLoc::int_lit(5)));
        let env = infer(&body, &["i"]);
        assert_eq!(env["i"], Interval::bounded(0, 5));
    }

    #[test]
    fn scaled_variable_divides_through() {
        // 2*i <= 7  ~~>  i <= 3
        let body = ExprLoc::int_lit(2).times(ExprLoc::var("i")).leq(ExprLoc::int_lit(7));
        let env = infer(&body, &["i"]);
        assert_eq!(env["i"].upper, Endpoint::fin(3));
    }

    #[test]
    fn unconstrained_variable_stays_top() {
        let body = ExprLoc::apply("p", vec![ExprLoc::var("i")]);
        let env = infer(&body, &["i"]);
        assert_eq!(env["i"], Interval::TOP);
    }

    #[test]
    fn false_collapses_to_bottom() {
        let body = ExprLoc::bool_lit(false);
        let env = infer(&body, &["i"]);
        assert!(env["i"].is_bottom());
    }

    #[test]
    fn variables_refine_through_each_other() {
        // 0 <= i && i <= j && j <= 4
        let body = ExprLoc::int_lit(0)
            .leq(ExprLoc::var("i"))
            .and(ExprLoc::var("i").leq(ExprLoc::var("j")))
            .and(ExprLoc::var("j").leq(ExprLoc::int_lit(4)));
        let env = infer(&body, &["i", "j"]);
        assert_eq!(env["i"], Interval::bounded(0, 4));
        assert_eq!(env["j"], Interval::bounded(0, 4));
    }

    #[test]
    fn refinement_is_monotone() {
        let body = ExprLoc::int_lit(0)
            .leq(ExprLoc::var("i"))
            .and(ExprLoc::var("i").lt(ExprLoc::int_lit(10)));
        let mut env = IntervalEnv::new();
        env.insert("i".to_owned(), Interval::TOP);
        let first = refine_var(&body, "i", &env, &mut literal_eval);
        env.insert("i".to_owned(), first.clone());
        let second = refine_var(&body, "i", &env, &mut literal_eval);
        assert_eq!(first.meet(&second), second, "a refinement step never enlarges");
    }

    #[test]
    fn contradictory_constant_atom_is_bottom() {
        // 1 <= 0 under a conjunction kills the domain
        let body = ExprLoc::int_lit(1)
            .leq(ExprLoc::int_lit(0))
            .and(ExprLoc::var("i").geq(ExprLoc::int_lit(0)));
        let env = infer(&body, &["i"]);
        assert!(env["i"].is_bottom());
    }
}
