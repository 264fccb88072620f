//! Abstract syntax of type-checked Boogie 2 programs.
//!
//! The external parser and type checker produce this representation; the
//! interpreter never sees source text. Every node carries the [`Pos`] of the
//! construct it came from so failures can point back at it. Construction
//! helpers build nodes at [`Pos::NONE`]; `.at(pos)` attaches a real position.

use ahash::AHashSet;
use num_bigint::BigInt;

use crate::{pos::Pos, value::Value};

/// An identifier: variable, constant, function, procedure, label or type name.
pub type Id = String;

// =============================================================================
// Types
// =============================================================================

/// A Boogie type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Type {
    Bool,
    Int,
    /// Map type `<type_vars>[domains]range`.
    Map {
        type_vars: Vec<Id>,
        domains: Vec<Type>,
        range: Box<Type>,
    },
    /// Named type: a user type constructor application, a type synonym, or a
    /// type variable (an `Ident` without arguments whose name is bound by an
    /// enclosing scope).
    Ident { name: Id, args: Vec<Type> },
}

impl Type {
    #[must_use]
    pub fn ident(name: impl Into<Id>) -> Self {
        Self::Ident {
            name: name.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn map(domains: Vec<Self>, range: Self) -> Self {
        Self::Map {
            type_vars: Vec::new(),
            domains,
            range: Box::new(range),
        }
    }

    #[must_use]
    pub fn is_map(&self) -> bool {
        matches!(self, Self::Map { .. })
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool => write!(f, "bool"),
            Self::Int => write!(f, "int"),
            Self::Map { type_vars, domains, range } => {
                if !type_vars.is_empty() {
                    write!(f, "<{vars}>", vars = type_vars.join(", "))?;
                }
                write!(f, "[")?;
                for (i, d) in domains.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{d}")?;
                }
                write!(f, "]{range}")
            }
            Self::Ident { name, args } => {
                write!(f, "{name}")?;
                for arg in args {
                    let atomic = matches!(arg, Self::Bool | Self::Int)
                        || matches!(arg, Self::Ident { args, .. } if args.is_empty());
                    if atomic {
                        write!(f, " {arg}")?;
                    } else {
                        write!(f, " ({arg})")?;
                    }
                }
                Ok(())
            }
        }
    }
}

// =============================================================================
// Expressions
// =============================================================================

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UnOp {
    /// Arithmetic negation.
    Neg,
    /// Logical negation.
    Not,
}

/// Binary operators. Arithmetic is over unbounded integers with Euclidean
/// division; `Explies` is reverse implication (`<==`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BinOp {
    Plus,
    Minus,
    Times,
    Div,
    Mod,
    And,
    Or,
    Implies,
    Explies,
    Equiv,
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    /// Partial-order operator `<:`; not executable.
    Lc,
}

impl BinOp {
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Times => "*",
            Self::Div => "div",
            Self::Mod => "mod",
            Self::And => "&&",
            Self::Or => "||",
            Self::Implies => "==>",
            Self::Explies => "<==",
            Self::Equiv => "<==>",
            Self::Eq => "==",
            Self::Neq => "!=",
            Self::Lt => "<",
            Self::Leq => "<=",
            Self::Gt => ">",
            Self::Geq => ">=",
            Self::Lc => "<:",
        }
    }

    fn precedence(self) -> u8 {
        match self {
            Self::Equiv => 1,
            Self::Implies | Self::Explies => 2,
            Self::Or => 3,
            Self::And => 4,
            Self::Eq | Self::Neq | Self::Lt | Self::Leq | Self::Gt | Self::Geq | Self::Lc => 5,
            Self::Plus | Self::Minus => 6,
            Self::Times | Self::Div | Self::Mod => 7,
        }
    }
}

/// Quantifier kinds. Lambdas share the binder syntax but are not executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum QOp {
    Forall,
    Exists,
    Lambda,
}

impl QOp {
    #[must_use]
    pub fn token(self) -> &'static str {
        match self {
            Self::Forall => "forall",
            Self::Exists => "exists",
            Self::Lambda => "lambda",
        }
    }
}

/// A name paired with its declared type.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IdType {
    pub name: Id,
    pub typ: Type,
}

impl IdType {
    #[must_use]
    pub fn new(name: impl Into<Id>, typ: Type) -> Self {
        Self { name: name.into(), typ }
    }
}

/// An expression node.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Expr {
    /// A literal run-time value. The parser produces booleans and integers;
    /// the interpreter also synthesizes custom-tagged and reference literals
    /// when it turns evaluated values back into expressions.
    Literal(Value),
    Var(Id),
    /// Function application `f(args)`.
    Application(Id, Vec<ExprLoc>),
    /// Map selection `m[args]`.
    MapSelection(Box<ExprLoc>, Vec<ExprLoc>),
    /// Map update `m[args := value]`.
    MapUpdate(Box<ExprLoc>, Vec<ExprLoc>, Box<ExprLoc>),
    /// Old-scope expression `old(e)`.
    Old(Box<ExprLoc>),
    /// Conditional expression `if cond then a else b`.
    IfExpr {
        cond: Box<ExprLoc>,
        then: Box<ExprLoc>,
        els: Box<ExprLoc>,
    },
    /// Type coercion `e : T`; a static annotation, the identity at run time.
    Coercion(Box<ExprLoc>, Type),
    Unary(UnOp, Box<ExprLoc>),
    Binary(BinOp, Box<ExprLoc>, Box<ExprLoc>),
    Quantified {
        op: QOp,
        type_vars: Vec<Id>,
        bound: Vec<IdType>,
        body: Box<ExprLoc>,
    },
}

/// An expression with its source position.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExprLoc {
    pub position: Pos,
    pub expr: Expr,
}

impl ExprLoc {
    #[must_use]
    pub fn new(position: Pos, expr: Expr) -> Self {
        Self { position, expr }
    }

    /// Rebinds the position, keeping the expression.
    #[must_use]
    pub fn at(mut self, position: Pos) -> Self {
        self.position = position;
        self
    }

    #[must_use]
    pub fn bool_lit(b: bool) -> Self {
        Self::new(Pos::NONE, Expr::Literal(Value::Bool(b)))
    }

    #[must_use]
    pub fn int_lit(i: i64) -> Self {
        Self::new(Pos::NONE, Expr::Literal(Value::int(i)))
    }

    #[must_use]
    pub fn bigint_lit(i: BigInt) -> Self {
        Self::new(Pos::NONE, Expr::Literal(Value::Int(i)))
    }

    #[must_use]
    pub fn literal(v: Value) -> Self {
        Self::new(Pos::NONE, Expr::Literal(v))
    }

    #[must_use]
    pub fn var(name: impl Into<Id>) -> Self {
        Self::new(Pos::NONE, Expr::Var(name.into()))
    }

    #[must_use]
    pub fn apply(name: impl Into<Id>, args: Vec<Self>) -> Self {
        Self::new(Pos::NONE, Expr::Application(name.into(), args))
    }

    #[must_use]
    pub fn select(self, args: Vec<Self>) -> Self {
        let position = self.position;
        Self::new(position, Expr::MapSelection(Box::new(self), args))
    }

    #[must_use]
    pub fn update(self, args: Vec<Self>, value: Self) -> Self {
        let position = self.position;
        Self::new(position, Expr::MapUpdate(Box::new(self), args, Box::new(value)))
    }

    #[must_use]
    pub fn old(self) -> Self {
        let position = self.position;
        Self::new(position, Expr::Old(Box::new(self)))
    }

    #[must_use]
    pub fn ite(cond: Self, then: Self, els: Self) -> Self {
        let position = cond.position;
        Self::new(
            position,
            Expr::IfExpr {
                cond: Box::new(cond),
                then: Box::new(then),
                els: Box::new(els),
            },
        )
    }

    #[must_use]
    pub fn coerce(self, typ: Type) -> Self {
        let position = self.position;
        Self::new(position, Expr::Coercion(Box::new(self), typ))
    }

    #[must_use]
    pub fn unary(op: UnOp, operand: Self) -> Self {
        let position = operand.position;
        Self::new(position, Expr::Unary(op, Box::new(operand)))
    }

    #[must_use]
    pub fn binary(op: BinOp, lhs: Self, rhs: Self) -> Self {
        let position = lhs.position;
        Self::new(position, Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    #[must_use]
    pub fn quantified(op: QOp, type_vars: Vec<Id>, bound: Vec<IdType>, body: Self) -> Self {
        let position = body.position;
        Self::new(
            position,
            Expr::Quantified {
                op,
                type_vars,
                bound,
                body: Box::new(body),
            },
        )
    }

    #[must_use]
    pub fn forall(bound: Vec<IdType>, body: Self) -> Self {
        Self::quantified(QOp::Forall, Vec::new(), bound, body)
    }

    #[must_use]
    pub fn exists(bound: Vec<IdType>, body: Self) -> Self {
        Self::quantified(QOp::Exists, Vec::new(), bound, body)
    }

    #[must_use]
    pub fn not(self) -> Self {
        Self::unary(UnOp::Not, self)
    }

    #[must_use]
    pub fn neg(self) -> Self {
        Self::unary(UnOp::Neg, self)
    }

    #[must_use]
    pub fn and(self, rhs: Self) -> Self {
        Self::binary(BinOp::And, self, rhs)
    }

    #[must_use]
    pub fn or(self, rhs: Self) -> Self {
        Self::binary(BinOp::Or, self, rhs)
    }

    #[must_use]
    pub fn implies(self, rhs: Self) -> Self {
        Self::binary(BinOp::Implies, self, rhs)
    }

    #[must_use]
    pub fn eq(self, rhs: Self) -> Self {
        Self::binary(BinOp::Eq, self, rhs)
    }

    #[must_use]
    pub fn neq(self, rhs: Self) -> Self {
        Self::binary(BinOp::Neq, self, rhs)
    }

    #[must_use]
    pub fn lt(self, rhs: Self) -> Self {
        Self::binary(BinOp::Lt, self, rhs)
    }

    #[must_use]
    pub fn leq(self, rhs: Self) -> Self {
        Self::binary(BinOp::Leq, self, rhs)
    }

    #[must_use]
    pub fn gt(self, rhs: Self) -> Self {
        Self::binary(BinOp::Gt, self, rhs)
    }

    #[must_use]
    pub fn geq(self, rhs: Self) -> Self {
        Self::binary(BinOp::Geq, self, rhs)
    }

    #[must_use]
    pub fn plus(self, rhs: Self) -> Self {
        Self::binary(BinOp::Plus, self, rhs)
    }

    #[must_use]
    pub fn minus(self, rhs: Self) -> Self {
        Self::binary(BinOp::Minus, self, rhs)
    }

    #[must_use]
    pub fn times(self, rhs: Self) -> Self {
        Self::binary(BinOp::Times, self, rhs)
    }

    #[must_use]
    pub fn div(self, rhs: Self) -> Self {
        Self::binary(BinOp::Div, self, rhs)
    }

    #[must_use]
    pub fn modulo(self, rhs: Self) -> Self {
        Self::binary(BinOp::Mod, self, rhs)
    }

    /// Collects the free variable names of the expression.
    #[must_use]
    pub fn free_vars(&self) -> AHashSet<Id> {
        let mut out = AHashSet::new();
        self.collect_free_vars(&mut Vec::new(), &mut out);
        out
    }

    fn collect_free_vars(&self, shadowed: &mut Vec<Id>, out: &mut AHashSet<Id>) {
        match &self.expr {
            Expr::Literal(_) => {}
            Expr::Var(name) => {
                if !shadowed.iter().any(|s| s == name) {
                    out.insert(name.clone());
                }
            }
            Expr::Application(_, args) => {
                for arg in args {
                    arg.collect_free_vars(shadowed, out);
                }
            }
            Expr::MapSelection(map, args) => {
                map.collect_free_vars(shadowed, out);
                for arg in args {
                    arg.collect_free_vars(shadowed, out);
                }
            }
            Expr::MapUpdate(map, args, value) => {
                map.collect_free_vars(shadowed, out);
                for arg in args {
                    arg.collect_free_vars(shadowed, out);
                }
                value.collect_free_vars(shadowed, out);
            }
            Expr::Old(inner) | Expr::Coercion(inner, _) | Expr::Unary(_, inner) => {
                inner.collect_free_vars(shadowed, out);
            }
            Expr::IfExpr { cond, then, els } => {
                cond.collect_free_vars(shadowed, out);
                then.collect_free_vars(shadowed, out);
                els.collect_free_vars(shadowed, out);
            }
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_free_vars(shadowed, out);
                rhs.collect_free_vars(shadowed, out);
            }
            Expr::Quantified { bound, body, .. } => {
                let depth = shadowed.len();
                shadowed.extend(bound.iter().map(|b| b.name.clone()));
                body.collect_free_vars(shadowed, out);
                shadowed.truncate(depth);
            }
        }
    }

    /// True when `name` occurs free in the expression.
    #[must_use]
    pub fn mentions(&self, name: &str) -> bool {
        self.free_vars().contains(name)
    }

    /// Renames free variable occurrences according to `map`, respecting
    /// quantifier shadowing.
    #[must_use]
    pub fn rename_vars(&self, map: &ahash::AHashMap<Id, Id>) -> Self {
        let expr = match &self.expr {
            Expr::Literal(v) => Expr::Literal(v.clone()),
            Expr::Var(name) => Expr::Var(map.get(name).cloned().unwrap_or_else(|| name.clone())),
            Expr::Application(name, args) => {
                Expr::Application(name.clone(), args.iter().map(|a| a.rename_vars(map)).collect())
            }
            Expr::MapSelection(m, args) => Expr::MapSelection(
                Box::new(m.rename_vars(map)),
                args.iter().map(|a| a.rename_vars(map)).collect(),
            ),
            Expr::MapUpdate(m, args, value) => Expr::MapUpdate(
                Box::new(m.rename_vars(map)),
                args.iter().map(|a| a.rename_vars(map)).collect(),
                Box::new(value.rename_vars(map)),
            ),
            Expr::Old(inner) => Expr::Old(Box::new(inner.rename_vars(map))),
            Expr::IfExpr { cond, then, els } => Expr::IfExpr {
                cond: Box::new(cond.rename_vars(map)),
                then: Box::new(then.rename_vars(map)),
                els: Box::new(els.rename_vars(map)),
            },
            Expr::Coercion(inner, typ) => Expr::Coercion(Box::new(inner.rename_vars(map)), typ.clone()),
            Expr::Unary(op, inner) => Expr::Unary(*op, Box::new(inner.rename_vars(map))),
            Expr::Binary(op, lhs, rhs) => {
                Expr::Binary(*op, Box::new(lhs.rename_vars(map)), Box::new(rhs.rename_vars(map)))
            }
            Expr::Quantified {
                op,
                type_vars,
                bound,
                body,
            } => {
                // bound names shadow the renaming inside the body
                let mut inner_map = map.clone();
                for b in bound {
                    inner_map.remove(&b.name);
                }
                Expr::Quantified {
                    op: *op,
                    type_vars: type_vars.clone(),
                    bound: bound.clone(),
                    body: Box::new(body.rename_vars(&inner_map)),
                }
            }
        };
        Self::new(self.position, expr)
    }

    fn write_prec(&self, f: &mut std::fmt::Formatter<'_>, required: u8) -> std::fmt::Result {
        let own = self.precedence();
        if own < required {
            write!(f, "(")?;
            self.write_prec(f, 0)?;
            return write!(f, ")");
        }
        match &self.expr {
            Expr::Literal(v) => write!(f, "{v}"),
            Expr::Var(name) => write!(f, "{name}"),
            Expr::Application(name, args) => {
                write!(f, "{name}(")?;
                write_comma_separated(f, args)?;
                write!(f, ")")
            }
            Expr::MapSelection(m, args) => {
                m.write_prec(f, 9)?;
                write!(f, "[")?;
                write_comma_separated(f, args)?;
                write!(f, "]")
            }
            Expr::MapUpdate(m, args, value) => {
                m.write_prec(f, 9)?;
                write!(f, "[")?;
                write_comma_separated(f, args)?;
                write!(f, " := ")?;
                value.write_prec(f, 0)?;
                write!(f, "]")
            }
            Expr::Old(inner) => {
                write!(f, "old(")?;
                inner.write_prec(f, 0)?;
                write!(f, ")")
            }
            Expr::IfExpr { cond, then, els } => {
                write!(f, "if ")?;
                cond.write_prec(f, 1)?;
                write!(f, " then ")?;
                then.write_prec(f, 1)?;
                write!(f, " else ")?;
                els.write_prec(f, 0)
            }
            Expr::Coercion(inner, typ) => {
                inner.write_prec(f, 9)?;
                write!(f, ": {typ}")
            }
            Expr::Unary(op, inner) => {
                match op {
                    UnOp::Neg => write!(f, "-")?,
                    UnOp::Not => write!(f, "!")?,
                }
                inner.write_prec(f, 8)
            }
            Expr::Binary(op, lhs, rhs) => {
                let p = op.precedence();
                // comparisons and implications do not chain; everything else
                // associates to the left
                let (lp, rp) = match op {
                    BinOp::Implies => (p + 1, p),
                    BinOp::Equiv | BinOp::Eq | BinOp::Neq | BinOp::Lt | BinOp::Leq | BinOp::Gt | BinOp::Geq
                    | BinOp::Lc => (p + 1, p + 1),
                    _ => (p, p + 1),
                };
                lhs.write_prec(f, lp)?;
                write!(f, " {token} ", token = op.token())?;
                rhs.write_prec(f, rp)
            }
            Expr::Quantified {
                op,
                type_vars,
                bound,
                body,
            } => {
                write!(f, "({token} ", token = op.token())?;
                if !type_vars.is_empty() {
                    write!(f, "<{vars}> ", vars = type_vars.join(", "))?;
                }
                for (i, b) in bound.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {typ}", name = b.name, typ = b.typ)?;
                }
                write!(f, " :: ")?;
                body.write_prec(f, 0)?;
                write!(f, ")")
            }
        }
    }

    fn precedence(&self) -> u8 {
        match &self.expr {
            Expr::Binary(op, _, _) => op.precedence(),
            Expr::IfExpr { .. } => 0,
            Expr::Unary(_, _) => 8,
            _ => 9,
        }
    }
}

fn write_comma_separated(f: &mut std::fmt::Formatter<'_>, items: &[ExprLoc]) -> std::fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        item.write_prec(f, 0)?;
    }
    Ok(())
}

impl std::fmt::Display for ExprLoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.write_prec(f, 0)
    }
}

// =============================================================================
// Specification clauses
// =============================================================================

/// Where a specification clause comes from; determines the word used when a
/// violation is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, serde::Serialize, serde::Deserialize)]
pub enum SpecKind {
    #[strum(serialize = "Assertion")]
    Inline,
    Precondition,
    Postcondition,
    #[strum(serialize = "Loop invariant")]
    LoopInvariant,
    #[strum(serialize = "Where clause")]
    Where,
    Axiom,
}

/// A specification clause. Free clauses are assumed; checked clauses are
/// asserted. Axiom and where clauses are always free.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SpecClause {
    pub kind: SpecKind,
    pub free: bool,
    pub expr: ExprLoc,
}

impl SpecClause {
    #[must_use]
    pub fn new(kind: SpecKind, free: bool, expr: ExprLoc) -> Self {
        Self { kind, free, expr }
    }

    /// A checked inline assertion.
    #[must_use]
    pub fn assertion(expr: ExprLoc) -> Self {
        Self::new(SpecKind::Inline, false, expr)
    }

    /// A free inline assumption.
    #[must_use]
    pub fn assumption(expr: ExprLoc) -> Self {
        Self::new(SpecKind::Inline, true, expr)
    }
}

// =============================================================================
// Statements
// =============================================================================

/// The guard of an `if` or `while`: an expression, or the wildcard `*`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Guard {
    Wildcard,
    Expr(ExprLoc),
}

/// One left-hand side of an assignment: a name and zero or more map index
/// tuples (`a[i][j] := v` has two tuples).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct AssignTarget {
    pub name: Id,
    pub indexes: Vec<Vec<ExprLoc>>,
}

impl AssignTarget {
    #[must_use]
    pub fn var(name: impl Into<Id>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    #[must_use]
    pub fn indexed(name: impl Into<Id>, indexes: Vec<Vec<ExprLoc>>) -> Self {
        Self {
            name: name.into(),
            indexes,
        }
    }
}

/// A statement. `Goto` and `Return` appear in source programs only as the
/// result of flattening; structured statements (`If`, `While`, `Break`)
/// appear only before it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Stmt {
    /// `assert e;` or `assume e;` depending on the clause's free flag.
    Predicate(SpecClause),
    Havoc(Vec<Id>),
    Assign {
        targets: Vec<AssignTarget>,
        rhss: Vec<ExprLoc>,
    },
    Call {
        lhss: Vec<Id>,
        callee: Id,
        args: Vec<ExprLoc>,
    },
    If {
        guard: Guard,
        then_branch: Block,
        else_branch: Option<Block>,
    },
    While {
        guard: Guard,
        invariants: Vec<SpecClause>,
        body: Block,
    },
    /// `break;` or `break label;`.
    Break(Option<Id>),
    Goto(Vec<Id>),
    Return,
    Skip,
}

/// A statement with its source position.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StmtLoc {
    pub position: Pos,
    pub stmt: Stmt,
}

impl StmtLoc {
    #[must_use]
    pub fn new(position: Pos, stmt: Stmt) -> Self {
        Self { position, stmt }
    }

    #[must_use]
    pub fn at(mut self, position: Pos) -> Self {
        self.position = position;
        self
    }

    #[must_use]
    pub fn predicate(clause: SpecClause) -> Self {
        let position = clause.expr.position;
        Self::new(position, Stmt::Predicate(clause))
    }

    #[must_use]
    pub fn assertion(expr: ExprLoc) -> Self {
        Self::predicate(SpecClause::assertion(expr))
    }

    #[must_use]
    pub fn assumption(expr: ExprLoc) -> Self {
        Self::predicate(SpecClause::assumption(expr))
    }

    #[must_use]
    pub fn havoc(names: Vec<Id>) -> Self {
        Self::new(Pos::NONE, Stmt::Havoc(names))
    }

    #[must_use]
    pub fn assign(name: impl Into<Id>, rhs: ExprLoc) -> Self {
        let position = rhs.position;
        Self::new(
            position,
            Stmt::Assign {
                targets: vec![AssignTarget::var(name)],
                rhss: vec![rhs],
            },
        )
    }

    #[must_use]
    pub fn assign_indexed(name: impl Into<Id>, indexes: Vec<Vec<ExprLoc>>, rhs: ExprLoc) -> Self {
        let position = rhs.position;
        Self::new(
            position,
            Stmt::Assign {
                targets: vec![AssignTarget::indexed(name, indexes)],
                rhss: vec![rhs],
            },
        )
    }

    #[must_use]
    pub fn call(lhss: Vec<Id>, callee: impl Into<Id>, args: Vec<ExprLoc>) -> Self {
        Self::new(
            Pos::NONE,
            Stmt::Call {
                lhss,
                callee: callee.into(),
                args,
            },
        )
    }

    #[must_use]
    pub fn if_stmt(guard: Guard, then_branch: Block, else_branch: Option<Block>) -> Self {
        Self::new(
            Pos::NONE,
            Stmt::If {
                guard,
                then_branch,
                else_branch,
            },
        )
    }

    #[must_use]
    pub fn while_stmt(guard: Guard, invariants: Vec<SpecClause>, body: Block) -> Self {
        Self::new(
            Pos::NONE,
            Stmt::While {
                guard,
                invariants,
                body,
            },
        )
    }

    #[must_use]
    pub fn break_stmt(label: Option<Id>) -> Self {
        Self::new(Pos::NONE, Stmt::Break(label))
    }

    #[must_use]
    pub fn goto(labels: Vec<Id>) -> Self {
        Self::new(Pos::NONE, Stmt::Goto(labels))
    }

    #[must_use]
    pub fn ret() -> Self {
        Self::new(Pos::NONE, Stmt::Return)
    }

    #[must_use]
    pub fn skip() -> Self {
        Self::new(Pos::NONE, Stmt::Skip)
    }
}

/// A statement with the labels attached to it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LabeledStmt {
    pub labels: Vec<Id>,
    pub stmt: StmtLoc,
}

impl LabeledStmt {
    #[must_use]
    pub fn plain(stmt: StmtLoc) -> Self {
        Self {
            labels: Vec::new(),
            stmt,
        }
    }

    #[must_use]
    pub fn labeled(label: impl Into<Id>, stmt: StmtLoc) -> Self {
        Self {
            labels: vec![label.into()],
            stmt,
        }
    }
}

/// A structured statement sequence.
pub type Block = Vec<LabeledStmt>;

// =============================================================================
// Declarations
// =============================================================================

/// A declared variable with an optional where-clause, an implicit assumption
/// checked when the variable is first materialized.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IdTypeWhere {
    pub name: Id,
    pub typ: Type,
    pub where_clause: Option<ExprLoc>,
}

impl IdTypeWhere {
    #[must_use]
    pub fn new(name: impl Into<Id>, typ: Type) -> Self {
        Self {
            name: name.into(),
            typ,
            where_clause: None,
        }
    }

    #[must_use]
    pub fn with_where(mut self, clause: ExprLoc) -> Self {
        self.where_clause = Some(clause);
        self
    }

    #[must_use]
    pub fn id_type(&self) -> IdType {
        IdType::new(self.name.clone(), self.typ.clone())
    }
}

/// A function argument: optionally named, always typed.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FArg {
    pub name: Option<Id>,
    pub typ: Type,
}

impl FArg {
    #[must_use]
    pub fn named(name: impl Into<Id>, typ: Type) -> Self {
        Self {
            name: Some(name.into()),
            typ,
        }
    }

    #[must_use]
    pub fn anon(typ: Type) -> Self {
        Self { name: None, typ }
    }
}

/// One procedure contract clause.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Contract {
    Requires { free: bool, expr: ExprLoc },
    Modifies(Vec<Id>),
    Ensures { free: bool, expr: ExprLoc },
}

/// A type declaration: a fresh constructor (arity = `args.len()`) or a
/// synonym when `synonym` is present.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TypeDef {
    pub name: Id,
    pub args: Vec<Id>,
    pub synonym: Option<Type>,
}

/// An edge in a constant's parent order (`extends` clauses). Stored for
/// completeness; partial orders are not executable.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ParentEdge {
    pub unique: bool,
    pub parent: Id,
}

/// An implementation body: local declarations plus a structured block.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Body {
    pub locals: Vec<IdTypeWhere>,
    pub block: Block,
}

/// A top-level declaration.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Decl {
    TypeDecl(Vec<TypeDef>),
    ConstantDecl {
        unique: bool,
        names: Vec<Id>,
        typ: Type,
        order_spec: Option<Vec<ParentEdge>>,
        complete: bool,
    },
    FunctionDecl {
        name: Id,
        type_args: Vec<Id>,
        args: Vec<FArg>,
        ret: FArg,
        body: Option<ExprLoc>,
    },
    AxiomDecl(ExprLoc),
    VarDecl(Vec<IdTypeWhere>),
    ProcedureDecl {
        name: Id,
        type_args: Vec<Id>,
        in_params: Vec<IdTypeWhere>,
        out_params: Vec<IdTypeWhere>,
        contracts: Vec<Contract>,
        body: Option<Body>,
    },
    ImplementationDecl {
        name: Id,
        type_args: Vec<Id>,
        in_params: Vec<IdType>,
        out_params: Vec<IdType>,
        bodies: Vec<Body>,
    },
}

/// A declaration with its source position.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DeclLoc {
    pub position: Pos,
    pub decl: Decl,
}

impl DeclLoc {
    #[must_use]
    pub fn new(position: Pos, decl: Decl) -> Self {
        Self { position, decl }
    }
}

/// A type-checked program: an ordered list of top-level declarations.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Program {
    pub decls: Vec<DeclLoc>,
}

impl Program {
    #[must_use]
    pub fn new(decls: Vec<Decl>) -> Self {
        Self {
            decls: decls.into_iter().map(|d| DeclLoc::new(Pos::NONE, d)).collect(),
        }
    }

    /// Serializes the program to a compact binary format.
    pub fn dump(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Restores a program serialized with [`Program::dump`].
    pub fn load(data: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(data)
    }
}
