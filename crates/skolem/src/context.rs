//! The type context accompanying a type-checked program.
//!
//! The external type checker guarantees the program is well-typed; this
//! module only carries the signature tables the interpreter needs to resolve
//! names, instantiate polymorphic signatures and synthesize the type of an
//! expression (for lazy value generation). [`Context::from_program`] builds
//! the tables a checker would hand over, which is convenient for hosts that
//! construct programs directly.

use ahash::{AHashMap, AHashSet};
use indexmap::IndexMap;

use crate::ast::{Contract, Decl, Expr, ExprLoc, Id, IdTypeWhere, Program, QOp, Type, UnOp};

/// A binding of type variable names to types.
pub type TypeSubst = AHashMap<Id, Type>;

/// Signature of a declared function.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FSig {
    pub type_vars: Vec<Id>,
    pub args: Vec<Type>,
    pub ret: Type,
}

impl FSig {
    /// The map type of the associated function constant.
    #[must_use]
    pub fn map_type(&self) -> Type {
        Type::Map {
            type_vars: self.type_vars.clone(),
            domains: self.args.clone(),
            range: Box::new(self.ret.clone()),
        }
    }
}

/// Signature and contract of a declared procedure.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PSig {
    pub type_vars: Vec<Id>,
    pub ins: Vec<IdTypeWhere>,
    pub outs: Vec<IdTypeWhere>,
    pub contracts: Vec<Contract>,
}

impl PSig {
    /// Preconditions as `(free, expr)` pairs, in declaration order.
    pub fn requires(&self) -> impl Iterator<Item = (bool, &ExprLoc)> {
        self.contracts.iter().filter_map(|c| match c {
            Contract::Requires { free, expr } => Some((*free, expr)),
            _ => None,
        })
    }

    /// Postconditions as `(free, expr)` pairs, in declaration order.
    pub fn ensures(&self) -> impl Iterator<Item = (bool, &ExprLoc)> {
        self.contracts.iter().filter_map(|c| match c {
            Contract::Ensures { free, expr } => Some((*free, expr)),
            _ => None,
        })
    }

    /// Union of all modifies clauses.
    #[must_use]
    pub fn modifies(&self) -> Vec<Id> {
        let mut out = Vec::new();
        for c in &self.contracts {
            if let Contract::Modifies(names) = c {
                for name in names {
                    if !out.contains(name) {
                        out.push(name.clone());
                    }
                }
            }
        }
        out
    }
}

/// Which store a name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    Local,
    Global,
    Constant,
    /// The map constant associated with a declared function.
    Function,
}

/// Signature tables plus the scoped state the interpreter threads through
/// procedure and quantifier scopes.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Context {
    pub type_constructors: AHashMap<Id, usize>,
    pub type_synonyms: AHashMap<Id, (Vec<Id>, Type)>,
    pub globals: IndexMap<Id, Type>,
    pub constants: IndexMap<Id, Type>,
    pub functions: AHashMap<Id, FSig>,
    pub procedures: AHashMap<Id, PSig>,
    locals: IndexMap<Id, Type>,
    type_vars: Vec<Id>,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the context tables a type checker would produce for `program`.
    #[must_use]
    pub fn from_program(program: &Program) -> Self {
        let mut ctx = Self::new();
        for decl in &program.decls {
            match &decl.decl {
                Decl::TypeDecl(defs) => {
                    for def in defs {
                        match &def.synonym {
                            Some(typ) => {
                                ctx.type_synonyms.insert(def.name.clone(), (def.args.clone(), typ.clone()));
                            }
                            None => {
                                ctx.type_constructors.insert(def.name.clone(), def.args.len());
                            }
                        }
                    }
                }
                Decl::ConstantDecl { names, typ, .. } => {
                    for name in names {
                        ctx.constants.insert(name.clone(), typ.clone());
                    }
                }
                Decl::FunctionDecl {
                    name,
                    type_args,
                    args,
                    ret,
                    ..
                } => {
                    ctx.functions.insert(
                        name.clone(),
                        FSig {
                            type_vars: type_args.clone(),
                            args: args.iter().map(|a| a.typ.clone()).collect(),
                            ret: ret.typ.clone(),
                        },
                    );
                }
                Decl::AxiomDecl(_) => {}
                Decl::VarDecl(vars) => {
                    for var in vars {
                        ctx.globals.insert(var.name.clone(), var.typ.clone());
                    }
                }
                Decl::ProcedureDecl {
                    name,
                    type_args,
                    in_params,
                    out_params,
                    contracts,
                    ..
                } => {
                    ctx.procedures.insert(
                        name.clone(),
                        PSig {
                            type_vars: type_args.clone(),
                            ins: in_params.clone(),
                            outs: out_params.clone(),
                            contracts: contracts.clone(),
                        },
                    );
                }
                Decl::ImplementationDecl { .. } => {}
            }
        }
        ctx
    }

    // -------------------------------------------------------------------------
    // Scoped state
    // -------------------------------------------------------------------------

    /// Replaces the local type table, returning the previous one.
    pub fn swap_locals(&mut self, locals: IndexMap<Id, Type>) -> IndexMap<Id, Type> {
        std::mem::replace(&mut self.locals, locals)
    }

    pub fn set_local(&mut self, name: impl Into<Id>, typ: Type) {
        self.locals.insert(name.into(), typ);
    }

    /// Shadows a local binding (for quantified scopes); returns the previous
    /// binding so the caller can restore it.
    pub fn shadow_local(&mut self, name: &str, typ: Type) -> Option<Type> {
        self.locals.insert(name.to_owned(), typ)
    }

    pub fn restore_local(&mut self, name: &str, previous: Option<Type>) {
        match previous {
            Some(typ) => {
                self.locals.insert(name.to_owned(), typ);
            }
            None => {
                self.locals.shift_remove(name);
            }
        }
    }

    /// Binds quantifier type variables; returns the depth to pop back to.
    pub fn push_type_vars(&mut self, names: &[Id]) -> usize {
        let depth = self.type_vars.len();
        self.type_vars.extend(names.iter().cloned());
        depth
    }

    pub fn pop_type_vars(&mut self, depth: usize) {
        self.type_vars.truncate(depth);
    }

    #[must_use]
    pub fn is_type_var(&self, name: &str) -> bool {
        self.type_vars.iter().any(|tv| tv == name)
    }

    // -------------------------------------------------------------------------
    // Name and type resolution
    // -------------------------------------------------------------------------

    /// Resolves a name to the store it lives in and its declared type.
    /// Locals shadow globals, which shadow constants; function constants come
    /// last.
    #[must_use]
    pub fn resolve_name(&self, name: &str) -> Option<(NameKind, Type)> {
        if let Some(typ) = self.locals.get(name) {
            return Some((NameKind::Local, typ.clone()));
        }
        if let Some(typ) = self.globals.get(name) {
            return Some((NameKind::Global, typ.clone()));
        }
        if let Some(typ) = self.constants.get(name) {
            return Some((NameKind::Constant, typ.clone()));
        }
        if let Some(sig) = self.functions.get(name) {
            return Some((NameKind::Function, sig.map_type()));
        }
        None
    }

    /// Expands type synonyms until a constructor, map, or primitive appears.
    #[must_use]
    pub fn resolve(&self, typ: &Type) -> Type {
        match typ {
            Type::Ident { name, args } => {
                if let Some((params, body)) = self.type_synonyms.get(name) {
                    let mut subst = TypeSubst::new();
                    for (param, arg) in params.iter().zip(args) {
                        subst.insert(param.clone(), self.resolve(arg));
                    }
                    self.resolve(&substitute(&subst, body))
                } else {
                    Type::Ident {
                        name: name.clone(),
                        args: args.iter().map(|a| self.resolve(a)).collect(),
                    }
                }
            }
            Type::Map {
                type_vars,
                domains,
                range,
            } => Type::Map {
                type_vars: type_vars.clone(),
                domains: domains.iter().map(|d| self.resolve(d)).collect(),
                range: Box::new(self.resolve(range)),
            },
            primitive => primitive.clone(),
        }
    }

    /// Synthesizes the type of a well-typed expression, instantiating
    /// polymorphic signatures from the argument types. Returns `None` for
    /// shapes the checker would have rejected or that carry no static type
    /// (reference literals).
    #[must_use]
    pub fn type_of(&self, e: &ExprLoc) -> Option<Type> {
        match &e.expr {
            Expr::Literal(v) => match v {
                crate::value::Value::Bool(_) => Some(Type::Bool),
                crate::value::Value::Int(_) => Some(Type::Int),
                crate::value::Value::Custom(c) => Some(Type::ident(c.type_name.clone())),
                crate::value::Value::Ref(_) | crate::value::Value::UnderConstruction(_) => None,
            },
            Expr::Var(name) => self.resolve_name(name).map(|(_, typ)| typ),
            Expr::Application(name, args) => {
                let sig = self.functions.get(name)?;
                if sig.type_vars.is_empty() {
                    return Some(sig.ret.clone());
                }
                let arg_types: Option<Vec<Type>> = args.iter().map(|a| self.type_of(a)).collect();
                let subst = self.match_all(&sig.type_vars, &sig.args, &arg_types?)?;
                Some(substitute(&subst, &sig.ret))
            }
            Expr::MapSelection(map, args) => {
                let map_type = self.resolve(&self.type_of(map)?);
                let Type::Map {
                    type_vars,
                    domains,
                    range,
                } = map_type
                else {
                    return None;
                };
                if type_vars.is_empty() {
                    return Some(*range);
                }
                let arg_types: Option<Vec<Type>> = args.iter().map(|a| self.type_of(a)).collect();
                let subst = self.match_all(&type_vars, &domains, &arg_types?)?;
                Some(substitute(&subst, &range))
            }
            Expr::MapUpdate(map, _, _) => self.type_of(map),
            Expr::Old(inner) => self.type_of(inner),
            Expr::Coercion(_, typ) => Some(typ.clone()),
            Expr::IfExpr { then, .. } => self.type_of(then),
            Expr::Unary(UnOp::Neg, _) => Some(Type::Int),
            Expr::Unary(UnOp::Not, _) => Some(Type::Bool),
            Expr::Binary(op, _, _) => {
                use crate::ast::BinOp;
                match op {
                    BinOp::Plus | BinOp::Minus | BinOp::Times | BinOp::Div | BinOp::Mod => Some(Type::Int),
                    _ => Some(Type::Bool),
                }
            }
            Expr::Quantified { op, bound, body, .. } => match op {
                QOp::Forall | QOp::Exists => Some(Type::Bool),
                QOp::Lambda => {
                    let domains = bound.iter().map(|b| b.typ.clone()).collect();
                    Some(Type::Map {
                        type_vars: Vec::new(),
                        domains,
                        range: Box::new(self.type_of(body)?),
                    })
                }
            },
        }
    }

    /// Matches a list of pattern types against concrete types, binding only
    /// the given type variables. Returns `None` on mismatch.
    #[must_use]
    pub fn match_all(&self, type_vars: &[Id], patterns: &[Type], concrete: &[Type]) -> Option<TypeSubst> {
        if patterns.len() != concrete.len() {
            return None;
        }
        let bindable: AHashSet<Id> = type_vars.iter().cloned().collect();
        let mut subst = TypeSubst::new();
        for (pattern, actual) in patterns.iter().zip(concrete) {
            self.match_into(&bindable, pattern, actual, &mut subst)?;
        }
        Some(subst)
    }

    fn match_into(&self, bindable: &AHashSet<Id>, pattern: &Type, actual: &Type, subst: &mut TypeSubst) -> Option<()> {
        let pattern = self.resolve(pattern);
        let actual = self.resolve(actual);
        match (&pattern, &actual) {
            (Type::Ident { name, args }, _) if args.is_empty() && bindable.contains(name) => {
                match subst.get(name) {
                    Some(bound) if *bound == actual => Some(()),
                    Some(_) => None,
                    None => {
                        subst.insert(name.clone(), actual.clone());
                        Some(())
                    }
                }
            }
            (Type::Bool, Type::Bool) | (Type::Int, Type::Int) => Some(()),
            (
                Type::Ident { name: n1, args: a1 },
                Type::Ident { name: n2, args: a2 },
            ) => {
                if n1 != n2 || a1.len() != a2.len() {
                    return None;
                }
                for (x, y) in a1.iter().zip(a2) {
                    self.match_into(bindable, x, y, subst)?;
                }
                Some(())
            }
            (
                Type::Map {
                    type_vars: tv1,
                    domains: d1,
                    range: r1,
                },
                Type::Map {
                    type_vars: tv2,
                    domains: d2,
                    range: r2,
                },
            ) => {
                if tv1.len() != tv2.len() || d1.len() != d2.len() {
                    return None;
                }
                // align the bound variables of the two map types, and stop
                // them from binding anything in the enclosing match
                let mut renaming = TypeSubst::new();
                for (a, b) in tv2.iter().zip(tv1) {
                    renaming.insert(a.clone(), Type::ident(b.clone()));
                }
                let mut inner_bindable = bindable.clone();
                for tv in tv1 {
                    inner_bindable.remove(tv);
                }
                for (x, y) in d1.iter().zip(d2) {
                    self.match_into(&inner_bindable, x, &substitute(&renaming, y), subst)?;
                }
                self.match_into(&inner_bindable, r1, &substitute(&renaming, r2), subst)
            }
            _ => None,
        }
    }
}

/// Applies a type substitution, respecting map-bound type variables.
#[must_use]
pub fn substitute(subst: &TypeSubst, typ: &Type) -> Type {
    match typ {
        Type::Bool => Type::Bool,
        Type::Int => Type::Int,
        Type::Ident { name, args } => {
            if args.is_empty()
                && let Some(replacement) = subst.get(name)
            {
                replacement.clone()
            } else {
                Type::Ident {
                    name: name.clone(),
                    args: args.iter().map(|a| substitute(subst, a)).collect(),
                }
            }
        }
        Type::Map {
            type_vars,
            domains,
            range,
        } => {
            let mut inner = subst.clone();
            for tv in type_vars {
                inner.remove(tv);
            }
            Type::Map {
                type_vars: type_vars.clone(),
                domains: domains.iter().map(|d| substitute(&inner, d)).collect(),
                range: Box::new(substitute(&inner, range)),
            }
        }
    }
}
