//! The abstract constraint store.
//!
//! Axioms, function bodies and where-clauses are compiled into *definitions*
//! (guarded equalities that can produce a value for an entity) and
//! *constraints* (boolean predicates a materialized value must satisfy).
//! Both are recorded per name; when a map-typed name materializes into a
//! heap reference, its set is copied onto the reference's source, where map
//! selection consults it key by key.

use ahash::AHashMap;

use crate::{
    ast::{ExprLoc, Id, IdType, SpecKind},
    heap::HeapId,
    pos::Pos,
};

/// A guarded, argument-formalized equality: `guard(formals) ==>
/// entity(formals) == body(formals)`. Plain names have no formals.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Definition {
    pub type_vars: Vec<Id>,
    pub formals: Vec<IdType>,
    pub guard: Option<ExprLoc>,
    pub body: ExprLoc,
    pub position: Pos,
}

/// A boolean predicate attached to an entity.
///
/// A closed constraint (`bound` empty) is assumed outright when the entity
/// materializes. A deferred constraint carries the bound variables of its
/// originating quantifier and the argument pattern of the map selection or
/// function application it was attached through; selection instantiates the
/// pattern against the concrete key and assumes the rest.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Constraint {
    pub type_vars: Vec<Id>,
    pub bound: Vec<IdType>,
    pub pattern: Vec<ExprLoc>,
    pub body: ExprLoc,
    pub kind: SpecKind,
    pub position: Pos,
}

impl Constraint {
    /// A closed constraint on a plain name.
    #[must_use]
    pub fn closed(body: ExprLoc, kind: SpecKind, position: Pos) -> Self {
        Self {
            type_vars: Vec::new(),
            bound: Vec::new(),
            pattern: Vec::new(),
            body,
            kind,
            position,
        }
    }
}

/// Definitions and constraints known for one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConstraintSet {
    pub definitions: Vec<Definition>,
    pub constraints: Vec<Constraint>,
}

impl ConstraintSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty() && self.constraints.is_empty()
    }

    pub fn extend(&mut self, other: Self) {
        self.definitions.extend(other.definitions);
        self.constraints.extend(other.constraints);
    }
}

/// Per-name and per-reference constraint storage.
///
/// Name entries live in two layers: the global layer built by preprocessing
/// (axioms, global where-clauses, function bodies) and a local layer the
/// statement evaluator swaps in and out around procedure scopes (parameter
/// and local where-clauses).
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ConstraintStore {
    names: AHashMap<Id, ConstraintSet>,
    local_names: AHashMap<Id, ConstraintSet>,
    refs: AHashMap<HeapId, ConstraintSet>,
}

impl ConstraintStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_name_definition(&mut self, name: impl Into<Id>, definition: Definition) {
        self.names.entry(name.into()).or_default().definitions.push(definition);
    }

    pub fn add_name_constraint(&mut self, name: impl Into<Id>, constraint: Constraint) {
        self.names.entry(name.into()).or_default().constraints.push(constraint);
    }

    /// Adds a constraint to the local layer; dropped when the scope exits.
    pub fn add_local_constraint(&mut self, name: impl Into<Id>, constraint: Constraint) {
        self.local_names
            .entry(name.into())
            .or_default()
            .constraints
            .push(constraint);
    }

    /// Replaces the local layer, returning the previous one.
    pub fn swap_locals(&mut self, locals: AHashMap<Id, ConstraintSet>) -> AHashMap<Id, ConstraintSet> {
        std::mem::replace(&mut self.local_names, locals)
    }

    /// All definitions for a name, local layer first.
    #[must_use]
    pub fn name_definitions(&self, name: &str) -> Vec<Definition> {
        let mut out = Vec::new();
        if let Some(set) = self.local_names.get(name) {
            out.extend(set.definitions.iter().cloned());
        }
        if let Some(set) = self.names.get(name) {
            out.extend(set.definitions.iter().cloned());
        }
        out
    }

    /// All constraints for a name, local layer first.
    #[must_use]
    pub fn name_constraints(&self, name: &str) -> Vec<Constraint> {
        let mut out = Vec::new();
        if let Some(set) = self.local_names.get(name) {
            out.extend(set.constraints.iter().cloned());
        }
        if let Some(set) = self.names.get(name) {
            out.extend(set.constraints.iter().cloned());
        }
        out
    }

    /// The set to copy onto a fresh reference when a map-typed name
    /// materializes. The name keeps its entry: a havocked and re-materialized
    /// map is constrained anew.
    #[must_use]
    pub fn name_set(&self, name: &str) -> ConstraintSet {
        ConstraintSet {
            definitions: self.name_definitions(name),
            constraints: self.name_constraints(name),
        }
    }

    pub fn attach_to_ref(&mut self, id: HeapId, set: ConstraintSet) {
        if set.is_empty() {
            return;
        }
        self.refs.entry(id).or_default().extend(set);
    }

    #[must_use]
    pub fn ref_definitions(&self, id: HeapId) -> Vec<Definition> {
        self.refs.get(&id).map(|set| set.definitions.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn ref_constraints(&self, id: HeapId) -> Vec<Constraint> {
        self.refs.get(&id).map(|set| set.constraints.clone()).unwrap_or_default()
    }

    /// Moves the sets of two unified sources onto the fresh source replacing
    /// them.
    pub fn merge_refs(&mut self, s1: HeapId, s2: HeapId, fresh: HeapId) {
        let mut merged = self.refs.remove(&s1).unwrap_or_default();
        merged.extend(self.refs.remove(&s2).unwrap_or_default());
        if !merged.is_empty() {
            self.refs.insert(fresh, merged);
        }
    }

    /// Drops the set of a garbage-collected reference.
    pub fn drop_ref(&mut self, id: HeapId) {
        self.refs.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Heap;

    fn definition(body: ExprLoc) -> Definition {
        Definition {
            type_vars: Vec::new(),
            formals: Vec::new(),
            guard: None,
            body,
            position: Pos::NONE,
        }
    }

    #[test]
    fn local_layer_shadows_and_unwinds() {
        let mut store = ConstraintStore::new();
        store.add_name_constraint("x", Constraint::closed(ExprLoc::var("x"), SpecKind::Axiom, Pos::NONE));
        let saved = store.swap_locals(AHashMap::new());
        store.add_local_constraint("x", Constraint::closed(ExprLoc::var("x"), SpecKind::Where, Pos::NONE));
        assert_eq!(store.name_constraints("x").len(), 2);
        assert_eq!(store.name_constraints("x")[0].kind, SpecKind::Where);
        store.swap_locals(saved);
        assert_eq!(store.name_constraints("x").len(), 1);
    }

    #[test]
    fn name_set_is_copied_not_moved() {
        let mut store = ConstraintStore::new();
        store.add_name_definition("f", definition(ExprLoc::int_lit(1)));
        let set = store.name_set("f");
        assert_eq!(set.definitions.len(), 1);
        assert_eq!(store.name_definitions("f").len(), 1, "the name keeps its definitions");
    }

    #[test]
    fn merge_refs_concatenates_sets() {
        let mut heap = Heap::new();
        let a = heap.alloc_empty_source();
        let b = heap.alloc_empty_source();
        let fresh = heap.alloc_empty_source();
        let mut store = ConstraintStore::new();
        store.attach_to_ref(
            a,
            ConstraintSet {
                definitions: vec![definition(ExprLoc::int_lit(1))],
                constraints: vec![],
            },
        );
        store.attach_to_ref(
            b,
            ConstraintSet {
                definitions: vec![definition(ExprLoc::int_lit(2))],
                constraints: vec![],
            },
        );
        store.merge_refs(a, b, fresh);
        assert_eq!(store.ref_definitions(fresh).len(), 2);
        assert!(store.ref_definitions(a).is_empty());
    }
}
