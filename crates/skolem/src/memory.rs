//! Execution stores: locals, globals, old globals, constants and the heap.

use ahash::AHashSet;
use indexmap::IndexMap;

use crate::{
    heap::Heap,
    value::Value,
};

/// A named value store with deterministic iteration order.
pub type Store = IndexMap<String, Value>;

/// Which store a read or write targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Local,
    Global,
    OldGlobal,
    Constant,
}

/// The full mutable state of one execution branch.
///
/// The old store is populated between procedure entry and exit and while an
/// `old(..)` expression is being evaluated; `modified` records the globals
/// assigned or havocked since the current procedure's entry.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Memory {
    pub locals: Store,
    pub globals: Store,
    pub old_globals: Store,
    pub constants: Store,
    pub modified: AHashSet<String>,
    pub heap: Heap,
    in_old: bool,
}

impl Memory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True while evaluation sits inside an `old(..)` scope.
    #[must_use]
    pub fn in_old(&self) -> bool {
        self.in_old
    }

    /// Enters an old-scope, returning the previous flag so nested `old` does
    /// not re-save.
    pub fn enter_old(&mut self) -> bool {
        std::mem::replace(&mut self.in_old, true)
    }

    pub fn exit_old(&mut self, previous: bool) {
        self.in_old = previous;
    }

    #[must_use]
    pub fn store(&self, kind: StoreKind) -> &Store {
        match kind {
            StoreKind::Local => &self.locals,
            StoreKind::Global => &self.globals,
            StoreKind::OldGlobal => &self.old_globals,
            StoreKind::Constant => &self.constants,
        }
    }

    fn store_mut(&mut self, kind: StoreKind) -> &mut Store {
        match kind {
            StoreKind::Local => &mut self.locals,
            StoreKind::Global => &mut self.globals,
            StoreKind::OldGlobal => &mut self.old_globals,
            StoreKind::Constant => &mut self.constants,
        }
    }

    #[must_use]
    pub fn get(&self, kind: StoreKind, name: &str) -> Option<&Value> {
        self.store(kind).get(name)
    }

    /// Stores a value into a slot, maintaining reference counts for both the
    /// stored value and any value it replaces.
    pub fn set(&mut self, kind: StoreKind, name: impl Into<String>, value: Value) {
        self.heap.inc_value(&value);
        let replaced = self.store_mut(kind).insert(name.into(), value);
        if let Some(old) = replaced {
            self.heap.dec_value(&old);
        }
    }

    /// Removes a slot, dropping its reference count contribution.
    pub fn unset(&mut self, kind: StoreKind, name: &str) {
        let removed = self.store_mut(kind).shift_remove(name);
        if let Some(old) = removed {
            self.heap.dec_value(&old);
        }
    }

    /// Swaps in a fresh locals frame, returning the previous one. Counts are
    /// unchanged: the saved frame still holds its slots.
    pub fn swap_locals(&mut self, locals: Store) -> Store {
        std::mem::replace(&mut self.locals, locals)
    }

    /// Drops every slot of a saved frame (on scope exit).
    pub fn drop_frame(&mut self, frame: Store) {
        for (_, value) in frame {
            self.heap.dec_value(&value);
        }
    }

    /// Snapshots the current globals into a fresh old store, returning the
    /// previous old store and modified set (to be restored on exit).
    pub fn save_old(&mut self) -> (Store, AHashSet<String>) {
        let snapshot = self.globals.clone();
        for value in snapshot.values() {
            self.heap.inc_value(value);
        }
        let saved_old = std::mem::replace(&mut self.old_globals, snapshot);
        let saved_modified = std::mem::take(&mut self.modified);
        (saved_old, saved_modified)
    }

    /// Restores the caller's old store at procedure exit.
    ///
    /// The callee's old values are partitioned on the caller's modified set:
    /// a value the caller never touched before the call is clean (it reflects
    /// the state at the caller's own entry) and is kept when the caller has
    /// no old value of its own; everything else is dropped in favor of the
    /// caller's saved store. The modified sets are merged.
    pub fn restore_old(&mut self, saved_old: Store, saved_modified: AHashSet<String>) {
        let callee_old = std::mem::replace(&mut self.old_globals, saved_old);
        for (name, value) in callee_old {
            let clean = !saved_modified.contains(&name) && !self.old_globals.contains_key(&name);
            if clean {
                self.old_globals.insert(name, value);
            } else {
                self.heap.dec_value(&value);
            }
        }
        let callee_modified = std::mem::replace(&mut self.modified, saved_modified);
        self.modified.extend(callee_modified);
    }

    /// Marks a global as modified since procedure entry.
    pub fn mark_modified(&mut self, name: &str) {
        self.modified.insert(name.to_owned());
    }

    /// Renders a value, flattening map references through the heap.
    #[must_use]
    pub fn show_value(&self, value: &Value) -> String {
        match value {
            Value::Ref(id) => {
                let (_, merged) = self.heap.flatten(*id);
                let mut entries: Vec<(&Vec<Value>, &Value)> = merged.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let rendered: Vec<String> = entries
                    .into_iter()
                    .map(|(key, val)| {
                        let keys: Vec<String> = key.iter().map(|k| self.show_value(k)).collect();
                        format!("{keys} -> {val}", keys = keys.join(", "), val = self.show_value(val))
                    })
                    .collect();
                format!("[{entries}]", entries = rendered.join(", "))
            }
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::heap::MapRepr;

    #[test]
    fn set_and_unset_maintain_reference_counts() {
        let mut mem = Memory::new();
        let id = mem.heap.alloc_empty_source();
        mem.set(StoreKind::Local, "m", Value::Ref(id));
        assert_eq!(mem.heap.refcount(id), 1);
        mem.set(StoreKind::Local, "m", Value::int(0));
        assert_eq!(mem.heap.refcount(id), 0);
        mem.unset(StoreKind::Local, "m");
        assert!(mem.get(StoreKind::Local, "m").is_none());
    }

    #[test]
    fn save_old_snapshots_and_counts() {
        let mut mem = Memory::new();
        let id = mem.heap.alloc_empty_source();
        mem.set(StoreKind::Global, "g", Value::Ref(id));
        let (saved_old, saved_modified) = mem.save_old();
        assert!(saved_old.is_empty());
        assert!(saved_modified.is_empty());
        assert_eq!(mem.heap.refcount(id), 2, "global slot plus old slot");
        assert_eq!(mem.get(StoreKind::OldGlobal, "g"), Some(&Value::Ref(id)));
    }

    #[test]
    fn restore_old_keeps_clean_values_and_merges_modified() {
        let mut mem = Memory::new();
        // caller entry: nothing known yet
        let (outer_old, outer_modified) = mem.save_old();
        // the callee materializes g lazily and mirrors it into its old store
        mem.set(StoreKind::Global, "g", Value::int(7));
        let (saved_old, saved_modified) = mem.save_old();
        mem.set(StoreKind::Global, "h", Value::int(1));
        mem.set(StoreKind::OldGlobal, "h", Value::int(1));
        mem.mark_modified("h2");
        mem.restore_old(saved_old, saved_modified);
        // h's old value was clean for the caller too
        assert_eq!(mem.get(StoreKind::OldGlobal, "h"), Some(&Value::int(1)));
        assert_eq!(mem.get(StoreKind::OldGlobal, "g"), Some(&Value::int(7)));
        assert!(mem.modified.contains("h2"));
        mem.restore_old(outer_old, outer_modified);
    }

    #[test]
    fn show_value_flattens_maps() {
        let mut mem = Memory::new();
        let id = mem.heap.alloc_empty_source();
        mem.set(StoreKind::Global, "a", Value::Ref(id));
        mem.heap.store_at_source(id, vec![Value::int(1)], Value::int(14));
        mem.heap.store_at_source(id, vec![Value::int(0)], Value::int(-5));
        assert_eq!(mem.show_value(&Value::Ref(id)), "[0 -> -5, 1 -> 14]");
        assert_eq!(mem.show_value(&Value::Bool(true)), "true");
        // a derived view shows the override
        let derived = mem.heap.derive_with(id, vec![Value::int(0)], Value::int(9));
        mem.set(StoreKind::Global, "b", Value::Ref(derived));
        assert_eq!(mem.show_value(&Value::Ref(derived)), "[0 -> 9, 1 -> 14]");
        assert!(matches!(mem.heap.payload(derived), MapRepr::Derived { .. }));
    }
}
