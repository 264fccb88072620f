use std::fmt;

use indexmap::IndexMap;

use crate::value::Value;

/// Handle of a map payload stored in the heap arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct HeapId(usize);

impl HeapId {
    /// Returns the raw slot index.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for HeapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{index}", index = self.0)
    }
}

/// Partial mapping from key tuples to values, insertion-ordered.
pub type MapStore = IndexMap<Vec<Value>, Value>;

/// Representation of one map payload.
///
/// A `Source` owns an explicit partial mapping. A `Derived` payload is a view
/// of a base reference with a private override mapping on top; chains of
/// `Derived` payloads are acyclic by construction, so dereferencing always
/// terminates.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum MapRepr {
    Source(MapStore),
    Derived { base: HeapId, overrides: MapStore },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct HeapEntry {
    refcount: usize,
    payload: MapRepr,
}

/// Snapshot of heap occupancy at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of live entries.
    pub live_entries: usize,
    /// Number of free (recycled) slots available for reuse.
    pub free_slots: usize,
    /// Total arena capacity (live + free).
    pub total_slots: usize,
}

/// Reference-counted arena of map payloads.
///
/// The count of an entry is the number of *stored* locations that reach it:
/// store slots holding its `Ref`, `Derived` payloads whose base it is, and
/// values held inside map payloads. A freshly allocated entry starts at zero
/// and is expected to be stored (or left for collection) by the caller.
///
/// Dropping the count to zero does not free the entry; unreferenced entries
/// are reclaimed by [`Heap::collect_garbage`], which the statement evaluator
/// runs at statement boundaries. This keeps temporaries created mid-statement
/// alive without counting them.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct Heap {
    entries: Vec<Option<HeapEntry>>,
    free_list: Vec<HeapId>,
}

impl Heap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a new entry with a reference count of zero.
    pub fn alloc(&mut self, payload: MapRepr) -> HeapId {
        let entry = HeapEntry { refcount: 0, payload };
        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = HeapId(self.entries.len());
            self.entries.push(Some(entry));
            id
        }
    }

    /// Allocates an empty source map.
    pub fn alloc_empty_source(&mut self) -> HeapId {
        self.alloc(MapRepr::Source(MapStore::new()))
    }

    fn entry(&self, id: HeapId) -> &HeapEntry {
        self.entries
            .get(id.index())
            .expect("Heap::entry: slot missing")
            .as_ref()
            .expect("Heap::entry: entry already freed")
    }

    fn entry_mut(&mut self, id: HeapId) -> &mut HeapEntry {
        self.entries
            .get_mut(id.index())
            .expect("Heap::entry_mut: slot missing")
            .as_mut()
            .expect("Heap::entry_mut: entry already freed")
    }

    /// Returns the payload stored at the given ID.
    ///
    /// # Panics
    /// Panics if the ID is invalid or the entry has been freed.
    #[must_use]
    pub fn payload(&self, id: HeapId) -> &MapRepr {
        &self.entry(id).payload
    }

    /// Returns the current reference count of a live entry.
    #[must_use]
    pub fn refcount(&self, id: HeapId) -> usize {
        self.entry(id).refcount
    }

    /// Increments the reference count for a newly stored occurrence.
    pub fn inc_ref(&mut self, id: HeapId) {
        self.entry_mut(id).refcount += 1;
    }

    /// Decrements the reference count for a dropped occurrence.
    ///
    /// The entry is kept alive even at count zero; reclamation happens in
    /// [`Heap::collect_garbage`].
    ///
    /// # Panics
    /// Panics if the count is already zero, which indicates unbalanced
    /// bookkeeping in the caller.
    pub fn dec_ref(&mut self, id: HeapId) {
        let entry = self.entry_mut(id);
        assert!(entry.refcount > 0, "Heap::dec_ref: count already zero for {id}");
        entry.refcount -= 1;
    }

    /// Increments the count if the value is a map reference.
    pub fn inc_value(&mut self, value: &Value) {
        if let Value::Ref(id) = value {
            self.inc_ref(*id);
        }
    }

    /// Decrements the count if the value is a map reference.
    pub fn dec_value(&mut self, value: &Value) {
        if let Value::Ref(id) = value {
            self.dec_ref(*id);
        }
    }

    /// Resolves a reference to its ultimate source.
    #[must_use]
    pub fn source_of(&self, id: HeapId) -> HeapId {
        let mut cur = id;
        loop {
            match self.payload(cur) {
                MapRepr::Source(_) => return cur,
                MapRepr::Derived { base, .. } => cur = *base,
            }
        }
    }

    /// Flattens a derived chain to `(ultimate source, merged key-value view)`.
    ///
    /// The nearest override wins for keys defined at several levels; the
    /// source's own mapping is the outermost layer.
    #[must_use]
    pub fn flatten(&self, id: HeapId) -> (HeapId, MapStore) {
        let mut merged = MapStore::new();
        let mut cur = id;
        loop {
            match self.payload(cur) {
                MapRepr::Derived { base, overrides } => {
                    for (key, value) in overrides {
                        merged.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                    cur = *base;
                }
                MapRepr::Source(store) => {
                    for (key, value) in store {
                        merged.entry(key.clone()).or_insert_with(|| value.clone());
                    }
                    return (cur, merged);
                }
            }
        }
    }

    /// Stores a key-value pair directly into a source payload, maintaining
    /// the counts of stored reference values.
    ///
    /// # Panics
    /// Panics if `source` does not hold a `Source` payload.
    pub fn store_at_source(&mut self, source: HeapId, key: Vec<Value>, value: Value) {
        self.inc_value(&value);
        let entry = self.entry_mut(source);
        let MapRepr::Source(store) = &mut entry.payload else {
            panic!("Heap::store_at_source: {source} is not a source");
        };
        let replaced = store.insert(key, value);
        if let Some(old) = replaced {
            self.dec_value(&old);
        }
    }

    /// Removes a key from a source payload, dropping the count of the stored
    /// value.
    ///
    /// # Panics
    /// Panics if `source` does not hold a `Source` payload.
    pub fn remove_at_source(&mut self, source: HeapId, key: &[Value]) -> Option<Value> {
        let entry = self.entry_mut(source);
        let MapRepr::Source(store) = &mut entry.payload else {
            panic!("Heap::remove_at_source: {source} is not a source");
        };
        let removed = store.shift_remove(key);
        if let Some(old) = &removed {
            self.dec_value(old);
        }
        removed
    }

    /// Allocates the update `base[key := value]` as a fresh derived payload.
    ///
    /// A source base gains a single-entry override child; a derived base has
    /// its override mapping extended (the new payload shares the same base).
    pub fn derive_with(&mut self, base: HeapId, key: Vec<Value>, value: Value) -> HeapId {
        let (chain_base, mut overrides) = match self.payload(base) {
            MapRepr::Source(_) => (base, MapStore::new()),
            MapRepr::Derived { base: inner, overrides } => (*inner, overrides.clone()),
        };
        // The new payload stores fresh copies of every carried override value.
        for carried in overrides.values().cloned().collect::<Vec<_>>() {
            self.inc_value(&carried);
        }
        self.inc_value(&value);
        if let Some(old) = overrides.insert(key, value) {
            self.dec_value(&old);
        }
        let id = self.alloc(MapRepr::Derived { base: chain_base, overrides });
        self.inc_ref(chain_base);
        id
    }

    /// Unifies two distinct sources under a fresh source holding `merged`.
    ///
    /// Both old sources become derived views of the fresh source, keeping
    /// their former mappings as override deltas so that existing derived
    /// descendants observe unchanged values. Returns the fresh source.
    ///
    /// # Panics
    /// Panics if either ID does not hold a `Source` payload, or if the two
    /// IDs coincide.
    pub fn unify_sources(&mut self, s1: HeapId, s2: HeapId, merged: MapStore) -> HeapId {
        assert_ne!(s1, s2, "Heap::unify_sources: sources coincide");
        for value in merged.values().cloned().collect::<Vec<_>>() {
            self.inc_value(&value);
        }
        let fresh = self.alloc(MapRepr::Source(merged));
        for old in [s1, s2] {
            let entry = self.entry_mut(old);
            let MapRepr::Source(store) = &mut entry.payload else {
                panic!("Heap::unify_sources: {old} is not a source");
            };
            let delta = std::mem::take(store);
            entry.payload = MapRepr::Derived { base: fresh, overrides: delta };
            self.inc_ref(fresh);
        }
        fresh
    }

    /// Reclaims every entry with a zero reference count, transitively.
    ///
    /// Freeing an entry drops its stored occurrences: the count of its
    /// derived base (if any) and of every reference value held in its
    /// mapping. Returns the freed IDs so callers can drop side tables.
    pub fn collect_garbage(&mut self) -> Vec<HeapId> {
        let mut freed = Vec::new();
        loop {
            let dead: Vec<HeapId> = self
                .entries
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| match slot {
                    Some(entry) if entry.refcount == 0 => Some(HeapId(index)),
                    _ => None,
                })
                .collect();
            if dead.is_empty() {
                return freed;
            }
            for id in dead {
                let entry = self.entries[id.index()].take().expect("Heap::collect_garbage: entry vanished");
                self.free_list.push(id);
                let store = match entry.payload {
                    MapRepr::Source(store) => store,
                    MapRepr::Derived { base, overrides } => {
                        self.dec_ref(base);
                        overrides
                    }
                };
                for value in store.values() {
                    if let Value::Ref(child) = value {
                        self.dec_ref(*child);
                    }
                }
                freed.push(id);
            }
        }
    }

    /// Returns an occupancy snapshot.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let live_entries = self.entries.iter().filter(|slot| slot.is_some()).count();
        HeapStats {
            live_entries,
            free_slots: self.free_list.len(),
            total_slots: self.entries.len(),
        }
    }

    /// Iterates over live entry IDs, in slot order.
    pub fn live_ids(&self) -> impl Iterator<Item = HeapId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|_| HeapId(index)))
    }
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{live} live, {free} free of {total} slots",
            live = self.live_entries,
            free = self.free_slots,
            total = self.total_slots
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: i64) -> Vec<Value> {
        vec![Value::int(i)]
    }

    #[test]
    fn alloc_starts_unreferenced_and_gc_reclaims() {
        let mut heap = Heap::new();
        let id = heap.alloc_empty_source();
        assert_eq!(heap.refcount(id), 0);
        let freed = heap.collect_garbage();
        assert_eq!(freed, vec![id]);
        assert_eq!(heap.stats().live_entries, 0);
        assert_eq!(heap.stats().free_slots, 1);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new();
        let first = heap.alloc_empty_source();
        heap.collect_garbage();
        let second = heap.alloc_empty_source();
        assert_eq!(first, second);
        assert_eq!(heap.stats().total_slots, 1);
    }

    #[test]
    fn derive_extends_overrides_without_lengthening_the_chain() {
        let mut heap = Heap::new();
        let source = heap.alloc_empty_source();
        heap.inc_ref(source);
        heap.store_at_source(source, key(0), Value::int(10));
        let d1 = heap.derive_with(source, key(1), Value::int(11));
        heap.inc_ref(d1);
        let d2 = heap.derive_with(d1, key(2), Value::int(12));
        heap.inc_ref(d2);

        match heap.payload(d2) {
            MapRepr::Derived { base, overrides } => {
                assert_eq!(*base, source);
                assert_eq!(overrides.len(), 2);
            }
            MapRepr::Source(_) => panic!("update produced a source"),
        }

        let (src, merged) = heap.flatten(d2);
        assert_eq!(src, source);
        assert_eq!(merged[&key(0)], Value::int(10));
        assert_eq!(merged[&key(1)], Value::int(11));
        assert_eq!(merged[&key(2)], Value::int(12));
    }

    #[test]
    fn nearest_override_wins_when_flattening() {
        let mut heap = Heap::new();
        let source = heap.alloc_empty_source();
        heap.inc_ref(source);
        heap.store_at_source(source, key(0), Value::int(1));
        let derived = heap.derive_with(source, key(0), Value::int(2));
        heap.inc_ref(derived);
        let (_, merged) = heap.flatten(derived);
        assert_eq!(merged[&key(0)], Value::int(2));
        // the base itself is unaffected
        let (_, base_view) = heap.flatten(source);
        assert_eq!(base_view[&key(0)], Value::int(1));
    }

    #[test]
    fn gc_cascades_through_bases_and_stored_references() {
        let mut heap = Heap::new();
        let inner = heap.alloc_empty_source();
        let outer = heap.alloc_empty_source();
        heap.inc_ref(outer);
        // outer[0] := inner, so inner is kept alive by a stored value
        heap.store_at_source(outer, key(0), Value::Ref(inner));
        let derived = heap.derive_with(outer, key(1), Value::int(1));
        heap.inc_ref(derived);

        assert!(heap.collect_garbage().is_empty());

        // dropping both roots frees the whole structure
        heap.dec_ref(outer);
        heap.dec_ref(derived);
        let freed = heap.collect_garbage();
        assert_eq!(freed.len(), 3);
        assert_eq!(heap.stats().live_entries, 0);
    }

    #[test]
    fn unify_redirects_old_sources_and_preserves_views() {
        let mut heap = Heap::new();
        let s1 = heap.alloc_empty_source();
        heap.inc_ref(s1);
        heap.store_at_source(s1, key(0), Value::int(5));
        let s2 = heap.alloc_empty_source();
        heap.inc_ref(s2);
        heap.store_at_source(s2, key(1), Value::int(7));

        let mut merged = MapStore::new();
        merged.insert(key(0), Value::int(5));
        merged.insert(key(1), Value::int(7));
        let fresh = heap.unify_sources(s1, s2, merged);

        // both old sources now resolve to the fresh source and agree everywhere
        for old in [s1, s2] {
            let (src, view) = heap.flatten(old);
            assert_eq!(src, fresh);
            assert_eq!(view[&key(0)], Value::int(5));
            assert_eq!(view[&key(1)], Value::int(7));
        }
        assert_eq!(heap.refcount(fresh), 2);
    }

    #[test]
    fn refcount_invariant_after_update_chains() {
        let mut heap = Heap::new();
        let source = heap.alloc_empty_source();
        heap.inc_ref(source); // one slot
        let d1 = heap.derive_with(source, key(0), Value::int(0));
        heap.inc_ref(d1); // one slot
        // source: 1 slot + 1 derived base
        assert_eq!(heap.refcount(source), 2);
        heap.dec_ref(d1);
        heap.collect_garbage();
        assert_eq!(heap.refcount(source), 1);
    }
}
