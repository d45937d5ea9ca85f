//! Bounded LRU cache for decoded atoms.

use crate::model::atom::{Atom, AtomId};
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_CAPACITY: usize = 2048;

/// Least-recently-used cache keyed by atom id.
///
/// Recency is a monotonically increasing tick; the smallest tick is evicted.
#[derive(Debug)]
pub(crate) struct AtomCache {
    capacity: usize,
    tick: u64,
    entries: HashMap<AtomId, (u64, Atom)>,
    recency: BTreeMap<u64, AtomId>,
}

impl AtomCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            tick: 0,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    pub fn get(&mut self, id: &AtomId) -> Option<Atom> {
        let tick = self.next_tick();
        let (stamp, atom) = self.entries.get_mut(id)?;
        self.recency.remove(stamp);
        *stamp = tick;
        self.recency.insert(tick, *id);
        Some(atom.clone())
    }

    pub fn put(&mut self, atom: Atom) {
        let tick = self.next_tick();
        let id = atom.id;
        if let Some((old_tick, _)) = self.entries.insert(id, (tick, atom)) {
            self.recency.remove(&old_tick);
        }
        self.recency.insert(tick, id);

        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    /// Drops a cached entry so the next read reloads it.
    pub fn invalidate(&mut self, id: &AtomId) {
        if let Some((tick, _)) = self.entries.remove(id) {
            self.recency.remove(&tick);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

#[cfg(test)]
mod tests {
    use super::AtomCache;
    use crate::model::atom::{Atom, NewAtom};
    use chrono::Utc;
    use serde_json::Value;

    fn atom(text: &str) -> Atom {
        let normalized = NewAtom::text(text).normalized();
        let content = normalized.content.clone();
        Atom::from_normalized(
            Atom::new_id(),
            normalized,
            content,
            String::new(),
            Utc::now(),
            Value::Null,
        )
    }

    #[test]
    fn evicts_least_recently_used_entry() {
        let mut cache = AtomCache::new(2);
        let first = atom("first");
        let second = atom("second");
        let third = atom("third");

        cache.put(first.clone());
        cache.put(second.clone());
        assert!(cache.get(&first.id).is_some());
        cache.put(third.clone());

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&second.id).is_none());
        assert!(cache.get(&first.id).is_some());
        assert!(cache.get(&third.id).is_some());
    }

    #[test]
    fn reinserting_refreshes_without_growing() {
        let mut cache = AtomCache::new(2);
        let first = atom("first");
        cache.put(first.clone());
        cache.put(first.clone());
        assert_eq!(cache.len(), 1);
        cache.invalidate(&first.id);
        assert!(cache.get(&first.id).is_none());
    }
}
