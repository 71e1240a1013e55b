use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, SystemTime};

struct Aged<V> {
    touched: SystemTime,
    value: V,
}

/// A `HashMap` whose entries remember when they were last touched, so the
/// oldest can be expired.
///
/// Times are supplied by the caller, which keeps the map independent of any
/// particular clock.
pub struct AgedUnorderedMap<K, V>
    where
        K: Eq + PartialEq + Hash,
        V: Default {
    inner: HashMap<K, Aged<V>>,
}

impl<K: Eq + PartialEq + Hash, V: Default> Default for AgedUnorderedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + PartialEq + Hash, V: Default> AgedUnorderedMap<K, V> {
    pub fn new() -> Self {
        AgedUnorderedMap {
            inner: Default::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Get the value for `k`, inserting a default one stamped with `now` if absent.
    pub fn get_or_insert_mut(&mut self, k: K, now: SystemTime) -> &mut V {
        match self.inner.entry(k) {
            Entry::Occupied(e) => &mut e.into_mut().value,
            Entry::Vacant(e) => &mut e.insert(Aged { touched: now, value: V::default() }).value,
        }
    }

    pub fn get(&self, k: &K) -> Option<&V> {
        self.inner.get(k).map(|aged| &aged.value)
    }

    pub fn get_mut(&mut self, k: &K) -> Option<&mut V> {
        self.inner.get_mut(k).map(|aged| &mut aged.value)
    }

    /// Update the timestamp on the entry, if present.
    pub fn touch(&mut self, k: &K, now: SystemTime) {
        if let Some(aged) = self.inner.get_mut(k) {
            aged.touched = now;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter().map(|(k, aged)| (k, &aged.value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.inner.iter_mut().map(|(k, aged)| (k, &mut aged.value))
    }

    /// Remove every entry not touched within `age` of `now`, unless `keep` says
    /// otherwise. Returns the number of removed entries.
    pub fn expire<F>(&mut self, now: SystemTime, age: Duration, mut keep: F) -> usize
        where
            F: FnMut(&K, &V) -> bool {
        let before = self.inner.len();
        self.inner.retain(|k, aged| {
            let fresh = now.duration_since(aged.touched).map_or(true, |elapsed| elapsed <= age);
            fresh || keep(k, &aged.value)
        });
        before - self.inner.len()
    }
}
