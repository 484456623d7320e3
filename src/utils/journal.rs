//! Undo journals for per-action rollback.
//!
//! While an action runs, every stateful component records the previous value
//! of each entry it overwrites. Committing drops the records and rolling back
//! replays them newest first, so either costs time proportional to the
//! entries the action touched rather than to the size of the state.
//!
//! Journals are never serialized: a snapshot only contains committed state.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::btree_map;
use std::collections::BTreeMap;

/// State that can undo everything changed since [`Transactional::begin`]
pub trait Transactional {
    /// Start recording changes
    fn begin(&mut self);
    /// Keep the recorded changes
    fn commit(&mut self);
    /// Undo the recorded changes
    fn rollback(&mut self);
}

// ═══════════════════════════════════════════════════════════════════════════════
// MAP
// ═══════════════════════════════════════════════════════════════════════════════

/// A `BTreeMap` that journals overwritten entries while recording
#[derive(Debug, Clone)]
pub struct JournaledMap<K, V> {
    map: BTreeMap<K, V>,
    undo: Vec<(K, Option<V>)>,
    recording: bool,
}

impl<K, V> Default for JournaledMap<K, V> {
    fn default() -> Self {
        Self {
            map: BTreeMap::new(),
            undo: Vec::new(),
            recording: false,
        }
    }
}

impl<K: Ord + Clone, V: Clone> JournaledMap<K, V> {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Value at `key`
    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    /// Whether `key` is present
    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the map is empty
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Entries in key order
    pub fn iter(&self) -> btree_map::Iter<'_, K, V> {
        self.map.iter()
    }

    /// Keys in order
    pub fn keys(&self) -> btree_map::Keys<'_, K, V> {
        self.map.keys()
    }

    /// Values in key order
    pub fn values(&self) -> btree_map::Values<'_, K, V> {
        self.map.values()
    }

    /// Insert, returning the previous value
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let old = self.map.insert(key.clone(), value);
        if self.recording {
            self.undo.push((key, old.clone()));
        }
        old
    }

    /// Remove, returning the previous value
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let old = self.map.remove(key);
        if self.recording && old.is_some() {
            self.undo.push((key.clone(), old.clone()));
        }
        old
    }

    /// Mutable access to an existing entry
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.recording {
            if let Some(old) = self.map.get(key) {
                self.undo.push((key.clone(), Some(old.clone())));
            }
        }
        self.map.get_mut(key)
    }

    /// Mutable access, inserting `default()` when absent
    pub fn get_or_insert_with(&mut self, key: K, default: impl FnOnce() -> V) -> &mut V {
        if self.recording {
            let old = self.map.get(&key).cloned();
            self.undo.push((key.clone(), old));
        }
        self.map.entry(key).or_insert_with(default)
    }

    /// Entries recorded since `begin`
    pub fn journal_len(&self) -> usize {
        self.undo.len()
    }
}

impl<K: Ord + Clone, V: Clone> Transactional for JournaledMap<K, V> {
    fn begin(&mut self) {
        self.undo.clear();
        self.recording = true;
    }

    fn commit(&mut self) {
        self.undo.clear();
        self.recording = false;
    }

    fn rollback(&mut self) {
        while let Some((key, old)) = self.undo.pop() {
            match old {
                Some(value) => {
                    self.map.insert(key, value);
                }
                None => {
                    self.map.remove(&key);
                }
            }
        }
        self.recording = false;
    }
}

impl<K, V> From<BTreeMap<K, V>> for JournaledMap<K, V> {
    fn from(map: BTreeMap<K, V>) -> Self {
        Self {
            map,
            undo: Vec::new(),
            recording: false,
        }
    }
}

impl<'a, K, V> IntoIterator for &'a JournaledMap<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = btree_map::Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.map.iter()
    }
}

impl<K: Serialize, V: Serialize> Serialize for JournaledMap<K, V> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.map.serialize(serializer)
    }
}

impl<'de, K, V> Deserialize<'de> for JournaledMap<K, V>
where
    K: Deserialize<'de> + Ord,
    V: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        BTreeMap::deserialize(deserializer).map(Self::from)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// VEC
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
enum VecChange<T> {
    Pushed,
    SwapRemoved { index: usize, value: T },
}

/// A `Vec` limited to push and swap-remove, journaled while recording
#[derive(Debug, Clone)]
pub struct JournaledVec<T> {
    items: Vec<T>,
    undo: Vec<VecChange<T>>,
    recording: bool,
}

impl<T> Default for JournaledVec<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            undo: Vec::new(),
            recording: false,
        }
    }
}

impl<T: Clone> JournaledVec<T> {
    /// Empty vector
    pub fn new() -> Self {
        Self::default()
    }

    /// Item at `index`
    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    /// Number of items
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the vector is empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items as a slice
    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    /// Append `value`
    pub fn push(&mut self, value: T) {
        self.items.push(value);
        if self.recording {
            self.undo.push(VecChange::Pushed);
        }
    }

    /// Remove the item at `index`, moving the last item into its place
    pub fn swap_remove(&mut self, index: usize) -> Option<T> {
        if index >= self.items.len() {
            return None;
        }
        let value = self.items.swap_remove(index);
        if self.recording {
            self.undo.push(VecChange::SwapRemoved {
                index,
                value: value.clone(),
            });
        }
        Some(value)
    }

    /// Changes recorded since `begin`
    pub fn journal_len(&self) -> usize {
        self.undo.len()
    }
}

impl<T: Clone> Transactional for JournaledVec<T> {
    fn begin(&mut self) {
        self.undo.clear();
        self.recording = true;
    }

    fn commit(&mut self) {
        self.undo.clear();
        self.recording = false;
    }

    fn rollback(&mut self) {
        while let Some(change) = self.undo.pop() {
            match change {
                VecChange::Pushed => {
                    self.items.pop();
                }
                VecChange::SwapRemoved { index, value } => {
                    if index == self.items.len() {
                        self.items.push(value);
                    } else {
                        let moved = std::mem::replace(&mut self.items[index], value);
                        self.items.push(moved);
                    }
                }
            }
        }
        self.recording = false;
    }
}

impl<T: Serialize> Serialize for JournaledVec<T> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.items.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for JournaledVec<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::deserialize(deserializer).map(|items| Self {
            items,
            undo: Vec::new(),
            recording: false,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SCALARS
// ═══════════════════════════════════════════════════════════════════════════════

/// Saved copy of a component's scalar fields
#[derive(Debug, Clone, Copy)]
pub struct Saved<T>(Option<T>);

impl<T> Default for Saved<T> {
    fn default() -> Self {
        Self(None)
    }
}

impl<T: Copy> Saved<T> {
    /// Keep `value` until the action ends
    pub fn save(&mut self, value: T) {
        self.0 = Some(value);
    }

    /// Forget the saved value
    pub fn clear(&mut self) {
        self.0 = None;
    }

    /// Take the saved value, if any
    pub fn take(&mut self) -> Option<T> {
        self.0.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_rollback_restores_touched_entries() {
        let mut map: JournaledMap<u32, u32> = JournaledMap::new();
        map.insert(1, 10);
        map.insert(2, 20);

        map.begin();
        map.insert(1, 11);
        map.insert(3, 30);
        map.remove(&2);
        *map.get_mut(&1).unwrap() += 1;
        *map.get_or_insert_with(4, || 0) += 40;
        assert_eq!(map.journal_len(), 5);
        map.rollback();

        assert_eq!(map.iter().collect::<Vec<_>>(), vec![(&1, &10), (&2, &20)]);
        assert_eq!(map.journal_len(), 0);
    }

    #[test]
    fn test_map_commit_keeps_changes() {
        let mut map: JournaledMap<u32, u32> = JournaledMap::new();
        map.begin();
        map.insert(1, 10);
        map.commit();
        assert_eq!(map.get(&1), Some(&10));

        // Not recording: nothing to undo
        map.insert(2, 20);
        map.rollback();
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_vec_rollback_restores_order() {
        let mut v = JournaledVec::new();
        for n in 0..5 {
            v.push(n);
        }

        v.begin();
        v.swap_remove(1);
        v.push(9);
        v.swap_remove(4);
        v.swap_remove(0);
        v.rollback();

        assert_eq!(v.as_slice(), &[0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_snapshot_excludes_journal() {
        let mut map: JournaledMap<u32, u32> = JournaledMap::new();
        map.begin();
        map.insert(7, 70);
        let bytes = bincode::serialize(&map).unwrap();
        let restored: JournaledMap<u32, u32> = bincode::deserialize(&bytes).unwrap();
        assert_eq!(restored.get(&7), Some(&70));
        assert_eq!(restored.journal_len(), 0);
    }

    #[test]
    fn test_saved_scalars() {
        let mut saved = Saved::default();
        saved.save((1u128, 2u64));
        assert_eq!(saved.take(), Some((1, 2)));
        assert_eq!(saved.take(), None);
        saved.save((3, 4));
        saved.clear();
        assert_eq!(saved.take(), None);
    }
}
