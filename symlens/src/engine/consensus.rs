//! Consensus map: a map that keeps a key only while every contribution
//! agrees on its value.
//!
//! Used for the old-function → new-function mapping: an entry survives only
//! if every frame that used to reference the old function resolved to the
//! same new function. A conflicting contribution removes the key for good —
//! re-inserting the original value afterwards must not resurrect it, which
//! is why this lives in its own type instead of being inlined.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

#[derive(Debug, Default)]
pub struct ConsensusMap<K, V> {
    map: HashMap<K, V>,
    conflicted: HashSet<K>,
}

impl<K: Eq + Hash + Clone, V: Eq> ConsensusMap<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self { map: HashMap::new(), conflicted: HashSet::new() }
    }

    /// Contribute one `key → value` observation.
    pub fn insert(&mut self, key: K, value: V) {
        if self.conflicted.contains(&key) {
            return;
        }
        match self.map.get(&key) {
            Some(existing) if *existing != value => {
                self.map.remove(&key);
                self.conflicted.insert(key);
            }
            Some(_) => {}
            None => {
                self.map.insert(key, value);
            }
        }
    }

    /// The surviving, fully-agreed entries.
    #[must_use]
    pub fn into_map(self) -> HashMap<K, V> {
        self.map
    }
}
