use std::collections::{BTreeMap, BTreeSet};

/// Set-valued map: every key maps to a non-empty set of values.
///
/// A key is dropped as soon as its last value is removed, so `contains_key`
/// always means "has at least one value".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiMap<K, V> {
    map: BTreeMap<K, BTreeSet<V>>,
}

impl<K, V> MultiMap<K, V>
where
    K: Ord + Clone,
    V: Ord + Clone,
{
    pub fn new() -> Self {
        MultiMap {
            map: BTreeMap::new(),
        }
    }

    /// Returns false if the pair was already present
    pub fn add(&mut self, key: K, value: V) -> bool {
        self.map.entry(key).or_default().insert(value)
    }

    /// Returns false if the pair was not present
    pub fn remove(&mut self, key: &K, value: &V) -> bool {
        let Some(values) = self.map.get_mut(key) else {
            return false;
        };
        let removed = values.remove(value);
        if values.is_empty() {
            self.map.remove(key);
        }
        removed
    }

    /// Take every value of `key` out of the map
    pub fn pop(&mut self, key: &K) -> Vec<V> {
        self.map
            .remove(key)
            .map(|values| values.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, key: &K) -> impl Iterator<Item = &V> {
        self.map.get(key).into_iter().flatten()
    }

    /// Smallest value of `key`, which is the first one in iteration order
    pub fn first(&self, key: &K) -> Option<&V> {
        self.map.get(key).and_then(|values| values.first())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl<K, V> Default for MultiMap<K, V>
where
    K: Ord + Clone,
    V: Ord + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remove_last_value_drops_key() {
        let mut map = MultiMap::new();
        map.add("a", 1);
        map.add("a", 2);

        assert!(map.remove(&"a", &1));
        assert!(map.contains_key(&"a"));

        assert!(map.remove(&"a", &2));
        assert!(!map.contains_key(&"a"));
        assert!(map.is_empty());
    }

    #[test]
    fn test_set_semantics() {
        let mut map = MultiMap::new();
        assert!(map.add("a", 1));
        assert!(!map.add("a", 1));
        assert_eq!(map.get(&"a").count(), 1);
        assert!(!map.remove(&"b", &1));
    }

    #[test]
    fn test_pop() {
        let mut map = MultiMap::new();
        map.add("a", 2);
        map.add("a", 1);

        assert_eq!(map.first(&"a"), Some(&1));
        assert_eq!(map.pop(&"a"), vec![1, 2]);
        assert!(map.pop(&"a").is_empty());
    }
}
