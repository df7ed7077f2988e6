//! Live name mapping shared between the refresher and the rewriter.
//!
//! The store holds one immutable [`Mapping`] snapshot behind a read/write
//! lock. Replacing it swaps the whole snapshot, so a reader sees either the
//! old mapping or the new one, never a mix.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Prefix used on diff log lines.
const DIFF_PREFIX: &str = "[zeabur-dns]";

/// An immutable set of `key -> value` pairs, unique by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    entries: HashMap<String, String>,
}

impl Mapping {
    /// Creates an empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, replacing any previous value for the key.
    ///
    /// Returns the replaced value, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.entries.insert(key.into(), value.into())
    }

    /// Looks up a key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the mapping has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all entries in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<HashMap<String, String>> for Mapping {
    fn from(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Mapping {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// A value change for a key present in both mappings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub key: String,
    pub old: String,
    pub new: String,
}

/// Structural difference between two mappings, sorted by key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingDiff {
    /// Entries only present in the new mapping.
    pub added: Vec<(String, String)>,
    /// Entries only present in the old mapping.
    pub removed: Vec<(String, String)>,
    /// Keys present in both with different values.
    pub changed: Vec<Change>,
}

impl MappingDiff {
    /// Computes the diff from `old` to `new`.
    pub fn between(old: &Mapping, new: &Mapping) -> Self {
        let mut diff = Self::default();

        for (key, old_value) in old.iter() {
            match new.get(key) {
                None => diff.removed.push((key.to_string(), old_value.to_string())),
                Some(new_value) if new_value != old_value => diff.changed.push(Change {
                    key: key.to_string(),
                    old: old_value.to_string(),
                    new: new_value.to_string(),
                }),
                Some(_) => {}
            }
        }

        for (key, new_value) in new.iter() {
            if old.get(key).is_none() {
                diff.added.push((key.to_string(), new_value.to_string()));
            }
        }

        diff.added.sort();
        diff.removed.sort();
        diff.changed.sort_by(|a, b| a.key.cmp(&b.key));
        diff
    }

    /// Whether the two mappings were identical.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }

    /// Renders the diff as `-`/`+` lines.
    ///
    /// A change renders as a removal of the old value followed by an
    /// addition of the new one.
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.added.len() + self.removed.len() + 2 * self.changed.len());
        for (key, value) in &self.removed {
            lines.push(format!("{DIFF_PREFIX} - {key} \t -> \t {value}"));
        }
        for change in &self.changed {
            lines.push(format!("{DIFF_PREFIX} - {} \t -> \t {}", change.key, change.old));
            lines.push(format!("{DIFF_PREFIX} + {} \t -> \t {}", change.key, change.new));
        }
        for (key, value) in &self.added {
            lines.push(format!("{DIFF_PREFIX} + {key} \t -> \t {value}"));
        }
        lines
    }

    /// Emits one log event per diff line.
    pub fn log(&self) {
        for line in self.lines() {
            info!(target: "zproxy::store", "{}", line);
        }
    }
}

/// Concurrently readable, atomically replaceable name mapping.
#[derive(Debug, Default)]
pub struct NameStore {
    current: RwLock<Arc<Mapping>>,
}

impl NameStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up a key in the current mapping.
    pub fn get(&self, key: &str) -> Option<String> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        current.get(key).map(str::to_string)
    }

    /// Returns the current mapping as a shared snapshot.
    ///
    /// The snapshot stays valid after later replacements.
    pub fn snapshot(&self) -> Arc<Mapping> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swaps in `mapping`, logging and returning the diff against the
    /// previous one.
    ///
    /// Diffing and the swap share one write critical section.
    pub fn replace(&self, mapping: Mapping) -> MappingDiff {
        let mapping = Arc::new(mapping);
        let diff = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let diff = MappingDiff::between(&current, &mapping);
            *current = mapping;
            diff
        };
        diff.log();
        diff
    }

    /// Number of entries in the current mapping.
    pub fn size(&self) -> usize {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn mapping(pairs: &[(&str, &str)]) -> Mapping {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_empty_store() {
        let store = NameStore::new();
        assert_eq!(store.size(), 0);
        assert!(store.get("web.shop").is_none());
    }

    #[test]
    fn test_replace_and_get() {
        let store = NameStore::new();
        store.replace(mapping(&[
            ("service1.example.com", "10.0.0.1"),
            ("service2.example.com", "10.0.0.2"),
        ]));

        assert_eq!(store.size(), 2);
        assert_eq!(store.get("service1.example.com").as_deref(), Some("10.0.0.1"));
        assert!(store.get("service3.example.com").is_none());
    }

    #[test]
    fn test_size_counts_unique_keys() {
        let mut m = Mapping::new();
        m.insert("a", "1");
        m.insert("a", "2");
        m.insert("b", "3");

        let store = NameStore::new();
        store.replace(m);
        assert_eq!(store.size(), 2);
        assert_eq!(store.get("a").as_deref(), Some("2"));
    }

    #[test]
    fn test_diff_add_remove_change() {
        let store = NameStore::new();
        store.replace(mapping(&[("a", "1"), ("b", "2")]));

        let diff = store.replace(mapping(&[("b", "3"), ("c", "4")]));
        assert_eq!(diff.removed, vec![("a".to_string(), "1".to_string())]);
        assert_eq!(
            diff.changed,
            vec![Change {
                key: "b".to_string(),
                old: "2".to_string(),
                new: "3".to_string(),
            }]
        );
        assert_eq!(diff.added, vec![("c".to_string(), "4".to_string())]);
    }

    #[test]
    fn test_diff_lines() {
        let old = mapping(&[
            ("service1.example.com", "10.0.0.1"),
            ("service2.example.com", "10.0.0.2"),
        ]);
        let new = mapping(&[
            ("service1.example.com", "10.0.0.3"),
            ("service3.example.com", "10.0.0.4"),
        ]);

        let lines = MappingDiff::between(&old, &new).lines();
        assert_eq!(
            lines,
            vec![
                "[zeabur-dns] - service2.example.com \t -> \t 10.0.0.2",
                "[zeabur-dns] - service1.example.com \t -> \t 10.0.0.1",
                "[zeabur-dns] + service1.example.com \t -> \t 10.0.0.3",
                "[zeabur-dns] + service3.example.com \t -> \t 10.0.0.4",
            ]
        );
    }

    #[test]
    fn test_identical_replace_has_empty_diff() {
        let store = NameStore::new();
        store.replace(mapping(&[("a", "1")]));
        let diff = store.replace(mapping(&[("a", "1")]));
        assert!(diff.is_empty());
        assert!(diff.lines().is_empty());
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let store = NameStore::new();
        store.replace(mapping(&[("a", "1")]));
        let before = store.snapshot();

        store.replace(mapping(&[("a", "2")]));
        assert_eq!(before.get("a"), Some("1"));
        assert_eq!(store.get("a").as_deref(), Some("2"));
    }

    #[test]
    fn test_readers_never_see_mixed_mapping() {
        let keys: Vec<String> = (0..64).map(|i| format!("svc{i}.proj")).collect();
        let m1: Mapping = keys.iter().map(|k| (k.clone(), "one".to_string())).collect();
        let m2: Mapping = keys.iter().map(|k| (k.clone(), "two".to_string())).collect();

        let store = Arc::new(NameStore::new());
        store.replace(m1.clone());

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..500 {
                        let snap = store.snapshot();
                        let first = snap.iter().next().map(|(_, v)| v.to_string());
                        assert!(snap.iter().all(|(_, v)| Some(v.to_string()) == first));
                        assert_eq!(snap.len(), 64);
                    }
                })
            })
            .collect();

        for i in 0..200 {
            store.replace(if i % 2 == 0 { m2.clone() } else { m1.clone() });
        }

        for reader in readers {
            reader.join().unwrap();
        }
    }
}
