//! In-memory key/value snapshot a resource renders against.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use glob::{MatchOptions, Pattern};

/// Read-only view of a key/value snapshot, as seen by template functions.
pub trait Lookup: Send + Sync {
    fn exists(&self, key: &str) -> bool;

    /// Values of every key starting with `prefix`, in no particular order.
    fn list(&self, prefix: &str) -> Vec<String>;

    /// Value stored at `key`, or an empty string.
    fn get(&self, key: &str) -> String;

    /// Values of every key matching the glob `pattern`, sorted.
    fn get_values(&self, pattern: &str) -> Vec<String>;

    fn get_all(&self, pattern: &str) -> BTreeMap<String, String>;
}

/// `*` must not cross a `/`, so `/upstream/*` only selects direct children.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Default)]
pub struct KeyValueCache {
    store: RwLock<HashMap<String, String>>,
}

impl KeyValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    pub fn clear(&self) {
        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Swaps the whole snapshot in one write, so readers never observe a
    /// half-filled cache.
    pub fn replace_all<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let fresh: HashMap<String, String> = entries.into_iter().collect();
        *self.store.write().unwrap_or_else(PoisonError::into_inner) = fresh;
    }

    pub fn len(&self) -> usize {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn matching<'a>(
        store: &'a HashMap<String, String>,
        pattern: &str,
    ) -> impl Iterator<Item = (&'a String, &'a String)> {
        let compiled = Pattern::new(pattern).ok();
        store.iter().filter(move |(k, _)| {
            compiled
                .as_ref()
                .map(|p| p.matches_with(k, MATCH_OPTIONS))
                .unwrap_or(false)
        })
    }
}

impl Lookup for KeyValueCache {
    fn exists(&self, key: &str) -> bool {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    fn list(&self, prefix: &str) -> Vec<String> {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect()
    }

    fn get(&self, key: &str) -> String {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    fn get_values(&self, pattern: &str) -> Vec<String> {
        let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
        let mut values: Vec<String> = Self::matching(&store, pattern)
            .map(|(_, v)| v.clone())
            .collect();
        values.sort();
        values
    }

    fn get_all(&self, pattern: &str) -> BTreeMap<String, String> {
        let store = self.store.read().unwrap_or_else(PoisonError::into_inner);
        Self::matching(&store, pattern)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> KeyValueCache {
        let cache = KeyValueCache::new();
        cache.set("/app/host", "db1");
        cache.set("/app/port", "5432");
        cache.set("/upstream/b", "10.0.0.2");
        cache.set("/upstream/a", "10.0.0.1");
        cache.set("/upstream/a/weight", "3");
        cache
    }

    #[test]
    fn test_get_and_exists() {
        let cache = sample();
        assert!(cache.exists("/app/host"));
        assert!(!cache.exists("/app/missing"));
        assert_eq!(cache.get("/app/host"), "db1");
        assert_eq!(cache.get("/app/missing"), "");
    }

    #[test]
    fn test_list_by_prefix() {
        let cache = sample();
        let mut values = cache.list("/app");
        values.sort();
        assert_eq!(values, vec!["5432".to_string(), "db1".to_string()]);
        assert!(cache.list("/nothing").is_empty());
    }

    #[test]
    fn test_get_values_sorted_and_single_level() {
        let cache = sample();
        // weight lives one level deeper and must not match `*`
        assert_eq!(
            cache.get_values("/upstream/*"),
            vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]
        );
    }

    #[test]
    fn test_get_all_returns_keys() {
        let cache = sample();
        let all = cache.get_all("/app/*");
        assert_eq!(all.len(), 2);
        assert_eq!(all.get("/app/port"), Some(&"5432".to_string()));
    }

    #[test]
    fn test_invalid_pattern_matches_nothing() {
        let cache = sample();
        assert!(cache.get_values("/app/[").is_empty());
        assert!(cache.get_all("/app/[").is_empty());
    }

    #[test]
    fn test_clear_and_replace_all() {
        let cache = sample();
        cache.clear();
        assert!(cache.is_empty());

        cache.replace_all(vec![("/x".to_string(), "1".to_string())]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("/x"), "1");

        cache.replace_all(vec![("/y".to_string(), "2".to_string())]);
        assert!(!cache.exists("/x"));
    }
}
