//! Named key/value lookup tables usable inside rewrite patterns.

use std::collections::HashMap;

use unicase::UniCase;

/// One immutable rewrite map with case-insensitive keys.
#[derive(Clone, Debug, Default)]
pub struct RewriteMap {
    entries: HashMap<UniCase<String>, String>,
}

impl RewriteMap {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&UniCase::new(key.to_owned()))
            .map(|v| v.as_str())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(UniCase::new(key.into()), value.into());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RewriteMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = Self::default();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

/// All maps declared by a rule document, addressed by name.
///
/// Loaded once at parse time and shared read-only with every evaluation;
/// pattern parsers validate map names against this set so an unknown map
/// is a load-time error rather than a per-request surprise.
#[derive(Clone, Debug, Default)]
pub struct RewriteMaps {
    maps: HashMap<String, RewriteMap>,
}

impl RewriteMaps {
    pub fn get(&self, name: &str) -> Option<&RewriteMap> {
        self.maps.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.maps.contains_key(name)
    }

    pub fn insert(&mut self, name: impl Into<String>, map: RewriteMap) {
        self.maps.insert(name.into(), map);
    }
}
