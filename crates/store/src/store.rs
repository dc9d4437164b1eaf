use metrics::histogram;
use reflex_core::Object;
use tracing::debug;

use crate::keyed::Keyed;
use crate::Cache;

/// Thread-safe cache of the latest object per key.
pub struct Store<K> {
    keyed: Keyed<K>,
}

impl<K: Object> Store<K> {
    pub fn new() -> Self { Self { keyed: Keyed::unordered() } }

    pub fn len(&self) -> usize { self.keyed.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl<K: Object> Default for Store<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Object> Cache<K> for Store<K> {
    fn add(&self, key: &str, obj: K) { self.keyed.upsert(key, obj) }

    fn update(&self, key: &str, obj: K) { self.keyed.upsert(key, obj) }

    fn delete(&self, key: &str) { self.keyed.delete(key) }

    fn get(&self, key: &str) -> Option<K> { self.keyed.get(key) }

    fn list(&self) -> Vec<K> { self.keyed.list() }

    fn replace(&self, objs: Vec<K>) {
        let n = objs.len();
        self.keyed.replace(objs);
        histogram!("reflex_store_replace_items", n as f64);
        debug!(items = n, "store replaced");
    }
}
