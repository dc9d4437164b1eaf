//! Mutex-guarded key -> object map shared by `Store` and `Fifo`.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use reflex_core::Object;
use rustc_hash::FxHashMap;

use crate::{CacheError, Popped};

enum Slot<K> {
    Live(K),
    /// Deletion marker; only ordered maps keep these.
    Tombstone,
}

struct Inner<K> {
    items: FxHashMap<String, Slot<K>>,
    /// Pending keys in arrival order, `None` for random-access maps.
    /// Every key here has exactly one entry in `items` and vice versa.
    order: Option<VecDeque<String>>,
    closed: bool,
}

impl<K: Object> Inner<K> {
    fn put(&mut self, key: &str, slot: Slot<K>) {
        if let Some(order) = self.order.as_mut() {
            if !self.items.contains_key(key) {
                order.push_back(key.to_string());
            }
        }
        self.items.insert(key.to_string(), slot);
    }

    fn pop_front(&mut self) -> Option<Popped<K>> {
        let order = self.order.as_mut()?;
        while let Some(key) = order.pop_front() {
            match self.items.remove(&key) {
                Some(Slot::Live(obj)) => return Some(Popped::Object(obj)),
                Some(Slot::Tombstone) => return Some(Popped::Deleted(key)),
                None => continue,
            }
        }
        None
    }
}

pub(crate) struct Keyed<K> {
    inner: Mutex<Inner<K>>,
}

impl<K: Object> Keyed<K> {
    fn with_order(order: Option<VecDeque<String>>) -> Self {
        Self { inner: Mutex::new(Inner { items: FxHashMap::default(), order, closed: false }) }
    }

    pub(crate) fn unordered() -> Self { Self::with_order(None) }

    pub(crate) fn ordered() -> Self { Self::with_order(Some(VecDeque::new())) }

    // A panicking writer cannot leave the map half-updated, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn upsert(&self, key: &str, obj: K) {
        self.lock().put(key, Slot::Live(obj));
    }

    pub(crate) fn delete(&self, key: &str) {
        let mut inner = self.lock();
        if inner.order.is_some() {
            inner.put(key, Slot::Tombstone);
        } else {
            inner.items.remove(key);
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<K> {
        match self.lock().items.get(key) {
            Some(Slot::Live(obj)) => Some(obj.clone()),
            _ => None,
        }
    }

    pub(crate) fn list(&self) -> Vec<K> {
        self.lock()
            .items
            .values()
            .filter_map(|slot| match slot {
                Slot::Live(obj) => Some(obj.clone()),
                Slot::Tombstone => None,
            })
            .collect()
    }

    pub(crate) fn replace(&self, objs: Vec<K>) {
        let mut inner = self.lock();
        inner.items.clear();
        if let Some(order) = inner.order.as_mut() {
            order.clear();
        }
        for obj in objs {
            let key = obj.key();
            inner.put(&key, Slot::Live(obj));
        }
    }

    /// Number of entries; for ordered maps this is the pending count.
    pub(crate) fn len(&self) -> usize { self.lock().items.len() }

    pub(crate) fn try_pop(&self) -> Result<Option<Popped<K>>, CacheError> {
        let mut inner = self.lock();
        match inner.pop_front() {
            Some(popped) => Ok(Some(popped)),
            None if inner.closed => Err(CacheError::Closed),
            None => Ok(None),
        }
    }

    pub(crate) fn close(&self) { self.lock().closed = true; }

    pub(crate) fn is_closed(&self) -> bool { self.lock().closed }
}
