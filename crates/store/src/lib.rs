//! Reflex caches: a keyed `Store` for random access and a deduplicating `Fifo`
//! for ordered consumption. Both are fed by a reflector through `Cache`.

#![forbid(unsafe_code)]

mod fifo;
mod keyed;
mod store;

pub use fifo::Fifo;
pub use store::Store;

use reflex_core::Object;

/// Target of a reflector. Every operation is atomic with respect to the others.
pub trait Cache<K: Object>: Send + Sync {
    fn add(&self, key: &str, obj: K);
    fn update(&self, key: &str, obj: K);
    /// Removing an absent key is not an error.
    fn delete(&self, key: &str);
    fn get(&self, key: &str) -> Option<K>;
    fn list(&self) -> Vec<K>;
    /// Discard all entries and install `objs`, keyed by `Object::key`.
    fn replace(&self, objs: Vec<K>);
    /// Called once the producer has stopped for good.
    fn close(&self) {}
}

/// Value handed out by `Fifo::pop`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Popped<K> {
    Object(K),
    /// The last operation on this key before it was popped was a delete.
    Deleted(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("queue closed")]
    Closed,
}
