use metrics::gauge;
use reflex_core::Object;
use tokio::sync::Notify;
use tracing::debug;

use crate::keyed::Keyed;
use crate::{Cache, CacheError, Popped};

/// Work queue keyed like `Store`: at most one pending entry per key, popped in
/// first-arrival order. Re-adding a pending key replaces its value in place.
pub struct Fifo<K> {
    keyed: Keyed<K>,
    notify: Notify,
}

impl<K: Object> Fifo<K> {
    pub fn new() -> Self { Self { keyed: Keyed::ordered(), notify: Notify::new() } }

    /// Wait for the oldest pending entry. Once the queue is closed, remaining
    /// entries are still handed out, then `CacheError::Closed` is returned.
    pub async fn pop(&self) -> Result<Popped<K>, CacheError> {
        loop {
            // Register before checking so a push between the check and the await is not missed.
            let notified = self.notify.notified();
            if let Some(popped) = self.try_pop()? {
                return Ok(popped);
            }
            notified.await;
        }
    }

    /// Non-blocking variant of `pop`; `Ok(None)` when nothing is pending.
    pub fn try_pop(&self) -> Result<Option<Popped<K>>, CacheError> {
        let popped = self.keyed.try_pop()?;
        if popped.is_some() {
            gauge!("reflex_fifo_pending", self.keyed.len() as f64);
        }
        Ok(popped)
    }

    /// Release every waiting consumer; the queue no longer blocks afterwards.
    pub fn close(&self) {
        self.keyed.close();
        self.notify.notify_waiters();
        debug!("fifo closed");
    }

    pub fn is_closed(&self) -> bool { self.keyed.is_closed() }

    /// Number of pending keys, deletion markers included.
    pub fn len(&self) -> usize { self.keyed.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    fn pushed(&self) {
        gauge!("reflex_fifo_pending", self.keyed.len() as f64);
        self.notify.notify_waiters();
    }
}

impl<K: Object> Default for Fifo<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Object> Cache<K> for Fifo<K> {
    fn add(&self, key: &str, obj: K) {
        self.keyed.upsert(key, obj);
        self.pushed();
    }

    fn update(&self, key: &str, obj: K) {
        self.keyed.upsert(key, obj);
        self.pushed();
    }

    /// Queues a deletion marker so consumers learn about the removal.
    fn delete(&self, key: &str) {
        self.keyed.delete(key);
        self.pushed();
    }

    fn get(&self, key: &str) -> Option<K> { self.keyed.get(key) }

    fn list(&self) -> Vec<K> { self.keyed.list() }

    fn replace(&self, objs: Vec<K>) {
        let n = objs.len();
        self.keyed.replace(objs);
        debug!(items = n, "fifo replaced");
        self.pushed();
    }

    fn close(&self) { Fifo::close(self) }
}
