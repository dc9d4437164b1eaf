//! In-memory fakes for driving caches and reflectors without a cluster.

use futures::channel::mpsc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::{EventStream, ListWatch, ListWatchError, Object, Snapshot, WatchEvent};

/// Minimal object with an explicit kind, name and version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FakeObject {
    pub kind: String,
    pub name: String,
    pub version: String,
}

impl FakeObject {
    pub fn new(kind: &str, name: &str, version: &str) -> Self {
        Self { kind: kind.to_string(), name: name.to_string(), version: version.to_string() }
    }
}

impl Object for FakeObject {
    fn key(&self) -> String { self.name.clone() }
    fn version(&self) -> &str { &self.version }
    fn kind(&self) -> &str { &self.kind }
}

type Item<K> = Result<WatchEvent<K>, ListWatchError>;

/// Sender half of a hand-driven watch. Events are buffered until consumed;
/// `stop` ends the stream after the buffered events.
pub struct FakeWatch<K> {
    tx: mpsc::UnboundedSender<Item<K>>,
}

impl<K> Clone for FakeWatch<K> {
    fn clone(&self) -> Self { Self { tx: self.tx.clone() } }
}

impl<K: Object> FakeWatch<K> {
    pub fn new() -> (Self, EventStream<K>) {
        let (tx, rx) = mpsc::unbounded();
        (Self { tx }, rx.boxed())
    }

    pub fn add(&self, obj: K) { self.action(WatchEvent::Added(obj)) }
    pub fn modify(&self, obj: K) { self.action(WatchEvent::Modified(obj)) }
    pub fn delete(&self, obj: K) { self.action(WatchEvent::Deleted(obj)) }

    pub fn action(&self, ev: WatchEvent<K>) {
        let _ = self.tx.unbounded_send(Ok(ev));
    }

    /// Deliver a terminal transport error.
    pub fn error(&self, err: ListWatchError) {
        let _ = self.tx.unbounded_send(Err(err));
    }

    pub fn stop(&self) { self.tx.close_channel(); }

    pub fn is_stopped(&self) -> bool { self.tx.is_closed() }
}

type ListFn<K> = Box<dyn Fn() -> Result<Snapshot<K>, ListWatchError> + Send + Sync>;
type WatchFn<K> = Box<dyn Fn(&str) -> Result<EventStream<K>, ListWatchError> + Send + Sync>;

/// List/watch source backed by closures.
pub struct FakeListWatch<K> {
    list_fn: ListFn<K>,
    watch_fn: WatchFn<K>,
}

impl<K: Object> FakeListWatch<K> {
    pub fn new<L, W>(list_fn: L, watch_fn: W) -> Self
    where
        L: Fn() -> Result<Snapshot<K>, ListWatchError> + Send + Sync + 'static,
        W: Fn(&str) -> Result<EventStream<K>, ListWatchError> + Send + Sync + 'static,
    {
        Self { list_fn: Box::new(list_fn), watch_fn: Box::new(watch_fn) }
    }

    /// Source whose every call fails; handy when only the watch handler is exercised.
    pub fn unreachable() -> Self {
        Self::new(
            || Err(ListWatchError::Transport("list not expected".into())),
            |_| Err(ListWatchError::Transport("watch not expected".into())),
        )
    }
}

#[async_trait::async_trait]
impl<K: Object> ListWatch<K> for FakeListWatch<K> {
    async fn list(&self) -> Result<Snapshot<K>, ListWatchError> { (self.list_fn)() }

    async fn watch(&self, after: &str) -> Result<EventStream<K>, ListWatchError> { (self.watch_fn)(after) }
}
