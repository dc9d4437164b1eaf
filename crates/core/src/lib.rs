//! Reflex core types: object accessor, watch events and the list/watch contract.

#![forbid(unsafe_code)]

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub mod fake;

/// Accessor for the only properties the cache machinery reads from an object.
pub trait Object: Clone + Send + Sync + 'static {
    /// Stable identity, unique within one synchronized collection.
    fn key(&self) -> String;
    /// Opaque version token assigned by the source of truth.
    fn version(&self) -> &str;
    /// Declared type tag, used to filter out unrelated events.
    fn kind(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// A single change notification. `Deleted` carries the last known state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
}

impl<K> WatchEvent<K> {
    pub fn new(event_type: EventType, obj: K) -> Self {
        match event_type {
            EventType::Added => WatchEvent::Added(obj),
            EventType::Modified => WatchEvent::Modified(obj),
            EventType::Deleted => WatchEvent::Deleted(obj),
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            WatchEvent::Added(_) => EventType::Added,
            WatchEvent::Modified(_) => EventType::Modified,
            WatchEvent::Deleted(_) => EventType::Deleted,
        }
    }

    pub fn object(&self) -> &K {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }

    pub fn into_object(self) -> K {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => o,
        }
    }
}

/// Full listing of a collection together with the version it was taken at.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Snapshot<K> {
    pub items: Vec<K>,
    pub version: String,
}

impl<K> Snapshot<K> {
    pub fn new(version: impl Into<String>, items: Vec<K>) -> Self {
        Self { items, version: version.into() }
    }
}

/// Errors raised by a list/watch transport.
#[derive(Debug, thiserror::Error)]
pub enum ListWatchError {
    #[error("transport: {0}")]
    Transport(String),
    /// The requested version is no longer available upstream.
    #[error("expired: {0}")]
    Expired(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Stream of watch events; an `Err` item ends the watch abnormally.
pub type EventStream<K> = BoxStream<'static, Result<WatchEvent<K>, ListWatchError>>;

/// Source of truth for one collection: a snapshot plus incremental events.
#[async_trait::async_trait]
pub trait ListWatch<K: Object>: Send + Sync {
    /// Return every object together with the collection version.
    async fn list(&self) -> Result<Snapshot<K>, ListWatchError>;

    /// Open an event stream delivering changes strictly after `after`.
    async fn watch(&self, after: &str) -> Result<EventStream<K>, ListWatchError>;
}

pub mod prelude {
    pub use super::{EventStream, EventType, ListWatch, ListWatchError, Object, Snapshot, WatchEvent};
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeObject;

    #[test]
    fn event_accessors_follow_tag() {
        let pod = FakeObject::new("Pod", "a", "7");
        let ev = WatchEvent::new(EventType::Modified, pod.clone());
        assert_eq!(ev, WatchEvent::Modified(pod.clone()));
        assert_eq!(ev.event_type(), EventType::Modified);
        assert_eq!(ev.object().version(), "7");
        assert_eq!(ev.into_object(), pod);
    }

    #[test]
    fn anyhow_errors_convert() {
        let err: ListWatchError = anyhow::anyhow!("boom").into();
        assert!(matches!(err, ListWatchError::Other(_)));
        assert_eq!(err.to_string(), "boom");
    }
}
