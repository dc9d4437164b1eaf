use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::StreamExt;
use metrics::{counter, histogram};
use reflex_core::{EventStream, ListWatch, ListWatchError, Object, WatchEvent};
use reflex_store::Cache;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{ReflectorConfig, ReflectorError, ResumePolicy};

/// How a watch stream ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEnd {
    /// Upstream closed the stream after `events` applied events.
    Closed { events: usize },
    /// `stop()` was requested while watching.
    Stopped,
}

/// Mirrors one collection from a `ListWatch` source into a cache.
///
/// The target is listed once, then kept current from watch events. When the
/// watch fails the reflector waits for the retry policy's delay and starts
/// again with a fresh list. Errors never reach cache consumers; they only see
/// the cache converge.
pub struct Reflector<K: Object, L> {
    list_watch: L,
    expected_kind: String,
    store: Arc<dyn Cache<K>>,
    config: ReflectorConfig,
    last_version: Mutex<String>,
    cancel: CancellationToken,
}

impl<K: Object, L: ListWatch<K>> Reflector<K, L> {
    pub fn new<C: Cache<K> + 'static>(list_watch: L, expected_kind: impl Into<String>, store: Arc<C>) -> Self {
        let store: Arc<dyn Cache<K>> = store;
        Self {
            list_watch,
            expected_kind: expected_kind.into(),
            store,
            config: ReflectorConfig::default(),
            last_version: Mutex::new(String::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_config(mut self, config: ReflectorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn expected_kind(&self) -> &str { &self.expected_kind }

    /// Version the next watch would resume from.
    pub fn last_version(&self) -> String {
        self.last_version.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn set_last_version(&self, version: &str) {
        let mut last = self.last_version.lock().unwrap_or_else(PoisonError::into_inner);
        last.clear();
        last.push_str(version);
    }

    pub fn stop(&self) { self.cancel.cancel() }

    /// Token that stops this reflector when cancelled.
    pub fn stop_token(&self) -> CancellationToken { self.cancel.clone() }

    /// Drive list/watch cycles until `stop()`. Closes the target cache on exit.
    pub async fn run(&self) {
        info!(kind = %self.expected_kind, resume = ?self.config.resume, "reflector started");
        let mut failures: u32 = 0;
        loop {
            match self.list_and_watch().await {
                Ok(()) => break,
                Err(e) => {
                    failures = match e {
                        ReflectorError::List(_) => failures.saturating_add(1),
                        _ => 1,
                    };
                    counter!("reflex_restarts_total", 1);
                    let delay = self.config.retry.delay(failures);
                    warn!(kind = %self.expected_kind, error = %e, failures, delay_ms = delay.as_millis() as u64, "list/watch cycle failed; retrying");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        self.store.close();
        info!(kind = %self.expected_kind, last_version = %self.last_version(), "reflector stopped");
    }

    /// Listing phase: replace the cache with a fresh snapshot and reset the
    /// resume version to the snapshot's. Returns that version.
    pub async fn list(&self) -> Result<String, ReflectorError> {
        let started = Instant::now();
        counter!("reflex_list_total", 1);
        let snapshot = self.list_watch.list().await.map_err(ReflectorError::List)?;
        let items = snapshot.items.len();
        self.store.replace(snapshot.items);
        self.set_last_version(&snapshot.version);
        histogram!("reflex_list_ms", started.elapsed().as_secs_f64() * 1000.0);
        histogram!("reflex_list_items", items as f64);
        debug!(kind = %self.expected_kind, items, version = %snapshot.version, "listed");
        Ok(snapshot.version)
    }

    /// One full cycle: list, then watch until the stream fails. `Ok(())` only
    /// when stopped; every other end is an error the caller retries.
    pub async fn list_and_watch(&self) -> Result<(), ReflectorError> {
        tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            res = self.list() => { res?; }
        }
        loop {
            let version = self.last_version();
            let stream = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                res = self.list_watch.watch(&version) => res.map_err(ReflectorError::WatchOpen)?,
            };
            debug!(kind = %self.expected_kind, version = %version, "watch opened");
            match (self.watch_handler(stream).await, self.config.resume) {
                (Ok(WatchEnd::Stopped), _) => return Ok(()),
                (Ok(WatchEnd::Closed { events }), ResumePolicy::Relist) => {
                    return Err(ReflectorError::StreamClosed { events })
                }
                (Ok(WatchEnd::Closed { events }), ResumePolicy::ResumeWatch) => {
                    info!(kind = %self.expected_kind, events, version = %self.last_version(), "watch closed; resuming");
                }
                (Err(ReflectorError::Stream { events, source }), ResumePolicy::ResumeWatch)
                    if events > 0 && !matches!(source, ListWatchError::Expired(_)) =>
                {
                    warn!(kind = %self.expected_kind, error = %source, events, version = %self.last_version(), "watch stream failed; resuming");
                }
                (Err(e), _) => return Err(e),
            }
        }
    }

    /// Apply events from `stream` to the cache until it ends or `stop()` is
    /// requested. Events of another kind are dropped without touching the
    /// cache or the resume version.
    pub(crate) async fn watch_handler(&self, mut stream: EventStream<K>) -> Result<WatchEnd, ReflectorError> {
        let started = Instant::now();
        let mut events: usize = 0;
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(WatchEnd::Stopped),
                next = stream.next() => next,
            };
            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(source)) => return Err(ReflectorError::Stream { events, source }),
                None => break,
            };
            let obj = event.object();
            if obj.kind() != self.expected_kind {
                let err = ReflectorError::KindMismatch {
                    expected: self.expected_kind.clone(),
                    got: obj.kind().to_string(),
                    key: obj.key(),
                };
                counter!("reflex_kind_mismatch_total", 1);
                warn!(error = %err, "dropping watch event");
                continue;
            }
            let key = obj.key();
            let version = obj.version().to_string();
            match event {
                WatchEvent::Added(obj) | WatchEvent::Modified(obj) => self.store.update(&key, obj),
                WatchEvent::Deleted(_) => self.store.delete(&key),
            }
            self.set_last_version(&version);
            events += 1;
            counter!("reflex_watch_events_total", 1);
        }
        let elapsed = started.elapsed();
        if events == 0 && elapsed < self.config.min_watch {
            return Err(ReflectorError::VeryShortWatch { elapsed_ms: elapsed.as_millis() });
        }
        debug!(kind = %self.expected_kind, events, "watch closed");
        Ok(WatchEnd::Closed { events })
    }
}
