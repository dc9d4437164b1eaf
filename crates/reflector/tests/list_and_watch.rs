#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reflex_core::fake::{FakeListWatch, FakeObject, FakeWatch};
use reflex_core::{ListWatchError, Snapshot, WatchEvent};
use reflex_reflector::{FixedDelay, Reflector, ReflectorConfig, ReflectorError, ResumePolicy};
use reflex_store::{Cache, CacheError, Fifo, Popped, Store};
use tokio::sync::mpsc;

type PodReflector = Reflector<FakeObject, FakeListWatch<FakeObject>>;

fn pod(name: &str, rv: &str) -> FakeObject { FakeObject::new("Pod", name, rv) }

fn fast(resume: ResumePolicy) -> ReflectorConfig {
    ReflectorConfig::default()
        .with_resume(resume)
        .with_retry(FixedDelay(Duration::from_millis(10)))
}

/// List/watch source whose list is fixed at version "1" and whose watches are
/// handed to the test as they are opened.
fn scripted_source() -> (FakeListWatch<FakeObject>, Arc<Mutex<Vec<String>>>, mpsc::UnboundedReceiver<FakeWatch<FakeObject>>) {
    let (created_tx, created_rx) = mpsc::unbounded_channel();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&calls);
    let lw = FakeListWatch::new(
        || Ok(Snapshot::new("1", Vec::new())),
        move |rv| {
            seen.lock().unwrap().push(rv.to_string());
            let (fw, stream) = FakeWatch::new();
            let _ = created_tx.send(fw);
            Ok(stream)
        },
    );
    (lw, calls, created_rx)
}

async fn next_watch(rx: &mut mpsc::UnboundedReceiver<FakeWatch<FakeObject>>) -> FakeWatch<FakeObject> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn pop(fifo: &Fifo<FakeObject>) -> Popped<FakeObject> {
    tokio::time::timeout(Duration::from_secs(5), fifo.pop()).await.unwrap().unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_policy_rewatches_from_last_applied_version() {
    let (lw, calls, mut created) = scripted_source();
    let fifo = Arc::new(Fifo::<FakeObject>::new());
    let r: Arc<PodReflector> = Arc::new(Reflector::new(lw, "Pod", fifo.clone()).with_config(fast(ResumePolicy::ResumeWatch)));
    let task = tokio::spawn({
        let r = Arc::clone(&r);
        async move { r.run().await }
    });

    let ids = ["foo", "bar", "baz", "qux", "zoo"];
    let mut fw: Option<FakeWatch<FakeObject>> = None;
    for (i, id) in ids.iter().enumerate() {
        let w = match fw.take() {
            Some(w) => w,
            None => next_watch(&mut created).await,
        };
        let rv = (i + 2).to_string();
        w.add(pod(id, &rv));
        if rv == "3" {
            // interrupt the stream; the next watch must resume after "3"
            w.stop();
        } else {
            fw = Some(w);
        }
    }

    for (i, id) in ids.iter().enumerate() {
        assert_eq!(pop(&fifo).await, Popped::Object(pod(id, &(i + 2).to_string())));
    }
    assert_eq!(*calls.lock().unwrap(), vec!["1", "3"]);
    eventually(|| r.last_version() == "6").await;

    r.stop();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert!(fifo.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn default_policy_relists_after_interruption() {
    let (lw, calls, mut created) = scripted_source();
    let fifo = Arc::new(Fifo::<FakeObject>::new());
    let r: Arc<PodReflector> = Arc::new(Reflector::new(lw, "Pod", fifo.clone()).with_config(fast(ResumePolicy::Relist)));
    let task = tokio::spawn({
        let r = Arc::clone(&r);
        async move { r.run().await }
    });

    let first = next_watch(&mut created).await;
    first.add(pod("foo", "2"));
    first.add(pod("bar", "3"));
    first.stop();

    // the relist replaced the queue before the second watch opened
    let second = next_watch(&mut created).await;
    assert_eq!(*calls.lock().unwrap(), vec!["1", "1"]);
    assert!(fifo.is_empty());
    second.add(pod("baz", "2"));
    assert_eq!(pop(&fifo).await, Popped::Object(pod("baz", "2")));

    r.stop();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_policy_relists_on_expired_version() {
    let lists = Arc::new(AtomicUsize::new(0));
    let watches = Arc::new(AtomicUsize::new(0));
    let (listed, watched) = (Arc::clone(&lists), Arc::clone(&watches));
    let lw = FakeListWatch::new(
        move || {
            listed.fetch_add(1, Ordering::SeqCst);
            Ok(Snapshot::new("1", vec![pod("a", "1")]))
        },
        move |_rv| {
            watched.fetch_add(1, Ordering::SeqCst);
            let (fw, stream) = FakeWatch::new();
            fw.error(ListWatchError::Expired("too old resource version".into()));
            Ok(stream)
        },
    );
    let store = Arc::new(Store::<FakeObject>::new());
    let config = ReflectorConfig::default()
        .with_resume(ResumePolicy::ResumeWatch)
        .with_retry(FixedDelay(Duration::from_millis(50)));
    let r: Arc<PodReflector> = Arc::new(Reflector::new(lw, "Pod", store.clone()).with_config(config));
    let task = tokio::spawn({
        let r = Arc::clone(&r);
        async move { r.run().await }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    r.stop();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();

    // every expired watch goes back through the retry delay and a fresh list
    let (lists, watches) = (lists.load(Ordering::SeqCst), watches.load(Ordering::SeqCst));
    assert!(lists >= 2, "lists={lists}");
    assert!(watches <= lists, "lists={lists} watches={watches}");
    assert!(watches < 20, "watches={watches}");
    assert_eq!(store.get("a").unwrap().version, "1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_policy_resumes_only_after_progress() {
    let (lw, calls, mut created) = scripted_source();
    let fifo = Arc::new(Fifo::<FakeObject>::new());
    let r: Arc<PodReflector> = Arc::new(Reflector::new(lw, "Pod", fifo.clone()).with_config(fast(ResumePolicy::ResumeWatch)));
    let task = tokio::spawn({
        let r = Arc::clone(&r);
        async move { r.run().await }
    });

    let first = next_watch(&mut created).await;
    first.add(pod("foo", "2"));
    first.error(ListWatchError::Transport("connection reset".into()));

    // progress was made, so the transport error resumes from "2"
    let second = next_watch(&mut created).await;
    assert_eq!(*calls.lock().unwrap(), vec!["1", "2"]);
    second.add(pod("bar", "3"));
    second.error(ListWatchError::Expired("too old resource version".into()));

    // an expired version always relists
    let third = next_watch(&mut created).await;
    assert_eq!(*calls.lock().unwrap(), vec!["1", "2", "1"]);
    third.error(ListWatchError::Transport("connection reset".into()));

    // no event before the failure: relist rather than resume
    let _fourth = next_watch(&mut created).await;
    assert_eq!(*calls.lock().unwrap(), vec!["1", "2", "1", "1"]);

    r.stop();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test]
async fn cycles_with_list_and_watch_errors() {
    fn list_of(rv: &str, pods: &[FakeObject]) -> Snapshot<FakeObject> { Snapshot::new(rv, pods.to_vec()) }

    struct Case {
        list: Option<Snapshot<FakeObject>>,
        events: Vec<WatchEvent<FakeObject>>,
        watch_err: bool,
    }
    let table = vec![
        Case {
            list: Some(list_of("1", &[])),
            events: vec![WatchEvent::Added(pod("foo", "2")), WatchEvent::Added(pod("bar", "3"))],
            watch_err: false,
        },
        Case {
            list: Some(list_of("3", &[pod("foo", "2"), pod("bar", "3")])),
            events: vec![WatchEvent::Deleted(pod("foo", "4")), WatchEvent::Added(pod("qux", "5"))],
            watch_err: false,
        },
        Case { list: None, events: Vec::new(), watch_err: false },
        Case { list: Some(list_of("5", &[pod("bar", "3"), pod("qux", "5")])), events: Vec::new(), watch_err: true },
        Case {
            list: Some(list_of("5", &[pod("bar", "3"), pod("qux", "5")])),
            events: vec![WatchEvent::Added(pod("baz", "6"))],
            watch_err: false,
        },
        Case { list: Some(list_of("6", &[pod("bar", "3"), pod("qux", "5"), pod("baz", "6")])), events: Vec::new(), watch_err: false },
    ];

    let fifo = Arc::new(Fifo::<FakeObject>::new());
    for (line, case) in table.into_iter().enumerate() {
        if let Some(list) = &case.list {
            // what the previous cycles left behind must be exactly this listing
            let current: HashMap<String, String> = fifo.list().into_iter().map(|p| (p.name, p.version)).collect();
            for p in &list.items {
                assert_eq!(current.get(&p.name), Some(&p.version), "{line}: pod {}", p.name);
            }
            assert_eq!(current.len(), list.items.len(), "{line}");
        }

        let list = case.list.clone();
        let events = case.events.clone();
        let watch_err = case.watch_err;
        let opened = Arc::new(AtomicUsize::new(0));
        let lw = FakeListWatch::new(
            move || list.clone().ok_or_else(|| ListWatchError::Transport("a list error".into())),
            move |_rv| {
                if watch_err || opened.fetch_add(1, Ordering::SeqCst) > 0 {
                    return Err(ListWatchError::Transport("a watch error".into()));
                }
                let (fw, stream) = FakeWatch::new();
                for e in events.iter().cloned() {
                    fw.action(e);
                }
                fw.stop();
                Ok(stream)
            },
        );
        let r: PodReflector = Reflector::new(lw, "Pod", fifo.clone());
        let res = r.list_and_watch().await;
        match (&case.list, watch_err, case.events.len()) {
            (None, _, _) => assert!(matches!(res, Err(ReflectorError::List(_))), "{line}: {res:?}"),
            (_, true, _) => assert!(matches!(res, Err(ReflectorError::WatchOpen(_))), "{line}: {res:?}"),
            (_, _, 0) => assert!(matches!(res, Err(ReflectorError::VeryShortWatch { .. })), "{line}: {res:?}"),
            (_, _, n) => assert!(matches!(res, Err(ReflectorError::StreamClosed { events }) if events == n), "{line}: {res:?}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_replaces_baseline() {
    let lists = Arc::new(AtomicUsize::new(0));
    let listed = Arc::clone(&lists);
    let (created_tx, mut created) = mpsc::unbounded_channel();
    let lw = FakeListWatch::new(
        move || {
            if listed.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Snapshot::new("1", vec![pod("a", "1"), pod("b", "1")]))
            } else {
                Ok(Snapshot::new("5", vec![pod("b", "4"), pod("c", "5")]))
            }
        },
        move |_rv| {
            let (fw, stream) = FakeWatch::new();
            let _ = created_tx.send(fw);
            Ok(stream)
        },
    );
    let store = Arc::new(Store::<FakeObject>::new());
    let r: Arc<PodReflector> = Arc::new(Reflector::new(lw, "Pod", store.clone()).with_config(fast(ResumePolicy::Relist)));
    let task = tokio::spawn({
        let r = Arc::clone(&r);
        async move { r.run().await }
    });

    let first = next_watch(&mut created).await;
    assert_eq!(store.len(), 2);
    first.error(ListWatchError::Transport("connection reset".into()));

    let _second = next_watch(&mut created).await;
    assert_eq!(lists.load(Ordering::SeqCst), 2);
    assert!(store.get("a").is_none());
    assert_eq!(store.get("b").unwrap().version, "4");
    assert_eq!(store.get("c").unwrap().version, "5");
    assert_eq!(r.last_version(), "5");

    r.stop();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_while_retrying_releases_consumers() {
    let lw = FakeListWatch::new(
        || Err(ListWatchError::Transport("unreachable".into())),
        |_rv| Err(ListWatchError::Transport("unreachable".into())),
    );
    let fifo = Arc::new(Fifo::<FakeObject>::new());
    let config = ReflectorConfig::default().with_retry(FixedDelay(Duration::from_secs(3600)));
    let r: Arc<PodReflector> = Arc::new(Reflector::new(lw, "Pod", fifo.clone()).with_config(config));
    let task = tokio::spawn({
        let r = Arc::clone(&r);
        async move { r.run().await }
    });
    let consumer = tokio::spawn({
        let fifo = Arc::clone(&fifo);
        async move { fifo.pop().await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    r.stop();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    let popped = tokio::time::timeout(Duration::from_secs(5), consumer).await.unwrap().unwrap();
    assert_eq!(popped, Err(CacheError::Closed));
}
