#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use recon_core::{Change, Key, Object, Tombstone};
use recon_store::{ChannelFeed, Informer, InformerConfig, ObjectCache, WatchEvent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn obj(name: &str, ns: Option<&str>, rv: &str) -> Object {
    let mut meta = serde_json::json!({ "name": name, "resourceVersion": rv });
    if let Some(ns) = ns {
        meta["namespace"] = serde_json::Value::String(ns.to_string());
    }
    Object::from_raw(serde_json::json!({ "kind": "User", "metadata": meta }))
}

/// (kind label, key, resource version) per observed change
#[derive(Default)]
struct Recorded(Mutex<Vec<(&'static str, String, String)>>);

impl Recorded {
    fn push(&self, change: Change) {
        let (label, obj) = match &change {
            Change::Added(o) => ("added", o.clone()),
            Change::Updated { new, .. } => ("updated", new.clone()),
            Change::Resynced(o) => ("resync", o.clone()),
            Change::Deleted(Tombstone::Final(o)) => ("deleted", o.clone()),
            Change::Deleted(Tombstone::StateUnknown { last_known, .. }) => ("deleted-unknown", last_known.clone()),
        };
        let key = change.key().map(|k| k.to_string()).unwrap_or_default();
        self.0.lock().unwrap().push((label, key, obj.resource_version.clone().unwrap_or_default()));
    }

    fn take(&self) -> Vec<(&'static str, String, String)> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }

    async fn wait_for(&self, n: usize) -> Vec<(&'static str, String, String)> {
        for _ in 0..10_000 {
            if self.0.lock().unwrap().len() >= n {
                return self.take();
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("expected {n} changes, saw {:?}", self.take());
    }
}

fn ev(label: &'static str, key: &str, rv: &str) -> (&'static str, String, String) {
    (label, key.to_string(), rv.to_string())
}

struct Harness {
    cache: ObjectCache,
    seen: Arc<Recorded>,
    tx: mpsc::Sender<WatchEvent>,
    feed: Arc<ChannelFeed>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

fn start(listing: Vec<Object>, config: InformerConfig, failing_lists: usize) -> Harness {
    let (tx, feed) = ChannelFeed::new(listing);
    feed.fail_next_lists(failing_lists);
    let feed = Arc::new(feed);
    let cache = ObjectCache::new();
    let seen = Arc::new(Recorded::default());
    let observer = {
        let seen = seen.clone();
        move |c: Change| seen.push(c)
    };
    let informer = Informer::new(feed.clone(), cache.clone(), Arc::new(observer)).with_config(config);
    let stop = CancellationToken::new();
    let task = tokio::spawn(informer.run(stop.clone()));
    Harness { cache, seen, tx, feed, stop, task }
}

fn no_resync() -> InformerConfig {
    InformerConfig { resync_period: None, ..InformerConfig::default() }
}

#[tokio::test(start_paused = true)]
async fn initial_list_then_incremental_events() {
    let h = start(vec![obj("foo", Some("default"), "1")], no_resync(), 0);
    assert_eq!(h.seen.wait_for(1).await, vec![ev("added", "default/foo", "1")]);
    assert!(h.cache.has_synced());

    h.tx.send(WatchEvent::Applied(obj("bar", Some("default"), "2"))).await.unwrap();
    h.tx.send(WatchEvent::Applied(obj("foo", Some("default"), "3"))).await.unwrap();
    h.tx.send(WatchEvent::Deleted(obj("bar", Some("default"), "4"))).await.unwrap();
    assert_eq!(
        h.seen.wait_for(3).await,
        vec![ev("added", "default/bar", "2"), ev("updated", "default/foo", "3"), ev("deleted", "default/bar", "4")]
    );
    assert!(h.cache.get(&Key::new("default/bar")).is_none());
    assert_eq!(h.cache.get(&Key::new("default/foo")).unwrap().resource_version.as_deref(), Some("3"));

    h.stop.cancel();
    h.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn deterministic_across_runs() {
    let seq = vec![
        WatchEvent::Applied(obj("a", Some("ns1"), "1")),
        WatchEvent::Applied(obj("b", Some("ns2"), "2")),
        WatchEvent::Applied(obj("c", None, "3")),
        WatchEvent::Applied(obj("b", Some("ns2"), "4")),
        WatchEvent::Applied(obj("b", Some("ns2"), "4")),
        WatchEvent::Deleted(obj("c", None, "5")),
        WatchEvent::Applied(obj("d", Some("prod"), "6")),
    ];

    let mut runs = Vec::new();
    for _ in 0..2 {
        let h = start(Vec::new(), no_resync(), 0);
        for e in seq.iter().cloned() {
            h.tx.send(e).await.unwrap();
        }
        h.seen.wait_for(seq.len()).await;
        let canon: Vec<(String, Option<String>)> = h
            .cache
            .keys()
            .into_iter()
            .map(|k| {
                let rv = h.cache.get(&k).and_then(|o| o.resource_version.clone());
                (k.to_string(), rv)
            })
            .collect();
        runs.push(canon);
        h.stop.cancel();
        h.task.await.unwrap();
    }
    assert_eq!(runs[0], runs[1], "cache contents must be deterministic across runs");
    assert_eq!(
        runs[0],
        vec![
            ("ns1/a".to_string(), Some("1".to_string())),
            ("ns2/b".to_string(), Some("4".to_string())),
            ("prod/d".to_string(), Some("6".to_string())),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn periodic_resync_replays_every_object() {
    let config = InformerConfig { resync_period: Some(Duration::from_secs(30)), ..InformerConfig::default() };
    let h = start(vec![obj("a", Some("ns"), "1"), obj("b", Some("ns"), "1")], config, 0);
    h.seen.wait_for(2).await;

    tokio::time::sleep(Duration::from_secs(29)).await;
    assert!(h.seen.take().is_empty());

    tokio::time::sleep(Duration::from_secs(2)).await;
    let mut replayed = h.seen.wait_for(2).await;
    replayed.sort();
    assert_eq!(replayed, vec![ev("resync", "ns/a", "1"), ev("resync", "ns/b", "1")]);

    h.stop.cancel();
    h.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn restart_reports_vanished_objects_as_unknown_deletes() {
    let h = start(vec![obj("a", Some("ns"), "1"), obj("b", Some("ns"), "1")], no_resync(), 0);
    h.seen.wait_for(2).await;

    h.tx.send(WatchEvent::Restarted(vec![obj("a", Some("ns"), "1")])).await.unwrap();
    let mut after = h.seen.wait_for(2).await;
    after.sort();
    assert_eq!(after, vec![ev("deleted-unknown", "ns/b", "1"), ev("updated", "ns/a", "1")]);
    assert_eq!(h.cache.keys(), vec![Key::new("ns/a")]);

    h.stop.cancel();
    h.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn ended_watch_triggers_relist() {
    let h = start(vec![obj("a", Some("ns"), "1")], no_resync(), 0);
    h.seen.wait_for(1).await;

    h.feed.set_listing(vec![obj("a", Some("ns"), "2"), obj("z", Some("ns"), "1")]);
    drop(h.tx);
    let mut relisted = h.seen.wait_for(2).await;
    relisted.sort();
    assert_eq!(relisted, vec![ev("added", "ns/z", "1"), ev("updated", "ns/a", "2")]);

    h.stop.cancel();
    h.task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_lists_are_retried_before_sync() {
    let h = start(vec![obj("a", Some("ns"), "1")], no_resync(), 3);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!h.cache.has_synced());
    h.seen.wait_for(1).await;
    assert!(h.cache.has_synced());

    h.stop.cancel();
    h.task.await.unwrap();
    assert!(h.cache.has_synced(), "sync flag never reverts");
}

#[tokio::test(start_paused = true)]
async fn stop_interrupts_a_never_ending_list_retry() {
    let h = start(Vec::new(), no_resync(), usize::MAX);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!h.cache.has_synced());
    h.stop.cancel();
    tokio::time::timeout(Duration::from_secs(1), h.task).await.expect("informer stops promptly").unwrap();
}
