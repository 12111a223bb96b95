use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mirra_core::{object_deletion_timestamp, Change, ChangeType, ResourceKey};
use mirra_kubehub::{MockTransport, TransportError, WatchScript};
use mirra_sync::{
    Collection, Engine, EngineConfig, EngineError, MemoryNotifier, NoticeAction, SessionHook, StreamState, WatchCallback,
    WatchOptions,
};
use mirra_select::LabelSelector;
use serde_json::{json, Value};

type Seen = Arc<Mutex<Vec<(usize, Option<Change>)>>>;

struct CountingSession(AtomicUsize);

impl SessionHook for CountingSession {
    fn login_required(&self) { self.0.fetch_add(1, Ordering::SeqCst); }
}

struct Harness {
    engine: Engine,
    mock: Arc<MockTransport>,
    notes: Arc<MemoryNotifier>,
    session: Arc<CountingSession>,
}

fn harness(cfg: EngineConfig) -> Harness {
    let mock = Arc::new(MockTransport::new());
    let notes = Arc::new(MemoryNotifier::new());
    let session = Arc::new(CountingSession(AtomicUsize::new(0)));
    let engine = Engine::spawn_with(mock.clone(), cfg, notes.clone(), session.clone());
    Harness { engine, mock, notes, session }
}

fn fast() -> EngineConfig {
    EngineConfig { reconnect_backoff: Duration::from_millis(100), ..EngineConfig::default() }
}

fn key() -> ResourceKey { ResourceKey::parse("pods", Some("web")).expect("key") }

fn pod(name: &str) -> Value { json!({"metadata": {"name": name, "labels": {"app": name}}}) }

fn recording() -> (WatchCallback, Seen) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    let cb: WatchCallback = Arc::new(move |coll: &Collection, change: Option<&Change>| {
        s.lock().expect("lock").push((coll.len(), change.cloned()));
    });
    (cb, seen)
}

fn frame(kind: &str, object: Value) -> Value { json!({"type": kind, "object": object}) }

/// Let every ready task run; with paused time this also fires due timers.
async fn settle() { tokio::time::sleep(Duration::from_millis(1)).await; }

#[tokio::test(start_paused = true)]
async fn concurrent_callers_share_one_list() {
    let h = harness(fast());
    h.mock.push_items("PodList", "1", vec![pod("a")]);
    h.mock.hold_lists();

    let fired = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..5 {
        let f = fired.clone();
        h.engine.list(&key(), move |res| {
            f.lock().expect("lock").push(res.map(|c| c.resource_version().map(String::from)).ok().flatten());
        });
    }
    let mut seen = Vec::new();
    for _ in 0..3 {
        let (cb, s) = recording();
        h.engine.watch(&key(), cb, WatchOptions::stream()).expect("watch");
        seen.push(s);
    }
    settle().await;
    assert_eq!(h.mock.list_calls(), 1);
    assert!(fired.lock().expect("lock").is_empty());

    h.mock.release_lists();
    settle().await;
    assert_eq!(h.mock.list_calls(), 1);
    assert_eq!(*fired.lock().expect("lock"), vec![Some("1".to_string()); 5]);
    for s in seen {
        assert_eq!(*s.lock().expect("lock"), vec![(1, None)]);
    }
    assert_eq!(h.mock.watch_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn second_watch_reuses_the_open_stream() {
    let h = harness(fast());
    h.mock.push_items("PodList", "1", vec![pod("a"), pod("b")]);
    let (first, _) = recording();
    h.engine.watch(&key(), first, WatchOptions::stream()).expect("watch");
    settle().await;
    assert_eq!(h.engine.stream_state(&key()).await, Some(StreamState::Open));
    assert_eq!(h.mock.watch_calls(), 1);

    let (second, seen) = recording();
    h.engine.watch(&key(), second, WatchOptions::stream()).expect("watch");
    assert!(seen.lock().expect("lock").is_empty());
    settle().await;
    assert_eq!(*seen.lock().expect("lock"), vec![(2, None)]);
    assert_eq!(h.mock.list_calls(), 1);
    assert_eq!(h.mock.watch_calls(), 1);

    // A one-shot list is answered from the live cache too.
    let got = h.engine.list_async(&key()).await.expect("cached");
    assert_eq!(got.len(), 2);
    assert_eq!(h.mock.list_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn changes_apply_in_order_and_deletions_are_stamped() {
    let h = harness(fast());
    h.mock.push_items("PodList", "1", vec![]);
    let (cb, seen) = recording();
    h.engine.watch(&key(), cb, WatchOptions::stream()).expect("watch");
    settle().await;

    h.mock.push_frame(0, &frame("ADDED", json!({"metadata": {"name": "a", "resourceVersion": "2"}})));
    h.mock.push_frame(0, &frame("MODIFIED", json!({"metadata": {"name": "a", "resourceVersion": "3"}})));
    h.mock.push_frame(0, &frame("DELETED", json!({"metadata": {"name": "a", "resourceVersion": "4"}})));
    settle().await;

    let seen = seen.lock().expect("lock").clone();
    let kinds: Vec<_> = seen.iter().map(|(_, c)| c.as_ref().map(|c| c.kind)).collect();
    assert_eq!(kinds, vec![None, Some(ChangeType::Added), Some(ChangeType::Modified), Some(ChangeType::Deleted)]);
    let deleted = seen.last().and_then(|(_, c)| c.clone()).expect("deleted change");
    assert!(object_deletion_timestamp(&deleted.object).is_some());

    let coll = h.engine.collection(&key()).await.expect("collection");
    assert!(!coll.contains("a"));
    assert_eq!(coll.resource_version(), Some("4"));
}

#[tokio::test(start_paused = true)]
async fn existing_deletion_timestamp_is_kept() {
    let h = harness(fast());
    h.mock.push_items("PodList", "1", vec![]);
    let (cb, seen) = recording();
    h.engine.watch(&key(), cb, WatchOptions::stream()).expect("watch");
    settle().await;
    let ts = "2020-02-02T00:00:00Z";
    h.mock.push_frame(0, &frame("DELETED", json!({"metadata": {"name": "a", "deletionTimestamp": ts}})));
    settle().await;
    let last = seen.lock().expect("lock").last().and_then(|(_, c)| c.clone()).expect("change");
    assert_eq!(object_deletion_timestamp(&last.object), Some(ts));
}

#[tokio::test(start_paused = true)]
async fn list_items_get_their_kind_backfilled() {
    let h = harness(fast());
    h.mock.push_items("PodList", "1", vec![pod("a"), json!({"kind": "Custom", "metadata": {"name": "b"}})]);
    let coll = h.engine.list_async(&key()).await.expect("list");
    assert_eq!(coll.get("a").expect("a")["kind"], "Pod");
    assert_eq!(coll.get("b").expect("b")["kind"], "Custom");
    // Nobody subscribed, so nothing is kept around.
    settle().await;
    assert_eq!(h.engine.tracked_keys().await, 0);
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped_without_closing_the_stream() {
    let h = harness(fast());
    h.mock.push_items("PodList", "1", vec![]);
    let (cb, seen) = recording();
    h.engine.watch(&key(), cb, WatchOptions::stream()).expect("watch");
    settle().await;
    h.mock.push_line(0, "{not json");
    h.mock.push_frame(0, &json!({"type": "ADDED"}));
    h.mock.push_frame(0, &frame("SOMETHING", json!({})));
    h.mock.push_frame(0, &frame("ADDED", pod("b")));
    settle().await;
    assert_eq!(seen.lock().expect("lock").len(), 2);
    assert!(h.mock.stream_attached(0));
    assert_eq!(h.mock.watch_calls(), 1);
    assert_eq!(h.engine.stream_state(&key()).await, Some(StreamState::Open));
}

#[tokio::test(start_paused = true)]
async fn unexpected_close_resumes_from_last_resource_version() {
    let h = harness(fast());
    h.mock.push_items("PodList", "1", vec![]);
    let (cb, _) = recording();
    h.engine.watch(&key(), cb, WatchOptions::stream()).expect("watch");
    settle().await;
    h.mock.push_frame(0, &frame("MODIFIED", json!({"metadata": {"name": "a", "resourceVersion": "5"}})));
    h.mock.push_frame(0, &frame("BOOKMARK", json!({"metadata": {"resourceVersion": "6"}})));
    h.mock.close_stream(0);
    settle().await;
    assert_eq!(h.engine.stream_state(&key()).await, Some(StreamState::ClosedRetryable));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.mock.watch_versions(), vec![Some("1".to_string()), Some("6".to_string())]);
    assert_eq!(h.mock.list_calls(), 1);
    assert_eq!(h.engine.stream_state(&key()).await, Some(StreamState::Open));
}

#[tokio::test(start_paused = true)]
async fn expired_resume_window_relists_before_reopening() {
    let h = harness(fast());
    h.mock.push_items("PodList", "1", vec![pod("a")]);
    h.mock.push_items("PodList", "7", vec![pod("b")]);
    let (cb, seen) = recording();
    h.engine.watch(&key(), cb, WatchOptions::stream()).expect("watch");
    settle().await;

    h.mock.push_frame(0, &frame("ERROR", json!({"kind": "Status", "code": 410})));
    settle().await;
    assert_eq!(h.engine.stream_state(&key()).await, Some(StreamState::RelistRequired));
    assert!(h.mock.stream_attached(0));

    h.mock.close_stream(0);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.mock.list_calls(), 2);
    assert_eq!(h.mock.watch_versions(), vec![Some("1".to_string()), Some("7".to_string())]);
    let coll = h.engine.collection(&key()).await.expect("collection");
    assert_eq!(coll.names().collect::<Vec<_>>(), vec!["b"]);
    assert_eq!(seen.lock().expect("lock").last().map(|(n, c)| (*n, c.is_none())), Some((1, true)));
}

#[tokio::test(start_paused = true)]
async fn rapid_flapping_halts_after_ten_events() {
    let h = harness(fast());
    h.mock.push_items("PodList", "1", vec![]);
    h.mock.set_watch_default(WatchScript::Ended);
    let (cb, _) = recording();
    h.engine.watch(&key(), cb, WatchOptions::stream()).expect("watch");

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.mock.watch_calls(), 5);
    assert_eq!(h.engine.stream_state(&key()).await, Some(StreamState::Halted));

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.mock.watch_calls(), 5);
    let halts: Vec<_> = h.notes.notices().into_iter().filter(|n| n.persistent).collect();
    assert_eq!(halts.len(), 1);
    assert_eq!(halts[0].action, Some(NoticeAction::Reload));
    assert_eq!(halts[0].key, Some(key()));
}

#[tokio::test(start_paused = true)]
async fn slow_failures_halt_after_five_closes() {
    let h = harness(EngineConfig { reconnect_backoff: Duration::from_secs(120), ..EngineConfig::default() });
    h.mock.push_items("PodList", "1", vec![]);
    h.mock.set_watch_default(WatchScript::Fail(TransportError::Connect("refused".into())));
    let (cb, _) = recording();
    h.engine.watch(&key(), cb, WatchOptions::stream()).expect("watch");

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.mock.watch_calls(), 5);
    assert_eq!(h.engine.stream_state(&key()).await, Some(StreamState::Halted));
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(h.mock.watch_calls(), 5);
}

#[tokio::test(start_paused = true)]
async fn navigation_resets_abuse_history() {
    let h = harness(EngineConfig { reconnect_backoff: Duration::from_secs(120), ..EngineConfig::default() });
    h.mock.push_items("PodList", "1", vec![]);
    h.mock.set_watch_default(WatchScript::Fail(TransportError::Connect("refused".into())));
    let (cb, _) = recording();
    h.engine.watch(&key(), cb, WatchOptions::stream()).expect("watch");

    // Four failed opens at 0s, 120s, 240s and 360s.
    tokio::time::sleep(Duration::from_secs(400)).await;
    assert_eq!(h.mock.watch_calls(), 4);
    h.engine.navigated();
    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(h.mock.watch_calls(), 5);
    assert_eq!(h.engine.stream_state(&key()).await, Some(StreamState::ClosedRetryable));
}

#[tokio::test(start_paused = true)]
async fn unwatch_closes_the_stream_for_good() {
    let h = harness(fast());
    h.mock.push_items("PodList", "1", vec![]);
    let (cb, _) = recording();
    let handle = h.engine.watch(&key(), cb, WatchOptions::stream()).expect("watch");
    settle().await;
    assert!(h.mock.stream_attached(0));

    h.engine.unwatch(&handle);
    h.engine.unwatch(&handle);
    settle().await;
    assert!(!h.mock.stream_attached(0));
    assert_eq!(h.engine.stream_state(&key()).await, None);
    assert_eq!(h.engine.tracked_keys().await, 0);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(h.mock.watch_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn poll_mode_relists_on_a_timer() {
    let h = harness(fast());
    h.mock.push_items("PodList", "1", vec![pod("a")]);
    h.mock.push_items("PodList", "2", vec![pod("a"), pod("b")]);
    let (cb, seen) = recording();
    let handle = h.engine.watch(&key(), cb, WatchOptions::poll(Some(Duration::from_secs(1)))).expect("watch");
    settle().await;
    assert_eq!(h.mock.list_calls(), 1);
    assert_eq!(h.mock.watch_calls(), 0);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(h.mock.list_calls(), 2);
    assert_eq!(*seen.lock().expect("lock"), vec![(1, None), (2, None)]);

    let err = h.engine.watch(&key(), recording().0, WatchOptions::stream()).expect_err("mode clash");
    assert!(matches!(err, EngineError::Config(_)));

    h.engine.unwatch(&handle);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.mock.list_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn watch_object_only_sees_its_object() {
    let h = harness(fast());
    h.mock.push_items("PodList", "1", vec![pod("a"), pod("b")]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = seen.clone();
    h.engine
        .watch_object(
            &key(),
            "a",
            move |obj: &Value, change: Option<ChangeType>| {
                s.lock().expect("lock").push((obj["metadata"]["name"].as_str().map(String::from), change));
            },
            WatchOptions::stream(),
        )
        .expect("watch");
    settle().await;
    h.mock.push_frame(0, &frame("MODIFIED", pod("b")));
    h.mock.push_frame(0, &frame("MODIFIED", pod("a")));
    settle().await;
    assert_eq!(
        *seen.lock().expect("lock"),
        vec![(Some("a".to_string()), None), (Some("a".to_string()), Some(ChangeType::Modified))]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_list_reaches_every_waiter_and_the_notifier() {
    let h = harness(fast());
    h.mock.push_list(Err(TransportError::Unauthorized("token expired".into())));
    h.mock.hold_lists();
    let errors = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let e = errors.clone();
        h.engine.list(&key(), move |res| {
            if let Err(err) = res {
                assert!(err.is_unauthorized());
                e.fetch_add(1, Ordering::SeqCst);
            }
        });
    }
    settle().await;
    h.mock.release_lists();
    settle().await;
    assert_eq!(errors.load(Ordering::SeqCst), 2);
    assert_eq!(h.mock.list_calls(), 1);
    assert_eq!(h.notes.notices().len(), 1);
    assert_eq!(h.session.0.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn selector_filters_the_live_collection() {
    let h = harness(fast());
    h.mock.push_items("PodList", "1", vec![pod("web"), pod("db")]);
    let sel: LabelSelector = "app in (web,cache)".parse().expect("selector");
    let views = Arc::new(Mutex::new(Vec::new()));
    let v = views.clone();
    let cb: WatchCallback = Arc::new(move |coll: &Collection, _: Option<&Change>| {
        v.lock().expect("lock").push(sel.select(coll.iter()).into_keys().collect::<Vec<_>>());
    });
    h.engine.watch(&key(), cb, WatchOptions::stream()).expect("watch");
    settle().await;

    h.mock.push_frame(0, &frame("ADDED", json!({"metadata": {"name": "cache", "resourceVersion": "2", "labels": {"app": "cache"}}})));
    h.mock.push_frame(0, &frame("MODIFIED", json!({"metadata": {"name": "web", "resourceVersion": "3", "labels": {"app": "legacy"}}})));
    settle().await;

    let views = views.lock().expect("lock").clone();
    assert_eq!(views, vec![vec!["web".to_string()], vec!["cache".to_string(), "web".to_string()], vec!["cache".to_string()]]);
}
