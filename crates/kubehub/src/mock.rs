//! Scripted in-memory transport.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use mirra_core::{object_name, ResourceKey};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use crate::{Transport, TransportError, WatchLines};

/// What the next `watch` call does.
#[derive(Debug, Clone)]
pub enum WatchScript {
    /// Open a stream fed by the test through [`MockTransport::push_line`].
    Hold,
    /// Open, then end immediately.
    Ended,
    /// Fail to open.
    Fail(TransportError),
}

type Feed = mpsc::UnboundedReceiver<Result<String, TransportError>>;

fn feed_stream(rx: Feed) -> WatchLines {
    futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// Transport double with call counters.
///
/// List responses are consumed FIFO; the last one is reused once the queue
/// drains. Lists can be held open with [`MockTransport::hold_lists`] so tests
/// can pile up concurrent callers before the first response lands.
pub struct MockTransport {
    lists: Mutex<VecDeque<Result<Value, TransportError>>>,
    last_list: Mutex<Option<Result<Value, TransportError>>>,
    list_gate: watch::Sender<bool>,
    watch_scripts: Mutex<VecDeque<WatchScript>>,
    watch_default: Mutex<WatchScript>,
    feeds: Mutex<Vec<Option<mpsc::UnboundedSender<Result<String, TransportError>>>>>,
    watch_versions: Mutex<Vec<Option<String>>>,
    objects: Mutex<HashMap<(ResourceKey, String), Value>>,
    request_failures: Mutex<VecDeque<TransportError>>,
    list_calls: AtomicUsize,
    watch_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        let (list_gate, _) = watch::channel(true);
        Self {
            lists: Mutex::new(VecDeque::new()),
            last_list: Mutex::new(None),
            list_gate,
            watch_scripts: Mutex::new(VecDeque::new()),
            watch_default: Mutex::new(WatchScript::Hold),
            feeds: Mutex::new(Vec::new()),
            watch_versions: Mutex::new(Vec::new()),
            objects: Mutex::new(HashMap::new()),
            request_failures: Mutex::new(VecDeque::new()),
            list_calls: AtomicUsize::new(0),
            watch_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
        }
    }
}

impl MockTransport {
    pub fn new() -> Self { Self::default() }

    /// Queue a list response.
    pub fn push_list(&self, resp: Result<Value, TransportError>) { lock(&self.lists).push_back(resp); }

    /// Convenience: queue `{kind, metadata.resourceVersion, items}`.
    pub fn push_items(&self, kind: &str, resource_version: &str, items: Vec<Value>) {
        self.push_list(Ok(json!({
            "kind": kind,
            "apiVersion": "v1",
            "metadata": {"resourceVersion": resource_version},
            "items": items,
        })));
    }

    pub fn hold_lists(&self) { self.list_gate.send_replace(false); }
    pub fn release_lists(&self) { self.list_gate.send_replace(true); }

    pub fn push_watch(&self, script: WatchScript) { lock(&self.watch_scripts).push_back(script); }
    pub fn set_watch_default(&self, script: WatchScript) { *lock(&self.watch_default) = script; }

    /// Fail the next one-shot request (get/create/update/delete).
    pub fn fail_next_request(&self, err: TransportError) { lock(&self.request_failures).push_back(err); }

    pub fn insert_object(&self, key: &ResourceKey, obj: Value) {
        if let Some(name) = object_name(&obj).map(|s| s.to_string()) {
            lock(&self.objects).insert((key.clone(), name), obj);
        }
    }

    /// Feed one line into stream `idx` (0-based, in open order).
    pub fn push_line(&self, idx: usize, line: impl Into<String>) -> bool {
        match lock(&self.feeds).get(idx).and_then(|f| f.as_ref()) {
            Some(tx) => tx.send(Ok(line.into())).is_ok(),
            None => false,
        }
    }

    pub fn push_frame(&self, idx: usize, frame: &Value) -> bool { self.push_line(idx, frame.to_string()) }

    /// End stream `idx` from the server side.
    pub fn close_stream(&self, idx: usize) {
        if let Some(slot) = lock(&self.feeds).get_mut(idx) { slot.take(); }
    }

    /// End stream `idx` with a transport error.
    pub fn fail_stream(&self, idx: usize, err: TransportError) {
        if let Some(tx) = lock(&self.feeds).get_mut(idx).and_then(|s| s.take()) { let _ = tx.send(Err(err)); }
    }

    /// Whether the consumer of stream `idx` is still attached.
    pub fn stream_attached(&self, idx: usize) -> bool {
        lock(&self.feeds).get(idx).and_then(|f| f.as_ref()).map(|tx| !tx.is_closed()).unwrap_or(false)
    }

    pub fn list_calls(&self) -> usize { self.list_calls.load(Ordering::SeqCst) }
    pub fn watch_calls(&self) -> usize { self.watch_calls.load(Ordering::SeqCst) }
    pub fn get_calls(&self) -> usize { self.get_calls.load(Ordering::SeqCst) }

    /// `resourceVersion` passed to each watch call, in order.
    pub fn watch_versions(&self) -> Vec<Option<String>> { lock(&self.watch_versions).clone() }

    fn take_failure(&self) -> Result<(), TransportError> {
        match lock(&self.request_failures).pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn not_found(name: &str) -> TransportError {
        TransportError::Status { code: 404, message: format!("\"{}\" not found", name) }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn list(&self, _key: &ResourceKey) -> Result<Value, TransportError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut gate = self.list_gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;
        let next = lock(&self.lists).pop_front();
        let mut last = lock(&self.last_list);
        match next {
            Some(resp) => {
                *last = Some(resp.clone());
                resp
            }
            None => last.clone().unwrap_or_else(|| Ok(json!({"kind": "List", "items": []}))),
        }
    }

    async fn watch(&self, _key: &ResourceKey, resource_version: Option<&str>) -> Result<WatchLines, TransportError> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.watch_versions).push(resource_version.map(|s| s.to_string()));
        let script = lock(&self.watch_scripts).pop_front().unwrap_or_else(|| lock(&self.watch_default).clone());
        let (tx, rx) = mpsc::unbounded_channel();
        match script {
            WatchScript::Fail(e) => {
                lock(&self.feeds).push(None);
                Err(e)
            }
            WatchScript::Ended => {
                lock(&self.feeds).push(None);
                drop(tx);
                Ok(feed_stream(rx))
            }
            WatchScript::Hold => {
                lock(&self.feeds).push(Some(tx));
                Ok(feed_stream(rx))
            }
        }
    }

    async fn get(&self, key: &ResourceKey, name: &str) -> Result<Value, TransportError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        lock(&self.objects).get(&(key.clone(), name.to_string())).cloned().ok_or_else(|| Self::not_found(name))
    }

    async fn create(&self, key: &ResourceKey, obj: &Value) -> Result<Value, TransportError> {
        self.take_failure()?;
        let name = object_name(obj)
            .ok_or_else(|| TransportError::Status { code: 422, message: "metadata.name is required".into() })?
            .to_string();
        let mut objects = lock(&self.objects);
        if objects.contains_key(&(key.clone(), name.clone())) {
            return Err(TransportError::Status { code: 409, message: format!("\"{}\" already exists", name) });
        }
        objects.insert((key.clone(), name), obj.clone());
        Ok(obj.clone())
    }

    async fn update(&self, key: &ResourceKey, name: &str, obj: &Value) -> Result<Value, TransportError> {
        self.take_failure()?;
        let mut objects = lock(&self.objects);
        match objects.get_mut(&(key.clone(), name.to_string())) {
            Some(slot) => {
                *slot = obj.clone();
                Ok(obj.clone())
            }
            None => Err(Self::not_found(name)),
        }
    }

    async fn delete(&self, key: &ResourceKey, name: &str) -> Result<Value, TransportError> {
        self.take_failure()?;
        lock(&self.objects)
            .remove(&(key.clone(), name.to_string()))
            .map(|_| json!({"kind": "Status", "status": "Success"}))
            .ok_or_else(|| Self::not_found(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ResourceKey { ResourceKey::parse("pods", Some("ns")).expect("key") }

    #[tokio::test]
    async fn list_queue_falls_back_to_last_response() {
        let m = MockTransport::new();
        m.push_items("PodList", "1", vec![]);
        m.push_items("PodList", "2", vec![]);
        assert_eq!(m.list(&key()).await.expect("list")["metadata"]["resourceVersion"], "1");
        assert_eq!(m.list(&key()).await.expect("list")["metadata"]["resourceVersion"], "2");
        assert_eq!(m.list(&key()).await.expect("list")["metadata"]["resourceVersion"], "2");
        assert_eq!(m.list_calls(), 3);
    }

    #[tokio::test]
    async fn held_stream_delivers_pushed_lines_until_closed() {
        let m = MockTransport::new();
        let mut s = m.watch(&key(), Some("5")).await.expect("open");
        assert!(m.push_line(0, "{}"));
        assert_eq!(s.next().await, Some(Ok("{}".to_string())));
        m.close_stream(0);
        assert_eq!(s.next().await, None);
        assert_eq!(m.watch_versions(), vec![Some("5".to_string())]);
    }

    #[tokio::test]
    async fn scripted_watch_failures() {
        let m = MockTransport::new();
        m.push_watch(WatchScript::Fail(TransportError::Connect("refused".into())));
        assert!(m.watch(&key(), None).await.is_err());
        let mut ended = m.watch(&key(), None).await.expect("default opens");
        m.close_stream(1);
        assert_eq!(ended.next().await, None);
    }

    #[tokio::test]
    async fn object_round_trip() {
        let m = MockTransport::new();
        let obj = json!({"metadata": {"name": "a"}});
        m.create(&key(), &obj).await.expect("create");
        assert_eq!(m.create(&key(), &obj).await.expect_err("dup").status(), Some(409));
        assert_eq!(m.get(&key(), "a").await.expect("get"), obj);
        m.delete(&key(), "a").await.expect("delete");
        assert_eq!(m.get(&key(), "a").await.expect_err("gone").status(), Some(404));
    }
}
