//! The driver task: owns every key's `WatchState` and runs the list -> stream
//! (or poll) handoff, frame application and the reconnect timers.
//!
//! Transport work is spawned and reports back through the same command
//! channel, so in-flight flags are always set before the work is issued and
//! no two callbacks for one key ever run concurrently.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics::{counter, gauge};
use mirra_core::{stamp_deletion, Change, ChangeType, ListEnvelope, ResourceKey};
use mirra_kubehub::{Transport, TransportError};
use mirra_store::{CallbackRegistry, Collection, SubscriptionId};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::notify::{Notice, Notifier, SessionHook};
use crate::reconnect::{AbuseDetector, CloseDecision, Reconnector, StreamState};
use crate::{EngineError, ListCallback, Mode, WatchCallback, WatchFn};

pub(crate) enum Command {
    List { key: ResourceKey, cb: ListCallback },
    Watch { key: ResourceKey, id: SubscriptionId, cb: WatchCallback, mode: Mode, poll_interval: Duration },
    Unwatch { key: ResourceKey, id: SubscriptionId },
    Navigated,
    ListDone { key: ResourceKey, result: Result<Value, TransportError> },
    StreamOpened { key: ResourceKey, gen: u64 },
    StreamFrame { key: ResourceKey, gen: u64, line: String },
    /// `opened == false` means the open itself failed.
    StreamClosed { key: ResourceKey, gen: u64, opened: bool, error: Option<TransportError> },
    TimerFired { key: ResourceKey, seq: u64 },
    Deliver { key: ResourceKey, delivery: Delivery },
    QueryState { key: ResourceKey, reply: oneshot::Sender<Option<StreamState>> },
    QueryCollection { key: ResourceKey, reply: oneshot::Sender<Option<Collection>> },
    QueryTracked { reply: oneshot::Sender<usize> },
    Shutdown,
}

/// Cached data handed out on a later turn.
pub(crate) enum Delivery {
    List(ListCallback),
    Watch(SubscriptionId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Reconnect,
    Relist,
    Poll,
}

struct Timer {
    kind: TimerKind,
    seq: u64,
    abort: AbortHandle,
}

struct StreamSlot {
    gen: u64,
    task: AbortHandle,
}

struct WatchState {
    collection: Option<Collection>,
    list_in_flight: bool,
    list_waiters: Vec<ListCallback>,
    subscribers: CallbackRegistry<WatchFn>,
    mode: Mode,
    poll_interval: Duration,
    stream: Option<StreamSlot>,
    reconnector: Reconnector,
    /// At most one of reconnect, relist or poll is pending.
    timer: Option<Timer>,
    pending_deliveries: usize,
}

impl WatchState {
    fn new(cfg: &EngineConfig) -> Self {
        Self {
            collection: None,
            list_in_flight: false,
            list_waiters: Vec::new(),
            subscribers: CallbackRegistry::new(),
            mode: Mode::Stream,
            poll_interval: cfg.poll_interval,
            stream: None,
            reconnector: Reconnector::new(AbuseDetector::from_config(cfg)),
            timer: None,
            pending_deliveries: 0,
        }
    }

    /// Cached data is current: a stream is up with a known resourceVersion,
    /// or the poll loop is running.
    fn serves_cached(&self) -> bool {
        let Some(coll) = self.collection.as_ref() else { return false };
        match self.mode {
            Mode::Stream => {
                self.stream.is_some()
                    && matches!(self.reconnector.state(), Some(StreamState::Connecting | StreamState::Open))
                    && coll.resource_version().is_some()
            }
            Mode::Poll => matches!(self.timer, Some(Timer { kind: TimerKind::Poll, .. })),
        }
    }

    fn idle(&self) -> bool {
        !self.subscribers.has_any()
            && !self.list_in_flight
            && self.list_waiters.is_empty()
            && self.stream.is_none()
            && self.timer.is_none()
            && self.pending_deliveries == 0
    }

    fn cancel_timer(&mut self) {
        if let Some(t) = self.timer.take() { t.abort.abort(); }
    }
}

/// What to start once a list completed.
enum Handoff {
    None,
    Stream,
    Poll(Duration),
}

#[derive(Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    object: Value,
}

pub(crate) struct Driver {
    tx: mpsc::UnboundedSender<Command>,
    transport: Arc<dyn Transport>,
    config: Arc<EngineConfig>,
    notifier: Arc<dyn Notifier>,
    session: Arc<dyn SessionHook>,
    states: FxHashMap<ResourceKey, WatchState>,
    next_gen: u64,
    next_timer: u64,
}

impl Driver {
    pub(crate) fn new(
        tx: mpsc::UnboundedSender<Command>,
        transport: Arc<dyn Transport>,
        config: Arc<EngineConfig>,
        notifier: Arc<dyn Notifier>,
        session: Arc<dyn SessionHook>,
    ) -> Self {
        Self { tx, transport, config, notifier, session, states: FxHashMap::default(), next_gen: 0, next_timer: 0 }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::List { key, cb } => self.on_list(key, cb),
                Command::Watch { key, id, cb, mode, poll_interval } => self.on_watch(key, id, cb, mode, poll_interval),
                Command::Unwatch { key, id } => self.on_unwatch(key, id),
                Command::Navigated => self.on_navigated(),
                Command::ListDone { key, result } => self.on_list_done(key, result),
                Command::StreamOpened { key, gen } => self.on_stream_opened(&key, gen),
                Command::StreamFrame { key, gen, line } => self.on_frame(&key, gen, &line),
                Command::StreamClosed { key, gen, opened, error } => self.on_stream_closed(key, gen, opened, error),
                Command::TimerFired { key, seq } => self.on_timer(key, seq),
                Command::Deliver { key, delivery } => self.on_deliver(key, delivery),
                Command::QueryState { key, reply } => {
                    let _ = reply.send(self.states.get(&key).and_then(|s| s.reconnector.state()));
                }
                Command::QueryCollection { key, reply } => {
                    let _ = reply.send(self.states.get(&key).and_then(|s| s.collection.clone()));
                }
                Command::QueryTracked { reply } => {
                    let _ = reply.send(self.states.len());
                }
                Command::Shutdown => break,
            }
        }
        self.shutdown();
    }

    fn shutdown(&mut self) {
        for (_, mut st) in self.states.drain() {
            st.reconnector.mark_do_not_reopen();
            if let Some(slot) = st.stream.take() { slot.task.abort(); }
            st.cancel_timer();
        }
        gauge!("sync_watched_keys", 0.0);
        info!("sync: driver stopped");
    }

    fn state(&mut self, key: &ResourceKey) -> &mut WatchState {
        let cfg = &self.config;
        self.states.entry(key.clone()).or_insert_with(|| WatchState::new(cfg))
    }

    fn discard_if_idle(&mut self, key: &ResourceKey) {
        if self.states.get(key).map(|s| s.idle()).unwrap_or(false) {
            self.states.remove(key);
            debug!(key = %key, "sync: watch state discarded");
        }
        gauge!("sync_watched_keys", self.states.len() as f64);
    }

    // ---- consumer commands ----

    fn on_list(&mut self, key: ResourceKey, cb: ListCallback) {
        let st = self.state(&key);
        if st.serves_cached() {
            self.defer(key, Delivery::List(cb));
            return;
        }
        st.list_waiters.push(cb);
        self.start_list(&key);
    }

    fn on_watch(&mut self, key: ResourceKey, id: SubscriptionId, cb: WatchCallback, mode: Mode, poll_interval: Duration) {
        let st = self.state(&key);
        if !st.subscribers.has_any() {
            st.mode = mode;
            st.poll_interval = poll_interval;
        }
        if !st.subscribers.insert(id, cb) {
            // Same callback already subscribed; the new id only aliases it.
            return;
        }
        gauge!("sync_watched_keys", self.states.len() as f64);
        let Some(st) = self.states.get(&key) else { return };
        if st.serves_cached() {
            self.defer(key, Delivery::Watch(id));
        } else if !st.list_in_flight {
            self.start_list(&key);
        }
    }

    fn on_unwatch(&mut self, key: ResourceKey, id: SubscriptionId) {
        let Some(st) = self.states.get_mut(&key) else { return };
        if !st.subscribers.remove(id) { return; }
        if !st.subscribers.has_any() {
            st.reconnector.mark_do_not_reopen();
            if let Some(slot) = st.stream.take() {
                slot.task.abort();
                st.reconnector.closed(Instant::now(), false);
                counter!("sync_stream_closes_total", 1u64, "reason" => "unwatch");
            }
            st.cancel_timer();
            debug!(key = %key, "sync: last subscriber gone, stream and timers stopped");
        }
        self.discard_if_idle(&key);
    }

    fn on_navigated(&mut self) {
        for st in self.states.values_mut() { st.reconnector.clear_history(); }
        debug!(keys = self.states.len(), "sync: navigation, abuse history cleared");
    }

    fn defer(&mut self, key: ResourceKey, delivery: Delivery) {
        if let Some(st) = self.states.get_mut(&key) { st.pending_deliveries += 1; }
        let _ = self.tx.send(Command::Deliver { key, delivery });
    }

    fn on_deliver(&mut self, key: ResourceKey, delivery: Delivery) {
        let Some(st) = self.states.get_mut(&key) else { return };
        st.pending_deliveries = st.pending_deliveries.saturating_sub(1);
        match delivery {
            Delivery::List(cb) => {
                if let Some(coll) = st.collection.as_ref() {
                    cb(Ok(coll));
                } else {
                    st.list_waiters.push(cb);
                    self.start_list(&key);
                }
            }
            Delivery::Watch(id) => {
                if let (Some(coll), Some(sub)) = (st.collection.as_ref(), st.subscribers.get(id)) { sub(coll, None); }
            }
        }
        self.discard_if_idle(&key);
    }

    // ---- list ----

    fn start_list(&mut self, key: &ResourceKey) {
        let st = self.state(key);
        if st.list_in_flight { return; }
        st.list_in_flight = true;
        counter!("sync_list_requests_total", 1u64);
        let transport = self.transport.clone();
        let tx = self.tx.clone();
        let key = key.clone();
        debug!(key = %key, "sync: list start");
        tokio::spawn(async move {
            let result = transport.list(&key).await;
            let _ = tx.send(Command::ListDone { key, result });
        });
    }

    fn on_list_done(&mut self, key: ResourceKey, result: Result<Value, TransportError>) {
        let Some(st) = self.states.get_mut(&key) else { return };
        st.list_in_flight = false;
        let decoded = result.map_err(EngineError::from).and_then(|v| ListEnvelope::from_value(v).map_err(EngineError::from));
        let handoff = match decoded {
            Ok(mut env) => {
                let filled = env.normalize();
                let coll = match st.collection.take() {
                    Some(mut c) => {
                        c.replace(env);
                        c
                    }
                    None => Collection::from_list(env),
                };
                let coll: &Collection = st.collection.insert(coll);
                debug!(key = %key, items = coll.len(), filled, rv = ?coll.resource_version(), "sync: list ok");
                for cb in std::mem::take(&mut st.list_waiters) { cb(Ok(coll)); }
                st.subscribers.fire(|sub| sub(coll, None));
                Self::handoff(st)
            }
            Err(err) => {
                warn!(key = %key, error = %err, "sync: list failed");
                for cb in std::mem::take(&mut st.list_waiters) { cb(Err(&err)); }
                self.notifier.notify(Notice::error(Some(&key), format!("failed to load {}: {}", key, err)));
                if err.is_unauthorized() { self.session.login_required(); }
                let mode = st.mode;
                match mode {
                    Mode::Poll if st.subscribers.has_any() && st.timer.is_none() => Handoff::Poll(st.poll_interval),
                    Mode::Stream if st.subscribers.has_any() && st.reconnector.state() == Some(StreamState::RelistRequired) => {
                        let decision = st.reconnector.relist_failed(Instant::now(), true);
                        self.apply_close_decision(&key, decision);
                        Handoff::None
                    }
                    _ => Handoff::None,
                }
            }
        };
        match handoff {
            Handoff::Stream => self.start_stream(&key),
            Handoff::Poll(every) => self.arm_timer(&key, TimerKind::Poll, every),
            Handoff::None => {}
        }
        self.discard_if_idle(&key);
    }

    fn handoff(st: &mut WatchState) -> Handoff {
        if !st.subscribers.has_any() { return Handoff::None; }
        match st.mode {
            Mode::Poll => match st.timer {
                None => Handoff::Poll(st.poll_interval),
                Some(_) => Handoff::None,
            },
            Mode::Stream => {
                if st.stream.is_some() || st.reconnector.is_halted() { return Handoff::None; }
                // A pending backoff reconnect resumes on its own; a pending relist is now redundant.
                match st.timer.as_ref().map(|t| t.kind) {
                    Some(TimerKind::Reconnect) => Handoff::None,
                    _ => {
                        st.cancel_timer();
                        Handoff::Stream
                    }
                }
            }
        }
    }

    // ---- stream ----

    fn start_stream(&mut self, key: &ResourceKey) {
        self.next_gen += 1;
        let gen = self.next_gen;
        let Some(st) = self.states.get_mut(key) else { return };
        if st.stream.is_some() || !st.reconnector.connecting() { return; }
        let rv = st.collection.as_ref().and_then(|c| c.resource_version()).map(|s| s.to_string());
        let transport = self.transport.clone();
        let tx = self.tx.clone();
        let k = key.clone();
        debug!(key = %key, gen, rv = ?rv, "sync: stream connecting");
        let task = tokio::spawn(async move {
            let mut lines = match transport.watch(&k, rv.as_deref()).await {
                Ok(lines) => lines,
                Err(error) => {
                    let _ = tx.send(Command::StreamClosed { key: k, gen, opened: false, error: Some(error) });
                    return;
                }
            };
            if tx.send(Command::StreamOpened { key: k.clone(), gen }).is_err() { return; }
            let mut error = None;
            while let Some(item) = lines.next().await {
                match item {
                    Ok(line) => {
                        if tx.send(Command::StreamFrame { key: k.clone(), gen, line }).is_err() { return; }
                    }
                    Err(e) => {
                        error = Some(e);
                        break;
                    }
                }
            }
            let _ = tx.send(Command::StreamClosed { key: k, gen, opened: true, error });
        });
        st.stream = Some(StreamSlot { gen, task: task.abort_handle() });
    }

    fn current<'a>(states: &'a mut FxHashMap<ResourceKey, WatchState>, key: &ResourceKey, gen: u64) -> Option<&'a mut WatchState> {
        states.get_mut(key).filter(|st| st.stream.as_ref().map(|s| s.gen) == Some(gen))
    }

    fn on_stream_opened(&mut self, key: &ResourceKey, gen: u64) {
        let Some(st) = Self::current(&mut self.states, key, gen) else { return };
        st.reconnector.opened(Instant::now());
        counter!("sync_stream_opens_total", 1u64);
        info!(key = %key, gen, "sync: stream open");
    }

    fn on_frame(&mut self, key: &ResourceKey, gen: u64, line: &str) {
        let Some(st) = Self::current(&mut self.states, key, gen) else { return };
        let frame: Frame = match serde_json::from_str(line) {
            Ok(f) => f,
            Err(e) => {
                warn!(key = %key, error = %e, "sync: malformed frame dropped");
                counter!("sync_frames_dropped_total", 1u64, "reason" => "malformed");
                return;
            }
        };
        let Some(coll) = st.collection.as_mut() else { return };
        match frame.kind.as_str() {
            "ERROR" => {
                info!(key = %key, status = %frame.object, "sync: resume window expired, relist on close");
                st.reconnector.resume_expired();
                coll.set_resource_version(None);
            }
            "BOOKMARK" => {
                if let Some(rv) = mirra_core::object_resource_version(&frame.object) {
                    coll.set_resource_version(Some(rv.to_string()));
                }
            }
            other => {
                let Ok(kind) = other.parse::<ChangeType>() else {
                    debug!(key = %key, kind = %other, "sync: unknown frame type dropped");
                    counter!("sync_frames_dropped_total", 1u64, "reason" => "unknown_type");
                    return;
                };
                let mut object = frame.object;
                if !object.is_object() {
                    warn!(key = %key, kind = %kind, "sync: frame without object dropped");
                    counter!("sync_frames_dropped_total", 1u64, "reason" => "malformed");
                    return;
                }
                if kind == ChangeType::Deleted { stamp_deletion(&mut object, &chrono::Utc::now().to_rfc3339()); }
                if let Some(rv) = mirra_core::object_resource_version(&object) {
                    coll.set_resource_version(Some(rv.to_string()));
                }
                if !coll.update(object.clone(), kind) {
                    counter!("sync_frames_dropped_total", 1u64, "reason" => "nameless");
                    return;
                }
                let change = Change { kind, object };
                let coll: &Collection = coll;
                st.subscribers.fire(|sub| sub(coll, Some(&change)));
            }
        }
    }

    fn on_stream_closed(&mut self, key: ResourceKey, gen: u64, opened: bool, error: Option<TransportError>) {
        let Some(st) = Self::current(&mut self.states, &key, gen) else { return };
        st.stream = None;
        let decision = st.reconnector.closed(Instant::now(), st.subscribers.has_any());
        let reason = if opened { "closed" } else { "open_failed" };
        counter!("sync_stream_closes_total", 1u64, "reason" => reason);
        match &error {
            Some(e) => info!(key = %key, gen, opened, error = %e, decision = ?decision, "sync: stream closed"),
            None => info!(key = %key, gen, decision = ?decision, "sync: stream ended"),
        }
        if let Some(TransportError::Unauthorized(_)) = error { self.session.login_required(); }
        self.apply_close_decision(&key, decision);
        self.discard_if_idle(&key);
    }

    fn apply_close_decision(&mut self, key: &ResourceKey, decision: CloseDecision) {
        match decision {
            CloseDecision::Clean => {}
            CloseDecision::Retry => self.arm_timer(key, TimerKind::Reconnect, self.config.reconnect_backoff),
            CloseDecision::Relist => self.arm_timer(key, TimerKind::Relist, self.config.relist_delay),
            CloseDecision::Halt(reason) => {
                if let Some(st) = self.states.get_mut(key) { st.cancel_timer(); }
                counter!("sync_halts_total", 1u64);
                warn!(key = %key, reason = ?reason, "sync: stream halted");
                self.notifier.notify(Notice::halted(
                    key,
                    format!("Stopped live updates for {}: {}. Reload to try again.", key, reason),
                ));
            }
        }
    }

    // ---- timers ----

    fn arm_timer(&mut self, key: &ResourceKey, kind: TimerKind, after: Duration) {
        let Some(st) = self.states.get_mut(key) else { return };
        self.next_timer += 1;
        let seq = self.next_timer;
        let tx = self.tx.clone();
        let k = key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(Command::TimerFired { key: k, seq });
        });
        st.cancel_timer();
        st.timer = Some(Timer { kind, seq, abort: task.abort_handle() });
        debug!(key = %key, kind = ?kind, after_ms = %after.as_millis(), "sync: timer armed");
    }

    fn on_timer(&mut self, key: ResourceKey, seq: u64) {
        let Some(st) = self.states.get_mut(&key) else { return };
        let kind = match st.timer.as_ref() {
            Some(t) if t.seq == seq => t.kind,
            _ => return,
        };
        st.timer = None;
        if !st.subscribers.has_any() {
            self.discard_if_idle(&key);
            return;
        }
        match kind {
            TimerKind::Reconnect => self.start_stream(&key),
            TimerKind::Relist | TimerKind::Poll => self.start_list(&key),
        }
    }
}
