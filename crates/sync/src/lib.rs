//! Mirra sync engine.
//!
//! Keeps an in-memory mirror of remote collections: one list per key, then an
//! incremental stream (or a poll loop) that keeps the [`Collection`] current
//! and fans each change out to subscribers.
//!
//! All per-key state lives in a single driver task that handles commands one
//! at a time, so at most one list and one stream/poll are ever in flight for a
//! key. [`Engine`] is the cheap, cloneable handle in front of it. Callbacks
//! run on the driver task and must not block.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mirra_core::{object_name, Change, ChangeType, CoreError, ResourceKey};
use mirra_kubehub::{Transport, TransportError};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

pub mod config;
mod driver;
pub mod notify;
pub mod reconnect;
mod requests;

pub use config::EngineConfig;
pub use mirra_store::{Collection, SubscriptionId};
pub use notify::{Level, LogSession, MemoryNotifier, Notice, NoticeAction, Notifier, SessionHook, TracingNotifier};
pub use reconnect::{AbuseDetector, AbuseReason, CloseDecision, Reconnector, StreamState};
pub use requests::RequestOptions;

use driver::{Command, Driver};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid response: {0}")]
    Decode(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("engine stopped")]
    Stopped,
}

impl From<CoreError> for EngineError {
    fn from(e: CoreError) -> Self { EngineError::Decode(e.to_string()) }
}

impl EngineError {
    pub fn is_unauthorized(&self) -> bool { matches!(self, EngineError::Transport(TransportError::Unauthorized(_))) }
}

/// Collection-level subscriber. The change is `None` after a full list.
pub type WatchFn = dyn Fn(&Collection, Option<&Change>) + Send + Sync;
pub type WatchCallback = Arc<WatchFn>;
pub(crate) type ListCallback = Box<dyn FnOnce(Result<&Collection, &EngineError>) + Send>;

/// How updates reach a subscriber after the initial list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Stream,
    Poll,
}

#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Re-list on a timer instead of opening a stream.
    pub poll: bool,
    /// Overrides [`EngineConfig::poll_interval`].
    pub poll_interval: Option<Duration>,
}

impl WatchOptions {
    pub fn stream() -> Self { Self::default() }
    pub fn poll(interval: Option<Duration>) -> Self { Self { poll: true, poll_interval: interval } }
    pub fn mode(&self) -> Mode { if self.poll { Mode::Poll } else { Mode::Stream } }
}

/// Returned by `watch`; pass to [`Engine::unwatch`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchHandle {
    key: ResourceKey,
    id: SubscriptionId,
}

impl WatchHandle {
    pub fn key(&self) -> &ResourceKey { &self.key }
    pub fn id(&self) -> SubscriptionId { self.id }
}

/// Live subscription ids per key, with the mode the first of them chose.
struct ModeEntry {
    mode: Mode,
    ids: Vec<SubscriptionId>,
}

struct Inner {
    tx: mpsc::UnboundedSender<Command>,
    modes: Mutex<FxHashMap<ResourceKey, ModeEntry>>,
    transport: Arc<dyn Transport>,
    config: Arc<EngineConfig>,
    notifier: Arc<dyn Notifier>,
    session: Arc<dyn SessionHook>,
    objects: Mutex<FxHashMap<(ResourceKey, String), Value>>,
}

impl Drop for Inner {
    fn drop(&mut self) { let _ = self.tx.send(Command::Shutdown); }
}

/// Handle to the sync engine. Clones share one driver; the driver stops when
/// the last clone is dropped.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Start the engine with log-only collaborators. Needs a tokio runtime.
    pub fn spawn(transport: Arc<dyn Transport>, config: EngineConfig) -> Self {
        Self::spawn_with(transport, config, Arc::new(TracingNotifier), Arc::new(LogSession))
    }

    pub fn spawn_with(
        transport: Arc<dyn Transport>,
        config: EngineConfig,
        notifier: Arc<dyn Notifier>,
        session: Arc<dyn SessionHook>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = Arc::new(config);
        let driver = Driver::new(tx.clone(), transport.clone(), config.clone(), notifier.clone(), session.clone());
        tokio::spawn(driver.run(rx));
        info!(backoff_ms = %config.reconnect_backoff.as_millis(), poll_ms = %config.poll_interval.as_millis(), "sync: engine started");
        Self {
            inner: Arc::new(Inner {
                tx,
                modes: Mutex::new(FxHashMap::default()),
                transport,
                config,
                notifier,
                session,
                objects: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig { &self.inner.config }

    fn modes(&self) -> MutexGuard<'_, FxHashMap<ResourceKey, ModeEntry>> {
        self.inner.modes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send(&self, cmd: Command) {
        if self.inner.tx.send(cmd).is_err() { debug!("sync: driver gone, command dropped"); }
    }

    /// One-shot read. `cb` runs exactly once, always on a later turn: from
    /// the cache when a stream is live for `key`, otherwise after the (shared)
    /// list completes.
    pub fn list<F>(&self, key: &ResourceKey, cb: F)
    where
        F: FnOnce(Result<&Collection, &EngineError>) + Send + 'static,
    {
        self.send(Command::List { key: key.clone(), cb: Box::new(cb) });
    }

    /// [`Engine::list`] as a future.
    pub async fn list_async(&self, key: &ResourceKey) -> Result<Collection, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.list(key, move |res| {
            let _ = tx.send(res.cloned().map_err(Clone::clone));
        });
        rx.await.unwrap_or(Err(EngineError::Stopped))
    }

    /// Subscribe to a key. `cb` fires with the full collection after every
    /// list and with each applied change.
    ///
    /// Fails immediately when the key already has subscribers in the other
    /// mode; the first registered mode holds until every subscriber is gone.
    pub fn watch(&self, key: &ResourceKey, cb: WatchCallback, opts: WatchOptions) -> Result<WatchHandle, EngineError> {
        let mode = opts.mode();
        let poll_interval = opts.poll_interval.unwrap_or(self.inner.config.poll_interval);
        let id = SubscriptionId::next();
        let mut modes = self.modes();
        let entry = modes.entry(key.clone()).or_insert_with(|| ModeEntry { mode, ids: Vec::new() });
        if entry.ids.is_empty() {
            entry.mode = mode;
        } else if entry.mode != mode {
            return Err(EngineError::Config(format!(
                "{} is already watched in {:?} mode; cannot add a {:?} subscriber",
                key, entry.mode, mode
            )));
        }
        entry.ids.push(id);
        // Sent under the lock so the driver sees subscribe/unsubscribe in mode-table order.
        self.send(Command::Watch { key: key.clone(), id, cb, mode, poll_interval });
        Ok(WatchHandle { key: key.clone(), id })
    }

    /// Watch a single object. `cb` fires when `name` is the object that
    /// changed, and after each full list in which it is present.
    pub fn watch_object<F>(&self, key: &ResourceKey, name: &str, cb: F, opts: WatchOptions) -> Result<WatchHandle, EngineError>
    where
        F: Fn(&Value, Option<ChangeType>) + Send + Sync + 'static,
    {
        let name = name.to_string();
        let wrapped: WatchCallback = Arc::new(move |coll: &Collection, change: Option<&Change>| match change {
            Some(ch) => {
                if object_name(&ch.object) == Some(name.as_str()) { cb(&ch.object, Some(ch.kind)); }
            }
            None => {
                if let Some(obj) = coll.get(&name) { cb(obj, None); }
            }
        });
        self.watch(key, wrapped, opts)
    }

    /// Remove exactly the subscription `handle` was created for. Repeated
    /// calls are no-ops.
    pub fn unwatch(&self, handle: &WatchHandle) {
        let mut modes = self.modes();
        let Some(entry) = modes.get_mut(&handle.key) else { return };
        let Some(pos) = entry.ids.iter().position(|id| *id == handle.id) else { return };
        entry.ids.remove(pos);
        if entry.ids.is_empty() { modes.remove(&handle.key); }
        self.send(Command::Unwatch { key: handle.key.clone(), id: handle.id });
    }

    pub fn unwatch_all(&self, handles: &[WatchHandle]) {
        for h in handles { self.unwatch(h); }
    }

    /// Route change: forget open/close history for every key.
    pub fn navigated(&self) { self.send(Command::Navigated); }

    pub async fn stream_state(&self, key: &ResourceKey) -> Option<StreamState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::QueryState { key: key.clone(), reply });
        rx.await.ok().flatten()
    }

    /// Clone of the cached collection, if the key has one.
    pub async fn collection(&self, key: &ResourceKey) -> Option<Collection> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::QueryCollection { key: key.clone(), reply });
        rx.await.ok().flatten()
    }

    /// Number of keys with live state in the driver.
    pub async fn tracked_keys(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        self.send(Command::QueryTracked { reply });
        rx.await.unwrap_or(0)
    }
}
