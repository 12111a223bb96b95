//! Multicast subscription lists.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use smallvec::SmallVec;

/// Process-wide unique subscription identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 { self.0 }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "sub-{}", self.0) }
}

struct Entry<F: ?Sized> {
    /// Every id the callback was registered under; the entry lives until all are removed.
    ids: SmallVec<[SubscriptionId; 1]>,
    cb: Arc<F>,
}

/// Ordered set of subscriber callbacks.
///
/// Registering the same `Arc` twice does not duplicate invocations. `fire`
/// snapshots the list and invokes with the lock released, so subscribers may
/// add or remove entries (including themselves) mid-pass.
pub struct CallbackRegistry<F: ?Sized> {
    entries: Mutex<Vec<Entry<F>>>,
}

impl<F: ?Sized> Default for CallbackRegistry<F> {
    fn default() -> Self { Self { entries: Mutex::new(Vec::new()) } }
}

impl<F: ?Sized> CallbackRegistry<F> {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Vec<Entry<F>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `cb` under `id`. Returns false when the same callback was
    /// already present (the id is then an alias for the existing entry).
    pub fn insert(&self, id: SubscriptionId, cb: Arc<F>) -> bool {
        let mut entries = self.lock();
        if let Some(e) = entries.iter_mut().find(|e| Arc::ptr_eq(&e.cb, &cb)) {
            if !e.ids.contains(&id) { e.ids.push(id); }
            return false;
        }
        entries.push(Entry { ids: smallvec::smallvec![id], cb });
        true
    }

    /// Register under a fresh id.
    pub fn add(&self, cb: Arc<F>) -> SubscriptionId {
        let id = SubscriptionId::next();
        self.insert(id, cb);
        id
    }

    /// Drop `id`. The callback itself goes once its last id is gone.
    /// Unknown ids are a no-op.
    pub fn remove(&self, id: SubscriptionId) -> bool {
        let mut entries = self.lock();
        let Some(pos) = entries.iter().position(|e| e.ids.contains(&id)) else { return false };
        entries[pos].ids.retain(|i| *i != id);
        if entries[pos].ids.is_empty() { entries.remove(pos); }
        true
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Arc<F>> {
        self.lock().iter().find(|e| e.ids.contains(&id)).map(|e| Arc::clone(&e.cb))
    }

    pub fn contains(&self, id: SubscriptionId) -> bool { self.lock().iter().any(|e| e.ids.contains(&id)) }
    pub fn has_any(&self) -> bool { !self.lock().is_empty() }
    pub fn len(&self) -> usize { self.lock().len() }
    pub fn is_empty(&self) -> bool { self.lock().is_empty() }
    pub fn clear(&self) { self.lock().clear(); }

    pub fn snapshot(&self) -> Vec<Arc<F>> { self.lock().iter().map(|e| Arc::clone(&e.cb)).collect() }

    /// Invoke `f` once per subscriber present when the pass started.
    pub fn fire(&self, mut f: impl FnMut(&F)) -> usize {
        let snapshot = self.snapshot();
        for cb in snapshot.iter() { f(cb); }
        snapshot.len()
    }
}
