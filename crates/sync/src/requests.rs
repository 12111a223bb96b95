//! One-shot get/create/update/delete.
//!
//! These bypass the driver entirely and never touch watched collections; the
//! next list or stream frame is what brings the cache up to date. The only
//! exception is the small allow-list of immutable resource types, whose
//! objects are remembered and served to later `get`s.

use std::time::Instant;

use mirra_core::{object_name, ResourceKey};
use mirra_kubehub::TransportError;
use serde_json::Value;
use tracing::{debug, info};

use crate::notify::Notice;
use crate::{Engine, EngineError};

#[derive(Debug, Clone, Copy)]
pub struct RequestOptions {
    /// Surface failures through the notifier as well as the returned error.
    pub error_notification: bool,
}

impl Default for RequestOptions {
    fn default() -> Self { Self { error_notification: true } }
}

impl RequestOptions {
    pub fn quiet() -> Self { Self { error_notification: false } }
}

impl Engine {
    fn cacheable(&self, key: &ResourceKey) -> bool { self.inner.config.is_cacheable(&key.resource().resource) }

    fn remember(&self, key: &ResourceKey, obj: &Value) {
        if !self.cacheable(key) { return; }
        if let Some(name) = object_name(obj) {
            let mut objects = self.inner.objects.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            objects.insert((key.clone(), name.to_string()), obj.clone());
        }
    }

    fn cached(&self, key: &ResourceKey, name: &str) -> Option<Value> {
        if !self.cacheable(key) { return None; }
        let objects = self.inner.objects.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        objects.get(&(key.clone(), name.to_string())).cloned()
    }

    fn finish(&self, op: &str, key: &ResourceKey, res: Result<Value, TransportError>, opts: RequestOptions) -> Result<Value, EngineError> {
        match res {
            Ok(v) => Ok(v),
            Err(e) => {
                let err = EngineError::from(e);
                info!(op, key = %key, error = %err, "sync: request failed");
                if opts.error_notification {
                    self.inner.notifier.notify(Notice::error(Some(key), format!("{} {} failed: {}", op, key, err)));
                }
                if err.is_unauthorized() { self.inner.session.login_required(); }
                Err(err)
            }
        }
    }

    pub async fn get(&self, key: &ResourceKey, name: &str, opts: RequestOptions) -> Result<Value, EngineError> {
        if let Some(v) = self.cached(key, name) {
            debug!(key = %key, name, "sync: get served from cache");
            return Ok(v);
        }
        let t0 = Instant::now();
        let res = self.inner.transport.get(key, name).await;
        let v = self.finish("get", key, res, opts)?;
        self.remember(key, &v);
        debug!(key = %key, name, took_ms = %t0.elapsed().as_millis(), "sync: get ok");
        Ok(v)
    }

    pub async fn create(&self, key: &ResourceKey, obj: &Value, opts: RequestOptions) -> Result<Value, EngineError> {
        let res = self.inner.transport.create(key, obj).await;
        let v = self.finish("create", key, res, opts)?;
        self.remember(key, &v);
        info!(key = %key, name = ?object_name(&v), "sync: created");
        Ok(v)
    }

    pub async fn update(&self, key: &ResourceKey, name: &str, obj: &Value, opts: RequestOptions) -> Result<Value, EngineError> {
        let res = self.inner.transport.update(key, name, obj).await;
        let v = self.finish("update", key, res, opts)?;
        info!(key = %key, name, "sync: updated");
        Ok(v)
    }

    pub async fn delete(&self, key: &ResourceKey, name: &str, opts: RequestOptions) -> Result<Value, EngineError> {
        let res = self.inner.transport.delete(key, name).await;
        let v = self.finish("delete", key, res, opts)?;
        info!(key = %key, name, "sync: deleted");
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mirra_kubehub::MockTransport;
    use serde_json::json;

    use super::*;
    use crate::{EngineConfig, LogSession, MemoryNotifier};

    fn setup() -> (Engine, Arc<MockTransport>, Arc<MemoryNotifier>) {
        let mock = Arc::new(MockTransport::new());
        let notes = Arc::new(MemoryNotifier::new());
        let engine = Engine::spawn_with(mock.clone(), EngineConfig::default(), notes.clone(), Arc::new(LogSession));
        (engine, mock, notes)
    }

    #[tokio::test]
    async fn immutable_objects_are_served_from_cache() {
        let (engine, mock, _) = setup();
        let key = ResourceKey::parse("image.openshift.io/v1/imagestreamimages", Some("ci")).expect("key");
        mock.insert_object(&key, json!({"metadata": {"name": "app@sha256:abc"}}));
        engine.get(&key, "app@sha256:abc", RequestOptions::default()).await.expect("first");
        engine.get(&key, "app@sha256:abc", RequestOptions::default()).await.expect("second");
        assert_eq!(mock.get_calls(), 1);

        let pods = ResourceKey::parse("pods", Some("ci")).expect("key");
        mock.insert_object(&pods, json!({"metadata": {"name": "p"}}));
        engine.get(&pods, "p", RequestOptions::default()).await.expect("first");
        engine.get(&pods, "p", RequestOptions::default()).await.expect("second");
        assert_eq!(mock.get_calls(), 3);
    }

    #[tokio::test]
    async fn failures_notify_unless_quiet() {
        let (engine, mock, notes) = setup();
        let key = ResourceKey::parse("pods", Some("ci")).expect("key");
        let err = engine.get(&key, "missing", RequestOptions::default()).await.expect_err("404");
        assert_eq!(err, EngineError::Transport(TransportError::Status { code: 404, message: "\"missing\" not found".into() }));
        assert_eq!(notes.notices().len(), 1);

        mock.fail_next_request(TransportError::Status { code: 500, message: "boom".into() });
        engine.delete(&key, "x", RequestOptions::quiet()).await.expect_err("500");
        assert_eq!(notes.notices().len(), 1);
    }

    #[tokio::test]
    async fn writes_do_not_touch_watched_collections() {
        let (engine, mock, _) = setup();
        let key = ResourceKey::parse("pods", Some("ci")).expect("key");
        mock.push_items("PodList", "1", vec![]);
        let coll = engine.list_async(&key).await.expect("list");
        assert!(coll.is_empty());
        engine.create(&key, &json!({"metadata": {"name": "new"}}), RequestOptions::default()).await.expect("create");
        assert!(engine.collection(&key).await.map(|c| c.is_empty()).unwrap_or(true));
    }
}
