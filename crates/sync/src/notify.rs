//! Collaborators the engine calls out to: user notifications and the session layer.

use std::sync::{Mutex, PoisonError};

use mirra_core::ResourceKey;
use serde::Serialize;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warning,
    Error,
}

/// Follow-up the user can trigger from a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeAction {
    Reload,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notice {
    pub level: Level,
    pub key: Option<ResourceKey>,
    pub message: String,
    /// Stays until the user dismisses it.
    pub persistent: bool,
    pub action: Option<NoticeAction>,
}

impl Notice {
    pub fn error(key: Option<&ResourceKey>, message: impl Into<String>) -> Self {
        Self { level: Level::Error, key: key.cloned(), message: message.into(), persistent: false, action: None }
    }

    /// Raised once when a key's stream is halted.
    pub fn halted(key: &ResourceKey, message: impl Into<String>) -> Self {
        Self {
            level: Level::Warning,
            key: Some(key.clone()),
            message: message.into(),
            persistent: true,
            action: Some(NoticeAction::Reload),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Default notifier: writes notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, n: Notice) {
        let key = n.key.as_ref().map(|k| k.to_string()).unwrap_or_else(|| "-".into());
        match n.level {
            Level::Info => info!(key = %key, persistent = n.persistent, "notice: {}", n.message),
            Level::Warning => warn!(key = %key, persistent = n.persistent, action = ?n.action, "notice: {}", n.message),
            Level::Error => error!(key = %key, persistent = n.persistent, "notice: {}", n.message),
        }
    }
}

/// Collects notices in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl MemoryNotifier {
    pub fn new() -> Self { Self::default() }
    pub fn notices(&self) -> Vec<Notice> { self.notices.lock().unwrap_or_else(PoisonError::into_inner).clone() }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notice: Notice) { self.notices.lock().unwrap_or_else(PoisonError::into_inner).push(notice); }
}

/// Auth/session layer: asked to start a login flow when the server answers 401.
pub trait SessionHook: Send + Sync {
    fn login_required(&self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogSession;

impl SessionHook for LogSession {
    fn login_required(&self) { warn!("session: credentials rejected, login required"); }
}
