//! Engine tunables, read from `MIRRA_*` environment variables.

use std::time::Duration;

use serde::Serialize;

/// Knobs for reconnection, polling, abuse detection and the write-side cache.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineConfig {
    /// Fixed delay before reopening a stream that closed unexpectedly.
    pub reconnect_backoff: Duration,
    /// Delay before the full relist that follows a resume-window expiry.
    pub relist_delay: Duration,
    /// Default poll interval for poll-mode subscribers.
    pub poll_interval: Duration,
    /// Open/close events remembered per key.
    pub abuse_history: usize,
    /// A full history inside this window halts the key.
    pub abuse_window: Duration,
    /// This many trailing closes with no open halts the key.
    pub abuse_consecutive_closes: usize,
    /// Immutable resource types whose objects may be cached by one-shot requests.
    pub cacheable_resources: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_millis(2000),
            relist_delay: Duration::from_millis(100),
            poll_interval: Duration::from_millis(5000),
            abuse_history: 10,
            abuse_window: Duration::from_secs(30),
            abuse_consecutive_closes: 5,
            cacheable_resources: vec!["imagestreamimages".to_string()],
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self { Self::from_lookup(|name| std::env::var(name).ok()) }

    /// Like [`EngineConfig::from_env`] but with an arbitrary variable source.
    /// Unset or unparsable values keep their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let ms = |name: &str, dflt: Duration| get(name).and_then(|s| s.parse::<u64>().ok()).map(Duration::from_millis).unwrap_or(dflt);
        let cacheable_resources = match get("MIRRA_CACHEABLE_RESOURCES") {
            Some(list) => list.split(',').map(|s| s.trim().to_ascii_lowercase()).filter(|s| !s.is_empty()).collect(),
            None => d.cacheable_resources.clone(),
        };
        Self {
            reconnect_backoff: ms("MIRRA_RECONNECT_BACKOFF_MS", d.reconnect_backoff),
            relist_delay: ms("MIRRA_RELIST_DELAY_MS", d.relist_delay),
            poll_interval: ms("MIRRA_POLL_INTERVAL_MS", d.poll_interval),
            abuse_history: get("MIRRA_ABUSE_HISTORY").and_then(|s| s.parse().ok()).filter(|n| *n > 0).unwrap_or(d.abuse_history),
            abuse_window: get("MIRRA_ABUSE_WINDOW_SECS").and_then(|s| s.parse().ok()).map(Duration::from_secs).unwrap_or(d.abuse_window),
            abuse_consecutive_closes: get("MIRRA_ABUSE_CONSECUTIVE_CLOSES")
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(d.abuse_consecutive_closes),
            cacheable_resources,
        }
    }

    pub fn is_cacheable(&self, resource: &str) -> bool {
        self.cacheable_resources.iter().any(|r| r.eq_ignore_ascii_case(resource))
    }
}
