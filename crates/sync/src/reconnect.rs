//! Stream lifecycle: named states, close decisions and abuse detection.
//!
//! The [`Reconnector`] is pure bookkeeping. It never sleeps or spawns; the
//! driver asks it what to do when a stream closes and arms timers itself.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamState {
    Connecting,
    Open,
    ClosedClean,
    ClosedRetryable,
    RelistRequired,
    Halted,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Connecting => "CONNECTING",
            StreamState::Open => "OPEN",
            StreamState::ClosedClean => "CLOSED_CLEAN",
            StreamState::ClosedRetryable => "CLOSED_RETRYABLE",
            StreamState::RelistRequired => "RELIST_REQUIRED",
            StreamState::Halted => "HALTED",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// What to do after a stream closed (or failed to open).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Terminal for this handle.
    Clean,
    /// Reopen after the backoff, resuming from the stored resourceVersion.
    Retry,
    /// Refetch from scratch after the relist delay.
    Relist,
    /// Abuse detected; stop for good.
    Halt(AbuseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbuseReason {
    /// The whole history happened inside the window.
    Thrashing,
    /// The trailing events are all closes.
    NeverOpens,
}

impl fmt::Display for AbuseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbuseReason::Thrashing => f.write_str("the connection is reopening too often"),
            AbuseReason::NeverOpens => f.write_str("the connection keeps failing"),
        }
    }
}

/// Ring buffer of the last `capacity` open/close events for one key.
#[derive(Debug, Clone)]
pub struct AbuseDetector {
    events: VecDeque<(StreamEvent, Instant)>,
    capacity: usize,
    window: Duration,
    consecutive_closes: usize,
}

impl AbuseDetector {
    pub fn new(capacity: usize, window: Duration, consecutive_closes: usize) -> Self {
        Self { events: VecDeque::with_capacity(capacity), capacity: capacity.max(1), window, consecutive_closes: consecutive_closes.max(1) }
    }

    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self::new(cfg.abuse_history, cfg.abuse_window, cfg.abuse_consecutive_closes)
    }

    pub fn record(&mut self, event: StreamEvent, at: Instant) {
        if self.events.len() == self.capacity { self.events.pop_front(); }
        self.events.push_back((event, at));
    }

    /// Both tests run independently; thrashing is checked first.
    pub fn check(&self, now: Instant) -> Option<AbuseReason> {
        if self.events.len() == self.capacity {
            if let Some((_, oldest)) = self.events.front() {
                if now.saturating_duration_since(*oldest) <= self.window { return Some(AbuseReason::Thrashing); }
            }
        }
        let k = self.consecutive_closes;
        if self.events.len() >= k && self.events.iter().rev().take(k).all(|(e, _)| *e == StreamEvent::Close) {
            return Some(AbuseReason::NeverOpens);
        }
        None
    }

    pub fn clear(&mut self) { self.events.clear(); }
    pub fn len(&self) -> usize { self.events.len() }
    pub fn is_empty(&self) -> bool { self.events.is_empty() }
}

/// Per-key stream state machine.
#[derive(Debug, Clone)]
pub struct Reconnector {
    state: Option<StreamState>,
    do_not_reopen: bool,
    relist: bool,
    history: AbuseDetector,
}

impl Reconnector {
    pub fn new(history: AbuseDetector) -> Self { Self { state: None, do_not_reopen: false, relist: false, history } }

    /// `None` until the first stream is requested.
    pub fn state(&self) -> Option<StreamState> { self.state }
    pub fn is_halted(&self) -> bool { self.state == Some(StreamState::Halted) }

    /// A new handle starts with fresh markers. Halted keys stay halted.
    pub fn connecting(&mut self) -> bool {
        if self.is_halted() { return false; }
        self.state = Some(StreamState::Connecting);
        self.do_not_reopen = false;
        self.relist = false;
        true
    }

    pub fn opened(&mut self, now: Instant) {
        if self.is_halted() { return; }
        self.state = Some(StreamState::Open);
        self.history.record(StreamEvent::Open, now);
    }

    /// The server said the resume window expired. The stream stays up, but
    /// its eventual close must relist instead of resuming.
    pub fn resume_expired(&mut self) {
        if self.is_halted() { return; }
        self.relist = true;
        self.state = Some(StreamState::RelistRequired);
    }

    pub fn mark_do_not_reopen(&mut self) { self.do_not_reopen = true; }

    /// Close (or failed open, which counts as a close without an open).
    pub fn closed(&mut self, now: Instant, has_subscribers: bool) -> CloseDecision {
        if self.is_halted() { return CloseDecision::Clean; }
        if self.do_not_reopen || !has_subscribers {
            self.state = Some(StreamState::ClosedClean);
            return CloseDecision::Clean;
        }
        self.history.record(StreamEvent::Close, now);
        if let Some(reason) = self.history.check(now) {
            self.state = Some(StreamState::Halted);
            return CloseDecision::Halt(reason);
        }
        if self.relist {
            self.state = Some(StreamState::RelistRequired);
            return CloseDecision::Relist;
        }
        self.state = Some(StreamState::ClosedRetryable);
        CloseDecision::Retry
    }

    /// A relist kicked off by [`CloseDecision::Relist`] failed; treated as
    /// another close so a dead endpoint still ends up halted.
    pub fn relist_failed(&mut self, now: Instant, has_subscribers: bool) -> CloseDecision {
        self.relist = true;
        self.closed(now, has_subscribers)
    }

    /// Navigation resets history but not state, so a halted key stays halted.
    pub fn clear_history(&mut self) { self.history.clear(); }
    pub fn history_len(&self) -> usize { self.history.len() }
}
