//! Mirra Ops: line-framed byte streams (pod logs, exec output).
//!
//! Same pub/sub shape as the resource watch stream, but frames are opaque
//! payloads: each line is one frame, either raw or base64-encoded.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use base64::Engine as _;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use mirra_store::{CallbackRegistry, SubscriptionId};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod pods;

pub use pods::{LogOptions, PodLogSource};

/// Raw chunks from a source; chunk boundaries need not align with lines.
pub type ByteChunks = BoxStream<'static, Result<Bytes, StreamError>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("open: {0}")]
    Open(String),
    #[error("io: {0}")]
    Io(String),
    #[error("decode: {0}")]
    Decode(String),
}

/// Where frames come from. `open` is called once per `start`.
#[async_trait]
pub trait ByteSource: Send + Sync + 'static {
    async fn open(&self) -> Result<ByteChunks, StreamError>;

    /// Short label for logs.
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameEncoding {
    #[default]
    Raw,
    Base64,
}

pub type OpenFn = dyn Fn() + Send + Sync;
pub type MessageFn = dyn Fn(&[u8]) + Send + Sync;
/// Receives `true` for a clean close (stop or end of stream).
pub type CloseFn = dyn Fn(bool) + Send + Sync;
pub type ErrorFn = dyn Fn(&StreamError) + Send + Sync;

#[derive(Default)]
struct Handlers {
    open: CallbackRegistry<OpenFn>,
    message: CallbackRegistry<MessageFn>,
    close: CallbackRegistry<CloseFn>,
    error: CallbackRegistry<ErrorFn>,
}

impl Handlers {
    fn error(&self, e: &StreamError) {
        self.error.fire(|cb| cb(e));
    }
    fn close(&self, clean: bool) {
        self.close.fire(|cb| cb(clean));
    }
}

/// Cancellation handle for an in-flight pump.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() { let _ = tx.send(()); }
    }
}

struct Running {
    cancel: CancelHandle,
    task: JoinHandle<()>,
}

/// A restartable byte stream with open/message/close/error callbacks.
pub struct ByteStream {
    source: Arc<dyn ByteSource>,
    encoding: FrameEncoding,
    handlers: Arc<Handlers>,
    running: Mutex<Option<Running>>,
}

impl ByteStream {
    pub fn new(source: Arc<dyn ByteSource>, encoding: FrameEncoding) -> Self {
        Self { source, encoding, handlers: Arc::new(Handlers::default()), running: Mutex::new(None) }
    }

    pub fn on_open(&self, cb: impl Fn() + Send + Sync + 'static) -> SubscriptionId { self.handlers.open.add(Arc::new(cb)) }
    pub fn on_message(&self, cb: impl Fn(&[u8]) + Send + Sync + 'static) -> SubscriptionId {
        self.handlers.message.add(Arc::new(cb))
    }
    pub fn on_close(&self, cb: impl Fn(bool) + Send + Sync + 'static) -> SubscriptionId { self.handlers.close.add(Arc::new(cb)) }
    pub fn on_error(&self, cb: impl Fn(&StreamError) + Send + Sync + 'static) -> SubscriptionId {
        self.handlers.error.add(Arc::new(cb))
    }

    /// Remove a callback registered through any `on_*`.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let h = &self.handlers;
        h.open.remove(id) | h.message.remove(id) | h.close.remove(id) | h.error.remove(id)
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> { self.running.lock().unwrap_or_else(PoisonError::into_inner) }

    pub fn is_running(&self) -> bool { self.running().as_ref().map(|r| !r.task.is_finished()).unwrap_or(false) }

    /// Open the source and start pumping. Returns false if already running.
    pub fn start(&self) -> bool {
        let mut running = self.running();
        if running.as_ref().map(|r| !r.task.is_finished()).unwrap_or(false) { return false; }
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let source = self.source.clone();
        let handlers = self.handlers.clone();
        let encoding = self.encoding;
        let task = tokio::spawn(async move {
            let label = source.describe();
            info!(source = %label, encoding = ?encoding, "ops: stream starting");
            let chunks = match source.open().await {
                Ok(c) => c,
                Err(e) => {
                    warn!(source = %label, error = %e, "ops: stream failed to open");
                    handlers.error(&e);
                    handlers.close(false);
                    return;
                }
            };
            handlers.open.fire(|cb| cb());
            let end = pump_frames(chunks, encoding, &handlers, cancel_rx, &label).await;
            handlers.close(end != PumpEnd::Failed);
        });
        *running = Some(Running { cancel: CancelHandle { tx: Some(cancel_tx) }, task });
        true
    }

    /// Stop pumping; `on_close(true)` fires once the pump has wound down.
    pub fn stop(&self) {
        if let Some(r) = self.running().take() { r.cancel.cancel(); }
    }

    /// Stop and wait for the close callbacks to finish.
    pub async fn stop_and_wait(&self) {
        let running = self.running().take();
        if let Some(r) = running {
            r.cancel.cancel();
            let _ = r.task.await;
        }
    }
}

impl Drop for ByteStream {
    fn drop(&mut self) {
        if let Some(r) = self.running.get_mut().unwrap_or_else(PoisonError::into_inner).take() { r.cancel.cancel(); }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    Cancelled,
    Ended,
    Failed,
}

fn emit(line: &[u8], encoding: FrameEncoding, handlers: &Handlers) {
    match encoding {
        FrameEncoding::Raw => {
            handlers.message.fire(|cb| cb(line));
        }
        FrameEncoding::Base64 => {
            let text = trim_ascii(line);
            if text.is_empty() { return; }
            match base64::engine::general_purpose::STANDARD.decode(text) {
                Ok(frame) => {
                    handlers.message.fire(|cb| cb(&frame));
                }
                Err(e) => {
                    debug!(error = %e, len = line.len(), "ops: undecodable frame dropped");
                    handlers.error(&StreamError::Decode(e.to_string()));
                }
            }
        }
    }
}

fn trim_ascii(mut b: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = b {
        if !first.is_ascii_whitespace() { break; }
        b = rest;
    }
    while let [rest @ .., last] = b {
        if !last.is_ascii_whitespace() { break; }
        b = rest;
    }
    b
}

/// Consume chunks, split into lines and emit one frame per line. A trailing
/// partial line is flushed when the source ends or is cancelled.
async fn pump_frames<S>(
    stream: S,
    encoding: FrameEncoding,
    handlers: &Handlers,
    mut cancel_rx: oneshot::Receiver<()>,
    ctx: &str,
) -> PumpEnd
where
    S: futures::Stream<Item = Result<Bytes, StreamError>>,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = bytes::BytesMut::new();
    let end = loop {
        tokio::select! {
            _ = &mut cancel_rx => { info!(ctx = %ctx, "ops: pump cancelled"); break PumpEnd::Cancelled; }
            next = stream.next() => {
                match next {
                    Some(Ok(chunk)) => {
                        buf.extend_from_slice(&chunk);
                        while let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                            let line = buf.split_to(pos);
                            let _ = buf.split_to(1); // drop '\n'
                            emit(&line, encoding, handlers);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(ctx = %ctx, error = %e, "ops: stream error");
                        handlers.error(&e);
                        break PumpEnd::Failed;
                    }
                    None => break PumpEnd::Ended,
                }
            }
        }
    };
    if !buf.is_empty() { emit(&buf, encoding, handlers); }
    info!(ctx = %ctx, end = ?end, "ops: pump ended");
    end
}
