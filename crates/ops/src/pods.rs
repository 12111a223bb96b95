//! Pod log source backed by the `pods/log` subresource.

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};
use kube::Client;
use serde::{Deserialize, Serialize};
use tokio_util::{compat::FuturesAsyncReadCompatExt, io::ReaderStream};
use tracing::info;

use crate::{ByteChunks, ByteSource, StreamError};

/// Options for a pod log stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogOptions {
    /// Keep the stream open for new output.
    pub follow: bool,
    /// Tail last n lines (server-side)
    pub tail_lines: Option<i64>,
    /// Only return logs newer than X seconds
    pub since_seconds: Option<i64>,
    pub container: Option<String>,
}

impl LogOptions {
    fn params(&self) -> LogParams {
        LogParams {
            follow: self.follow,
            tail_lines: self.tail_lines,
            since_seconds: self.since_seconds,
            container: self.container.clone(),
            ..LogParams::default()
        }
    }
}

pub struct PodLogSource {
    api: Api<Pod>,
    pod: String,
    opts: LogOptions,
}

impl PodLogSource {
    pub fn new(client: Client, namespace: &str, pod: &str, opts: LogOptions) -> Self {
        Self { api: Api::namespaced(client, namespace), pod: pod.to_string(), opts }
    }
}

#[async_trait]
impl ByteSource for PodLogSource {
    async fn open(&self) -> Result<ByteChunks, StreamError> {
        let lp = self.opts.params();
        info!(pod = %self.pod, container = ?lp.container, follow = lp.follow, tail = ?lp.tail_lines, since = ?lp.since_seconds, "ops: log stream opening");
        let reader = self.api.log_stream(&self.pod, &lp).await.map_err(|e| StreamError::Open(e.to_string()))?;
        // futures AsyncRead -> tokio AsyncRead -> Stream<Bytes>
        let stream = ReaderStream::new(reader.compat()).map_err(|e| StreamError::Io(e.to_string()));
        Ok(stream.boxed())
    }

    fn describe(&self) -> String {
        match &self.opts.container {
            Some(c) => format!("pod/{}:{}", self.pod, c),
            None => format!("pod/{}", self.pod),
        }
    }
}
