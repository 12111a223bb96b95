//! Mirra kubehub: transport adapters for list, watch and one-shot requests.
//!
//! [`Transport`] is the seam the sync engine talks through. [`KubeTransport`]
//! speaks the Kubernetes REST protocol via `kube::Client`; [`MockTransport`]
//! scripts responses for tests and demos.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{AsyncBufReadExt, StreamExt, TryStreamExt};
use kube::{
    api::{DeleteParams, GetParams, ListParams, PostParams, WatchParams},
    core::{ApiResource, DynamicObject, Request},
    Client, Resource,
};
use mirra_core::ResourceKey;
use serde_json::Value;
use tracing::{debug, info};

mod mock;

pub use mock::{MockTransport, WatchScript};

/// Inbound watch stream: one JSON-encoded frame per item.
pub type WatchLines = BoxStream<'static, Result<String, TransportError>>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("status {code}: {message}")]
    Status { code: u16, message: String },
    #[error("connect: {0}")]
    Connect(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("request: {0}")]
    Request(String),
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Unauthorized(_) => Some(401),
            TransportError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<kube::Error> for TransportError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 401 => TransportError::Unauthorized(ae.message),
            kube::Error::Api(ae) => TransportError::Status { code: ae.code, message: ae.message },
            kube::Error::SerdeError(e) => TransportError::Decode(e.to_string()),
            other => TransportError::Connect(other.to_string()),
        }
    }
}

/// Wire operations the engine needs. Implementations must be cheap to share.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Full list; returns the raw envelope.
    async fn list(&self, key: &ResourceKey) -> Result<Value, TransportError>;

    /// Open the incremental stream, resuming from `resource_version` when given.
    /// A returned `Ok` means the stream is open.
    async fn watch(&self, key: &ResourceKey, resource_version: Option<&str>) -> Result<WatchLines, TransportError>;

    async fn get(&self, key: &ResourceKey, name: &str) -> Result<Value, TransportError>;
    async fn create(&self, key: &ResourceKey, obj: &Value) -> Result<Value, TransportError>;
    async fn update(&self, key: &ResourceKey, name: &str, obj: &Value) -> Result<Value, TransportError>;
    async fn delete(&self, key: &ResourceKey, name: &str) -> Result<Value, TransportError>;
}

/// REST path for a key, e.g. `/apis/apps/v1/namespaces/web/deployments`.
pub fn url_path(key: &ResourceKey) -> String {
    let rt = key.resource();
    let ar = ApiResource {
        group: rt.group.clone(),
        version: rt.version.clone(),
        api_version: rt.api_version(),
        kind: String::new(),
        plural: rt.resource.clone(),
    };
    DynamicObject::url_path(&ar, key.namespace())
}

/// Watch request for `key`. `resourceVersion` is only sent when resuming.
fn watch_request(key: &ResourceKey, resource_version: Option<&str>) -> Result<http::Request<Vec<u8>>, TransportError> {
    let wp = WatchParams::default();
    let mut req = Request::new(url_path(key)).watch(&wp, resource_version.unwrap_or("")).map_err(request_err)?;
    if resource_version.is_none() {
        let uri = without_param(&req.uri().to_string(), "resourceVersion");
        *req.uri_mut() = uri.parse().map_err(request_err)?;
    }
    Ok(req)
}

fn without_param(uri: &str, name: &str) -> String {
    let Some((path, query)) = uri.split_once('?') else { return uri.to_string() };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| pair.split_once('=').map(|(k, _)| k).unwrap_or(pair) != name)
        .collect();
    if kept.is_empty() { path.to_string() } else { format!("{}?{}", path, kept.join("&")) }
}

fn request_err(e: impl std::fmt::Display) -> TransportError { TransportError::Request(e.to_string()) }

fn decode(text: &str) -> Result<Value, TransportError> {
    serde_json::from_str(text).map_err(|e| TransportError::Decode(e.to_string()))
}

fn encode(obj: &Value) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(obj).map_err(|e| TransportError::Decode(e.to_string()))
}

/// Transport over the current kubeconfig context.
#[derive(Clone)]
pub struct KubeTransport {
    client: Client,
}

impl KubeTransport {
    pub fn new(client: Client) -> Self { Self { client } }

    pub async fn try_default() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        info!(ns = %client.default_namespace(), "kubehub: client ready");
        Ok(Self { client })
    }

    pub fn client(&self) -> &Client { &self.client }

    fn request(key: &ResourceKey) -> Request { Request::new(url_path(key)) }
}

#[async_trait]
impl Transport for KubeTransport {
    async fn list(&self, key: &ResourceKey) -> Result<Value, TransportError> {
        let req = Self::request(key).list(&ListParams::default()).map_err(request_err)?;
        let text = self.client.request_text(req).await?;
        debug!(key = %key, bytes = text.len(), "kubehub: list ok");
        decode(&text)
    }

    async fn watch(&self, key: &ResourceKey, resource_version: Option<&str>) -> Result<WatchLines, TransportError> {
        let req = watch_request(key, resource_version)?;
        let reader = self.client.request_stream(req).await?;
        debug!(key = %key, rv = ?resource_version, "kubehub: watch stream open");
        let lines = reader
            .lines()
            .map_err(|e| TransportError::Connect(e.to_string()))
            .try_filter(|l| futures::future::ready(!l.trim().is_empty()));
        Ok(lines.boxed())
    }

    async fn get(&self, key: &ResourceKey, name: &str) -> Result<Value, TransportError> {
        let req = Self::request(key).get(name, &GetParams::default()).map_err(request_err)?;
        decode(&self.client.request_text(req).await?)
    }

    async fn create(&self, key: &ResourceKey, obj: &Value) -> Result<Value, TransportError> {
        let req = Self::request(key).create(&PostParams::default(), encode(obj)?).map_err(request_err)?;
        decode(&self.client.request_text(req).await?)
    }

    async fn update(&self, key: &ResourceKey, name: &str, obj: &Value) -> Result<Value, TransportError> {
        let req = Self::request(key).replace(name, &PostParams::default(), encode(obj)?).map_err(request_err)?;
        decode(&self.client.request_text(req).await?)
    }

    async fn delete(&self, key: &ResourceKey, name: &str) -> Result<Value, TransportError> {
        let req = Self::request(key).delete(name, &DeleteParams::default()).map_err(request_err)?;
        decode(&self.client.request_text(req).await?)
    }
}
