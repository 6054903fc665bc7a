//! Upstream gateway: the only place that knows base URLs and credentials.
//!
//! The translation core hands the gateway an [`UpstreamRequest`] naming an opaque
//! [`UpstreamTarget`]; [`HttpGateway`] resolves the target against the configuration,
//! builds the URL, filters headers and injects authentication.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};

use crate::config::{BridgeConfig, UpstreamConfig};
use crate::error::{BridgeError, Result};

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Headers that describe one hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "http2-settings",
];

/// Request headers the client sets itself.
const CLIENT_MANAGED: &[&str] = &["host", "content-length", "accept-encoding"];

/// Name of a configured upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamTarget(String);

impl UpstreamTarget {
    pub fn new(alias: impl Into<String>) -> Self {
        Self(alias.into())
    }

    pub fn alias(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UpstreamTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    /// Path as the caller saw it, e.g. `/v1/chat/completions`.
    pub path: String,
    pub body: Bytes,
    pub query: Option<String>,
    /// The caller's headers; filtered by the gateway before sending.
    pub headers: HeaderMap,
    pub target: UpstreamTarget,
}

impl UpstreamRequest {
    pub fn new(
        method: Method,
        target: UpstreamTarget,
        path: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            body: body.into(),
            query: None,
            headers: HeaderMap::new(),
            target,
        }
    }

    pub fn post(target: UpstreamTarget, path: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self::new(Method::POST, target, path, body)
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_query(mut self, query: Option<String>) -> Self {
        self.query = query.filter(|q| !q.is_empty());
        self
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct UpstreamStream {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl std::fmt::Debug for UpstreamStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamStream")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Transport to the upstream providers.
pub trait UpstreamGateway: Send + Sync + 'static {
    /// Send a request and read the whole response body.
    fn send(&self, req: UpstreamRequest) -> impl Future<Output = Result<UpstreamResponse>> + Send;

    /// Send a request and hand back the response body as it arrives.
    fn open_stream(
        &self,
        req: UpstreamRequest,
    ) -> impl Future<Output = Result<UpstreamStream>> + Send;
}

/// [`UpstreamGateway`] over HTTP, configured from [`BridgeConfig`].
#[derive(Debug, Clone)]
pub struct HttpGateway {
    config: Arc<BridgeConfig>,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(config: Arc<BridgeConfig>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { config, client })
    }

    fn build(&self, req: UpstreamRequest) -> Result<(reqwest::RequestBuilder, &UpstreamConfig)> {
        let (_, upstream) = self.config.resolve_upstream(Some(req.target.alias()))?;
        let url = build_upstream_url(&upstream.base_url, &req.path, req.query.as_deref());
        let has_body = !req.body.is_empty();
        let headers = outbound_headers(&req.headers, upstream, has_body)?;

        tracing::debug!(target_alias = %req.target, method = %req.method, %url, "upstream request");

        let builder = self
            .client
            .request(req.method, url)
            .headers(headers)
            .body(req.body);
        Ok((builder, upstream))
    }
}

impl UpstreamGateway for HttpGateway {
    async fn send(&self, req: UpstreamRequest) -> Result<UpstreamResponse> {
        let (builder, upstream) = self.build(req)?;
        let response = builder
            .timeout(Duration::from_secs(upstream.timeout_secs))
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        tracing::debug!(status = status.as_u16(), body_len = body.len(), "upstream response");

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }

    async fn open_stream(&self, req: UpstreamRequest) -> Result<UpstreamStream> {
        // No total timeout: a stream lives as long as the upstream keeps talking
        let (builder, _) = self.build(req)?;
        let response = builder.send().await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(BridgeError::from));

        Ok(UpstreamStream {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}

/// Join base URL and path, collapsing a `/v1` present on both sides.
pub fn build_upstream_url(base_url: &str, path: &str, query: Option<&str>) -> String {
    let base = base_url.trim_end_matches('/');
    let mut path = path;
    if base.ends_with("/v1") {
        if let Some(rest) = path.strip_prefix("/v1") {
            path = if rest.is_empty() { "/" } else { rest };
        }
    }

    let mut url = String::with_capacity(base.len() + path.len() + 1);
    url.push_str(base);
    if !path.starts_with('/') {
        url.push('/');
    }
    url.push_str(path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Header names listed in `Connection`, which are scoped to this hop too.
fn connection_tokens(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Caller headers prepared for the upstream: hop-by-hop and client-managed headers
/// removed, a JSON content type when a body is sent without one, and the configured
/// credential. Without a configured key the caller's own auth header goes through.
pub fn outbound_headers(
    incoming: &HeaderMap,
    upstream: &UpstreamConfig,
    has_body: bool,
) -> Result<HeaderMap> {
    let named = connection_tokens(incoming);
    let mut headers = HeaderMap::with_capacity(incoming.len() + 2);
    for (name, value) in incoming {
        if is_hop_by_hop(name)
            || CLIENT_MANAGED.contains(&name.as_str())
            || named.iter().any(|t| t == name.as_str())
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if has_body && !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }

    if let Some(key) = upstream.resolve_api_key() {
        let name = HeaderName::from_bytes(upstream.auth_header.trim().as_bytes()).map_err(|e| {
            BridgeError::config(format!("Invalid auth_header '{}': {}", upstream.auth_header, e))
        })?;
        let value = HeaderValue::from_str(&upstream.auth_value(&key))
            .map_err(|e| BridgeError::config(format!("Invalid API key characters: {}", e)))?;
        headers.insert(name, value);
    }

    Ok(headers)
}

/// Upstream response headers safe to hand back to the caller verbatim.
pub fn passthrough_headers(upstream: &HeaderMap) -> HeaderMap {
    let named = connection_tokens(upstream);
    let mut headers = HeaderMap::with_capacity(upstream.len());
    for (name, value) in upstream {
        if is_hop_by_hop(name)
            || *name == reqwest::header::CONTENT_LENGTH
            || named.iter().any(|t| t == name.as_str())
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}
