use crate::error::{truncate, BridgeError, Result};
use crate::gateway::{
    ByteStream, UpstreamGateway, UpstreamRequest, UpstreamResponse, UpstreamStream, UpstreamTarget,
};
use crate::logging::{DiagnosticEntry, DiagnosticKind, DiagnosticsLog};
use crate::translate::streaming::{StreamReframer, UpstreamFrame};
use crate::translate::typed::{MessagesRequest, MessagesResponse, StreamEvent};
use crate::translate::{body_to_typed, RequestTranslator};

use bytes::Bytes;
use eventsource_stream::{EventStreamError, Eventsource};
use futures::stream::Stream;
use futures::StreamExt;
use reqwest::header::HeaderMap;
use reqwest::Method;
use serde_json::{json, Value};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Flat-message endpoint every translated request is sent to.
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Upstream bodies are cut to this many bytes before they are logged or journaled.
const BODY_EXCERPT_LIMIT: usize = 2000;

/// Decode errors in a row after which the upstream stream is treated as ended.
/// The SSE decoder does not advance past a line it cannot parse.
const MAX_DECODE_ERRORS: usize = 8;

/// Where a request goes and what it carries besides its body.
#[derive(Debug, Clone)]
pub struct RouteContext {
    pub target: UpstreamTarget,
    /// The upstream's configured default model.
    pub default_model: String,
    pub headers: HeaderMap,
    pub query: Option<String>,
}

impl RouteContext {
    pub fn new(target: UpstreamTarget, default_model: impl Into<String>) -> Self {
        Self {
            target,
            default_model: default_model.into(),
            headers: HeaderMap::new(),
            query: None,
        }
    }

    fn request(&self, path: &str, body: impl Into<Bytes>) -> UpstreamRequest {
        self.request_with(Method::POST, path, body)
    }

    fn request_with(&self, method: Method, path: &str, body: impl Into<Bytes>) -> UpstreamRequest {
        UpstreamRequest::new(method, self.target.clone(), path, body)
            .with_headers(self.headers.clone())
            .with_query(self.query.clone())
    }

    fn journal(&self, kind: DiagnosticKind, message: impl Into<String>) -> DiagnosticEntry {
        DiagnosticEntry::new(kind, message).with_upstream(self.target.alias())
    }
}

/// Outcome of proxying a non-streaming request
#[derive(Debug)]
pub enum ProxyResult {
    Success(MessagesResponse),
    /// The upstream answered with an error status; relayed untouched.
    Upstream(UpstreamResponse),
}

/// Outcome of proxying a streaming request
pub enum StreamResult {
    Events(SseStream),
    /// The upstream answered with an error status; relayed untouched.
    Upstream(UpstreamStream),
}

/// Outcome of a flat-message passthrough request
pub enum PassthroughResult {
    Buffered(UpstreamResponse),
    Streamed(UpstreamStream),
}

/// Outbound typed-block events, already serialized.
pub type SseStream = Pin<Box<dyn Stream<Item = SseEvent> + Send>>;

#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

impl SseEvent {
    fn from_event(event: &StreamEvent) -> Option<Self> {
        serde_json::to_string(event).ok().map(|data| SseEvent {
            event: event.event_name().to_string(),
            data,
        })
    }
}

/// Translate a non-streaming typed-block request, send it, and translate the answer.
pub async fn proxy_non_streaming<G: UpstreamGateway>(
    req: &MessagesRequest,
    ctx: &RouteContext,
    gateway: &G,
    diagnostics: &DiagnosticsLog,
) -> Result<ProxyResult> {
    let flat = RequestTranslator::new(&ctx.default_model).translate(req);
    let body = serde_json::to_vec(&flat)?;

    tracing::info!(upstream = %ctx.target, model = %flat.model, messages = flat.messages.len(), "POST {}", CHAT_COMPLETIONS_PATH);

    let response = gateway
        .send(ctx.request(CHAT_COMPLETIONS_PATH, body))
        .await
        .inspect_err(|e| record_transport_error(ctx, diagnostics, e))?;

    if !response.status.is_success() {
        record_upstream_status(ctx, diagnostics, response.status.as_u16(), &response.body);
        return Ok(ProxyResult::Upstream(response));
    }

    let translated = body_to_typed(&response.body, &flat.model)
        .inspect_err(|e| record_protocol_error(ctx, diagnostics, e))?;

    tracing::info!(
        upstream = %ctx.target,
        input_tokens = translated.usage.input_tokens,
        output_tokens = translated.usage.output_tokens,
        "completed"
    );

    Ok(ProxyResult::Success(translated))
}

/// Translate a streaming typed-block request and open the upstream stream.
///
/// The returned event stream stops as soon as `cancel` fires, without closing events.
pub async fn proxy_streaming<G: UpstreamGateway>(
    req: &MessagesRequest,
    ctx: &RouteContext,
    gateway: &G,
    diagnostics: &DiagnosticsLog,
    cancel: CancellationToken,
) -> Result<StreamResult> {
    let flat = RequestTranslator::new(&ctx.default_model).translate(req);
    let body = serde_json::to_vec(&flat)?;

    tracing::info!(upstream = %ctx.target, model = %flat.model, messages = flat.messages.len(), "POST {} (streaming)", CHAT_COMPLETIONS_PATH);

    let upstream = gateway
        .open_stream(ctx.request(CHAT_COMPLETIONS_PATH, body))
        .await
        .inspect_err(|e| record_transport_error(ctx, diagnostics, e))?;

    if !upstream.status.is_success() {
        let status = upstream.status.as_u16();
        tracing::warn!(upstream = %ctx.target, status, "upstream rejected streaming request");
        diagnostics.record(ctx.journal(
            DiagnosticKind::UpstreamStatus,
            format!("streaming request failed with status {}", status),
        ));
        return Ok(StreamResult::Upstream(upstream));
    }

    let events = reframe_stream(
        upstream.body,
        flat.model,
        ctx.clone(),
        diagnostics.clone(),
        cancel,
    );
    Ok(StreamResult::Events(Box::pin(events)))
}

/// Decode an upstream SSE byte stream and re-frame it into typed-block events.
pub fn reframe_stream(
    body: ByteStream,
    model: String,
    ctx: RouteContext,
    diagnostics: DiagnosticsLog,
    cancel: CancellationToken,
) -> impl Stream<Item = SseEvent> + Send + 'static {
    async_stream::stream! {
        let mut reframer = StreamReframer::new(&model);
        let mut payloads = Box::pin(lossy_utf8(body)).eventsource();
        let mut close = true;
        let mut decode_errors = 0;

        'read: loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    close = false;
                    break 'read;
                }
                next = payloads.next() => next,
            };

            let event = match next {
                Some(Ok(event)) => {
                    decode_errors = 0;
                    event
                }
                Some(Err(EventStreamError::Transport(e))) => {
                    tracing::error!(upstream = %ctx.target, error = %e, "upstream stream failed");
                    diagnostics.record(ctx.journal(DiagnosticKind::Transport, format!("stream interrupted: {}", e)));
                    close = false;
                    break;
                }
                Some(Err(e)) => {
                    decode_errors += 1;
                    tracing::warn!(upstream = %ctx.target, error = %e, "skipping undecodable upstream event");
                    diagnostics.record(ctx.journal(DiagnosticKind::SkippedChunk, e.to_string()));
                    if decode_errors >= MAX_DECODE_ERRORS {
                        break;
                    }
                    continue;
                }
                None => break,
            };

            if event.data.trim().is_empty() {
                continue;
            }

            let frame = UpstreamFrame::parse(&event.data);
            if let UpstreamFrame::Malformed { ref error } = frame {
                diagnostics.record(
                    ctx.journal(DiagnosticKind::SkippedChunk, error.clone())
                        .with_context(json!({ "data": truncate(&event.data, BODY_EXCERPT_LIMIT) })),
                );
            }
            let done = matches!(frame, UpstreamFrame::Done);

            for out in reframer.process(frame) {
                if cancel.is_cancelled() {
                    close = false;
                    break 'read;
                }
                if let Some(sse) = SseEvent::from_event(&out) {
                    yield sse;
                }
            }

            if done {
                break;
            }
        }

        if close && !reframer.is_closed() {
            for out in reframer.finish() {
                if cancel.is_cancelled() {
                    break;
                }
                if let Some(sse) = SseEvent::from_event(&out) {
                    yield sse;
                }
            }
        }

        if cancel.is_cancelled() {
            tracing::info!(upstream = %ctx.target, "stream cancelled by caller");
        } else {
            tracing::info!(upstream = %ctx.target, "stream completed");
        }
    }
}

/// Pass upstream bytes on as valid UTF-8. Invalid sequences become U+FFFD; a
/// sequence split across chunks is carried over to the next chunk.
fn lossy_utf8(body: ByteStream) -> impl Stream<Item = Result<Bytes>> + Send + 'static {
    async_stream::stream! {
        let mut body = body;
        let mut carry: Vec<u8> = Vec::new();

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(e);
                    break;
                }
            };
            carry.extend_from_slice(&chunk);

            let mut text = String::with_capacity(carry.len());
            let mut rest: &[u8] = &carry;
            while !rest.is_empty() {
                match std::str::from_utf8(rest) {
                    Ok(valid) => {
                        text.push_str(valid);
                        rest = &[];
                    }
                    Err(e) => {
                        let (valid, after) = rest.split_at(e.valid_up_to());
                        text.push_str(&String::from_utf8_lossy(valid));
                        match e.error_len() {
                            Some(len) => {
                                text.push(char::REPLACEMENT_CHARACTER);
                                rest = &after[len..];
                            }
                            // Incomplete sequence at the end: wait for more bytes
                            None => {
                                rest = after;
                                break;
                            }
                        }
                    }
                }
            }
            let leftover = rest.to_vec();
            carry = leftover;

            if !text.is_empty() {
                yield Ok(Bytes::from(text));
            }
        }

        if !carry.is_empty() {
            yield Ok(Bytes::from(String::from_utf8_lossy(&carry).into_owned()));
        }
    }
}

/// Forward a flat-message request to the upstream unchanged, except that a blank
/// model is replaced with the upstream's default and `stream` defaults to `false`.
pub async fn proxy_chat_completions<G: UpstreamGateway>(
    body: &[u8],
    ctx: &RouteContext,
    gateway: &G,
    diagnostics: &DiagnosticsLog,
) -> Result<PassthroughResult> {
    let mut payload: Value = serde_json::from_slice(body)
        .map_err(|e| BridgeError::malformed(format!("Invalid request body: {}", e)))?;
    let object = payload
        .as_object_mut()
        .ok_or_else(|| BridgeError::malformed("Request body must be a JSON object"))?;

    let model_missing = object
        .get("model")
        .and_then(Value::as_str)
        .map_or(true, |m| m.trim().is_empty());
    if model_missing {
        object.insert("model".to_string(), Value::String(ctx.default_model.clone()));
    }
    if object.get("stream").map_or(true, Value::is_null) {
        object.insert("stream".to_string(), Value::Bool(false));
    }
    let streaming = object.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let out = serde_json::to_vec(&payload)?;
    tracing::info!(upstream = %ctx.target, streaming, "passthrough POST {}", CHAT_COMPLETIONS_PATH);
    let request = ctx.request(CHAT_COMPLETIONS_PATH, out);

    if streaming {
        let upstream = gateway
            .open_stream(request)
            .await
            .inspect_err(|e| record_transport_error(ctx, diagnostics, e))?;
        if !upstream.status.is_success() {
            diagnostics.record(ctx.journal(
                DiagnosticKind::UpstreamStatus,
                format!("passthrough stream failed with status {}", upstream.status.as_u16()),
            ));
        }
        return Ok(PassthroughResult::Streamed(upstream));
    }

    let response = gateway
        .send(request)
        .await
        .inspect_err(|e| record_transport_error(ctx, diagnostics, e))?;
    if !response.status.is_success() {
        record_upstream_status(ctx, diagnostics, response.status.as_u16(), &response.body);
    }
    Ok(PassthroughResult::Buffered(response))
}

/// Forward any other upstream endpoint (models, embeddings, ...) as-is. `path` is the
/// request path with the alias prefix already removed.
pub async fn proxy_passthrough<G: UpstreamGateway>(
    method: Method,
    path: &str,
    body: Bytes,
    ctx: &RouteContext,
    gateway: &G,
    diagnostics: &DiagnosticsLog,
) -> Result<UpstreamResponse> {
    tracing::info!(upstream = %ctx.target, %method, path, "passthrough");

    let response = gateway
        .send(ctx.request_with(method, path, body))
        .await
        .inspect_err(|e| record_transport_error(ctx, diagnostics, e))?;
    if !response.status.is_success() {
        record_upstream_status(ctx, diagnostics, response.status.as_u16(), &response.body);
    }
    Ok(response)
}

/// Remove a leading `/<alias>` segment from a request path.
pub fn strip_alias_prefix(path: &str, alias: Option<&str>) -> String {
    let Some(alias) = alias.filter(|a| !a.is_empty()) else {
        return path.to_string();
    };
    let Some(rest) = path
        .strip_prefix('/')
        .and_then(|p| p.strip_prefix(alias))
    else {
        return path.to_string();
    };
    if rest.is_empty() {
        "/".to_string()
    } else if rest.starts_with('/') {
        rest.to_string()
    } else {
        path.to_string()
    }
}

fn record_transport_error(ctx: &RouteContext, diagnostics: &DiagnosticsLog, error: &BridgeError) {
    tracing::error!(upstream = %ctx.target, %error, "upstream request failed");
    diagnostics.record(ctx.journal(DiagnosticKind::Transport, error.to_string()));
}

fn record_upstream_status(ctx: &RouteContext, diagnostics: &DiagnosticsLog, status: u16, body: &[u8]) {
    let body = String::from_utf8_lossy(body);
    let excerpt = truncate(&body, BODY_EXCERPT_LIMIT);
    tracing::warn!(upstream = %ctx.target, status, body = %excerpt, "upstream returned an error");
    diagnostics.record(
        ctx.journal(DiagnosticKind::UpstreamStatus, format!("upstream returned status {}", status))
            .with_context(json!({ "status": status, "body": excerpt })),
    );
}

fn record_protocol_error(ctx: &RouteContext, diagnostics: &DiagnosticsLog, error: &BridgeError) {
    let body = match error {
        BridgeError::UpstreamProtocol { body, .. } => body.as_str(),
        _ => "",
    };
    tracing::error!(upstream = %ctx.target, %error, body = %body, "unusable upstream response");
    diagnostics.record(
        ctx.journal(DiagnosticKind::UpstreamProtocol, error.to_string())
            .with_context(json!({ "body": body })),
    );
}
