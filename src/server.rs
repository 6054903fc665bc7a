use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::gateway::{
    passthrough_headers, UpstreamGateway, UpstreamResponse, UpstreamStream, UpstreamTarget,
};
use crate::logging::{DiagnosticKind, DiagnosticsLog};
use crate::proxy::{self, PassthroughResult, ProxyResult, RouteContext, StreamResult};
use crate::translate::typed::{ErrorResponse, MessagesRequest};

use axum::body::Body;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub struct AppState<G> {
    pub config: Arc<BridgeConfig>,
    pub gateway: G,
    pub diagnostics: DiagnosticsLog,
}

impl<G> AppState<G> {
    pub fn new(config: Arc<BridgeConfig>, gateway: G, diagnostics: DiagnosticsLog) -> Self {
        Self {
            config,
            gateway,
            diagnostics,
        }
    }
}

pub fn build_router<G: UpstreamGateway>(state: Arc<AppState<G>>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/messages", post(handle_messages::<G>))
        .route("/:alias/v1/messages", post(handle_alias_messages::<G>))
        .route("/v1/chat/completions", post(handle_chat_completions::<G>))
        .route(
            "/:alias/v1/chat/completions",
            post(handle_alias_chat_completions::<G>),
        )
        .route("/v1", post(handle_passthrough::<G>))
        .route("/v1/", post(handle_passthrough::<G>))
        .route("/:alias/v1", post(handle_alias_passthrough::<G>))
        .route("/:alias/v1/", post(handle_alias_passthrough::<G>))
        .route("/health", get(handle_health))
        .route("/healthz", get(handle_health))
        .route("/:alias/health", get(handle_alias_health::<G>))
        .route("/:alias/healthz", get(handle_alias_health::<G>))
        .route("/debug/diagnostics", get(handle_diagnostics::<G>))
        .fallback(handle_fallback::<G>)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve the upstream for a request and capture what the gateway needs from it.
fn route_context(
    config: &BridgeConfig,
    alias: Option<&str>,
    headers: HeaderMap,
    query: Option<String>,
) -> Result<RouteContext, BridgeError> {
    let (alias, upstream) = config.resolve_upstream(alias)?;
    let mut ctx = RouteContext::new(UpstreamTarget::new(alias), upstream.default_model.clone());
    ctx.headers = headers;
    ctx.query = query;
    Ok(ctx)
}

async fn handle_messages<G: UpstreamGateway>(
    State(state): State<Arc<AppState<G>>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    messages(state, None, query, headers, body).await
}

async fn handle_alias_messages<G: UpstreamGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(alias): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    messages(state, Some(alias), query, headers, body).await
}

async fn messages<G: UpstreamGateway>(
    state: Arc<AppState<G>>,
    alias: Option<String>,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = match route_context(&state.config, alias.as_deref(), headers, query) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };

    let req: MessagesRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!(error = %e, "failed to parse request");
            state.diagnostics.note(DiagnosticKind::MalformedInput, e.to_string());
            return error_response(&BridgeError::malformed(format!("Invalid request body: {}", e)));
        }
    };

    tracing::info!(
        upstream = %ctx.target,
        model = %req.model,
        streaming = req.is_streaming(),
        messages = req.messages.len(),
        "messages request"
    );

    if req.is_streaming() {
        handle_streaming(&state, &req, &ctx).await
    } else {
        handle_non_streaming(&state, &req, &ctx).await
    }
}

async fn handle_non_streaming<G: UpstreamGateway>(
    state: &Arc<AppState<G>>,
    req: &MessagesRequest,
    ctx: &RouteContext,
) -> Response {
    match proxy::proxy_non_streaming(req, ctx, &state.gateway, &state.diagnostics).await {
        Ok(ProxyResult::Success(resp)) => Json(resp).into_response(),
        Ok(ProxyResult::Upstream(resp)) => buffered_response(resp),
        Err(e) => error_response(&e),
    }
}

async fn handle_streaming<G: UpstreamGateway>(
    state: &Arc<AppState<G>>,
    req: &MessagesRequest,
    ctx: &RouteContext,
) -> Response {
    let cancel = CancellationToken::new();
    let result = proxy::proxy_streaming(
        req,
        ctx,
        &state.gateway,
        &state.diagnostics,
        cancel.clone(),
    )
    .await;

    let events = match result {
        Ok(StreamResult::Events(events)) => events,
        Ok(StreamResult::Upstream(upstream)) => return streamed_response(upstream),
        Err(e) => return error_response(&e),
    };

    // Cancelled when the response body is dropped, i.e. the caller went away
    let guard = cancel.drop_guard();
    let event_stream = events.map(move |sse| -> Result<Event, Infallible> {
        let _ = &guard;
        Ok(Event::default().event(sse.event).data(sse.data))
    });

    Sse::new(event_stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn handle_chat_completions<G: UpstreamGateway>(
    State(state): State<Arc<AppState<G>>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    chat_completions(state, None, query, headers, body).await
}

async fn handle_alias_chat_completions<G: UpstreamGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(alias): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    chat_completions(state, Some(alias), query, headers, body).await
}

async fn chat_completions<G: UpstreamGateway>(
    state: Arc<AppState<G>>,
    alias: Option<String>,
    query: Option<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ctx = match route_context(&state.config, alias.as_deref(), headers, query) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };

    match proxy::proxy_chat_completions(&body, &ctx, &state.gateway, &state.diagnostics).await {
        Ok(PassthroughResult::Buffered(resp)) => buffered_response(resp),
        Ok(PassthroughResult::Streamed(upstream)) => streamed_response(upstream),
        Err(e) => error_response(&e),
    }
}

async fn handle_passthrough<G: UpstreamGateway>(
    State(state): State<Arc<AppState<G>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    passthrough(state, None, method, uri, headers, body).await
}

async fn handle_alias_passthrough<G: UpstreamGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(alias): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    passthrough(state, Some(alias), method, uri, headers, body).await
}

/// Anything unrouted under `/<alias>/...` goes to that upstream, any method.
async fn handle_fallback<G: UpstreamGateway>(
    State(state): State<Arc<AppState<G>>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let alias = uri
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string();
    if alias.is_empty() || alias == "v1" {
        return StatusCode::NOT_FOUND.into_response();
    }
    if !state.config.upstreams.contains_key(&alias) {
        return (StatusCode::NOT_FOUND, format!("unknown alias: {}", alias)).into_response();
    }
    passthrough(state, Some(alias), method, uri, headers, body).await
}

async fn passthrough<G: UpstreamGateway>(
    state: Arc<AppState<G>>,
    alias: Option<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let query = uri.query().map(str::to_string);
    let ctx = match route_context(&state.config, alias.as_deref(), headers, query) {
        Ok(ctx) => ctx,
        Err(e) => return error_response(&e),
    };
    let path = proxy::strip_alias_prefix(uri.path(), alias.as_deref());

    match proxy::proxy_passthrough(method, &path, body, &ctx, &state.gateway, &state.diagnostics)
        .await
    {
        Ok(resp) => buffered_response(resp),
        Err(e) => error_response(&e),
    }
}

async fn handle_health() -> &'static str {
    "ok"
}

async fn handle_alias_health<G: UpstreamGateway>(
    State(state): State<Arc<AppState<G>>>,
    Path(alias): Path<String>,
) -> Response {
    match state.config.resolve_upstream(Some(&alias)) {
        Ok(_) => "ok".into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct DiagnosticsQuery {
    limit: Option<usize>,
}

async fn handle_diagnostics<G: UpstreamGateway>(
    State(state): State<Arc<AppState<G>>>,
    Query(params): Query<DiagnosticsQuery>,
) -> Json<serde_json::Value> {
    let entries = state.diagnostics.recent(params.limit.unwrap_or(100));
    Json(serde_json::json!({ "entries": entries }))
}

/// Map a bridge error onto an HTTP status and a typed-block error body.
pub fn error_response(error: &BridgeError) -> Response {
    let (status, body) = match error {
        BridgeError::MalformedInput { message } => (
            StatusCode::BAD_REQUEST,
            ErrorResponse::invalid_request(message.clone()),
        ),
        BridgeError::UnknownUpstream { .. } => (
            StatusCode::NOT_FOUND,
            ErrorResponse::not_found(error.to_string()),
        ),
        BridgeError::UpstreamProtocol { message, .. } => (
            StatusCode::BAD_GATEWAY,
            ErrorResponse::api_error(message.clone()),
        ),
        BridgeError::Http(e) => {
            tracing::error!(error = %e, "upstream transport error");
            (
                StatusCode::BAD_GATEWAY,
                ErrorResponse::api_error(format!("Upstream request failed: {}", e)),
            )
        }
        other => {
            tracing::error!(error = %other, "bridge error");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorResponse::api_error(other.to_string()),
            )
        }
    };
    (status, Json(body)).into_response()
}

fn buffered_response(resp: UpstreamResponse) -> Response {
    let mut response = Response::new(Body::from(resp.body));
    *response.status_mut() = resp.status;
    *response.headers_mut() = passthrough_headers(&resp.headers);
    response
}

fn streamed_response(upstream: UpstreamStream) -> Response {
    let mut response = Response::new(Body::from_stream(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = passthrough_headers(&upstream.headers);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn test_error_response_mapping() {
        let resp = error_response(&BridgeError::malformed("missing messages"));
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["type"], "invalid_request_error");
        assert_eq!(json["error"]["message"], "missing messages");

        let resp = error_response(&BridgeError::upstream_protocol("no choices", "{}"));
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "api_error");

        let resp = error_response(&BridgeError::unknown_upstream("nope"));
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_buffered_response_keeps_status_and_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("content-length", "2".parse().unwrap());
        headers.insert("x-upstream", "yes".parse().unwrap());
        let resp = buffered_response(UpstreamResponse {
            status: StatusCode::TOO_MANY_REQUESTS,
            headers,
            body: Bytes::from_static(b"{}"),
        });
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()["x-upstream"], "yes");
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"{}");
    }
}
