use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::logging::SharedLogger;
use crate::proxy::{self, ProxyResult};
use crate::translate::openai_types::{ChatCompletionRequest, ChatErrorResponse, EmbeddingsRequest};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub config: ProxyConfig,
    pub client: reqwest::Client,
    pub logger: SharedLogger,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/chat/completions", post(handle_chat_completions))
        .route("/v1/embeddings", post(handle_embeddings))
        .route("/embeddings", post(handle_embeddings))
        .route("/v1/models", get(handle_models))
        .route("/models", get(handle_models))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            state
                .logger
                .error("server", format!("Failed to parse request: {e}"));
            let err = ChatErrorResponse::invalid_request(format!("Invalid request body: {e}"));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };

    let api_key = resolve_api_key(&headers, &state.config);
    let is_streaming = req.is_streaming();

    state.logger.info(
        "server",
        format!(
            "Request: model={} streaming={} messages={}",
            req.model
                .as_ref()
                .map_or_else(|| "<default>".to_string(), ToString::to_string),
            is_streaming,
            req.messages.len()
        ),
    );

    if is_streaming {
        handle_streaming(&state, &req, api_key.as_deref()).await
    } else {
        let result = proxy::proxy_non_streaming(
            &req,
            api_key.as_deref(),
            &state.config,
            &state.client,
            &state.logger,
        )
        .await;
        json_response(&state, result)
    }
}

async fn handle_streaming(
    state: &AppState,
    req: &ChatCompletionRequest,
    api_key: Option<&str>,
) -> Response {
    let result =
        proxy::proxy_streaming(req, api_key, &state.config, &state.client, &state.logger).await;

    match result {
        Ok(ProxyResult::Success(stream)) => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(stream))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        Ok(ProxyResult::Error(err, status_code)) => error_response(err, status_code),
        Err(e) => proxy_error_response(state, &e),
    }
}

async fn handle_embeddings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: EmbeddingsRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            let err = ChatErrorResponse::invalid_request(format!("Invalid request body: {e}"));
            return (StatusCode::BAD_REQUEST, Json(err)).into_response();
        }
    };

    let api_key = resolve_api_key(&headers, &state.config);
    let result = proxy::proxy_embeddings(
        &req,
        api_key.as_deref(),
        &state.config,
        &state.client,
        &state.logger,
    )
    .await;
    json_response(&state, result)
}

async fn handle_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let api_key = resolve_api_key(&headers, &state.config);
    let result =
        proxy::proxy_models(api_key.as_deref(), &state.config, &state.client, &state.logger).await;
    json_response(&state, result)
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn json_response<T: Serialize>(state: &AppState, result: crate::Result<ProxyResult<T>>) -> Response {
    match result {
        Ok(ProxyResult::Success(body)) => Json(body).into_response(),
        Ok(ProxyResult::Error(err, status_code)) => error_response(err, status_code),
        Err(e) => proxy_error_response(state, &e),
    }
}

fn error_response(err: ChatErrorResponse, status_code: u16) -> Response {
    let status = StatusCode::from_u16(status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    (status, Json(err)).into_response()
}

fn proxy_error_response(state: &AppState, e: &ProxyError) -> Response {
    let err = if e.is_client_error() {
        state.logger.warn("server", format!("Rejected request: {e}"));
        ChatErrorResponse::invalid_request(e.to_string())
    } else {
        state.logger.error("server", format!("Proxy error: {e}"));
        ChatErrorResponse::api_error(format!("Proxy error: {e}"))
    };
    error_response(err, e.status_code())
}

/// Bearer token from the client, else the configured environment variable.
fn resolve_api_key(headers: &HeaderMap, config: &ProxyConfig) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .or_else(|| config.fallback_api_key())
}
