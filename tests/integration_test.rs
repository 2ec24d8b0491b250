//! End-to-end tests: the proxy router in front of an in-process mock of the
//! Gemini REST API. No network access or API key needed.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use gemini_openai_proxy::{build_router, AppState, ProxyConfig, SharedLogger};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake-image";

#[derive(Debug, Clone)]
struct Captured {
    call: String,
    api_key: Option<String>,
    client_header: Option<String>,
    body: Value,
}

type Seen = Arc<Mutex<Vec<Captured>>>;

fn sse_body(chunks: Vec<&'static str>) -> Response {
    let stream = futures::stream::iter(
        chunks
            .into_iter()
            .map(|c| Ok::<_, Infallible>(Bytes::from_static(c.as_bytes()))),
    );
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from_stream(stream))
        .unwrap()
}

async fn mock_model_call(
    State(seen): State<Seen>,
    Path(call): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    seen.lock().unwrap().push(Captured {
        call: call.clone(),
        api_key: header_value("x-goog-api-key"),
        client_header: header_value("x-goog-api-client"),
        body: serde_json::from_slice(&body).unwrap_or(Value::Null),
    });

    let (model, method) = call.split_once(':').unwrap_or((call.as_str(), ""));
    match (model, method) {
        ("gemini-error", _) => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({"error": {"code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED"}})),
        )
            .into_response(),
        (_, "generateContent") => Json(json!({
            "candidates": [{
                "index": 0,
                "content": {"role": "model", "parts": [{"text": "Hello, "}, {"text": "world!"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 4, "candidatesTokenCount": 6, "totalTokenCount": 10},
            "modelVersion": "gemini-2.0-flash-001"
        }))
        .into_response(),
        ("gemini-malformed", "streamGenerateContent") => {
            sse_body(vec!["data: {not json}\r\n\r\n"])
        }
        ("gemini-empty", "streamGenerateContent") => sse_body(vec![]),
        (_, "streamGenerateContent") => sse_body(vec![
            "data: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Hel",
            "lo\"}]}}]}\r\n\r\ndata: {\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\" world\"}]},\"finishReason\":\"STOP\"}],",
            "\"usageMetadata\":{\"promptTokenCount\":3,\"candidatesTokenCount\":2,\"totalTokenCount\":5}}\r\n\r\n",
        ]),
        (_, "batchEmbedContents") => {
            let count = seen.lock().unwrap().last().map_or(0, |c| {
                c.body["requests"].as_array().map_or(0, Vec::len)
            });
            let embeddings: Vec<Value> = (0..count)
                .map(|i| json!({"values": [i as f64, 0.5]}))
                .collect();
            Json(json!({"embeddings": embeddings})).into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn mock_list_models() -> Json<Value> {
    Json(json!({
        "models": [
            {"name": "models/gemini-2.0-flash"},
            {"name": "models/text-embedding-004"}
        ]
    }))
}

async fn mock_image() -> Response {
    Response::builder()
        .header(header::CONTENT_TYPE, "image/png")
        .body(Body::from(PNG_BYTES))
        .unwrap()
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

struct Harness {
    proxy: String,
    upstream: String,
    seen: Seen,
    client: reqwest::Client,
}

impl Harness {
    async fn start() -> Self {
        let seen: Seen = Arc::default();
        let upstream_router = Router::new()
            .route("/v1beta/models", get(mock_list_models))
            .route("/v1beta/models/:call", post(mock_model_call))
            .route("/image.png", get(mock_image))
            .with_state(seen.clone());
        let upstream = serve(upstream_router).await;

        let proxy = start_proxy(&upstream).await;
        Self {
            proxy,
            upstream,
            seen,
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}{path}", self.proxy))
            .bearer_auth("test-key")
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    fn last_call(&self) -> Captured {
        self.seen.lock().unwrap().last().cloned().unwrap()
    }
}

async fn start_proxy(upstream: &str) -> String {
    let mut config = ProxyConfig::default();
    config.upstream.base_url = upstream.to_string();
    config.upstream.api_key_env = "GEMINI_PROXY_IT_UNSET_KEY".to_string();

    let state = Arc::new(AppState {
        config,
        client: reqwest::Client::new(),
        logger: SharedLogger::in_memory(),
    });
    serve(build_router(state)).await
}

/// Payloads of every `data:` frame in an SSE body, in order.
fn sse_payloads(body: &str) -> Vec<String> {
    body.split("\n\n")
        .filter(|frame| !frame.is_empty())
        .map(|frame| frame.strip_prefix("data: ").unwrap().to_string())
        .collect()
}

fn sse_chunks(payloads: &[String]) -> Vec<Value> {
    payloads
        .iter()
        .filter(|p| p.as_str() != "[DONE]")
        .map(|p| serde_json::from_str(p).unwrap())
        .collect()
}

fn assert_single_trailing_done(payloads: &[String]) {
    let dones = payloads.iter().filter(|p| p.as_str() == "[DONE]").count();
    assert_eq!(dones, 1);
    assert_eq!(payloads.last().map(String::as_str), Some("[DONE]"));
}

#[tokio::test]
async fn test_non_streaming_chat() {
    let h = Harness::start().await;

    let resp = h
        .post(
            "/v1/chat/completions",
            json!({
                "model": "gemini-2.0-flash",
                "messages": [
                    {"role": "system", "content": "Be brief."},
                    {"role": "user", "content": "Hi"}
                ],
                "temperature": 0.2,
                "max_tokens": 64
            }),
        )
        .await;

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "gemini-2.0-flash-001");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello, \n\n|>world!");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert_eq!(body["usage"]["total_tokens"], 10);

    let call = h.last_call();
    assert_eq!(call.call, "gemini-2.0-flash:generateContent");
    assert_eq!(call.api_key.as_deref(), Some("test-key"));
    assert!(call.client_header.is_some());
    assert_eq!(call.body["system_instruction"]["parts"][0]["text"], "Be brief.");
    assert_eq!(call.body["contents"][0]["role"], "user");
    assert_eq!(call.body["contents"][0]["parts"][0]["text"], "Hi");
    assert_eq!(call.body["safetySettings"].as_array().unwrap().len(), 5);
    assert_eq!(call.body["generationConfig"]["maxOutputTokens"], 64);
}

#[tokio::test]
async fn test_unprefixed_route_and_default_model() {
    let h = Harness::start().await;

    let resp = h
        .post(
            "/chat/completions",
            json!({"model": "gpt-4o", "messages": [{"role": "user", "content": "Hi"}]}),
        )
        .await;

    assert_eq!(resp.status(), 200);
    assert_eq!(h.last_call().call, "gemini-2.5-flash:generateContent");
}

#[tokio::test]
async fn test_streaming_chat_reassembles_split_frames() {
    let h = Harness::start().await;

    let resp = h
        .post(
            "/v1/chat/completions",
            json!({
                "model": "models/gemini-2.0-flash",
                "messages": [{"role": "user", "content": "Hi"}],
                "stream": true,
                "stream_options": {"include_usage": true}
            }),
        )
        .await;

    assert_eq!(resp.status(), 200);
    assert!(resp.headers()[header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let body = resp.text().await.unwrap();
    let payloads = sse_payloads(&body);
    assert_single_trailing_done(&payloads);

    let chunks = sse_chunks(&payloads);
    let id = chunks[0]["id"].as_str().unwrap();
    assert!(chunks.iter().all(|c| c["id"] == id));
    assert!(chunks.iter().all(|c| c["object"] == "chat.completion.chunk"));

    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(chunks[0]["choices"][0]["delta"]["content"], "");

    let text: String = chunks
        .iter()
        .filter_map(|c| c["choices"][0]["delta"]["content"].as_str())
        .collect();
    assert_eq!(text, "Hello world");

    let terminal = chunks.last().unwrap();
    assert_eq!(terminal["choices"][0]["finish_reason"], "stop");
    assert_eq!(terminal["usage"]["total_tokens"], 5);
    assert!(chunks[..chunks.len() - 1]
        .iter()
        .all(|c| c["choices"][0]["finish_reason"].is_null()));

    assert_eq!(h.last_call().call, "gemini-2.0-flash:streamGenerateContent");
}

#[tokio::test]
async fn test_malformed_stream_reports_error() {
    let h = Harness::start().await;

    let resp = h
        .post(
            "/v1/chat/completions",
            json!({
                "model": "gemini-malformed",
                "messages": [{"role": "user", "content": "Hi"}],
                "stream": true
            }),
        )
        .await;

    assert_eq!(resp.status(), 200);
    let payloads = sse_payloads(&resp.text().await.unwrap());
    assert_single_trailing_done(&payloads);

    let chunks = sse_chunks(&payloads);
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(chunks[1]["choices"][0]["finish_reason"], "error");
    assert!(chunks[1].get("usage").is_none());
}

#[tokio::test]
async fn test_empty_stream_is_still_terminated() {
    let h = Harness::start().await;

    let resp = h
        .post(
            "/v1/chat/completions",
            json!({
                "model": "gemini-empty",
                "messages": [{"role": "user", "content": "Hi"}],
                "stream": true
            }),
        )
        .await;

    let payloads = sse_payloads(&resp.text().await.unwrap());
    assert_single_trailing_done(&payloads);
    let chunks = sse_chunks(&payloads);
    assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "error");
}

#[tokio::test]
async fn test_upstream_error_is_reshaped() {
    let h = Harness::start().await;

    for stream in [false, true] {
        let resp = h
            .post(
                "/v1/chat/completions",
                json!({
                    "model": "gemini-error",
                    "messages": [{"role": "user", "content": "Hi"}],
                    "stream": stream
                }),
            )
            .await;

        assert_eq!(resp.status(), 429);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(body["error"]["message"], "Quota exceeded");
    }
}

#[tokio::test]
async fn test_invalid_requests_are_rejected() {
    let h = Harness::start().await;

    let resp = h
        .client
        .post(format!("{}/v1/chat/completions", h.proxy))
        .header(header::CONTENT_TYPE, "application/json")
        .body("not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");

    let resp = h
        .post("/v1/chat/completions", json!({"model": "gemini-2.0-flash", "messages": []}))
        .await;
    assert_eq!(resp.status(), 400);

    let resp = h
        .post(
            "/v1/chat/completions",
            json!({
                "messages": [{"role": "user", "content": [
                    {"type": "image_url", "image_url": "ftp://example.com/cat.png"}
                ]}],
                "stream": true
            }),
        )
        .await;
    assert_eq!(resp.status(), 400);

    assert!(h.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_remote_image_is_inlined() {
    let h = Harness::start().await;

    let resp = h
        .post(
            "/v1/chat/completions",
            json!({
                "model": "gemini-2.0-flash",
                "messages": [{"role": "user", "content": [
                    {"type": "image_url", "image_url": {"url": format!("{}/image.png", h.upstream)}}
                ]}]
            }),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let call = h.last_call();
    let parts = call.body["contents"][0]["parts"].as_array().unwrap().clone();
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0]["inlineData"]["mimeType"], "image/png");
    assert_eq!(parts[0]["inlineData"]["data"], STANDARD.encode(PNG_BYTES));
    assert_eq!(parts[1]["text"], "");
}

#[tokio::test]
async fn test_missing_remote_image_fails_request() {
    let h = Harness::start().await;

    let resp = h
        .post(
            "/v1/chat/completions",
            json!({
                "model": "gemini-2.0-flash",
                "messages": [{"role": "user", "content": [
                    {"type": "image_url", "image_url": format!("{}/missing.png", h.upstream)}
                ]}]
            }),
        )
        .await;
    assert_eq!(resp.status(), 502);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "api_error");
}

#[tokio::test]
async fn test_transport_failure_streams_error() {
    let closed = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        format!("http://{}", listener.local_addr().unwrap())
    };
    let proxy = start_proxy(&closed).await;

    let resp = reqwest::Client::new()
        .post(format!("{proxy}/v1/chat/completions"))
        .json(&json!({
            "model": "gemini-2.0-flash",
            "messages": [{"role": "user", "content": "Hi"}],
            "stream": true
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let payloads = sse_payloads(&resp.text().await.unwrap());
    assert_single_trailing_done(&payloads);
    let chunks = sse_chunks(&payloads);
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1]["choices"][0]["finish_reason"], "error");
}

#[tokio::test]
async fn test_models_listing() {
    let h = Harness::start().await;

    let resp = h
        .client
        .get(format!("{}/v1/models", h.proxy))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["gemini-2.0-flash", "text-embedding-004"]);
}

#[tokio::test]
async fn test_embeddings() {
    let h = Harness::start().await;

    let resp = h
        .post(
            "/v1/embeddings",
            json!({"model": "text-embedding-ada-002", "input": ["a", "b"]}),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["model"], "text-embedding-004");
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    assert_eq!(body["data"][1]["index"], 1);
    assert_eq!(body["data"][1]["embedding"], json!([1.0, 0.5]));

    let call = h.last_call();
    assert_eq!(call.call, "text-embedding-004:batchEmbedContents");
    assert_eq!(call.body["requests"][0]["model"], "models/text-embedding-004");

    let resp = h
        .post("/v1/embeddings", json!({"model": 42, "input": "a"}))
        .await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_health() {
    let h = Harness::start().await;
    let body: Value = h
        .client
        .get(format!("{}/health", h.proxy))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
}
