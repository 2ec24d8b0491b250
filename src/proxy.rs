use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{RequestLogger, SharedLogger};
use crate::models::{resolve_chat_model, resolve_embeddings_model, to_model_list};
use crate::translate::embeddings::{embeddings_to_gemini, gemini_to_embeddings};
use crate::translate::gemini_types::{
    BatchEmbedResponse, GenerateContentResponse, ModelsResponse, VendorErrorResponse,
};
use crate::translate::openai_types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatErrorResponse, EmbeddingsRequest,
    EmbeddingsResponse, ModelList,
};
use crate::translate::request::chat_to_gemini;
use crate::translate::response::{
    gemini_to_openai, generate_completion_id, vendor_error_to_openai, ERROR_FINISH_REASON,
};
use crate::translate::sse::FrameReassembler;
use crate::translate::streaming::{StreamFrame, StreamTranslator};

use bytes::Bytes;
use futures::stream::Stream;
use futures::StreamExt;
use std::pin::Pin;

/// Outcome of a proxied call that reached the upstream.
pub enum ProxyResult<T> {
    Success(T),
    /// The upstream answered with an error status; reshaped body plus that status.
    Error(ChatErrorResponse, u16),
}

/// OpenAI SSE bytes, ready to be written to the client as they are produced.
pub type SseStream = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send>>;

/// Forward a non-streaming chat request.
pub async fn proxy_non_streaming(
    req: &ChatCompletionRequest,
    api_key: Option<&str>,
    config: &ProxyConfig,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<ProxyResult<ChatCompletionResponse>> {
    let id = generate_completion_id();
    let log = logger.for_request(&id);
    let model = resolve_chat_model(req.model.as_ref(), &config.models);
    let body = chat_to_gemini(req, client).await?;
    let url = format!("{}/models/{}:generateContent", config.api_root(), model);

    log.info("proxy", format!("POST {url} model={model}"));

    let response = vendor_request(client.post(&url), config, api_key)
        .json(&body)
        .send()
        .await
        .map_err(|e| ProxyError::upstream(format!("Request failed: {e}")))?;

    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| ProxyError::upstream(format!("Failed to read response body: {e}")))?;

    if status >= 400 {
        log.warn("proxy", format!("Upstream error status={status}: {}", truncate(&text, 300)));
        return Ok(ProxyResult::Error(reshape_error(status, &text), status));
    }

    let parsed: GenerateContentResponse = serde_json::from_str(&text).unwrap_or_else(|e| {
        log.anomaly("proxy", format!("Unparseable upstream response: {e}"), &text);
        GenerateContentResponse::default()
    });

    let resp = gemini_to_openai(&parsed, &id, &model);

    if resp
        .choices
        .iter()
        .any(|c| c.finish_reason == ERROR_FINISH_REASON)
    {
        log.anomaly("proxy", "Upstream response lacked usable candidates", &text);
    }

    log.info(
        "proxy",
        format!(
            "Completed: choices={} prompt={} completion={} tokens",
            resp.choices.len(),
            resp.usage.prompt_tokens,
            resp.usage.completion_tokens
        ),
    );

    Ok(ProxyResult::Success(resp))
}

/// Forward a streaming chat request, returning a stream of OpenAI SSE frames.
///
/// Client errors in the request are returned as `Err` before anything is sent.
/// Once the request is valid, transport failures still produce a complete,
/// `[DONE]`-terminated stream.
pub async fn proxy_streaming(
    req: &ChatCompletionRequest,
    api_key: Option<&str>,
    config: &ProxyConfig,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<ProxyResult<SseStream>> {
    let id = generate_completion_id();
    let log = logger.for_request(&id);
    let model = resolve_chat_model(req.model.as_ref(), &config.models);

    let translator = StreamTranslator::new(&id, &model)
        .with_usage(req.include_usage())
        .with_flush_finish_reason(&config.stream.flush_finish_reason);

    let body = match chat_to_gemini(req, client).await {
        Ok(body) => body,
        Err(e) if e.is_client_error() => return Err(e),
        Err(e) => {
            log.error("proxy", format!("Request preparation failed: {e}"));
            return Ok(ProxyResult::Success(Box::pin(error_stream(translator, log))));
        }
    };

    let url = format!(
        "{}/models/{}:streamGenerateContent?alt=sse",
        config.api_root(),
        model
    );

    log.info("proxy", format!("POST {url} model={model} (streaming)"));

    let response = match vendor_request(client.post(&url), config, api_key)
        .json(&body)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            log.error("proxy", format!("Streaming request failed: {e}"));
            return Ok(ProxyResult::Success(Box::pin(error_stream(translator, log))));
        }
    };

    let status = response.status().as_u16();
    if status >= 400 {
        let text = response.text().await.unwrap_or_default();
        log.warn("proxy", format!("Streaming error status={status}: {}", truncate(&text, 300)));
        return Ok(ProxyResult::Error(reshape_error(status, &text), status));
    }

    let stream = sse_translate_stream(response.bytes_stream(), translator, log);
    Ok(ProxyResult::Success(Box::pin(stream)))
}

/// Reassemble the vendor SSE byte stream and translate it frame by frame.
/// Frames are produced only as the consumer polls, and dropping the stream
/// drops the upstream connection with it.
fn sse_translate_stream(
    byte_stream: impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
    mut translator: StreamTranslator,
    log: RequestLogger,
) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send + 'static {
    async_stream::stream! {
        let mut reassembler = FrameReassembler::new();
        let mut frames_in = 0usize;

        tokio::pin!(byte_stream);

        while let Some(chunk_result) = byte_stream.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    log.error("stream", format!("Byte stream error: {e}"));
                    for frame in translator.process_malformed() {
                        if let Some(bytes) = encode(&frame, &log) {
                            yield Ok(bytes);
                        }
                    }
                    break;
                }
            };

            for payload in reassembler.feed(&chunk) {
                frames_in += 1;
                for frame in translate_payload(&mut translator, &payload, &log) {
                    if let Some(bytes) = encode(&frame, &log) {
                        yield Ok(bytes);
                    }
                }
            }
        }

        if let Some(rest) = reassembler.finish() {
            log.anomaly("stream", "Unterminated data at end of stream", &rest);
            for frame in translate_payload(&mut translator, &rest, &log) {
                if let Some(bytes) = encode(&frame, &log) {
                    yield Ok(bytes);
                }
            }
        }

        for frame in translator.finish() {
            if let Some(bytes) = encode(&frame, &log) {
                yield Ok(bytes);
            }
        }

        log.info("stream", format!("Stream completed frames={frames_in}"));
    }
}

/// A stream that reports a single error candidate and terminates cleanly.
fn error_stream(
    mut translator: StreamTranslator,
    log: RequestLogger,
) -> impl Stream<Item = std::result::Result<Bytes, std::io::Error>> + Send + 'static {
    let frames: Vec<_> = translator
        .process_malformed()
        .into_iter()
        .chain(translator.finish())
        .filter_map(|frame| encode(&frame, &log))
        .map(Ok)
        .collect();
    futures::stream::iter(frames)
}

fn translate_payload(
    translator: &mut StreamTranslator,
    payload: &str,
    log: &RequestLogger,
) -> Vec<StreamFrame> {
    let content_emitted = translator.content_emitted();
    translator.process_frame(payload, |e| {
        if content_emitted {
            log.anomaly("stream", format!("Dropping malformed frame: {e}"), payload);
        } else {
            log.anomaly("stream", format!("Malformed frame before content: {e}"), payload);
        }
    })
}

fn encode(frame: &StreamFrame, log: &RequestLogger) -> Option<Bytes> {
    match frame.to_sse() {
        Ok(s) => Some(Bytes::from(s)),
        Err(e) => {
            log.error("stream", format!("Failed to serialize chunk: {e}"));
            None
        }
    }
}

/// List models, reshaped into the OpenAI `/models` format.
pub async fn proxy_models(
    api_key: Option<&str>,
    config: &ProxyConfig,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<ProxyResult<ModelList>> {
    let url = format!("{}/models", config.api_root());
    logger.info("proxy", format!("GET {url}"));

    let response = vendor_request(client.get(&url), config, api_key)
        .send()
        .await
        .map_err(|e| ProxyError::upstream(format!("Failed to fetch models: {e}")))?;

    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| ProxyError::upstream(format!("Failed to read models response: {e}")))?;

    if status >= 400 {
        logger.warn("proxy", format!("Models error status={status}"));
        return Ok(ProxyResult::Error(reshape_error(status, &text), status));
    }

    let parsed: ModelsResponse = serde_json::from_str(&text).map_err(|e| {
        ProxyError::translation(format!(
            "Failed to parse models response: {e}. Body: {}",
            truncate(&text, 300)
        ))
    })?;

    Ok(ProxyResult::Success(to_model_list(parsed)))
}

/// Forward an embeddings request through `batchEmbedContents`.
pub async fn proxy_embeddings(
    req: &EmbeddingsRequest,
    api_key: Option<&str>,
    config: &ProxyConfig,
    client: &reqwest::Client,
    logger: &SharedLogger,
) -> Result<ProxyResult<EmbeddingsResponse>> {
    let requested = req
        .model
        .as_ref()
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ProxyError::invalid_request("model is not specified"))?;

    let (model_path, model_name) = resolve_embeddings_model(requested, &config.models);
    let body = embeddings_to_gemini(req, &model_path);
    let url = format!("{}/{}:batchEmbedContents", config.api_root(), model_path);

    logger.info(
        "proxy",
        format!("POST {url} inputs={}", body.requests.len()),
    );

    let response = vendor_request(client.post(&url), config, api_key)
        .json(&body)
        .send()
        .await
        .map_err(|e| ProxyError::upstream(format!("Embeddings request failed: {e}")))?;

    let status = response.status().as_u16();
    let text = response
        .text()
        .await
        .map_err(|e| ProxyError::upstream(format!("Failed to read embeddings response: {e}")))?;

    if status >= 400 {
        logger.warn("proxy", format!("Embeddings error status={status}"));
        return Ok(ProxyResult::Error(reshape_error(status, &text), status));
    }

    let parsed: BatchEmbedResponse = serde_json::from_str(&text).map_err(|e| {
        ProxyError::translation(format!(
            "Failed to parse embeddings response: {e}. Body: {}",
            truncate(&text, 300)
        ))
    })?;

    Ok(ProxyResult::Success(gemini_to_embeddings(parsed, &model_name)))
}

fn vendor_request(
    builder: reqwest::RequestBuilder,
    config: &ProxyConfig,
    api_key: Option<&str>,
) -> reqwest::RequestBuilder {
    let builder = builder
        .header("x-goog-api-client", &config.upstream.client_header)
        .header(reqwest::header::CONTENT_TYPE, "application/json");

    match api_key {
        Some(key) => builder.header("x-goog-api-key", key),
        None => builder,
    }
}

fn reshape_error(status: u16, body: &str) -> ChatErrorResponse {
    match serde_json::from_str::<VendorErrorResponse>(body) {
        Ok(err) => vendor_error_to_openai(&err),
        Err(_) => ChatErrorResponse::api_error(format!(
            "Upstream returned status {status}: {}",
            truncate(body, 500)
        )),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((end, _)) => &s[..end],
        None => s,
    }
}
