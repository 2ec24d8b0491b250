//! Translate OpenAI Chat Completions requests into Gemini `generateContent` requests.
//!
//! System messages become the `system_instruction`; every other message is
//! folded into `contents` with its role renamed (`assistant` -> `model`,
//! anything else -> `user`). Remote images are fetched and inlined before the
//! request is returned, so this is the only translation step that does I/O.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::gemini_types::{Content, GenerateContentRequest, GenerationConfig, Part, SafetySetting};
use super::openai_types::{ChatCompletionRequest, ChatContent, ChatMessage, ContentPart, ResponseFormat};
use crate::error::{ProxyError, Result};

/// Every category the vendor lets us configure; all of them are set to `BLOCK_NONE`.
pub const SAFETY_CATEGORIES: [&str; 5] = [
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
];

const SAFETY_THRESHOLD: &str = "BLOCK_NONE";

/// Schema keywords the vendor's schema dialect rejects.
const UNSUPPORTED_SCHEMA_KEYS: [&str; 3] = ["additionalProperties", "$schema", "strict"];

pub fn safety_settings() -> Vec<SafetySetting> {
    SAFETY_CATEGORIES
        .iter()
        .map(|category| SafetySetting {
            category: (*category).to_string(),
            threshold: SAFETY_THRESHOLD.to_string(),
        })
        .collect()
}

/// Translate a chat request. `client` is used to fetch remote `image_url` parts.
pub async fn chat_to_gemini(
    req: &ChatCompletionRequest,
    client: &reqwest::Client,
) -> Result<GenerateContentRequest> {
    let mut system_instruction = None;
    let mut contents = Vec::with_capacity(req.messages.len());

    for msg in &req.messages {
        let parts = translate_content(msg, client).await?;
        match msg.role.as_str() {
            "system" => {
                system_instruction = Some(Content { role: None, parts });
            }
            role => contents.push(Content {
                role: Some(gemini_role(role).to_string()),
                parts,
            }),
        }
    }

    if contents.is_empty() {
        if system_instruction.is_none() {
            return Err(ProxyError::invalid_request(
                "messages must contain at least one message",
            ));
        }
        // The vendor rejects a conversation made only of a system instruction.
        contents.push(Content {
            role: Some("user".to_string()),
            parts: vec![Part::text(" ")],
        });
    }

    Ok(GenerateContentRequest {
        system_instruction,
        contents,
        safety_settings: safety_settings(),
        generation_config: generation_config(req)?,
    })
}

fn gemini_role(role: &str) -> &'static str {
    if role == "assistant" {
        "model"
    } else {
        "user"
    }
}

async fn translate_content(msg: &ChatMessage, client: &reqwest::Client) -> Result<Vec<Part>> {
    let items = match &msg.content {
        None => return Ok(vec![Part::text("")]),
        Some(ChatContent::Text(text)) => return Ok(vec![Part::text(text.clone())]),
        Some(ChatContent::Parts(items)) => items,
    };

    let mut parts = Vec::with_capacity(items.len() + 1);
    for item in items {
        let part = match item {
            ContentPart::Text { text } => Part::text(text.clone()),
            ContentPart::ImageUrl { image_url } => image_part(image_url.url(), client).await?,
            ContentPart::InputAudio { input_audio } => {
                Part::inline(format!("audio/{}", input_audio.format), input_audio.data.clone())
            }
            ContentPart::Unsupported => {
                return Err(ProxyError::invalid_request(format!(
                    "Unknown content part type in {} message",
                    msg.role
                )));
            }
        };
        parts.push(part);
    }

    // The vendor rejects turns without any text part.
    if items
        .iter()
        .all(|item| matches!(item, ContentPart::ImageUrl { .. }))
    {
        parts.push(Part::text(""));
    }

    Ok(parts)
}

async fn image_part(url: &str, client: &reqwest::Client) -> Result<Part> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return fetch_image(url, client).await;
    }
    if url.starts_with("data:") {
        return parse_data_uri(url);
    }
    Err(invalid_image(url))
}

async fn fetch_image(url: &str, client: &reqwest::Client) -> Result<Part> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| ProxyError::upstream(format!("Failed to fetch image {url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProxyError::upstream(format!(
            "Failed to fetch image: {status} ({url})"
        )));
    }

    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string();

    let bytes = response
        .bytes()
        .await
        .map_err(|e| ProxyError::upstream(format!("Failed to read image {url}: {e}")))?;

    Ok(Part::inline(mime_type, STANDARD.encode(&bytes)))
}

/// `data:<mime>;base64,<payload>`. The payload is checked and forwarded unchanged.
fn parse_data_uri(url: &str) -> Result<Part> {
    let rest = &url["data:".len()..];
    let (header, data) = rest.split_once(',').ok_or_else(|| invalid_image(url))?;
    let mime_type = header
        .strip_suffix(";base64")
        .filter(|m| !m.is_empty())
        .ok_or_else(|| invalid_image(url))?;

    STANDARD.decode(data).map_err(|_| invalid_image(url))?;

    Ok(Part::inline(mime_type, data))
}

fn invalid_image(url: &str) -> ProxyError {
    let excerpt: String = url.chars().take(64).collect();
    ProxyError::invalid_request(format!("Invalid image data: {excerpt}"))
}

fn generation_config(req: &ChatCompletionRequest) -> Result<GenerationConfig> {
    let mut cfg = GenerationConfig {
        stop_sequences: req.stop.clone().map(|s| s.into_vec()),
        candidate_count: req.n,
        max_output_tokens: req.max_completion_tokens.or(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        frequency_penalty: req.frequency_penalty,
        presence_penalty: req.presence_penalty,
        ..GenerationConfig::default()
    };

    if let Some(ref format) = req.response_format {
        apply_response_format(format, &mut cfg)?;
    }

    Ok(cfg)
}

fn apply_response_format(format: &ResponseFormat, cfg: &mut GenerationConfig) -> Result<()> {
    match format.format_type.as_str() {
        "json_schema" => {
            let schema = format
                .json_schema
                .as_ref()
                .and_then(|s| s.schema.clone())
                .map(sanitize_schema);
            let is_enum = schema
                .as_ref()
                .and_then(serde_json::Value::as_object)
                .is_some_and(|s| s.contains_key("enum"));
            let mime_type = if is_enum { "text/x.enum" } else { "application/json" };
            cfg.response_mime_type = Some(mime_type.to_string());
            cfg.response_schema = schema;
        }
        "json_object" => {
            cfg.response_mime_type = Some("application/json".to_string());
        }
        "text" => {
            cfg.response_mime_type = Some("text/plain".to_string());
        }
        other => {
            return Err(ProxyError::invalid_request(format!(
                "Unsupported response_format.type: {other}"
            )));
        }
    }
    Ok(())
}

fn sanitize_schema(schema: serde_json::Value) -> serde_json::Value {
    match schema {
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .filter(|(key, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&key.as_str()))
                .map(|(key, value)| (key, sanitize_schema(value)))
                .collect(),
        ),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(sanitize_schema).collect())
        }
        other => other,
    }
}
