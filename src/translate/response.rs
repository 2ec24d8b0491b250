use super::gemini_types::{Candidate, GenerateContentResponse, UsageMetadata, VendorErrorResponse};
use super::openai_types::{ChatCompletionResponse, ChatErrorResponse, ChatUsage, Choice, ChoiceMessage};

/// Joins the text parts of one candidate.
pub const PART_SEPARATOR: &str = "\n\n|>";

/// Finish reason reported when the vendor gives us nothing usable.
pub const ERROR_FINISH_REASON: &str = "error";

/// `chatcmpl-` followed by 32 random alphanumeric characters.
pub fn generate_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

/// Current time as whole seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Map a vendor finish reason to the OpenAI vocabulary. Unknown values pass through.
pub fn map_finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop".to_string(),
        "MAX_TOKENS" => "length".to_string(),
        "SAFETY" | "RECITATION" => "content_filter".to_string(),
        other => other.to_string(),
    }
}

pub fn map_usage(usage: &UsageMetadata) -> ChatUsage {
    let prompt_tokens = usage.prompt_token_count.unwrap_or(0);
    let completion_tokens = usage.candidates_token_count.unwrap_or(0);
    ChatUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens: usage
            .total_token_count
            .unwrap_or_else(|| prompt_tokens.saturating_add(completion_tokens)),
    }
}

/// Concatenated text of a candidate, or `None` if it has no `content.parts` array.
pub fn candidate_text(candidate: &Candidate) -> Option<String> {
    candidate.texts().map(|texts| texts.join(PART_SEPARATOR))
}

/// Translate a vendor response into an OpenAI `chat.completion`.
/// Never fails: missing pieces become an empty assistant message with
/// `finish_reason: "error"` and zeroed usage.
pub fn gemini_to_openai(
    resp: &GenerateContentResponse,
    id: &str,
    requested_model: &str,
) -> ChatCompletionResponse {
    let candidates = resp.candidates.as_deref().unwrap_or_default();

    let choices = if candidates.is_empty() {
        let blocked = resp
            .prompt_feedback
            .as_ref()
            .and_then(|f| f.block_reason.as_ref())
            .is_some();
        let finish_reason = if blocked { "content_filter" } else { ERROR_FINISH_REASON };
        vec![placeholder_choice(0, finish_reason.to_string())]
    } else {
        candidates.iter().map(candidate_to_choice).collect()
    };

    ChatCompletionResponse {
        id: id.to_string(),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: resp
            .model_version
            .clone()
            .unwrap_or_else(|| requested_model.to_string()),
        choices,
        usage: resp.usage_metadata.as_ref().map(map_usage).unwrap_or_default(),
    }
}

fn candidate_to_choice(candidate: &Candidate) -> Choice {
    let finish_reason = candidate
        .finish_reason
        .as_deref()
        .map_or_else(|| ERROR_FINISH_REASON.to_string(), map_finish_reason);

    match candidate_text(candidate) {
        Some(content) => Choice {
            index: candidate.index(),
            message: ChoiceMessage {
                role: "assistant".to_string(),
                content,
            },
            logprobs: None,
            finish_reason,
        },
        // Only a filtered candidate legitimately arrives without parts.
        None if finish_reason == "content_filter" => {
            placeholder_choice(candidate.index(), finish_reason)
        }
        None => placeholder_choice(candidate.index(), ERROR_FINISH_REASON.to_string()),
    }
}

fn placeholder_choice(index: u32, finish_reason: String) -> Choice {
    Choice {
        index,
        message: ChoiceMessage {
            role: "assistant".to_string(),
            content: String::new(),
        },
        logprobs: None,
        finish_reason,
    }
}

/// Reshape a vendor error body into the OpenAI error shape.
pub fn vendor_error_to_openai(err: &VendorErrorResponse) -> ChatErrorResponse {
    let error_type = match err.error.status.as_deref() {
        Some("INVALID_ARGUMENT" | "FAILED_PRECONDITION" | "NOT_FOUND") => "invalid_request_error",
        Some("PERMISSION_DENIED" | "UNAUTHENTICATED") => "authentication_error",
        Some("RESOURCE_EXHAUSTED") => "rate_limit_error",
        _ => "api_error",
    };

    ChatErrorResponse::new(error_type, &err.error.message, err.error.code.clone())
}
