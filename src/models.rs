//! Model naming: resolving client-supplied model ids to vendor model ids,
//! and reshaping the vendor model listing into an OpenAI `/models` response.

use crate::config::ModelsConfig;
use crate::translate::gemini_types::ModelsResponse;
use crate::translate::openai_types::{ModelCard, ModelList};

const MODELS_PREFIX: &str = "models/";

/// Resolve the model for a chat request. First match wins:
/// an explicit `models/<id>` prefix is stripped; a name in one of the known
/// families is used as-is; anything else, including a missing or non-string
/// value, becomes the configured default.
#[must_use]
pub fn resolve_chat_model(requested: Option<&serde_json::Value>, models: &ModelsConfig) -> String {
    let Some(name) = requested.and_then(serde_json::Value::as_str) else {
        return models.default.clone();
    };

    if let Some(stripped) = name.strip_prefix(MODELS_PREFIX) {
        if !stripped.is_empty() {
            return stripped.to_string();
        }
    }

    if models.families.iter().any(|family| name.starts_with(family.as_str())) {
        return name.to_string();
    }

    models.default.clone()
}

/// Resolve the model path for an embeddings request, returning
/// `(vendor path "models/<id>", name echoed back to the client)`.
#[must_use]
pub fn resolve_embeddings_model(requested: &str, models: &ModelsConfig) -> (String, String) {
    if requested.starts_with(MODELS_PREFIX) {
        return (requested.to_string(), requested.to_string());
    }

    let name = if requested.starts_with("gemini-") {
        requested.to_string()
    } else {
        models.default_embeddings.clone()
    };

    (format!("{MODELS_PREFIX}{name}"), name)
}

/// Reshape the vendor listing into OpenAI's `{"object":"list","data":[...]}`.
#[must_use]
pub fn to_model_list(resp: ModelsResponse) -> ModelList {
    let data = resp
        .models
        .unwrap_or_default()
        .into_iter()
        .map(|m| ModelCard {
            id: m
                .name
                .strip_prefix(MODELS_PREFIX)
                .unwrap_or(&m.name)
                .to_string(),
            object: "model".to_string(),
            created: 0,
            owned_by: String::new(),
        })
        .collect();

    ModelList {
        object: "list".to_string(),
        data,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_models_prefix_is_stripped() {
        let cfg = ModelsConfig::default();
        let model = json!("models/gemini-1.5-pro");
        assert_eq!(resolve_chat_model(Some(&model), &cfg), "gemini-1.5-pro");

        let tuned = json!("models/my-tuned-model");
        assert_eq!(resolve_chat_model(Some(&tuned), &cfg), "my-tuned-model");
    }

    #[test]
    fn test_known_families_pass_through() {
        let cfg = ModelsConfig::default();
        for name in ["gemini-2.0-flash", "gemma-3-27b-it", "learnlm-2.0-flash-experimental"] {
            assert_eq!(resolve_chat_model(Some(&json!(name)), &cfg), name);
        }
    }

    #[test]
    fn test_unknown_or_missing_falls_back_to_default() {
        let cfg = ModelsConfig::default();
        assert_eq!(resolve_chat_model(Some(&json!("gpt-4o")), &cfg), cfg.default);
        assert_eq!(resolve_chat_model(Some(&json!(42)), &cfg), cfg.default);
        assert_eq!(resolve_chat_model(Some(&json!("models/")), &cfg), cfg.default);
        assert_eq!(resolve_chat_model(None, &cfg), cfg.default);
    }

    #[test]
    fn test_embeddings_model_resolution() {
        let cfg = ModelsConfig::default();
        assert_eq!(
            resolve_embeddings_model("models/text-embedding-004", &cfg),
            (
                "models/text-embedding-004".to_string(),
                "models/text-embedding-004".to_string()
            )
        );
        assert_eq!(
            resolve_embeddings_model("gemini-embedding-001", &cfg).0,
            "models/gemini-embedding-001"
        );
        assert_eq!(
            resolve_embeddings_model("text-embedding-3-small", &cfg).1,
            "text-embedding-004"
        );
        assert_eq!(
            resolve_embeddings_model("ada-002", &cfg),
            (
                "models/text-embedding-004".to_string(),
                "text-embedding-004".to_string()
            )
        );
    }

    #[test]
    fn test_model_list_reshape() {
        let resp: ModelsResponse = serde_json::from_value(json!({
            "models": [{"name": "models/gemini-2.0-flash", "displayName": "Flash"}, {"name": "tunedModels/x"}]
        }))
        .unwrap();
        let list = to_model_list(resp);
        assert_eq!(list.object, "list");
        assert_eq!(list.data[0].id, "gemini-2.0-flash");
        assert_eq!(list.data[1].id, "tunedModels/x");
        assert_eq!(list.data[0].object, "model");
    }
}
