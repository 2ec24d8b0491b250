//! Embeddings reshaping between OpenAI `/embeddings` and Gemini `batchEmbedContents`.

use super::gemini_types::{BatchEmbedRequest, BatchEmbedResponse, Content, EmbedContentRequest, Part};
use super::openai_types::{EmbeddingData, EmbeddingInput, EmbeddingsRequest, EmbeddingsResponse};

/// Build the batch request. `model_path` is the vendor path (`models/<id>`).
pub fn embeddings_to_gemini(req: &EmbeddingsRequest, model_path: &str) -> BatchEmbedRequest {
    let inputs: Vec<&str> = match &req.input {
        EmbeddingInput::One(text) => vec![text.as_str()],
        EmbeddingInput::Many(texts) => texts.iter().map(String::as_str).collect(),
    };

    BatchEmbedRequest {
        requests: inputs
            .into_iter()
            .map(|text| EmbedContentRequest {
                model: model_path.to_string(),
                content: Content {
                    role: None,
                    parts: vec![Part::text(text)],
                },
                output_dimensionality: req.dimensions,
            })
            .collect(),
    }
}

pub fn gemini_to_embeddings(resp: BatchEmbedResponse, model: &str) -> EmbeddingsResponse {
    EmbeddingsResponse {
        object: "list".to_string(),
        data: resp
            .embeddings
            .unwrap_or_default()
            .into_iter()
            .enumerate()
            .map(|(index, e)| EmbeddingData {
                object: "embedding".to_string(),
                index,
                embedding: e.values,
            })
            .collect(),
        model: model.to_string(),
    }
}
