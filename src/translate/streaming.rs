//! State machine for translating Gemini stream frames into OpenAI chunk frames.
//!
//! Each candidate index moves through: unseen -> open (header chunk with the
//! assistant role sent) -> streaming (content deltas) -> closed (terminal chunk
//! with `finish_reason`). The vendor does not reliably mark a candidate as
//! finished mid-stream, so every index is closed in [`StreamTranslator::finish`]
//! from the last frame seen for it, followed by the `[DONE]` sentinel.

use std::collections::BTreeMap;

use super::gemini_types::{Candidate, GenerateContentResponse, UsageMetadata};
use super::openai_types::{ChatCompletionChunk, ChunkChoice, ChunkDelta};
use super::response::{candidate_text, map_finish_reason, map_usage, unix_now, ERROR_FINISH_REASON};

const DONE_SENTINEL: &str = "data: [DONE]\n\n";

/// One outgoing SSE frame.
#[derive(Debug, Clone)]
pub enum StreamFrame {
    Chunk(ChatCompletionChunk),
    Done,
}

impl StreamFrame {
    /// Wire form: `data: <json>` followed by a blank line.
    pub fn to_sse(&self) -> serde_json::Result<String> {
        match self {
            StreamFrame::Chunk(chunk) => Ok(format!("data: {}\n\n", serde_json::to_string(chunk)?)),
            StreamFrame::Done => Ok(DONE_SENTINEL.to_string()),
        }
    }

    pub fn chunk(&self) -> Option<&ChatCompletionChunk> {
        match self {
            StreamFrame::Chunk(chunk) => Some(chunk),
            StreamFrame::Done => None,
        }
    }
}

/// Per-request streaming state.
///
/// Usage:
///   let mut translator = StreamTranslator::new(id, "gemini-2.0-flash").with_usage(true);
///   for payload in frames {
///       let out = translator.process_frame(&payload, |err| warn!("bad frame: {err}"));
///       // write each frame's `to_sse()`
///   }
///   let out = translator.finish(); // terminal chunks, then `[DONE]`
#[derive(Debug)]
pub struct StreamTranslator {
    id: String,
    model: String,
    include_usage: bool,
    flush_finish_reason: String,
    /// Most recent candidate seen for each index.
    last_seen: BTreeMap<u32, Candidate>,
    usage: Option<UsageMetadata>,
    content_emitted: bool,
    finished: bool,
}

impl StreamTranslator {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            include_usage: false,
            flush_finish_reason: "stop".to_string(),
            last_seen: BTreeMap::new(),
            usage: None,
            content_emitted: false,
            finished: false,
        }
    }

    /// Attach usage totals to the final terminal chunk.
    #[must_use]
    pub fn with_usage(mut self, include_usage: bool) -> Self {
        self.include_usage = include_usage;
        self
    }

    /// Finish reason for a candidate whose last frame carried none.
    #[must_use]
    pub fn with_flush_finish_reason(mut self, reason: impl Into<String>) -> Self {
        self.flush_finish_reason = reason.into();
        self
    }

    /// True once any candidate has produced non-empty content.
    pub fn content_emitted(&self) -> bool {
        self.content_emitted
    }

    /// Parse and process one reassembled payload. An unparseable payload is
    /// reported to `on_malformed` and then handled by
    /// [`process_malformed`](Self::process_malformed).
    pub fn process_frame(
        &mut self,
        payload: &str,
        on_malformed: impl FnOnce(&serde_json::Error),
    ) -> Vec<StreamFrame> {
        match serde_json::from_str::<GenerateContentResponse>(payload) {
            Ok(frame) => self.process_response(&frame),
            Err(e) => {
                on_malformed(&e);
                self.process_malformed()
            }
        }
    }

    /// Process one decoded vendor frame.
    pub fn process_response(&mut self, frame: &GenerateContentResponse) -> Vec<StreamFrame> {
        if self.finished {
            return Vec::new();
        }

        if let Some(ref usage) = frame.usage_metadata {
            self.usage = Some(usage.clone());
        }

        let candidates = frame.candidates.as_deref().unwrap_or_default();
        if candidates.is_empty() {
            if frame.usage_metadata.is_some() {
                return Vec::new();
            }
            return self.process_malformed();
        }

        let mut out = Vec::new();
        for candidate in candidates {
            self.observe(candidate.clone(), &mut out);
        }
        out
    }

    /// A frame that could not be used. Before any content has streamed, an
    /// empty error candidate is recorded so the client still gets a complete
    /// stream; afterwards the frame is dropped to keep the open message intact.
    pub fn process_malformed(&mut self) -> Vec<StreamFrame> {
        if self.finished || self.content_emitted {
            return Vec::new();
        }

        let mut out = Vec::new();
        self.observe(error_candidate(), &mut out);
        out
    }

    /// End of input: one terminal chunk per seen index, then `[DONE]`.
    pub fn finish(&mut self) -> Vec<StreamFrame> {
        if self.finished {
            return Vec::new();
        }

        let mut out = Vec::new();
        if self.last_seen.is_empty() {
            self.observe(error_candidate(), &mut out);
        }
        self.finished = true;

        let last_index = self.last_seen.keys().next_back().copied();
        for (&index, candidate) in &self.last_seen {
            let finish_reason = candidate
                .finish_reason
                .as_deref()
                .map_or_else(|| self.flush_finish_reason.clone(), map_finish_reason);

            let mut chunk = self.make_chunk(index, ChunkDelta::default(), Some(finish_reason));
            if self.include_usage && Some(index) == last_index {
                chunk.usage = self.usage.as_ref().map(map_usage);
            }
            out.push(StreamFrame::Chunk(chunk));
        }

        out.push(StreamFrame::Done);
        out
    }

    fn observe(&mut self, candidate: Candidate, out: &mut Vec<StreamFrame>) {
        let index = candidate.index();

        if !self.last_seen.contains_key(&index) {
            let header = ChunkDelta {
                role: Some("assistant".to_string()),
                content: Some(String::new()),
            };
            out.push(StreamFrame::Chunk(self.make_chunk(index, header, None)));
        }

        let text = candidate_text(&candidate);
        self.last_seen.insert(index, candidate);

        if let Some(text) = text.filter(|t| !t.is_empty()) {
            let delta = ChunkDelta {
                role: None,
                content: Some(text),
            };
            out.push(StreamFrame::Chunk(self.make_chunk(index, delta, None)));
            self.content_emitted = true;
        }
    }

    fn make_chunk(
        &self,
        index: u32,
        delta: ChunkDelta,
        finish_reason: Option<String>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: unix_now(),
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }
}

fn error_candidate() -> Candidate {
    Candidate {
        index: Some(0),
        content: None,
        finish_reason: Some(ERROR_FINISH_REASON.to_string()),
    }
}
