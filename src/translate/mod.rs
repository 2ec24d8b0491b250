//! API translation between `OpenAI` and Gemini formats.
//!
//! The core of the proxy: converts requests, responses, and streaming frames
//! between the two API formats. Everything here is free of network I/O except
//! fetching remote images referenced by a request.

pub mod embeddings;
pub mod gemini_types;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod sse;
pub mod streaming;
