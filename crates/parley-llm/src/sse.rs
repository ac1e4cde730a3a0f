//! Server-sent event framing and Chat Completions chunk decoding.

use serde::Deserialize;
use tracing::warn;

use parley_core::{ProviderChunk, UsageUpdate};

use crate::pricing::Pricing;

/// Payload of one `data:` field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseData {
    Json(String),
    /// The `[DONE]` end-of-stream marker.
    Done,
}

/// Extract `data:` payloads from a block of SSE text, in order.
///
/// Comments, `event:`/`id:`/`retry:` fields and empty data are skipped.
pub fn parse_sse_lines(raw: &str) -> Vec<SseData> {
    raw.lines().filter_map(extract_sse_data).collect()
}

fn extract_sse_data(line: &str) -> Option<SseData> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }
    let data = trimmed
        .strip_prefix("data: ")
        .or_else(|| trimmed.strip_prefix("data:"))?
        .trim();
    match data {
        "" => None,
        "[DONE]" => Some(SseData::Done),
        json => Some(SseData::Json(json.to_string())),
    }
}

#[derive(Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    usage: Option<ChunkUsage>,
    error: Option<ApiErrorBody>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Default, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    message: Option<String>,
}

/// Decode one Chat Completions stream chunk into provider chunks.
///
/// A chunk may carry a content delta, a usage object (the last chunk when
/// `include_usage` is requested), both, or an inline error. Malformed JSON
/// is logged and skipped.
pub fn parse_chat_chunk(data: &str, pricing: &Pricing) -> Vec<ProviderChunk> {
    let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!(error = %e, data_preview = %preview(data), "failed to parse chat completion chunk");
            return Vec::new();
        }
    };

    if let Some(err) = chunk.error {
        return vec![ProviderChunk::Error(
            err.message
                .unwrap_or_else(|| "upstream reported an error".to_string()),
        )];
    }

    let mut out = Vec::new();
    if let Some(text) = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|text| !text.is_empty())
    {
        out.push(ProviderChunk::Text(text));
    }
    if let Some(usage) = chunk.usage {
        out.push(ProviderChunk::Usage(UsageUpdate {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
            estimated_cost_usd: pricing.estimate(usage.prompt_tokens, usage.completion_tokens),
        }));
    }
    out
}

fn preview(data: &str) -> &str {
    match data.char_indices().nth(100) {
        Some((idx, _)) => &data[..idx],
        None => data,
    }
}
