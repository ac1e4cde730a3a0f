use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Usage figures reported by a provider. Every field is optional; only the
/// ones present are merged into [`ModelMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost_usd: Option<f64>,
}

impl UsageUpdate {
    /// Total tokens as reported, or derived from the prompt/completion halves
    /// when at least one of them is present.
    pub fn resolved_total(&self) -> Option<u32> {
        self.total_tokens.or_else(|| {
            if self.prompt_tokens.is_none() && self.completion_tokens.is_none() {
                return None;
            }
            Some(
                self.prompt_tokens
                    .unwrap_or(0)
                    .saturating_add(self.completion_tokens.unwrap_or(0)),
            )
        })
    }
}

/// Per-model output metrics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelMetrics {
    pub chunk_count: u64,
    pub total_chars: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl ModelMetrics {
    /// Account for one appended fragment. Characters are Unicode scalar values.
    pub fn record_chunk(&mut self, text: &str) {
        self.chunk_count += 1;
        self.total_chars += text.chars().count() as u64;
    }

    pub fn merge_usage(&mut self, usage: &UsageUpdate) {
        if let Some(prompt) = usage.prompt_tokens {
            self.prompt_tokens = Some(prompt);
        }
        if let Some(completion) = usage.completion_tokens {
            self.completion_tokens = Some(completion);
        }
        if let Some(total) = usage.resolved_total() {
            self.total_tokens = Some(total);
        }
        if let Some(cost) = usage.estimated_cost_usd {
            self.estimated_cost_usd = Some(cost);
        }
    }

    pub fn mark_started(&mut self, at: DateTime<Utc>) {
        self.started_at = Some(at);
    }

    pub fn mark_finished(&mut self, at: DateTime<Utc>) {
        self.completed_at = Some(at);
        self.duration_ms = duration_between(self.started_at, self.completed_at);
    }
}

/// Milliseconds from `start` to `end`, clamped at zero. `None` when either
/// end is missing.
pub fn duration_between(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Option<u64> {
    let (start, end) = (start?, end?);
    let millis = (end - start).num_milliseconds();
    Some(millis.max(0) as u64)
}
