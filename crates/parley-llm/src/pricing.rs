use serde::{Deserialize, Serialize};

/// Per-1K-token rates in USD.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub prompt_per_1k: Option<f64>,
    pub completion_per_1k: Option<f64>,
}

impl Pricing {
    pub fn new(prompt_per_1k: Option<f64>, completion_per_1k: Option<f64>) -> Self {
        Self {
            prompt_per_1k,
            completion_per_1k,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.prompt_per_1k.is_some() || self.completion_per_1k.is_some()
    }

    /// Estimated cost rounded to 6 decimals, or `None` when no rate is set.
    /// A missing token count or rate contributes nothing.
    pub fn estimate(&self, prompt_tokens: Option<u32>, completion_tokens: Option<u32>) -> Option<f64> {
        if !self.is_configured() {
            return None;
        }
        let part = |tokens: Option<u32>, rate: Option<f64>| match (tokens, rate) {
            (Some(t), Some(r)) => f64::from(t) / 1000.0 * r,
            _ => 0.0,
        };
        let total = part(prompt_tokens, self.prompt_per_1k)
            + part(completion_tokens, self.completion_per_1k);
        total
            .is_finite()
            .then(|| (total * 1_000_000.0).round() / 1_000_000.0)
    }
}
