use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ModelId, SessionId};
use crate::metrics::ModelMetrics;

/// Lifecycle shared by sessions and per-model runs:
/// `pending → running → {completed | error}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Whether moving from `self` to `next` respects the forward-only
    /// lifecycle. `pending → error` covers runs that fail before starting.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Error)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Error)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

/// Output and metrics collected for one model within a session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelState {
    pub model_id: ModelId,
    pub status: RunStatus,
    pub chunks: Vec<String>,
    pub metrics: ModelMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ModelState {
    pub fn new(model_id: ModelId) -> Self {
        Self {
            model_id,
            status: RunStatus::Pending,
            chunks: Vec::new(),
            metrics: ModelMetrics::default(),
            error_message: None,
        }
    }

    /// Full output so far: fragments concatenated in arrival order.
    pub fn output(&self) -> String {
        self.chunks.concat()
    }
}

/// One prompt fanned out to a fixed set of models.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub prompt: String,
    pub model_ids: Vec<ModelId>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub responses: BTreeMap<ModelId, ModelState>,
}

impl Session {
    /// Build a pending session. Repeated model ids collapse to their first
    /// occurrence so `model_ids` and the `responses` key set always agree.
    pub fn new(prompt: impl Into<String>, model_ids: impl IntoIterator<Item = ModelId>) -> Self {
        let mut ordered = Vec::new();
        let mut responses = BTreeMap::new();
        for model_id in model_ids {
            if responses.contains_key(&model_id) {
                continue;
            }
            responses.insert(model_id.clone(), ModelState::new(model_id.clone()));
            ordered.push(model_id);
        }

        let now = Utc::now();
        Self {
            id: SessionId::new(),
            prompt: prompt.into(),
            model_ids: ordered,
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
            error_message: None,
            responses,
        }
    }

    pub fn model(&self, model_id: &ModelId) -> Option<&ModelState> {
        self.responses.get(model_id)
    }

    pub fn model_mut(&mut self, model_id: &ModelId) -> Option<&mut ModelState> {
        self.responses.get_mut(model_id)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(raw: &[&str]) -> Vec<ModelId> {
        raw.iter().map(|s| ModelId::from(*s)).collect()
    }

    #[test]
    fn new_session_is_pending_with_one_state_per_model() {
        let session = Session::new("2+2?", ids(&["m1", "m2"]));
        assert_eq!(session.status, RunStatus::Pending);
        assert_eq!(session.responses.len(), 2);
        for state in session.responses.values() {
            assert_eq!(state.status, RunStatus::Pending);
            assert!(state.chunks.is_empty());
            assert_eq!(state.metrics, ModelMetrics::default());
        }
    }

    #[test]
    fn duplicate_model_ids_collapse() {
        let session = Session::new("hi", ids(&["b", "a", "b"]));
        assert_eq!(session.model_ids, ids(&["b", "a"]));
        let keys: Vec<_> = session.responses.keys().cloned().collect();
        assert_eq!(keys, ids(&["a", "b"]));
    }

    #[test]
    fn transitions_are_forward_only() {
        use RunStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Error));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Error));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Completed.can_transition_to(Error));
        assert!(!Error.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn status_string_roundtrip() {
        for status in [RunStatus::Pending, RunStatus::Running, RunStatus::Completed, RunStatus::Error] {
            let parsed: RunStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("done".parse::<RunStatus>().is_err());
    }

    #[test]
    fn output_concatenates_chunks() {
        let mut state = ModelState::new(ModelId::from("m"));
        state.chunks.push("Hel".into());
        state.chunks.push("lo".into());
        assert_eq!(state.output(), "Hello");
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let session = Session::new("p", ids(&["m1"]));
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["modelIds"][0], "m1");
        assert_eq!(json["responses"]["m1"]["modelId"], "m1");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("errorMessage").is_none());
    }
}
