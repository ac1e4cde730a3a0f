use serde::{Deserialize, Serialize};

use crate::ids::ModelId;
use crate::metrics::ModelMetrics;
use crate::session::RunStatus;

/// Live updates for one session, as delivered to stream subscribers.
/// Each event is self-contained so clients can rebuild state without
/// querying the session snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "session.status")]
    SessionStatus { status: RunStatus },

    #[serde(rename = "session.error")]
    SessionError { error: String },

    #[serde(rename = "session.completed")]
    SessionCompleted,

    #[serde(rename = "model.status", rename_all = "camelCase")]
    ModelStatus { model_id: ModelId, status: RunStatus },

    #[serde(rename = "model.chunk", rename_all = "camelCase")]
    ModelChunk { model_id: ModelId, content: String },

    #[serde(rename = "model.error", rename_all = "camelCase")]
    ModelError { model_id: ModelId, error: String },

    #[serde(rename = "model.metrics", rename_all = "camelCase")]
    ModelMetrics { model_id: ModelId, metrics: ModelMetrics },
}

impl StreamEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SessionStatus { .. } => "session.status",
            Self::SessionError { .. } => "session.error",
            Self::SessionCompleted => "session.completed",
            Self::ModelStatus { .. } => "model.status",
            Self::ModelChunk { .. } => "model.chunk",
            Self::ModelError { .. } => "model.error",
            Self::ModelMetrics { .. } => "model.metrics",
        }
    }

    /// The model this event concerns, if it is model-scoped.
    pub fn model_id(&self) -> Option<&ModelId> {
        match self {
            Self::ModelStatus { model_id, .. }
            | Self::ModelChunk { model_id, .. }
            | Self::ModelError { model_id, .. }
            | Self::ModelMetrics { model_id, .. } => Some(model_id),
            Self::SessionStatus { .. } | Self::SessionError { .. } | Self::SessionCompleted => None,
        }
    }

    /// Session-level outcome events; nothing is published after one.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::SessionCompleted | Self::SessionError { .. })
    }
}
