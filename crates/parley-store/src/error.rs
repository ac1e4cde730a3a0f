use parley_core::{ModelId, RunStatus, SessionId};

/// Why a store mutation was not applied. These never reach callers of
/// [`crate::SessionStore`]; they are logged and the mutation is skipped.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("model {model_id} not found in session {session_id}")]
    ModelNotFound {
        session_id: SessionId,
        model_id: ModelId,
    },

    #[error("model {model_id} in session {session_id} already settled as {status}")]
    ModelSettled {
        session_id: SessionId,
        model_id: ModelId,
        status: RunStatus,
    },

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },
}
