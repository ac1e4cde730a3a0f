use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

use parley_core::{ModelId, ModelMetrics, ModelState, RunStatus, Session, SessionId, UsageUpdate};

use crate::error::StoreError;

/// Canonical owner of session state.
///
/// Mutations against an unknown session or model are logged and ignored:
/// a model task may still be emitting after its session was dropped.
/// Reads return owned snapshots.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, prompt: String, model_ids: Vec<ModelId>) -> Session;

    async fn get_session(&self, id: &SessionId) -> Option<Session>;

    async fn set_session_status(
        &self,
        id: &SessionId,
        status: RunStatus,
        error_message: Option<String>,
    );

    /// Entering `running` stamps the start time; entering a terminal status
    /// stamps the completion time and derives the duration.
    async fn set_model_status(
        &self,
        id: &SessionId,
        model_id: &ModelId,
        status: RunStatus,
        error_message: Option<String>,
    );

    async fn append_model_chunk(&self, id: &SessionId, model_id: &ModelId, text: &str);

    /// Merge the fields present in `usage`. Returns the resulting metrics.
    async fn update_model_usage(
        &self,
        id: &SessionId,
        model_id: &ModelId,
        usage: &UsageUpdate,
    ) -> Option<ModelMetrics>;

    async fn get_model_metrics(&self, id: &SessionId, model_id: &ModelId) -> Option<ModelMetrics>;

    async fn session_count(&self) -> usize;

    /// Drop a session record. Later mutations for it become no-ops.
    async fn remove_session(&self, id: &SessionId) -> bool;
}

/// In-process store. Each session sits behind its own mutex inside a
/// sharded map, so different sessions never contend.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: DashMap<SessionId, Arc<Mutex<Session>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &SessionId) -> Result<Arc<Mutex<Session>>, StoreError> {
        self.sessions
            .get(id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| StoreError::SessionNotFound(id.clone()))
    }

    fn with_session<R>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut Session) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let entry = self.entry(id)?;
        let mut session = entry.lock();
        let out = f(&mut session)?;
        session.touch();
        Ok(out)
    }

    fn with_model<R>(
        &self,
        id: &SessionId,
        model_id: &ModelId,
        f: impl FnOnce(&mut ModelState) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.with_session(id, |session| {
            let state = session
                .model_mut(model_id)
                .ok_or_else(|| StoreError::ModelNotFound {
                    session_id: id.clone(),
                    model_id: model_id.clone(),
                })?;
            f(state)
        })
    }

    fn read_model<R>(
        &self,
        id: &SessionId,
        model_id: &ModelId,
        f: impl FnOnce(&ModelState) -> R,
    ) -> Result<R, StoreError> {
        let entry = self.entry(id)?;
        let session = entry.lock();
        session
            .model(model_id)
            .map(f)
            .ok_or_else(|| StoreError::ModelNotFound {
                session_id: id.clone(),
                model_id: model_id.clone(),
            })
    }
}

/// Output and usage are frozen once a model has settled.
fn ensure_open(id: &SessionId, state: &ModelState) -> Result<(), StoreError> {
    if state.status.is_terminal() {
        return Err(StoreError::ModelSettled {
            session_id: id.clone(),
            model_id: state.model_id.clone(),
            status: state.status,
        });
    }
    Ok(())
}

fn check_transition(from: RunStatus, to: RunStatus) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(StoreError::InvalidTransition { from, to })
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    #[instrument(level = "debug", skip_all, fields(models = model_ids.len()))]
    async fn create_session(&self, prompt: String, model_ids: Vec<ModelId>) -> Session {
        let session = Session::new(prompt, model_ids);
        self.sessions
            .insert(session.id.clone(), Arc::new(Mutex::new(session.clone())));
        debug!(session_id = %session.id, "session created");
        session
    }

    async fn get_session(&self, id: &SessionId) -> Option<Session> {
        let entry = self.entry(id).ok()?;
        let snapshot = entry.lock().clone();
        Some(snapshot)
    }

    #[instrument(level = "debug", skip_all, fields(session_id = %id, %status))]
    async fn set_session_status(
        &self,
        id: &SessionId,
        status: RunStatus,
        error_message: Option<String>,
    ) {
        let result = self.with_session(id, |session| {
            check_transition(session.status, status)?;
            session.status = status;
            if error_message.is_some() {
                session.error_message = error_message;
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!(session_id = %id, %status, error = %e, "session status not updated");
        }
    }

    #[instrument(level = "debug", skip_all, fields(session_id = %id, model_id = %model_id, %status))]
    async fn set_model_status(
        &self,
        id: &SessionId,
        model_id: &ModelId,
        status: RunStatus,
        error_message: Option<String>,
    ) {
        let result = self.with_model(id, model_id, |state| {
            check_transition(state.status, status)?;
            state.status = status;
            let now = Utc::now();
            if status == RunStatus::Running {
                state.metrics.mark_started(now);
            } else if status.is_terminal() {
                state.metrics.mark_finished(now);
            }
            if error_message.is_some() {
                state.error_message = error_message;
            }
            Ok(())
        });
        if let Err(e) = result {
            warn!(session_id = %id, model_id = %model_id, %status, error = %e, "model status not updated");
        }
    }

    async fn append_model_chunk(&self, id: &SessionId, model_id: &ModelId, text: &str) {
        let result = self.with_model(id, model_id, |state| {
            ensure_open(id, state)?;
            state.chunks.push(text.to_string());
            state.metrics.record_chunk(text);
            Ok(())
        });
        if let Err(e) = result {
            warn!(session_id = %id, model_id = %model_id, error = %e, "chunk dropped");
        }
    }

    async fn update_model_usage(
        &self,
        id: &SessionId,
        model_id: &ModelId,
        usage: &UsageUpdate,
    ) -> Option<ModelMetrics> {
        let result = self.with_model(id, model_id, |state| {
            ensure_open(id, state)?;
            state.metrics.merge_usage(usage);
            Ok(state.metrics.clone())
        });
        match result {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                warn!(session_id = %id, model_id = %model_id, error = %e, "usage dropped");
                None
            }
        }
    }

    async fn get_model_metrics(&self, id: &SessionId, model_id: &ModelId) -> Option<ModelMetrics> {
        self.read_model(id, model_id, |state| state.metrics.clone()).ok()
    }

    async fn session_count(&self) -> usize {
        self.sessions.len()
    }

    async fn remove_session(&self, id: &SessionId) -> bool {
        let removed = self.sessions.remove(id).is_some();
        if removed {
            debug!(session_id = %id, "session removed");
        }
        removed
    }
}
