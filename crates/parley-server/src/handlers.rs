//! Route handlers for the session API.
//!
//! Sessions are created with `POST /sessions` and run in the background.
//! Clients either poll `GET /sessions/{id}` or follow
//! `GET /sessions/{id}/stream`, which delivers one JSON `StreamEvent` per
//! SSE message until the session settles.

use std::collections::HashSet;
use std::convert::Infallible;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use parley_core::{ModelId, ProviderSummary, Session, SessionId, StreamEvent};
use parley_engine::{SessionOrchestrator, SubmitRequest};
use parley_telemetry::{LogQuery, LogRecord, MetricSample};

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct CreateSessionBody {
    pub prompt: String,
    pub model_ids: Vec<String>,
    /// Accepted for client compatibility, not stored.
    #[serde(default)]
    pub metadata: Option<String>,
}

impl CreateSessionBody {
    /// Check the body and return the model ids to run.
    pub fn validate(self, max_prompt_chars: usize) -> Result<SubmitRequest, ApiError> {
        let prompt_chars = self.prompt.chars().count();
        if prompt_chars > max_prompt_chars {
            return Err(ApiError::BadRequest(format!(
                "prompt is {prompt_chars} characters, limit is {max_prompt_chars}"
            )));
        }
        if self.model_ids.is_empty() {
            return Err(ApiError::BadRequest("modelIds must not be empty".into()));
        }

        let mut seen = HashSet::new();
        for id in &self.model_ids {
            if id.is_empty() {
                return Err(ApiError::BadRequest("model ids must not be empty".into()));
            }
            if !seen.insert(id.as_str()) {
                return Err(ApiError::BadRequest(format!("duplicate model id {id}")));
            }
        }

        Ok(SubmitRequest {
            prompt: self.prompt,
            model_ids: self.model_ids.into_iter().map(ModelId::from).collect(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub sessions: usize,
    pub active_sessions: usize,
    pub providers: usize,
}

pub async fn create_session(
    State(state): State<AppState>,
    body: Result<Json<CreateSessionBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Session>), ApiError> {
    let Json(body) = body?;
    let request = body.validate(state.config.max_prompt_chars)?;
    let session = state.orchestrator.submit(request).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    let session_id = SessionId::from(id);
    match state.orchestrator.store().get_session(&session_id).await {
        Some(session) => Ok(Json(session)),
        None => Err(ApiError::SessionNotFound(session_id)),
    }
}

/// Drop a settled session and its event history.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let session_id = SessionId::from(id);
    if state.orchestrator.is_active(&session_id) {
        return Err(ApiError::Conflict(format!(
            "session {session_id} is still running"
        )));
    }
    if state.orchestrator.evict(&session_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::SessionNotFound(session_id))
    }
}

pub async fn stream_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session_id = SessionId::from(id);
    if state.orchestrator.store().get_session(&session_id).await.is_none() {
        return Err(ApiError::SessionNotFound(session_id));
    }

    debug!(session_id = %session_id, "stream subscriber attached");
    let events = state
        .orchestrator
        .bus()
        .subscribe(&session_id)
        .filter_map(|event| async move { to_sse_event(&event) })
        .map(Ok);

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.config.keepalive_interval)))
}

fn to_sse_event(event: &StreamEvent) -> Option<Event> {
    match Event::default().json_data(event) {
        Ok(sse) => Some(sse),
        Err(e) => {
            warn!(event = event.event_type(), error = %e, "dropping unserializable event");
            None
        }
    }
}

pub async fn list_providers(State(state): State<AppState>) -> Json<Vec<ProviderSummary>> {
    Json(state.orchestrator.providers().summaries())
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        sessions: state.orchestrator.store().session_count().await,
        active_sessions: state.orchestrator.active_count(),
        providers: state.orchestrator.providers().len(),
    })
}

pub async fn metrics(State(state): State<AppState>) -> Json<Vec<MetricSample>> {
    Json(state.metrics.snapshot())
}

/// Most recent persisted warn+ events, newest first.
pub async fn logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    let sink = state.logs.clone().ok_or(ApiError::LogsDisabled)?;
    let records = tokio::task::spawn_blocking(move || sink.query(&query))
        .await
        .map_err(|e| ApiError::Internal(format!("log query task failed: {e}")))?
        .map_err(|e| ApiError::Internal(format!("log query failed: {e}")))?;
    Ok(Json(records))
}
