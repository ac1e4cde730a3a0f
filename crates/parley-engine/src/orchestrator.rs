//! Session orchestrator: fans one prompt out to every selected model and
//! folds the outcomes back into a session result.
//!
//! Each model runs in its own task inside a `JoinSet`. A task writes to the
//! store first and publishes the matching event second, so a snapshot read
//! after an event always reflects it. Model failures never escape their
//! task; they become `error` state plus a `model.error` event.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use parley_core::{ModelId, ProviderChunk, RunStatus, Session, SessionId, StreamEvent};
use parley_llm::ProviderRegistry;
use parley_store::SessionStore;
use parley_telemetry::MetricsRecorder;

use crate::bus::EventBus;
use crate::error::EngineError;

/// A prompt to run against a set of models.
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub prompt: String,
    pub model_ids: Vec<ModelId>,
}

#[async_trait]
pub trait SessionOrchestrator: Send + Sync {
    /// Create a session and start executing it in the background. Returns
    /// the `pending` snapshot without waiting for any model.
    async fn submit(&self, request: SubmitRequest) -> Result<Session, EngineError>;

    fn is_active(&self, session_id: &SessionId) -> bool;

    fn active_count(&self) -> usize;
}

enum ModelOutcome {
    Completed,
    Failed,
}

/// Production orchestrator over a [`SessionStore`], an [`EventBus`] and a
/// [`ProviderRegistry`].
#[derive(Clone)]
pub struct EngineOrchestrator {
    store: Arc<dyn SessionStore>,
    bus: Arc<EventBus>,
    providers: Arc<ProviderRegistry>,
    metrics: Option<Arc<MetricsRecorder>>,
    active: Arc<DashMap<SessionId, Instant>>,
}

impl EngineOrchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        bus: Arc<EventBus>,
        providers: Arc<ProviderRegistry>,
    ) -> Self {
        Self {
            store,
            bus,
            providers,
            metrics: None,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    /// Run a stored session to completion. Returns the final session
    /// status, or `None` if the session no longer exists, is already
    /// running, or has already run.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn execute(&self, session_id: &SessionId) -> Option<RunStatus> {
        let started = Instant::now();
        match self.active.entry(session_id.clone()) {
            Entry::Occupied(_) => {
                warn!("session already executing, ignoring second run");
                return None;
            }
            Entry::Vacant(slot) => {
                slot.insert(started);
            }
        }

        // The claim is held while the status leaves `pending`, so a later
        // caller always sees a non-pending snapshot.
        let session = match self.store.get_session(session_id).await {
            Some(session) if session.status == RunStatus::Pending => session,
            Some(session) => {
                warn!(status = %session.status, "session already ran, ignoring second run");
                self.active.remove(session_id);
                return None;
            }
            None => {
                warn!("session vanished before execution, nothing to do");
                self.active.remove(session_id);
                return None;
            }
        };
        self.gauge_add("sessions.active", 1.0);

        self.store
            .set_session_status(session_id, RunStatus::Running, None)
            .await;
        self.bus.publish(
            session_id,
            StreamEvent::SessionStatus {
                status: RunStatus::Running,
            },
        );

        let session = Arc::new(session);
        let mut tasks = JoinSet::new();
        for model_id in session.model_ids.iter().cloned() {
            let this = self.clone();
            let session = Arc::clone(&session);
            let span = info_span!("model", session_id = %session.id, model_id = %model_id);
            tasks.spawn(
                async move {
                    let outcome = AssertUnwindSafe(this.run_model(&session, &model_id))
                        .catch_unwind()
                        .await;
                    let outcome = match outcome {
                        Ok(outcome) => outcome,
                        Err(_) => this.fail_model(&session.id, &model_id, EngineError::Panicked).await,
                    };
                    (model_id, outcome)
                }
                .instrument(span),
            );
        }

        let total = session.model_ids.len();
        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, ModelOutcome::Completed)) => {}
                Ok((model_id, ModelOutcome::Failed)) => {
                    debug!(model_id = %model_id, "model settled with failure");
                    failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "model task did not finish");
                    failed += 1;
                }
            }
        }

        let status = if failed > 0 {
            let summary = format!("{failed} of {total} models failed");
            self.store
                .set_session_status(session_id, RunStatus::Error, Some(summary.clone()))
                .await;
            self.bus
                .publish(session_id, StreamEvent::SessionError { error: summary });
            RunStatus::Error
        } else {
            self.store
                .set_session_status(session_id, RunStatus::Completed, None)
                .await;
            self.bus.publish(session_id, StreamEvent::SessionCompleted);
            RunStatus::Completed
        };
        self.bus.close_session(session_id);

        self.active.remove(session_id);
        self.gauge_add("sessions.active", -1.0);
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("sessions.completed", &[("outcome", status.as_str())], 1);
        }
        info!(
            %status,
            failed,
            total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "session finished"
        );
        Some(status)
    }

    /// Drop a session from the store and the bus. Sessions that are still
    /// executing are kept; returns whether anything was removed.
    #[instrument(skip_all, fields(session_id = %session_id))]
    pub async fn evict(&self, session_id: &SessionId) -> bool {
        if self.active.contains_key(session_id) {
            debug!("session still executing, not evicted");
            return false;
        }
        let removed = self.store.remove_session(session_id).await;
        let forgotten = self.bus.forget(session_id);
        removed || forgotten
    }

    async fn run_model(&self, session: &Session, model_id: &ModelId) -> ModelOutcome {
        match self.stream_model(session, model_id).await {
            Ok(()) => {
                self.store
                    .set_model_status(&session.id, model_id, RunStatus::Completed, None)
                    .await;
                self.bus.publish(
                    &session.id,
                    StreamEvent::ModelStatus {
                        model_id: model_id.clone(),
                        status: RunStatus::Completed,
                    },
                );
                self.publish_metrics(&session.id, model_id).await;
                self.record_model_outcome(&session.id, model_id, RunStatus::Completed)
                    .await;
                ModelOutcome::Completed
            }
            Err(e) => self.fail_model(&session.id, model_id, e).await,
        }
    }

    /// Pull fragments until the provider is done. Any error ends the run.
    async fn stream_model(&self, session: &Session, model_id: &ModelId) -> Result<(), EngineError> {
        let provider = self
            .providers
            .get(model_id.as_str())
            .ok_or_else(|| EngineError::UnknownProvider(model_id.clone()))?;

        self.store
            .set_model_status(&session.id, model_id, RunStatus::Running, None)
            .await;
        self.bus.publish(
            &session.id,
            StreamEvent::ModelStatus {
                model_id: model_id.clone(),
                status: RunStatus::Running,
            },
        );

        let mut stream = provider.stream_response(session).await?;
        while let Some(chunk) = stream.next().await {
            match chunk {
                ProviderChunk::Text(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    self.store
                        .append_model_chunk(&session.id, model_id, &text)
                        .await;
                    self.bus.publish(
                        &session.id,
                        StreamEvent::ModelChunk {
                            model_id: model_id.clone(),
                            content: text,
                        },
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.counter_inc("models.chunks", &[("model", model_id.as_str())], 1);
                    }
                    self.publish_metrics(&session.id, model_id).await;
                }
                ProviderChunk::Usage(usage) => {
                    if let Some(metrics) = self
                        .store
                        .update_model_usage(&session.id, model_id, &usage)
                        .await
                    {
                        self.bus.publish(
                            &session.id,
                            StreamEvent::ModelMetrics {
                                model_id: model_id.clone(),
                                metrics,
                            },
                        );
                    }
                }
                ProviderChunk::Done => break,
                ProviderChunk::Error(message) => return Err(EngineError::ModelFailed(message)),
            }
        }
        Ok(())
    }

    async fn fail_model(
        &self,
        session_id: &SessionId,
        model_id: &ModelId,
        error: EngineError,
    ) -> ModelOutcome {
        let message = error.to_string();
        warn!(session_id = %session_id, model_id = %model_id, error = %message, "model failed");
        self.store
            .set_model_status(session_id, model_id, RunStatus::Error, Some(message.clone()))
            .await;
        self.bus.publish(
            session_id,
            StreamEvent::ModelError {
                model_id: model_id.clone(),
                error: message,
            },
        );
        self.publish_metrics(session_id, model_id).await;
        self.record_model_outcome(session_id, model_id, RunStatus::Error)
            .await;
        ModelOutcome::Failed
    }

    async fn publish_metrics(&self, session_id: &SessionId, model_id: &ModelId) {
        if let Some(metrics) = self.store.get_model_metrics(session_id, model_id).await {
            self.bus.publish(
                session_id,
                StreamEvent::ModelMetrics {
                    model_id: model_id.clone(),
                    metrics,
                },
            );
        }
    }

    async fn record_model_outcome(&self, session_id: &SessionId, model_id: &ModelId, status: RunStatus) {
        let Some(recorder) = &self.metrics else {
            return;
        };
        let labels = [("model", model_id.as_str()), ("outcome", status.as_str())];
        recorder.counter_inc("models.completed", &labels, 1);
        if let Some(duration) = self
            .store
            .get_model_metrics(session_id, model_id)
            .await
            .and_then(|m| m.duration_ms)
        {
            recorder.histogram_observe(
                "models.duration_ms",
                &[("model", model_id.as_str())],
                duration as f64,
            );
        }
    }

    fn gauge_add(&self, name: &str, delta: f64) {
        if let Some(metrics) = &self.metrics {
            metrics.gauge_add(name, &[], delta);
        }
    }
}

#[async_trait]
impl SessionOrchestrator for EngineOrchestrator {
    async fn submit(&self, request: SubmitRequest) -> Result<Session, EngineError> {
        if request.model_ids.is_empty() {
            return Err(EngineError::InvalidRequest(
                "at least one model id is required".into(),
            ));
        }

        let session = self
            .store
            .create_session(request.prompt, request.model_ids)
            .await;
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("sessions.started", &[], 1);
        }
        info!(session_id = %session.id, models = session.model_ids.len(), "session submitted");

        let this = self.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            this.execute(&session_id).await;
        });

        Ok(session)
    }

    fn is_active(&self, session_id: &SessionId) -> bool {
        self.active.contains_key(session_id)
    }

    fn active_count(&self) -> usize {
        self.active.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parley_core::{ChunkStream, ModelProvider, ProviderError, UsageUpdate};
    use parley_llm::{MockResponse, ScriptedProvider};
    use parley_store::MemorySessionStore;

    use crate::bus::BusConfig;

    struct Harness {
        orchestrator: EngineOrchestrator,
        store: Arc<MemorySessionStore>,
        bus: Arc<EventBus>,
        metrics: Arc<MetricsRecorder>,
    }

    fn harness(providers: Vec<Arc<dyn ModelProvider>>) -> Harness {
        let store = Arc::new(MemorySessionStore::new());
        let bus = Arc::new(EventBus::new(BusConfig::default()));
        let metrics = Arc::new(MetricsRecorder::new());
        let registry = providers
            .into_iter()
            .fold(ProviderRegistry::new(), |registry, p| registry.with(p));
        let orchestrator = EngineOrchestrator::new(
            Arc::clone(&store) as Arc<dyn SessionStore>,
            Arc::clone(&bus),
            Arc::new(registry),
        )
        .with_metrics(Arc::clone(&metrics));
        Harness {
            orchestrator,
            store,
            bus,
            metrics,
        }
    }

    fn ids(raw: &[&str]) -> Vec<ModelId> {
        raw.iter().map(|s| ModelId::from(*s)).collect()
    }

    fn model_events<'a>(events: &'a [StreamEvent], model: &str) -> Vec<&'a StreamEvent> {
        events
            .iter()
            .filter(|e| e.model_id().map(ModelId::as_str) == Some(model))
            .collect()
    }

    async fn run(h: &Harness, models: &[&str]) -> (Session, Vec<StreamEvent>) {
        let session = h.store.create_session("2+2?".into(), ids(models)).await;
        let stream = h.bus.subscribe(&session.id);
        h.orchestrator.execute(&session.id).await;
        let events: Vec<_> = stream.collect().await;
        let snapshot = h.store.get_session(&session.id).await.unwrap();
        (snapshot, events)
    }

    #[tokio::test]
    async fn one_success_one_failure() {
        let h = harness(vec![
            Arc::new(ScriptedProvider::always("m1", MockResponse::texts(&["4"]))),
            Arc::new(ScriptedProvider::always(
                "m2",
                MockResponse::stream_error("quota exceeded"),
            )),
        ]);
        let (session, events) = run(&h, &["m1", "m2"]).await;

        let m1 = session.model(&"m1".into()).unwrap();
        assert_eq!(m1.status, RunStatus::Completed);
        assert_eq!(m1.chunks, vec!["4"]);
        let m2 = session.model(&"m2".into()).unwrap();
        assert_eq!(m2.status, RunStatus::Error);
        assert_eq!(m2.error_message.as_deref(), Some("quota exceeded"));
        assert_eq!(session.status, RunStatus::Error);
        assert_eq!(session.error_message.as_deref(), Some("1 of 2 models failed"));

        assert_eq!(
            events.first(),
            Some(&StreamEvent::SessionStatus {
                status: RunStatus::Running
            })
        );
        assert_eq!(
            events.last(),
            Some(&StreamEvent::SessionError {
                error: "1 of 2 models failed".into()
            })
        );

        let m1_types: Vec<_> = model_events(&events, "m1")
            .iter()
            .map(|e| e.event_type())
            .collect();
        assert_eq!(
            m1_types,
            vec![
                "model.status",
                "model.chunk",
                "model.metrics",
                "model.status",
                "model.metrics"
            ]
        );

        let m2_events = model_events(&events, "m2");
        let errors = m2_events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ModelError { .. }))
            .count();
        assert_eq!(errors, 1);
        assert!(matches!(
            m2_events.last(),
            Some(StreamEvent::ModelMetrics { .. })
        ));
        assert!(h.bus.is_closed(&session.id));
    }

    #[tokio::test]
    async fn unknown_model_fails_without_provider_call() {
        let known = Arc::new(ScriptedProvider::always("m1", MockResponse::texts(&["x"])));
        let h = harness(vec![known.clone() as Arc<dyn ModelProvider>]);
        let (session, events) = run(&h, &["unknown-model"]).await;

        let state = session.model(&"unknown-model".into()).unwrap();
        assert_eq!(state.status, RunStatus::Error);
        assert_eq!(
            state.error_message.as_deref(),
            Some("Unknown provider unknown-model")
        );
        assert!(state.metrics.started_at.is_none());
        assert_eq!(session.status, RunStatus::Error);
        assert_eq!(known.call_count(), 0);
        assert!(events.iter().any(|e| matches!(
            e,
            StreamEvent::ModelError { error, .. } if error == "Unknown provider unknown-model"
        )));
    }

    #[tokio::test]
    async fn all_completed_session_completes() {
        let h = harness(vec![
            Arc::new(ScriptedProvider::always("a", MockResponse::texts(&["Hel", "lo"]))),
            Arc::new(ScriptedProvider::always("b", MockResponse::texts(&["Hi"]))),
        ]);
        let (session, events) = run(&h, &["a", "b"]).await;

        assert_eq!(session.status, RunStatus::Completed);
        assert!(session.error_message.is_none());
        let a = session.model(&"a".into()).unwrap();
        assert_eq!(a.output(), "Hello");
        assert_eq!(a.metrics.chunk_count, 2);
        assert_eq!(a.metrics.total_chars, 5);
        assert!(a.metrics.duration_ms.is_some());
        assert_eq!(events.last(), Some(&StreamEvent::SessionCompleted));
    }

    #[tokio::test]
    async fn zero_fragments_is_a_valid_completion() {
        let h = harness(vec![Arc::new(ScriptedProvider::always(
            "quiet",
            MockResponse::Stream(vec![ProviderChunk::Done]),
        ))]);
        let (session, _) = run(&h, &["quiet"]).await;

        let state = session.model(&"quiet".into()).unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert!(state.chunks.is_empty());
        assert_eq!(state.metrics.chunk_count, 0);
        assert_eq!(state.metrics.total_chars, 0);
        assert_eq!(session.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn exhausted_stream_counts_as_done() {
        let h = harness(vec![Arc::new(ScriptedProvider::always(
            "m",
            MockResponse::Stream(vec![ProviderChunk::text("a"), ProviderChunk::text("")]),
        ))]);
        let (session, _) = run(&h, &["m"]).await;
        let state = session.model(&"m".into()).unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.chunks, vec!["a"]);
    }

    #[tokio::test]
    async fn open_failure_is_a_model_error() {
        let h = harness(vec![Arc::new(ScriptedProvider::always(
            "m",
            MockResponse::Error(ProviderError::AuthenticationFailed("bad key".into())),
        ))]);
        let (session, _) = run(&h, &["m"]).await;
        let state = session.model(&"m".into()).unwrap();
        assert_eq!(state.status, RunStatus::Error);
        assert_eq!(
            state.error_message.as_deref(),
            Some("authentication failed: bad key")
        );
        assert!(state.metrics.started_at.is_some());
    }

    #[tokio::test]
    async fn usage_fragments_update_metrics() {
        let h = harness(vec![Arc::new(ScriptedProvider::always(
            "m",
            MockResponse::Stream(vec![
                ProviderChunk::text("4"),
                ProviderChunk::Usage(UsageUpdate {
                    prompt_tokens: Some(3),
                    completion_tokens: Some(1),
                    total_tokens: None,
                    estimated_cost_usd: Some(0.002),
                }),
                ProviderChunk::Done,
            ]),
        ))]);
        let (session, events) = run(&h, &["m"]).await;

        let metrics = &session.model(&"m".into()).unwrap().metrics;
        assert_eq!(metrics.total_tokens, Some(4));
        assert_eq!(metrics.estimated_cost_usd, Some(0.002));
        let metric_events = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ModelMetrics { .. }))
            .count();
        assert_eq!(metric_events, 3);
    }

    #[tokio::test]
    async fn vanished_session_publishes_nothing() {
        let h = harness(Vec::new());
        let ghost = SessionId::from("sess_ghost");
        assert_eq!(h.orchestrator.execute(&ghost).await, None);
        assert_eq!(h.bus.open_sessions(), 0);
        assert!(!h.bus.is_closed(&ghost));
        assert_eq!(h.orchestrator.active_count(), 0);
    }

    #[tokio::test]
    async fn finished_session_is_not_run_again() {
        let provider = Arc::new(ScriptedProvider::always("m", MockResponse::texts(&["a"])));
        let h = harness(vec![Arc::clone(&provider) as Arc<dyn ModelProvider>]);
        let (session, _) = run(&h, &["m"]).await;
        assert_eq!(session.status, RunStatus::Completed);

        assert_eq!(h.orchestrator.execute(&session.id).await, None);
        assert_eq!(provider.call_count(), 1);
        assert_eq!(h.orchestrator.active_count(), 0);

        let after = h.store.get_session(&session.id).await.unwrap();
        let state = after.model(&"m".into()).unwrap();
        assert_eq!(state.chunks, vec!["a"]);
        assert_eq!(state.metrics.chunk_count, 1);
        assert_eq!(h.metrics.counter_get("sessions.completed", &[("outcome", "completed")]), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_execute_runs_once() {
        let provider = Arc::new(ScriptedProvider::always(
            "m",
            MockResponse::Paced(
                Duration::from_millis(50),
                vec![ProviderChunk::text("a"), ProviderChunk::Done],
            ),
        ));
        let h = harness(vec![Arc::clone(&provider) as Arc<dyn ModelProvider>]);
        let session = h.store.create_session("p".into(), ids(&["m"])).await;

        let (first, second) = tokio::join!(
            h.orchestrator.execute(&session.id),
            h.orchestrator.execute(&session.id)
        );
        let mut outcomes = [first, second];
        outcomes.sort_by_key(|o| o.is_some());
        assert_eq!(outcomes, [None, Some(RunStatus::Completed)]);
        assert_eq!(provider.call_count(), 1);

        let done = h.store.get_session(&session.id).await.unwrap();
        assert_eq!(done.model(&"m".into()).unwrap().chunks, vec!["a"]);
    }

    #[tokio::test]
    async fn evict_clears_store_and_bus() {
        let h = harness(vec![Arc::new(ScriptedProvider::always("m", MockResponse::texts(&["a"])))]);
        let (session, _) = run(&h, &["m"]).await;
        assert!(h.bus.is_closed(&session.id));

        assert!(h.orchestrator.evict(&session.id).await);
        assert!(h.store.get_session(&session.id).await.is_none());
        assert_eq!(h.bus.tracked_sessions(), 0);
        assert!(!h.orchestrator.evict(&session.id).await);
        assert_eq!(h.orchestrator.execute(&session.id).await, None);
    }

    struct Exploding;

    #[async_trait]
    impl ModelProvider for Exploding {
        fn id(&self) -> &str {
            "boom"
        }
        fn display_name(&self) -> &str {
            "Exploding"
        }
        fn supports_streaming(&self) -> bool {
            true
        }
        async fn stream_response(&self, _session: &Session) -> Result<ChunkStream, ProviderError> {
            panic!("provider bug");
        }
    }

    #[tokio::test]
    async fn panicking_model_is_isolated() {
        let h = harness(vec![
            Arc::new(Exploding),
            Arc::new(ScriptedProvider::always("ok", MockResponse::texts(&["fine"]))),
        ]);
        let (session, _) = run(&h, &["boom", "ok"]).await;

        let boom = session.model(&"boom".into()).unwrap();
        assert_eq!(boom.status, RunStatus::Error);
        assert_eq!(boom.error_message.as_deref(), Some("model task panicked"));
        assert_eq!(
            session.model(&"ok".into()).unwrap().status,
            RunStatus::Completed
        );
        assert_eq!(session.status, RunStatus::Error);
    }

    #[tokio::test]
    async fn submit_returns_pending_and_runs_in_background() {
        let h = harness(vec![Arc::new(ScriptedProvider::always(
            "m",
            MockResponse::texts(&["a", "b"]),
        ))]);
        let session = h
            .orchestrator
            .submit(SubmitRequest {
                prompt: "hi".into(),
                model_ids: ids(&["m"]),
            })
            .await
            .unwrap();
        assert_eq!(session.status, RunStatus::Pending);

        let events: Vec<_> = h.bus.subscribe(&session.id).collect().await;
        assert_eq!(events.last(), Some(&StreamEvent::SessionCompleted));

        let done = h.store.get_session(&session.id).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.model(&"m".into()).unwrap().output(), "ab");
        assert!(!h.orchestrator.is_active(&session.id));
        assert_eq!(h.metrics.counter_get("sessions.started", &[]), 1);
    }

    #[tokio::test]
    async fn submit_rejects_empty_model_list() {
        let h = harness(Vec::new());
        let result = h
            .orchestrator
            .submit(SubmitRequest {
                prompt: "hi".into(),
                model_ids: Vec::new(),
            })
            .await;
        assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
        assert_eq!(h.store.session_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_reflects_every_received_chunk() {
        let h = harness(vec![
            Arc::new(ScriptedProvider::always(
                "slow",
                MockResponse::Paced(
                    Duration::from_millis(30),
                    vec![
                        ProviderChunk::text("1"),
                        ProviderChunk::text("2"),
                        ProviderChunk::text("3"),
                        ProviderChunk::Done,
                    ],
                ),
            )),
            Arc::new(ScriptedProvider::always(
                "fast",
                MockResponse::Paced(
                    Duration::from_millis(10),
                    vec![ProviderChunk::text("x"), ProviderChunk::Done],
                ),
            )),
        ]);
        let session = h.store.create_session("p".into(), ids(&["slow", "fast"])).await;
        let mut stream = h.bus.subscribe(&session.id);
        let orchestrator = h.orchestrator.clone();
        let id = session.id.clone();
        let run = tokio::spawn(async move { orchestrator.execute(&id).await });

        let mut seen = std::collections::HashMap::<String, usize>::new();
        while let Some(event) = stream.next().await {
            if let StreamEvent::ModelChunk { model_id, .. } = &event {
                let count = seen.entry(model_id.to_string()).or_default();
                *count += 1;
                let snap = h.store.get_session(&session.id).await.unwrap();
                assert!(snap.model(model_id).unwrap().chunks.len() >= *count);
            }
        }
        assert_eq!(run.await.unwrap(), Some(RunStatus::Completed));
        assert_eq!(seen.get("slow"), Some(&3));
        assert_eq!(seen.get("fast"), Some(&1));
    }

    #[tokio::test]
    async fn records_metrics() {
        let h = harness(vec![
            Arc::new(ScriptedProvider::always("a", MockResponse::texts(&["1", "2"]))),
            Arc::new(ScriptedProvider::always("b", MockResponse::stream_error("nope"))),
        ]);
        let _ = run(&h, &["a", "b"]).await;

        let m = &h.metrics;
        assert_eq!(m.counter_get("models.chunks", &[("model", "a")]), 2);
        assert_eq!(
            m.counter_get("models.completed", &[("model", "a"), ("outcome", "completed")]),
            1
        );
        assert_eq!(
            m.counter_get("models.completed", &[("model", "b"), ("outcome", "error")]),
            1
        );
        assert_eq!(m.counter_get("sessions.completed", &[("outcome", "error")]), 1);
        assert_eq!(m.histogram_summary("models.duration_ms", &[("model", "a")]).count, 1);
        assert_eq!(m.gauge_get("sessions.active", &[]), 0.0);
    }
}
