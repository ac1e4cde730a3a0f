use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use parley_engine::EngineOrchestrator;
use parley_telemetry::{MetricsRecorder, SqliteLogSink};

use crate::config::ServerConfig;
use crate::handlers;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<EngineOrchestrator>,
    pub metrics: Arc<MetricsRecorder>,
    pub config: Arc<ServerConfig>,
    /// Persisted warn+ logs, served by `GET /logs` when present.
    pub logs: Option<Arc<SqliteLogSink>>,
}

impl AppState {
    pub fn new(
        orchestrator: EngineOrchestrator,
        metrics: Arc<MetricsRecorder>,
        config: ServerConfig,
    ) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            metrics,
            config: Arc::new(config),
            logs: None,
        }
    }

    pub fn with_logs(mut self, logs: Option<Arc<SqliteLogSink>>) -> Self {
        self.logs = logs;
        self
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/sessions", post(handlers::create_session))
        .route(
            "/sessions/{id}",
            get(handlers::get_session).delete(handlers::delete_session),
        )
        .route("/sessions/{id}/stream", get(handlers::stream_session))
        .route("/providers", get(handlers::list_providers))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/logs", get(handlers::logs))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve in the background. Returns a handle to shut it down.
pub async fn start(state: AppState) -> Result<ServerHandle, std::io::Error> {
    let addr = state.config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let shutdown = CancellationToken::new();
    let router = build_router(state);
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    tracing::info!(addr = %local_addr, "parley server started");

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for in-flight requests.
    /// Open event streams end when their sessions do.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task did not finish cleanly");
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}
