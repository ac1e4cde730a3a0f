mod logging;
mod metrics;

pub use logging::{LogQuery, LogRecord, SqliteLogLayer, SqliteLogSink};
pub use metrics::{HistogramSummary, MetricSample, MetricType, MetricValue, MetricsRecorder};

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "parley_llm" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Persist warn+ events to this SQLite file when set.
    pub log_db_path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json: false,
            log_db_path: None,
        }
    }
}

impl TelemetryConfig {
    fn filter_directives(&self) -> String {
        let mut filter = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            filter.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        filter
    }
}

/// Keeps telemetry sinks reachable for the lifetime of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    metrics: Arc<MetricsRecorder>,
}

impl TelemetryGuard {
    pub fn metrics(&self) -> Arc<MetricsRecorder> {
        Arc::clone(&self.metrics)
    }

    /// The persisted-log sink, when a log database is configured.
    pub fn logs(&self) -> Option<Arc<SqliteLogSink>> {
        self.log_sink.clone()
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    let json_layer = config
        .json
        .then(|| tracing_subscriber::fmt::layer().json().with_target(true));
    let text_layer = (!config.json).then(|| tracing_subscriber::fmt::layer().with_target(true));

    let (sqlite_layer, log_sink) = match &config.log_db_path {
        Some(path) => match SqliteLogSink::open(path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(Arc::clone(&sink))), Some(sink))
            }
            Err(e) => {
                eprintln!("parley-telemetry: failed to open log DB {}: {e}", path.display());
                (None, None)
            }
        },
        None => (None, None),
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(sqlite_layer)
        .try_init()
    {
        eprintln!("parley-telemetry: subscriber already installed: {e}");
    }

    TelemetryGuard {
        log_sink,
        metrics: Arc::new(MetricsRecorder::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.log_level, Level::INFO);
        assert!(!config.json);
        assert!(config.log_db_path.is_none());
    }

    #[test]
    fn filter_directives_include_module_overrides() {
        let config = TelemetryConfig {
            log_level: Level::WARN,
            module_levels: vec![
                ("parley_engine".into(), Level::DEBUG),
                ("parley_llm".into(), Level::TRACE),
            ],
            ..Default::default()
        };
        assert_eq!(
            config.filter_directives(),
            "warn,parley_engine=debug,parley_llm=trace"
        );
    }
}
