use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        fields TEXT,
        session_id TEXT,
        model_id TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
    CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id);";

/// A warn+ log event persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub session_id: Option<String>,
    pub model_id: Option<String>,
}

/// Filters for [`SqliteLogSink::query`]. Unset fields match everything.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogQuery {
    pub level: Option<String>,
    pub session_id: Option<String>,
    pub model_id: Option<String>,
    pub limit: Option<u32>,
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, entry: &Captured, level: &str, target: &str) {
        let fields = (!entry.fields.is_empty())
            .then(|| serde_json::to_string(&entry.fields).unwrap_or_default());
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, session_id, model_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                Utc::now().to_rfc3339(),
                level,
                target,
                entry.message.as_deref().unwrap_or_default(),
                fields,
                entry.session_id,
                entry.model_id,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, session_id, model_id
             FROM logs WHERE 1=1",
        );
        let mut params: Vec<String> = Vec::new();
        for (column, value) in [
            ("level", &q.level),
            ("session_id", &q.session_id),
            ("model_id", &q.model_id),
        ] {
            if let Some(value) = value {
                params.push(value.clone());
                sql.push_str(&format!(" AND {column} = ?{}", params.len()));
            }
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                session_id: row.get(6)?,
                model_id: row.get(7)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// tracing layer that writes warn+ events to a [`SqliteLogSink`].
///
/// `session_id` and `model_id` are taken from the event itself or, failing
/// that, from the nearest enclosing span that recorded them.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct Captured {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    session_id: Option<String>,
    model_id: Option<String>,
}

impl Captured {
    fn put(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = Some(value),
            "session_id" => self.session_id = Some(value),
            "model_id" => self.model_id = Some(value),
            other => {
                self.fields
                    .insert(other.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for Captured {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        self.put(field.name(), rendered.trim_matches('"').to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

/// Correlation ids remembered on a span for its child events.
struct SpanIds {
    session_id: Option<String>,
    model_id: Option<String>,
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut captured = Captured::default();
        attrs.record(&mut captured);
        if captured.session_id.is_none() && captured.model_id.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanIds {
                session_id: captured.session_id,
                model_id: captured.model_id,
            });
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut captured = Captured::default();
        event.record(&mut captured);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if captured.session_id.is_some() && captured.model_id.is_some() {
                    break;
                }
                let extensions = span.extensions();
                if let Some(ids) = extensions.get::<SpanIds>() {
                    if captured.session_id.is_none() {
                        captured.session_id.clone_from(&ids.session_id);
                    }
                    if captured.model_id.is_none() {
                        captured.model_id.clone_from(&ids.model_id);
                    }
                }
            }
        }

        self.sink.insert(
            &captured,
            &level.to_string().to_uppercase(),
            event.metadata().target(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn with_sink(f: impl FnOnce()) -> Arc<SqliteLogSink> {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        let subscriber =
            tracing_subscriber::registry().with(SqliteLogLayer::new(Arc::clone(&sink)));
        tracing::subscriber::with_default(subscriber, f);
        sink
    }

    #[test]
    fn persists_only_warn_and_above() {
        let sink = with_sink(|| {
            tracing::info!("not persisted");
            tracing::warn!("persisted warning");
            tracing::error!(attempt = 3u64, "persisted error");
        });

        assert_eq!(sink.count().unwrap(), 2);
        let errors = sink
            .query(&LogQuery {
                level: Some("ERROR".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].message, "persisted error");
        assert!(errors[0].fields.as_deref().unwrap().contains("\"attempt\":3"));
    }

    #[test]
    fn extracts_correlation_ids_from_event_fields() {
        let sink = with_sink(|| {
            tracing::warn!(session_id = "sess_1", model_id = "m1", "provider stalled");
        });

        let rows = sink
            .query(&LogQuery {
                session_id: Some("sess_1".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].model_id.as_deref(), Some("m1"));
    }

    #[test]
    fn inherits_correlation_ids_from_spans() {
        let sink = with_sink(|| {
            let outer = tracing::info_span!("session", session_id = "sess_2");
            let _outer = outer.enter();
            let inner = tracing::info_span!("model", model_id = "m2");
            let _inner = inner.enter();
            tracing::warn!("inside model task");
        });

        let rows = sink
            .query(&LogQuery {
                model_id: Some("m2".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].session_id.as_deref(), Some("sess_2"));
    }

    #[test]
    fn open_creates_file_backed_sink() {
        let dir = std::env::temp_dir().join(format!("parley-logs-{}", uuid::Uuid::now_v7()));
        let sink = SqliteLogSink::open(&dir.join("logs.db")).unwrap();
        assert_eq!(sink.count().unwrap(), 0);
        std::fs::remove_dir_all(dir).ok();
    }
}
