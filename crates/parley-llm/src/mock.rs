use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use parley_core::{ChunkStream, ModelProvider, ProviderChunk, ProviderError, Session};

/// Pre-programmed responses for deterministic testing without API calls.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Yield these chunks immediately.
    Stream(Vec<ProviderChunk>),
    /// Yield these chunks, sleeping before each one.
    Paced(Duration, Vec<ProviderChunk>),
    /// Fail to open the stream.
    Error(ProviderError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    /// Text fragments followed by `Done`.
    pub fn texts(fragments: &[&str]) -> Self {
        let mut chunks: Vec<_> = fragments.iter().map(|f| ProviderChunk::text(*f)).collect();
        chunks.push(ProviderChunk::Done);
        Self::Stream(chunks)
    }

    /// A stream whose only chunk is an error fragment.
    pub fn stream_error(message: &str) -> Self {
        Self::Stream(vec![ProviderChunk::error(message)])
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Provider that replays scripted responses, one per call. Once the
/// script runs out the last response is repeated.
pub struct ScriptedProvider {
    id: String,
    display_name: String,
    responses: Vec<MockResponse>,
    call_count: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(id: impl Into<String>, responses: Vec<MockResponse>) -> Self {
        let id = id.into();
        Self {
            display_name: format!("Scripted {id}"),
            id,
            responses,
            call_count: AtomicUsize::new(0),
        }
    }

    /// Single response used for every call.
    pub fn always(id: impl Into<String>, response: MockResponse) -> Self {
        Self::new(id, vec![response])
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn stream_response(&self, _session: &Session) -> Result<ChunkStream, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        let response = self
            .responses
            .get(idx)
            .or_else(|| self.responses.last())
            .ok_or_else(|| {
                ProviderError::InvalidRequest(format!("{}: no scripted responses", self.id))
            })?;
        resolve_response(response).await
    }
}

/// Resolve a MockResponse, unrolling nested delays iteratively.
async fn resolve_response(response: &MockResponse) -> Result<ChunkStream, ProviderError> {
    let mut current = response;
    loop {
        match current {
            MockResponse::Stream(chunks) => return Ok(Box::pin(stream::iter(chunks.clone()))),
            MockResponse::Paced(interval, chunks) => return Ok(paced(*interval, chunks.clone())),
            MockResponse::Error(e) => return Err(e.clone()),
            MockResponse::Delay(duration, inner) => {
                tokio::time::sleep(*duration).await;
                current = inner;
            }
        }
    }
}

fn paced(interval: Duration, chunks: Vec<ProviderChunk>) -> ChunkStream {
    Box::pin(stream::iter(chunks).then(move |chunk| async move {
        tokio::time::sleep(interval).await;
        chunk
    }))
}

const DEMO_INTERVAL: Duration = Duration::from_millis(100);
const PROMPT_ECHO_CHARS: usize = 100;

/// Offline stand-in used when no real backend is configured. Emits three
/// paced fragments echoing the prompt, then completes.
pub struct DemoProvider {
    id: String,
    display_name: String,
    interval: Duration,
}

impl DemoProvider {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            interval: DEMO_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn fragments(&self, prompt: &str) -> Vec<ProviderChunk> {
        let echoed: String = prompt.chars().take(PROMPT_ECHO_CHARS).collect();
        vec![
            ProviderChunk::Text(format!("Hello from {}!", self.display_name)),
            ProviderChunk::Text(format!(" You asked: \"{echoed}\"")),
            ProviderChunk::text(" This is placeholder text while real provider integration is implemented."),
            ProviderChunk::Done,
        ]
    }
}

#[async_trait]
impl ModelProvider for DemoProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn stream_response(&self, session: &Session) -> Result<ChunkStream, ProviderError> {
        Ok(paced(self.interval, self.fragments(&session.prompt)))
    }
}
