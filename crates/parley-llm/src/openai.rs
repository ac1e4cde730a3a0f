use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use parley_core::{ChunkStream, ModelProvider, ProviderChunk, ProviderError, Session};

use crate::pricing::Pricing;
use crate::sse::{self, SseData};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const TEMPERATURE: f32 = 0.7;

/// One configured OpenAI-backed model.
#[derive(Clone, Debug)]
pub struct OpenAiConfig {
    /// Model id callers select (e.g. `gpt-4`).
    pub id: String,
    pub display_name: String,
    /// Upstream model name sent in the request (e.g. `gpt-4o-mini`).
    pub model: String,
    pub system_prompt: Option<String>,
    pub pricing: Pricing,
    pub base_url: String,
    pub api_key: SecretString,
}

/// Streams Chat Completions responses.
pub struct OpenAiProvider {
    client: Client,
    config: OpenAiConfig,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    temperature: f32,
    stream_options: StreamOptions,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct StreamOptions {
    include_usage: bool,
}

impl OpenAiProvider {
    pub fn new(config: OpenAiConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::NetworkError(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &OpenAiConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn request_body<'a>(&'a self, prompt: &'a str) -> ChatRequest<'a> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = self.config.system_prompt.as_deref() {
            messages.push(ChatMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ChatMessage {
            role: "user",
            content: prompt,
        });
        ChatRequest {
            model: &self.config.model,
            messages,
            stream: true,
            temperature: TEMPERATURE,
            stream_options: StreamOptions {
                include_usage: true,
            },
        }
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn display_name(&self) -> &str {
        &self.config.display_name
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    #[instrument(skip(self, session), fields(model = %self.config.model, session_id = %session.id))]
    async fn stream_response(&self, session: &Session) -> Result<ChunkStream, ProviderError> {
        let resp = self
            .client
            .post(self.endpoint())
            .bearer_auth(self.config.api_key.expose_secret())
            .header("accept", "text/event-stream")
            .json(&self.request_body(&session.prompt))
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }

        debug!("chat completion stream opened");
        Ok(Box::pin(ChatStream::new(
            resp.bytes_stream(),
            self.config.pricing,
        )))
    }
}

/// Turns a Chat Completions SSE byte stream into provider chunks.
///
/// Ends with `Done` at the `[DONE]` marker or at end of body, or with a
/// single `Error` on transport failure or when no data arrives within the
/// idle timeout.
struct ChatStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    pricing: Pricing,
    buffer: BytesMut,
    pending: VecDeque<ProviderChunk>,
    finished: bool,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
}

impl ChatStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        pricing: Pricing,
    ) -> Self {
        Self::with_idle_timeout(byte_stream, pricing, SSE_IDLE_TIMEOUT)
    }

    fn with_idle_timeout(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        pricing: Pricing,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            pricing,
            buffer: BytesMut::with_capacity(8192),
            pending: VecDeque::new(),
            finished: false,
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
        }
    }

    /// Decode and ingest every complete line in the buffer. Raw bytes stay
    /// buffered until their line ends, so characters split across reads
    /// are decoded whole.
    fn drain_lines(&mut self) {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(pos + 1);
            self.ingest_bytes(&line);
        }
    }

    fn ingest_bytes(&mut self, raw: &[u8]) {
        match std::str::from_utf8(raw) {
            Ok(text) => self.ingest(text),
            Err(e) => warn!(error = %e, "skipping SSE line with invalid UTF-8"),
        }
    }

    fn ingest(&mut self, block: &str) {
        for data in sse::parse_sse_lines(block) {
            if self.finished {
                return;
            }
            match data {
                SseData::Done => self.finish(ProviderChunk::Done),
                SseData::Json(json) => {
                    for chunk in sse::parse_chat_chunk(&json, &self.pricing) {
                        if chunk.is_terminal() {
                            self.finish(chunk);
                            break;
                        }
                        self.pending.push_back(chunk);
                    }
                }
            }
        }
    }

    fn finish(&mut self, last: ProviderChunk) {
        self.pending.push_back(last);
        self.finished = true;
    }
}

impl Stream for ChatStream {
    type Item = ProviderChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(chunk) = self.pending.pop_front() {
            return Poll::Ready(Some(chunk));
        }
        if self.finished {
            return Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);

                    self.buffer.extend_from_slice(&bytes);
                    self.drain_lines();

                    if let Some(chunk) = self.pending.pop_front() {
                        return Poll::Ready(Some(chunk));
                    }
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(ProviderChunk::Error(
                        ProviderError::StreamInterrupted(e.to_string()).to_string(),
                    )));
                }
                Poll::Ready(None) => {
                    let remaining = self.buffer.split();
                    self.ingest_bytes(&remaining);
                    if !self.finished {
                        self.finish(ProviderChunk::Done);
                    }
                    return Poll::Ready(self.pending.pop_front());
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        let err = ProviderError::Timeout(self.idle_duration);
                        return Poll::Ready(Some(ProviderChunk::Error(format!(
                            "no data from upstream: {err}"
                        ))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
