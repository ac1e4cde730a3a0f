use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::ProviderError;
use crate::metrics::UsageUpdate;
use crate::session::Session;

/// One unit of a provider's streamed output.
///
/// A stream ends at `Done`, at `Error`, or when it is exhausted.
#[derive(Clone, Debug, PartialEq)]
pub enum ProviderChunk {
    Text(String),
    Usage(UsageUpdate),
    Done,
    Error(String),
}

impl ProviderChunk {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(message.into())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error(_))
    }
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = ProviderChunk> + Send>>;

/// A text-generation backend that can answer a session's prompt.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Model identifier callers select this provider by.
    fn id(&self) -> &str;
    fn display_name(&self) -> &str;
    fn supports_streaming(&self) -> bool;

    async fn stream_response(&self, session: &Session) -> Result<ChunkStream, ProviderError>;

    fn summary(&self) -> ProviderSummary {
        ProviderSummary {
            id: self.id().to_string(),
            display_name: self.display_name().to_string(),
            supports_streaming: self.supports_streaming(),
        }
    }
}

/// Public description of a configured provider.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSummary {
    pub id: String,
    pub display_name: String,
    pub supports_streaming: bool,
}
