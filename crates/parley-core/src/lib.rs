pub mod errors;
pub mod events;
pub mod ids;
pub mod metrics;
pub mod provider;
pub mod session;

pub use errors::ProviderError;
pub use events::StreamEvent;
pub use ids::{ModelId, SessionId};
pub use metrics::{ModelMetrics, UsageUpdate};
pub use provider::{ChunkStream, ModelProvider, ProviderChunk, ProviderSummary};
pub use session::{ModelState, RunStatus, Session};
