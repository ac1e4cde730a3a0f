use parley_core::{ModelId, ProviderError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown provider {0}")]
    UnknownProvider(ModelId),

    #[error("{0}")]
    Provider(#[from] ProviderError),

    /// Error fragment reported by the provider mid-stream.
    #[error("{0}")]
    ModelFailed(String),

    #[error("model task panicked")]
    Panicked,
}
