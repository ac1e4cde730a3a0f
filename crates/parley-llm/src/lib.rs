pub mod mock;
pub mod openai;
pub mod pricing;
pub mod registry;
pub mod sse;

pub use mock::{DemoProvider, MockResponse, ScriptedProvider};
pub use openai::{OpenAiConfig, OpenAiProvider};
pub use pricing::Pricing;
pub use registry::{OpenAiModelSettings, ProviderRegistry, ProviderSettings};
