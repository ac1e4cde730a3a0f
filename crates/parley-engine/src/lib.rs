pub mod bus;
pub mod error;
pub mod orchestrator;

pub use bus::{BusConfig, EventBus, EventStream};
pub use error::EngineError;
pub use orchestrator::{EngineOrchestrator, SessionOrchestrator, SubmitRequest};
