pub mod error;
pub mod sessions;

pub use error::StoreError;
pub use sessions::{MemorySessionStore, SessionStore};
