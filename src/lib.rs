// Re-export modules for the binary and the integration tests
pub mod config;
pub mod error;
pub mod models;
pub mod sync;

// Re-export main types for convenience
pub use config::ClientConfig;
pub use error::{ChatError, ChatResult};
pub use models::*;
pub use sync::engine::{EngineEvent, SyncEngine};
pub use sync::ChatSession;
