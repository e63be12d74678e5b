pub mod cli;
pub mod config;
pub mod engine;
pub mod index;
pub mod llm;
pub mod telemetry;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use engine::{EngineContext, Query, QueryEngine, QueryResponse, QueryStatus, Route};
pub use index::{JsonIndexStore, MemoryIndex};
