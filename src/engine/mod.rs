//! 查询编排引擎：各阶段实现与状态机

pub mod assembler;
pub mod context;
pub mod critic;
pub mod generator;
pub mod guardrail;
pub mod orchestrator;
pub mod planner;
pub mod router;
pub mod selector;
pub mod tree_search;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use context::EngineContext;
pub use orchestrator::QueryEngine;
pub use types::{Query, QueryResponse, QueryStatus, Route, SourceRef, StreamEvent};
