//! LLM补全服务抽象 - 编排引擎只依赖 [`CompletionService`]，具体实现通过构造注入

use async_trait::async_trait;
use thiserror::Error;

use crate::telemetry::Stage;

pub mod client;

/// 一次补全请求
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    /// 发起调用的流水线阶段，用于日志与遥测
    pub stage: Stage,
    pub system_prompt: String,
    pub user_prompt: String,
    pub max_tokens: u32,
    pub model: String,
}

/// 补全服务错误，超时与服务方错误分开，便于各阶段选择降级策略
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LlmError {
    #[error("LLM call for stage `{stage}` timed out after {timeout_ms}ms")]
    Timeout { stage: Stage, timeout_ms: u64 },

    #[error("LLM provider error in stage `{stage}`: {message}")]
    Provider { stage: Stage, message: String },
}

/// 文本补全服务
///
/// 实现方需要保证可被多个并发查询共享（`Send + Sync`），
/// 连接等资源的生命周期由持有者显式管理。
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError>;
}
