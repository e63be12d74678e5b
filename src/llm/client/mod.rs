//! LLM客户端 - 基于rig的 [`CompletionService`] 实现

use anyhow::Result;
use async_trait::async_trait;
use std::time::{Duration, Instant};

use crate::config::LLMConfig;
use crate::llm::{CompletionRequest, CompletionService, LlmError};
use crate::telemetry::Stage;

mod providers;

use providers::ProviderClient;

/// LLM客户端
///
/// 进程内只创建一个实例，由编排引擎在构造时注入并在并发查询间共享。
/// 单次调用的超时在此处统一施加；失败不在客户端内部重试，由各阶段自行降级。
#[derive(Clone)]
pub struct LLMClient {
    config: LLMConfig,
    client: ProviderClient,
}

impl LLMClient {
    /// 创建新的LLM客户端
    pub fn new(config: LLMConfig) -> Result<Self> {
        let client = ProviderClient::new(&config)?;
        Ok(Self { client, config })
    }

    /// 检查模型连接和功能是否正常
    pub async fn check_connection(&self) -> Result<()> {
        eprintln!("🔄 正在检查模型连接...");
        let request = CompletionRequest {
            stage: Stage::HealthCheck,
            system_prompt: "You are a helpful assistant.".to_string(),
            user_prompt: "Reply with the single word: ok".to_string(),
            max_tokens: 8,
            model: self.config.model_efficient.clone(),
        };
        match self.complete(request).await {
            Ok(_) => {
                eprintln!("✅ 模型连接正常");
                Ok(())
            }
            Err(e) => {
                eprintln!("❌ 模型连接失败: {}", e);
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl CompletionService for LLMClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String, LlmError> {
        let timeout_ms = self.config.call_timeout_ms;
        let agent = self.client.create_agent(
            &request.model,
            &request.system_prompt,
            request.max_tokens,
            &self.config,
        );

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            agent.prompt(&request.user_prompt),
        )
        .await;

        match outcome {
            Ok(Ok(text)) => {
                tracing::debug!(
                    stage = %request.stage,
                    model = %request.model,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "llm call completed"
                );
                Ok(text)
            }
            Ok(Err(e)) => {
                tracing::warn!(stage = %request.stage, model = %request.model, error = %e, "llm call failed");
                Err(LlmError::Provider {
                    stage: request.stage,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                tracing::warn!(stage = %request.stage, model = %request.model, timeout_ms, "llm call timed out");
                Err(LlmError::Timeout {
                    stage: request.stage,
                    timeout_ms,
                })
            }
        }
    }
}
