use std::sync::Arc;

use crate::config::Config;
use crate::engine::critic::{EvidenceCritic, EvidenceEvaluator};
use crate::engine::guardrail::{InputGuard, InputValidator, OutputGuard, OutputValidator};
use crate::index::{DocumentCatalog, PageContentProvider, TreeIndexProvider};
use crate::llm::{CompletionRequest, CompletionService, LlmError};
use crate::telemetry::{Stage, TelemetrySink, TracingTelemetrySink};

/// 引擎上下文 - 进程内长期存在的协作方集合
///
/// 所有成员都是只读共享的，可以被并发查询同时使用；单个查询的可变状态只存在于
/// [`QueryState`](crate::engine::types::QueryState) 中。
#[derive(Clone)]
pub struct EngineContext {
    /// LLM补全服务
    pub llm: Arc<dyn CompletionService>,
    /// 树索引
    pub tree_index: Arc<dyn TreeIndexProvider>,
    /// 页面原文
    pub pages: Arc<dyn PageContentProvider>,
    /// 文档目录
    pub catalog: Arc<dyn DocumentCatalog>,
    /// 阶段事件接收端
    pub telemetry: Arc<dyn TelemetrySink>,
    pub input_validator: Arc<dyn InputValidator>,
    pub output_validator: Arc<dyn OutputValidator>,
    /// 证据评审器
    pub critic: Arc<dyn EvidenceEvaluator>,
    /// 配置
    pub config: Config,
}

impl EngineContext {
    pub fn new(
        config: Config,
        llm: Arc<dyn CompletionService>,
        tree_index: Arc<dyn TreeIndexProvider>,
        pages: Arc<dyn PageContentProvider>,
        catalog: Arc<dyn DocumentCatalog>,
    ) -> Self {
        let input_validator = Arc::new(InputGuard::new(config.guardrail.clone()));
        let output_validator = Arc::new(OutputGuard::new(&config.guardrail));
        Self {
            llm,
            tree_index,
            pages,
            catalog,
            telemetry: Arc::new(TracingTelemetrySink),
            input_validator,
            output_validator,
            critic: Arc::new(EvidenceCritic),
            config,
        }
    }

    /// 使用同一个对象同时提供树索引、页面与目录
    pub fn with_index<I>(config: Config, llm: Arc<dyn CompletionService>, index: Arc<I>) -> Self
    where
        I: TreeIndexProvider + PageContentProvider + DocumentCatalog + 'static,
    {
        Self::new(config, llm, index.clone(), index.clone(), index)
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_input_validator(mut self, validator: Arc<dyn InputValidator>) -> Self {
        self.input_validator = validator;
        self
    }

    pub fn with_output_validator(mut self, validator: Arc<dyn OutputValidator>) -> Self {
        self.output_validator = validator;
        self
    }

    pub fn with_critic(mut self, critic: Arc<dyn EvidenceEvaluator>) -> Self {
        self.critic = critic;
        self
    }

    /// 以高能效模型发起补全
    pub async fn complete_efficient(
        &self,
        stage: Stage,
        system_prompt: &str,
        user_prompt: String,
        max_tokens: u32,
    ) -> Result<String, LlmError> {
        let model = self.config.llm.model_efficient.clone();
        self.complete(stage, system_prompt, user_prompt, max_tokens, model)
            .await
    }

    pub async fn complete(
        &self,
        stage: Stage,
        system_prompt: &str,
        user_prompt: String,
        max_tokens: u32,
        model: String,
    ) -> Result<String, LlmError> {
        self.llm
            .complete(CompletionRequest {
                stage,
                system_prompt: system_prompt.to_string(),
                user_prompt,
                max_tokens,
                model,
            })
            .await
    }
}
