use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::context::EngineContext;
use crate::engine::types::Route;
use crate::telemetry::Stage;
use crate::utils::json::{extract_json, unit_interval};

const ROUTER_SYSTEM_PROMPT: &str = "You classify questions about long financial and business documents by how much retrieval and reasoning they need. Output ONLY valid JSON.";

/// 分类失败时使用的分数，落在standard区间
const DEGRADED_SCORE: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub route: Route,
    pub complexity_score: f64,
    /// LLM调用失败或输出无法解析
    pub degraded: bool,
}

/// 模型的分类回复；分数可能是数字也可能是数字字符串
#[derive(Debug, Deserialize)]
struct ComplexityReply {
    #[serde(alias = "score")]
    complexity_score: Value,
}

/// 复杂度路由器
#[derive(Default)]
pub struct ComplexityRouter;

impl ComplexityRouter {
    pub async fn classify(&self, context: &EngineContext, question: &str) -> RouteDecision {
        let prompt = format!(
            r#"Rate the complexity of the question below on a scale from 0.0 to 1.0.

Question: {question}

Guidelines:
- 0.0-0.39: a direct factual lookup of a single figure or concept ("What was total revenue?")
- 0.4-0.69: needs synthesis of several passages from one or more documents
- 0.7-1.0: multi-part, comparative or multi-hop questions across documents or periods

Respond with JSON: {{"complexity_score": 0.0, "reasoning": "one sentence"}}"#
        );

        let response = context
            .complete_efficient(Stage::Router, ROUTER_SYSTEM_PROMPT, prompt, 128)
            .await;

        let score = match response {
            Ok(text) => parse_score(&text),
            Err(e) => {
                tracing::warn!(stage = %Stage::Router, error = %e, "classification failed, using standard route");
                None
            }
        };

        let query = &context.config.query;
        match score {
            Some(score) => RouteDecision {
                route: Route::from_score(score, query.fast_threshold, query.complex_threshold),
                complexity_score: score,
                degraded: false,
            },
            None => RouteDecision {
                route: Route::Standard,
                complexity_score: DEGRADED_SCORE,
                degraded: true,
            },
        }
    }
}

/// 支持 `{"complexity_score": x}`、`{"score": x}` 以及纯数字回复
fn parse_score(text: &str) -> Option<f64> {
    if let Some(value) = extract_json(text) {
        if value.is_number() {
            return unit_interval(&value);
        }
        if let Ok(reply) = serde_json::from_value::<ComplexityReply>(value) {
            return unit_interval(&reply.complexity_score);
        }
    }
    text.trim().parse::<f64>().ok().filter(|s| s.is_finite()).map(|s| s.clamp(0.0, 1.0))
}
